/// Webhook delivery for external integrations
pub mod spreadsheet;

pub use spreadsheet::{SpreadsheetRelay, SpreadsheetRow};
