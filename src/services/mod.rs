// Lead capture
pub mod leads;

// Payment flow
pub mod checkout;
pub mod payment_status;
pub mod poller;

// Administrative
pub mod promotions;
