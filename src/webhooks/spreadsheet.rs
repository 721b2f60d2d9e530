use crate::config::RelayConfig;
use crate::errors::ServiceError;
use crate::models::Lead;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Flat row appended to the lead spreadsheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadsheetRow {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub paid: bool,
}

impl From<&Lead> for SpreadsheetRow {
    fn from(lead: &Lead) -> Self {
        Self {
            name: lead.name.clone(),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
            paid: false,
        }
    }
}

/// Best-effort relay of captured leads to a spreadsheet webhook.
///
/// The webhook usually answers with a redirect to an HTML page; redirects
/// are not followed and any 2xx or 3xx status counts as delivered.
#[derive(Clone)]
pub struct SpreadsheetRelay {
    client: reqwest::Client,
    webhook_url: Option<String>,
    max_attempts: u32,
}

impl SpreadsheetRelay {
    pub fn new(config: &RelayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ServiceError::Configuration(format!("relay HTTP client: {}", e)))?;

        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// A relay that drops every row.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: None,
            max_attempts: 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Deliver one row, retrying with exponential backoff.
    #[instrument(skip(self, row), fields(email = %row.email))]
    pub async fn deliver(&self, row: &SpreadsheetRow) -> Result<(), ServiceError> {
        let Some(webhook_url) = self.webhook_url.as_deref() else {
            return Ok(());
        };

        for attempt in 1..=self.max_attempts {
            match self.client.post(webhook_url).json(row).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        info!(status = status.as_u16(), "Lead relayed to spreadsheet");
                        counter!("enrollment_relay.delivered", 1);
                        return Ok(());
                    }
                    warn!(
                        "Spreadsheet relay answered {} (attempt {}/{})",
                        status, attempt, self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "Spreadsheet relay error: {} (attempt {}/{})",
                        e, attempt, self.max_attempts
                    );
                }
            }

            // 1s, 2s, 4s
            if attempt < self.max_attempts {
                let backoff = Duration::from_secs(2_u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
        }

        counter!("enrollment_relay.failed", 1);
        Err(ServiceError::RelayFailure(format!(
            "spreadsheet relay failed after {} attempts",
            self.max_attempts
        )))
    }

    /// Fire-and-forget delivery; failures are only logged.
    pub fn send_async(&self, row: SpreadsheetRow) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }

        let relay = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = relay.deliver(&row).await {
                error!("Async spreadsheet relay failed: {}", e);
            }
        }))
    }
}
