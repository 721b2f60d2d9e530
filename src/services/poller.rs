//! Payment status polling.
//!
//! A poller is started for one payment reference and owns a single task
//! holding both timers: the query interval and the overall ceiling. The
//! task ends when a terminal status is observed, when the ceiling elapses,
//! on [`PollerHandle::stop`], or when the handle is dropped. Queries run
//! inside the task one after another, so two never overlap.

use crate::config::PollingConfig;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{PaymentIntentId, PaymentStatus};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const REFRESH_INSTRUCTION: &str =
    "We could not confirm your payment yet. Please refresh this page to check again.";

/// Anything that can answer "what is the status of this payment?".
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn query(&self, reference: &PaymentIntentId) -> ServiceResult<PaymentStatus>;
}

/// How a polling run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A terminal status was observed
    Resolved(PaymentStatus),
    /// The ceiling elapsed first
    TimedOut,
    /// The consumer lost interest
    Stopped,
}

impl PollOutcome {
    pub fn user_message(&self) -> &'static str {
        match self {
            PollOutcome::Resolved(PaymentStatus::Succeeded) => "Payment received. Welcome aboard!",
            PollOutcome::Resolved(PaymentStatus::Failed) => {
                "Your payment did not go through. Please try again."
            }
            PollOutcome::Resolved(PaymentStatus::Canceled) => "Your payment was canceled.",
            PollOutcome::Resolved(PaymentStatus::Processing) => "Your payment is processing.",
            PollOutcome::TimedOut => REFRESH_INSTRUCTION,
            PollOutcome::Stopped => "Stopped checking payment status.",
        }
    }
}

/// Observable polling state.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStatusQuery {
    pub reference: PaymentIntentId,
    pub status: PaymentStatus,
    pub elapsed: Duration,
    /// Most recent query error; cleared by the next successful query
    pub last_error: Option<String>,
    pub queries_issued: u32,
    /// Set once polling has ended
    pub outcome: Option<PollOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        (&PollingConfig::default()).into()
    }
}

impl From<&PollingConfig> for PollerSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            ceiling: config.ceiling(),
        }
    }
}

/// Owner of a running poller. Dropping it releases both timers.
pub struct PollerHandle {
    snapshots: watch::Receiver<PaymentStatusQuery>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<PollOutcome>>,
}

/// Starts polling. This is the only way to acquire the poller's timers.
/// A zero interval is rejected.
pub fn start_polling(
    source: Arc<dyn StatusSource>,
    reference: PaymentIntentId,
    settings: PollerSettings,
) -> ServiceResult<PollerHandle> {
    if settings.interval.is_zero() {
        return Err(ServiceError::InvalidInput(
            "polling interval must be greater than zero".to_string(),
        ));
    }

    let initial = PaymentStatusQuery {
        reference: reference.clone(),
        status: PaymentStatus::Processing,
        elapsed: Duration::ZERO,
        last_error: None,
        queries_issued: 0,
        outcome: None,
    };
    let (snapshot_tx, snapshots) = watch::channel(initial.clone());
    let (stop_tx, stop_rx) = oneshot::channel();

    let task = tokio::spawn(run(source, initial, settings, snapshot_tx, stop_rx));

    Ok(PollerHandle {
        snapshots,
        stop_tx: Some(stop_tx),
        task: Some(task),
    })
}

impl PollerHandle {
    pub fn snapshot(&self) -> PaymentStatusQuery {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PaymentStatusQuery> {
        self.snapshots.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits until polling ends on its own.
    pub async fn finished(&mut self) -> PollOutcome {
        match self.task.take() {
            Some(task) => task.await.unwrap_or(PollOutcome::Stopped),
            None => self.snapshot().outcome.unwrap_or(PollOutcome::Stopped),
        }
    }

    /// Stops polling and waits for the task to release its timers. Returns
    /// the natural outcome if polling had already ended.
    pub async fn stop(&mut self) -> PollOutcome {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.finished().await
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    source: Arc<dyn StatusSource>,
    mut state: PaymentStatusQuery,
    settings: PollerSettings,
    snapshots: watch::Sender<PaymentStatusQuery>,
    mut stop_rx: oneshot::Receiver<()>,
) -> PollOutcome {
    let started = Instant::now();
    let ceiling = time::sleep(settings.ceiling);
    tokio::pin!(ceiling);

    // first tick completes immediately
    let mut ticker = time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break PollOutcome::Stopped,
            _ = &mut ceiling => break PollOutcome::TimedOut,
            _ = ticker.tick() => {}
        }

        state.queries_issued += 1;
        let result = tokio::select! {
            biased;
            _ = &mut stop_rx => break PollOutcome::Stopped,
            _ = &mut ceiling => break PollOutcome::TimedOut,
            result = source.query(&state.reference) => result,
        };

        match result {
            Ok(status) => {
                state.status = status;
                state.last_error = None;
            }
            Err(e) => {
                debug!(reference = %state.reference, error = %e, "Status query failed; will retry");
                state.last_error = Some(e.to_string());
            }
        }
        state.elapsed = started.elapsed();

        if state.status.is_terminal() {
            break PollOutcome::Resolved(state.status);
        }
        snapshots.send_replace(state.clone());
    };

    match outcome {
        PollOutcome::Resolved(status) => {
            info!(reference = %state.reference, %status, queries = state.queries_issued, "Payment resolved")
        }
        PollOutcome::TimedOut => {
            warn!(reference = %state.reference, queries = state.queries_issued, "Payment status polling timed out")
        }
        PollOutcome::Stopped => debug!(reference = %state.reference, "Payment status polling stopped"),
    }

    state.elapsed = started.elapsed();
    state.outcome = Some(outcome);
    snapshots.send_replace(state);
    outcome
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    success: bool,
    status: Option<PaymentStatus>,
    #[serde(default)]
    message: Option<String>,
}

/// Queries a running API's `GET /payment/status` endpoint.
#[derive(Clone)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str, timeout: Duration) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Configuration(format!("status HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn query(&self, reference: &PaymentIntentId) -> ServiceResult<PaymentStatus> {
        let response = self
            .client
            .get(format!("{}/payment/status", self.base_url))
            .query(&[("paymentIntentId", reference.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::UpstreamTimeout(e.to_string())
                } else {
                    ServiceError::UpstreamUnavailable(e.to_string())
                }
            })?;

        let http_status = response.status();
        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamUnavailable(format!("unreadable status: {}", e)))?;

        match body.status {
            Some(status) if body.success => Ok(status),
            _ => {
                let message = body
                    .message
                    .unwrap_or_else(|| format!("status endpoint answered {}", http_status));
                if http_status.is_client_error() {
                    Err(ServiceError::UpstreamRejection(message))
                } else {
                    Err(ServiceError::UpstreamUnavailable(message))
                }
            }
        }
    }
}
