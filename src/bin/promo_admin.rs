use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use enrollment_api::{
    config::{self, AppConfig},
    models::PaymentStatus,
    provider::{provider_from_config, PaymentProvider},
    services::{
        poller::{start_polling, HttpStatusSource, PaymentStatusQuery, PollOutcome, PollerSettings},
        promotions::{
            expected_mappings, PromotionConsistencyManager, RepairPolicy, RepairReport,
            RepairStrategy,
        },
    },
    validation::validate_payment_reference,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize()?;

    match cli.command {
        Commands::Audit => handle_audit(&context, cli.json).await?,
        Commands::Repair(args) => handle_repair(&context, args, cli.json).await?,
        Commands::WatchPayment(args) => handle_watch_payment(&context, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "promo-admin",
    about = "Promotion code consistency and payment tooling for the enrollment funnel",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report promotion code drift and ceiling mismatches without changing anything
    Audit,
    /// Repair drift, missing codes and duplicates, then clean up stale entities
    Repair(RepairArgs),
    /// Poll a running API for a payment's status until it resolves
    WatchPayment(WatchPaymentArgs),
}

#[derive(Args)]
struct RepairArgs {
    #[arg(long, value_enum, default_value_t = StrategyArg::InPlace)]
    strategy: StrategyArg,
    #[arg(long, action = ArgAction::SetTrue, help = "Leave stale zero-redemption entities in place")]
    keep_stale: bool,
}

#[derive(Args)]
struct WatchPaymentArgs {
    #[arg(long, default_value = "http://localhost:8080", help = "Base URL of the enrollment API")]
    api: String,
    #[arg(long, help = "Override the polling interval in milliseconds")]
    interval_ms: Option<u64>,
    #[arg(long, help = "Override the polling ceiling in seconds")]
    ceiling_secs: Option<u64>,
    /// Payment intent id, e.g. pi_3NkXwTLkdIwHu7ix0abcDEF1
    payment_intent_id: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    InPlace,
    Recreate,
}

impl From<StrategyArg> for RepairStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::InPlace => RepairStrategy::InPlace,
            StrategyArg::Recreate => RepairStrategy::Recreate,
        }
    }
}

struct CliContext {
    config: AppConfig,
}

impl CliContext {
    fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);
        Ok(Self { config })
    }

    fn provider(&self) -> Result<Arc<dyn PaymentProvider>> {
        provider_from_config(&self.config.payment, &self.config.pricing)
            .context("failed to build payment provider")
    }

    fn manager(&self, policy: RepairPolicy) -> Result<PromotionConsistencyManager> {
        Ok(PromotionConsistencyManager::new(
            self.provider()?,
            self.config.pricing.clone(),
            policy,
        ))
    }
}

async fn handle_audit(context: &CliContext, json: bool) -> Result<()> {
    let expected = expected_mappings(&context.config.pricing);
    let report = context
        .manager(RepairPolicy::audit_only())?
        .audit_and_repair(&expected)
        .await
        .context("promotion code audit failed")?;

    render_report(&report, json)?;
    report.ensure_no_drift()?;
    Ok(())
}

async fn handle_repair(context: &CliContext, args: RepairArgs, json: bool) -> Result<()> {
    let mut policy = RepairPolicy::repair(args.strategy.into());
    policy.cleanup_stale = !args.keep_stale;
    info!(strategy = %policy.strategy, cleanup = policy.cleanup_stale, "Repairing promotion codes");

    let expected = expected_mappings(&context.config.pricing);
    let report = context
        .manager(policy)?
        .audit_and_repair(&expected)
        .await
        .context("promotion code repair failed")?;

    render_report(&report, json)
}

async fn handle_watch_payment(
    context: &CliContext,
    args: WatchPaymentArgs,
    json: bool,
) -> Result<()> {
    let reference = validate_payment_reference(&args.payment_intent_id)
        .map_err(|e| anyhow!("invalid payment intent id: {}", e))?;

    let mut settings = PollerSettings::from(&context.config.polling);
    if let Some(ms) = args.interval_ms {
        settings.interval = Duration::from_millis(ms.max(1));
    }
    if let Some(secs) = args.ceiling_secs {
        settings.ceiling = Duration::from_secs(secs);
    }

    let source = HttpStatusSource::new(&args.api, context.config.payment.request_timeout())?;
    let mut handle = start_polling(Arc::new(source), reference, settings)
        .context("failed to start payment status poller")?;
    let mut updates = handle.subscribe();

    let outcome = loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break handle.finished().await;
                }
                let snapshot = updates.borrow_and_update().clone();
                render_snapshot(&snapshot, json)?;
                if let Some(outcome) = snapshot.outcome {
                    break outcome;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted, stopping poller");
                break handle.stop().await;
            }
        }
    };

    if !json {
        println!("{}", outcome.user_message());
    }
    match outcome {
        PollOutcome::Resolved(PaymentStatus::Succeeded) => Ok(()),
        PollOutcome::Resolved(status) => Err(anyhow!("payment ended as {}", status)),
        PollOutcome::TimedOut => Err(anyhow!("payment status unresolved")),
        PollOutcome::Stopped => Ok(()),
    }
}

fn render_report(report: &RepairReport, json: bool) -> Result<()> {
    if json {
        print_json(report)
    } else {
        print!("{}", report);
        if report.is_consistent() {
            println!("All promotion codes are consistent");
        }
        Ok(())
    }
}

fn render_snapshot(snapshot: &PaymentStatusQuery, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({
            "reference": snapshot.reference,
            "status": snapshot.status,
            "elapsedMs": snapshot.elapsed.as_millis() as u64,
            "queriesIssued": snapshot.queries_issued,
            "lastError": snapshot.last_error,
            "outcome": snapshot.outcome.map(|o| format!("{:?}", o)),
        }));
    }

    println!(
        "- {} • {} • {} queries • {:.1}s{}",
        snapshot.reference,
        snapshot.status,
        snapshot.queries_issued,
        snapshot.elapsed.as_secs_f64(),
        snapshot
            .last_error
            .as_deref()
            .map(|e| format!(" • last error: {}", e))
            .unwrap_or_default()
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
