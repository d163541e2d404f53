//! Reconciler Binary
//!
//! Runs the donation reconciliation service, or inspects its ledger.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use impact_projector::{project, ChannelSink, NullSink};
use ledger_core::{CharityRef, DonorRef, Ledger, RailKind};
use rail_adapters::{ChainAdapter, FiatAdapter, RailAdapter, RailFeed, SimulatedProcessor};
use reconciliation::{InMemoryCharityDirectory, ReconcilerConfig, ReconciliationEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "reconciler")]
#[command(about = "Donation ledger reconciliation service")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "RECONCILER_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger data directory (overrides config file)
    #[arg(long, env = "LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run rail workers and the maintenance loop until Ctrl-C
    Run,
    /// Reconcile a file of raw rail payloads (one JSON document per line)
    Ingest {
        /// Rail code (fiat_card, fiat_bank, btc, eth, stablecoin)
        rail: String,
        /// Payload file
        file: PathBuf,
    },
    /// Verify the ledger hash chain
    Audit,
    /// Print marketplace statistics
    Stats,
    /// Print per-currency totals for a charity
    Total {
        /// Charity reference
        charity: String,
    },
    /// Print a donor's receipts for a tax year
    Receipts {
        /// Donor reference
        donor: String,
        /// Tax year
        tax_year: i32,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn adapter_for(feed: RailFeed, name: &str) -> rail_adapters::Result<Box<dyn RailAdapter>> {
    if feed.rail_kind().is_chain() {
        Ok(Box::new(ChainAdapter::new(feed, name)?))
    } else {
        Ok(Box::new(FiatAdapter::new(feed, name)?))
    }
}

async fn open_engine(config: &ReconcilerConfig) -> anyhow::Result<Arc<ReconciliationEngine>> {
    let directory = Arc::new(InMemoryCharityDirectory::with_records(config.charities.clone()));
    let (sink, mut notices) = ChannelSink::new();

    // Delivery belongs to the notification service; the binary only logs
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            info!(
                receipt_id = %notice.receipt_id,
                donor = %notice.donor_ref,
                amount = notice.amount,
                currency = %notice.currency,
                tax_year = notice.tax_year,
                supersedes = ?notice.supersedes,
                "Receipt issued"
            );
        }
    });

    let engine = ReconciliationEngine::new(config.clone(), directory, Arc::new(sink))
        .await
        .context("opening reconciliation engine")?;
    Ok(Arc::new(engine))
}

async fn run(config: ReconcilerConfig) -> anyhow::Result<()> {
    let engine = open_engine(&config).await?;

    let mut adapters = Vec::with_capacity(config.workers.rails.len());
    for rail in &config.workers.rails {
        let feed = RailFeed::new(*rail);
        if !rail.is_chain() {
            engine
                .schedules()
                .register_initiator(*rail, Arc::new(SimulatedProcessor::new(feed.clone())));
        }
        adapters.push(adapter_for(feed, &config.service_name)?);
    }

    info!(
        service = %config.service_name,
        rails = ?config.workers.rails,
        data_dir = %config.ledger.data_dir.display(),
        "Reconciler running"
    );

    let token = CancellationToken::new();
    let runner = tokio::spawn(engine.clone().run(adapters, token.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    token.cancel();
    runner.await??;
    engine.shutdown().await?;
    Ok(())
}

async fn ingest(config: ReconcilerConfig, rail: &str, file: PathBuf) -> anyhow::Result<()> {
    let rail = RailKind::from_code(rail).with_context(|| format!("unknown rail `{}`", rail))?;
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;

    let engine = open_engine(&config).await?;
    let feed = RailFeed::new(rail);
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        feed.publish(line.to_string());
    }

    let mut adapter = adapter_for(feed, &config.service_name)?;
    let report = engine.drain(adapter.as_mut()).await?;
    let maintenance = engine.maintain(Utc::now()).await;

    println!("Messages:   {}", report.messages);
    println!("Posted:     {}", report.posted);
    println!("Held:       {}", report.held);
    println!("Duplicates: {}", report.duplicates);
    println!("Dropped:    {}", report.dropped);
    println!("Review:     {}", report.reviewed);
    println!("Expired:    {}", maintenance.expired);
    for item in engine.review().list() {
        println!(
            "  #{} {} {} {}: {}",
            item.id,
            item.reason,
            item.rail_kind,
            item.external_id.as_deref().unwrap_or("-"),
            item.detail
        );
    }

    engine.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = match &cli.config {
        Some(path) => ReconcilerConfig::from_file(path)?,
        None => ReconcilerConfig::from_env()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.ledger.data_dir = data_dir;
    }

    match cli.command {
        Command::Run => run(config).await,
        Command::Ingest { rail, file } => ingest(config, &rail, file).await,
        Command::Audit => {
            let ledger = Ledger::open(config.ledger).await?;
            let verified = ledger.verify_chain()?;
            println!("Audit chain intact: {} entries verified", verified);
            ledger.shutdown().await?;
            Ok(())
        }
        Command::Stats => {
            let ledger = Ledger::open(config.ledger).await?;
            let projection = project(&ledger.replay_all()?)?;
            println!("{}", projection.stats());
            ledger.shutdown().await?;
            Ok(())
        }
        Command::Total { charity } => {
            let ledger = Ledger::open(config.ledger).await?;
            let charity_ref = CharityRef::new(charity);
            let totals = ledger.read_total(&charity_ref, Utc::now())?;
            if totals.is_empty() {
                println!("{}: nothing raised", charity_ref);
            }
            for (currency, amount) in totals {
                println!("{}: {} {}", charity_ref, currency.to_major(amount), currency);
            }
            ledger.shutdown().await?;
            Ok(())
        }
        Command::Receipts { donor, tax_year } => {
            let ledger = Ledger::open(config.ledger.clone()).await?;
            let engine = ReconciliationEngine::with_ledger(
                Arc::new(ledger),
                config.clone(),
                Arc::new(InMemoryCharityDirectory::new()),
                Arc::new(NullSink),
            )?;

            let receipts = engine.donor_receipts(&DonorRef::new(donor), tax_year);
            if receipts.is_empty() {
                println!("No receipts for {}", tax_year);
            }
            for receipt in receipts {
                let charity_name = config
                    .charities
                    .iter()
                    .find(|record| record.charity_ref == receipt.charity_ref)
                    .map(|record| record.name.as_str())
                    .unwrap_or(receipt.charity_ref.as_str());
                println!("{}", receipt.render_text(charity_name));
            }
            engine.shutdown().await?;
            Ok(())
        }
    }
}
