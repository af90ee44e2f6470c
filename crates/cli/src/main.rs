use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{debug, info, warn};

use steward_core::OperandContext;
use steward_engine::Reconciler;
use steward_store::KubeStore;

#[derive(Parser, Debug)]
#[command(name = "stewardctl", version, about = "Steward operand reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct ContextArgs {
    /// Operand context YAML file; flags below are ignored when set
    #[arg(long = "context-file")]
    file: Option<std::path::PathBuf>,

    /// Operand name, also the identity `name` label
    #[arg(long, default_value = "node-labeller")]
    name: String,

    /// Namespace for the namespace-scoped catalogue entries
    #[arg(long, env = "STEWARD_NAMESPACE")]
    namespace: Option<String>,

    /// Identity `component` label value
    #[arg(long, default_value = "schedule")]
    component: String,

    /// Identity `part-of` label value
    #[arg(long = "part-of", default_value = "steward")]
    part_of: String,

    /// Version label value (stamped, never part of identity)
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    version: String,
}

impl ContextArgs {
    fn load(&self) -> Result<OperandContext> {
        if let Some(path) = &self.file {
            let text = std::fs::read_to_string(path)?;
            return Ok(serde_yaml::from_str(&text)?);
        }
        let namespace = self
            .namespace
            .clone()
            .ok_or_else(|| anyhow!("--namespace is required without --context-file"))?;
        Ok(OperandContext {
            name: self.name.clone(),
            namespace,
            component: self.component.clone(),
            part_of: self.part_of.clone(),
            version: self.version.clone(),
            owner: None,
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconcile pass and print the report
    Reconcile {
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Reconcile continuously: periodic passes plus change-triggered passes
    Run {
        #[command(flatten)]
        context: ContextArgs,
        /// Seconds between periodic passes
        #[arg(long, env = "STEWARD_RESYNC_SECS", default_value_t = 60)]
        interval: u64,
    },
    /// Print the operand's desired catalogue without touching the cluster
    Catalogue {
        #[command(flatten)]
        context: ContextArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

fn render_report(report: &steward_core::PassReport, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for o in &report.outcomes {
                let detail = o.message.as_deref().unwrap_or("");
                println!("{:<44} {:<24} {}", o.object.to_string(), o.outcome.to_string(), detail);
            }
            println!("pass {}", if report.healthy() { "healthy" } else { "degraded" });
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reconcile { context } => {
            let ctx = context.load()?;
            let store = Arc::new(KubeStore::try_default().await?);
            let rec = Reconciler::new(store);
            let report = rec.reconcile_once(&ctx).await;
            render_report(&report, cli.output)?;
            if !report.healthy() {
                std::process::exit(1);
            }
        }
        Commands::Run { context, interval } => {
            let ctx = context.load()?;
            let store = Arc::new(KubeStore::try_default().await?);
            let rec = Reconciler::new(store);

            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut watch = rec.watch(&ctx).await?;
            info!(operand = %ctx.name, interval, "run loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = rec.reconcile_once(&ctx).await;
                        info!(operand = %ctx.name, healthy = report.healthy(), "periodic pass");
                    }
                    ev = watch.rx.recv() => match ev {
                        Some(ev) => {
                            debug!(object = %ev.name, kind = %ev.kind, "change observed");
                            // Coalesce a burst of events into one pass.
                            while watch.rx.try_recv().is_ok() {}
                            let report = rec.reconcile_once(&ctx).await;
                            info!(operand = %ctx.name, healthy = report.healthy(), "triggered pass");
                        }
                        None => {
                            warn!(operand = %ctx.name, "watch stream closed; rewiring");
                            watch = rec.watch(&ctx).await?;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!(operand = %ctx.name, "shutting down");
                        break;
                    }
                }
            }
            watch.cancel.cancel();
        }
        Commands::Catalogue { context } => {
            let ctx = context.load()?;
            let entries = steward_catalogue::entries(&ctx);
            match cli.output {
                Output::Human => {
                    for e in &entries {
                        println!("{}", e.object);
                    }
                }
                Output::Json => {
                    let items: Vec<serde_json::Value> = entries
                        .iter()
                        .map(|e| serde_json::json!({ "object": e.object, "body": e.body }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
    }

    Ok(())
}
