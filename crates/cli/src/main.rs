use std::str::FromStr;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use stagehand_api::{ApiError, InProcApi, PipelinesApi};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stagehandctl", version, about = "Stagehand CLI: chart promotions and upgrades along GitOps pipelines")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace to read releases from (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List pipelines with their environments and charts
    Pipelines,
    /// List Kustomization pipelines with their paths and Git sources
    Kustomizations,
    /// Show promotions pending along a pipeline
    Promotions {
        pipeline: String,
    },
    /// Check chart repositories for newer versions of deployed charts
    Upgrades {
        pipeline: String,
    },
    /// Patch releases to their promotion target versions
    Promote {
        pipeline: String,
        /// Server-side dry-run; nothing is persisted
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("STAGEHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STAGEHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STAGEHAND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("interrupted; cancelling");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

fn fail(what: &str, e: ApiError) -> anyhow::Error {
    error!(error = %e, "{} failed", what);
    anyhow::anyhow!("{} error: {}", what, e)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = InProcApi::new(cli.namespace.clone());

    match cli.command {
        Commands::Pipelines => {
            info!(ns = ?cli.namespace, "pipelines invoked");
            let pipelines = api.list_pipelines().await.map_err(|e| fail("pipelines", e))?;
            match cli.output {
                Output::Human => {
                    for p in &pipelines {
                        println!("{}", p.name);
                        for env in &p.environments {
                            println!("  {}", env.name);
                            for c in &env.charts {
                                println!("    {}@{}\t{}", c.name, c.version, c.source);
                            }
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&pipelines)?),
            }
        }
        Commands::Kustomizations => {
            info!(ns = ?cli.namespace, "kustomizations invoked");
            let pipelines = api.kustomization_pipelines().await.map_err(|e| fail("kustomizations", e))?;
            match cli.output {
                Output::Human => {
                    for p in &pipelines {
                        println!("{}", p.name);
                        for env in &p.environments {
                            println!("  {}", env.name);
                            for k in &env.kustomizations {
                                let url = if k.url.is_empty() { "-" } else { k.url.as_str() };
                                let reference = k
                                    .reference
                                    .as_ref()
                                    .and_then(|r| r.commit.as_ref().or(r.tag.as_ref()).or(r.semver.as_ref()).or(r.branch.as_ref()).or(r.name.as_ref()))
                                    .map(String::as_str)
                                    .unwrap_or("-");
                                println!("    {}\t{}\t{}\t{}", k.path, k.source, url, reference);
                            }
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&pipelines)?),
            }
        }
        Commands::Promotions { pipeline } => {
            info!(pipeline = %pipeline, "promotions invoked");
            let promotions = api.promotions(&pipeline).await.map_err(|e| fail("promotions", e))?;
            match cli.output {
                Output::Human => {
                    if promotions.is_empty() {
                        println!("no promotions pending for {}", pipeline);
                    }
                    println!("{:<16} {:<24} {:<12} {:<12} RESOURCES", "ENVIRONMENT", "CHART", "FROM", "TO");
                    for p in &promotions {
                        let resources: Vec<String> = p.promoted_resources.iter().map(|r| r.to_string()).collect();
                        println!(
                            "{:<16} {:<24} {:<12} {:<12} {}",
                            p.environment,
                            p.from.name,
                            p.from.version,
                            p.to.version,
                            resources.join(",")
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&promotions)?),
            }
        }
        Commands::Upgrades { pipeline } => {
            info!(pipeline = %pipeline, "upgrades invoked");
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let result = api.upgrades(&pipeline, cancel.clone()).await;
            cancel.cancel();
            let upgrades = result.map_err(|e| fail("upgrades", e))?;
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<12} {:<12} SOURCE", "CHART", "CURRENT", "AVAILABLE");
                    for u in &upgrades {
                        println!("{:<24} {:<12} {:<12} {}", u.current.name, u.current.version, u.available.version, u.current.source);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&upgrades)?),
            }
        }
        Commands::Promote { pipeline, dry_run } => {
            info!(pipeline = %pipeline, dry_run, "promote invoked");
            let report = api.apply_promotions(&pipeline, dry_run).await.map_err(|e| fail("promote", e))?;
            match cli.output {
                Output::Human => {
                    let suffix = if report.dry_run { " (dry-run)" } else { "" };
                    for p in &report.patched {
                        println!("{} {} {} -> {}{}", p.resource, p.chart, p.from_version, p.to_version, suffix);
                    }
                    println!("{} release(s) patched{}", report.patched.len(), suffix);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }
    Ok(())
}
