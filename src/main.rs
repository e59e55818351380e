use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::orchestration::AllowlistEntry;
use strand_core::{AppConfig, EventKind, RunId, RunStatus, Severity};
use strand_exec::{AgentDefinition, Caller, Platform, StartRun};
use strand_graph::GraphDocument;

const TENANT: &str = "local";
const USER: &str = "cli";

#[derive(Parser)]
#[command(name = "strand", version, about = "Graph agent runtime with run orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml", env = "STRAND_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a graph document and print its diagnostics
    Compile {
        /// Graph document (JSON)
        file: PathBuf,
        /// Print the compiled IR
        #[arg(long)]
        ir: bool,
    },
    /// Deploy a graph and run it to completion
    Run {
        /// Graph document (JSON)
        file: PathBuf,
        /// Run input, as JSON (plain text is passed as a string)
        #[arg(short, long, default_value = "null")]
        input: String,
        /// Extra agents the run may spawn, one graph file each
        #[arg(long = "with")]
        with: Vec<PathBuf>,
        /// Resume payload (JSON) used when the run pauses
        #[arg(long)]
        resume: Option<String>,
        /// Seconds to wait for the run to settle
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// Print the run tree a run belongs to
    Tree {
        run_id: String,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Compile { file, ir } => {
            let platform = Platform::builder(config).in_memory().build()?;
            let doc = read_document(&file)?;
            let output = strand_graph::GraphCompiler::new(platform.nodes.clone())
                .with_options(strand_graph::CompilerOptions {
                    orchestration_enabled: platform.config.orchestration.graph_primitives_enabled,
                })
                .compile(&doc);
            for diag in &output.diagnostics {
                let level = match diag.severity {
                    Severity::Error => "error",
                    Severity::Warning => "warning",
                };
                match &diag.node_id {
                    Some(node) => eprintln!("{}[{}]: {}", level, node, diag.message),
                    None => eprintln!("{}: {}", level, diag.message),
                }
            }
            let errors = output.errors().count();
            if errors > 0 {
                bail!("{} error(s) in {}", errors, file.display());
            }
            if ir {
                let ir = output.into_result()?;
                println!("{}", serde_json::to_string_pretty(&ir)?);
            } else {
                println!("{}: ok", file.display());
            }
        }
        Commands::Run {
            file,
            input,
            with,
            resume,
            timeout,
        } => {
            let platform = Platform::builder(config).build()?;
            let agent_id = deploy(&platform, &file)?;
            for extra in &with {
                let target = deploy(&platform, extra)?;
                platform
                    .orchestration_store()
                    .add_allowlist_entry(&AllowlistEntry::for_agent(TENANT, &agent_id, &target))?;
            }

            let input = serde_json::from_str(&input)
                .unwrap_or_else(|_| serde_json::Value::String(input.clone()));
            let run = platform
                .service
                .start_run(StartRun::new(TENANT, &agent_id, USER, input))?;
            info!(run_id = %run.id, agent_id = %agent_id, "Started run");

            let mut events = platform.service.subscribe_run(run.id.clone());
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event.event {
                        EventKind::NodeStart => eprintln!("> {}", event.name),
                        EventKind::TokenDelta => {
                            if let Some(text) = event.data.get("text").and_then(|t| t.as_str()) {
                                eprint!("{}", text);
                            }
                        }
                        EventKind::SpawnDecision => eprintln!("  spawned {}", event.name),
                        EventKind::JoinDecision => {
                            eprintln!("  joined {}: {}", event.name, event.data["status"])
                        }
                        EventKind::PolicyDeny => {
                            eprintln!("  denied: {}", event.data["reason"])
                        }
                        _ => {}
                    }
                }
            });

            let wait = Duration::from_secs(timeout);
            let mut record = platform.service.wait(&run.id, wait).await?;
            if record.status == RunStatus::Paused {
                match resume {
                    Some(payload) => {
                        let payload = serde_json::from_str(&payload)
                            .context("--resume must be valid JSON")?;
                        platform
                            .service
                            .resume_run(&run.id, &Caller::new(TENANT, USER), payload)?;
                        record = platform.service.wait(&run.id, wait).await?;
                    }
                    None => {
                        let snapshot = platform.service.snapshot(&run.id).await?;
                        warn!(run_id = %run.id, next = ?snapshot.next, "Run paused; pass --resume to continue");
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status == RunStatus::Failed {
                bail!(
                    "run {} failed: {}",
                    record.id,
                    record.error_message.unwrap_or_default()
                );
            }
        }
        Commands::Tree { run_id } => {
            let platform = Platform::builder(config).build()?;
            let tree = platform.lineage().query_tree(&RunId::from(run_id))?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn read_document(path: &Path) -> anyhow::Result<GraphDocument> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(GraphDocument::from_json(&text)?)
}

/// Deploy a graph file under its file stem. Returns the agent id.
fn deploy(platform: &Platform, path: &Path) -> anyhow::Result<String> {
    let doc = read_document(path)?;
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("graph file needs a name")?
        .to_string();
    let (_, warnings) = platform
        .service
        .deploy_agent(AgentDefinition::new(TENANT, &id), &doc)?;
    for w in warnings {
        eprintln!("warning: {}", w.message);
    }
    Ok(id)
}
