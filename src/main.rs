use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use faultline::config::AppConfig;
use faultline::model::{DedupKey, IncidentStatus, SensorReading};
use faultline::pipeline::Pipeline;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "faultline",
    about = "Telemetry-to-resolution incident pipeline for industrial machine fleets",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides FAULTLINE_CONFIG and /etc/faultline/faultline.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest JSON-lines sensor readings
    Ingest {
        /// Input file (default: stdin)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Investigate and resolve the incidents this batch opened
        #[arg(long)]
        respond: bool,
    },

    /// Investigate and resolve incidents (default: every active incident)
    Respond {
        /// Incident IDs
        ids: Vec<Uuid>,
    },

    /// Inspect and manage incidents
    Incident {
        #[command(subcommand)]
        action: IncidentAction,
    },

    /// Predictive forecasts
    Forecast {
        #[command(subcommand)]
        action: ForecastAction,
    },

    /// Run the scheduled forecast scan until interrupted
    Watch,

    /// Print synthetic JSON-lines telemetry
    Simulate {
        #[arg(long, default_value = "3")]
        machines: usize,

        /// Metric names (comma separated)
        #[arg(long, default_value = "temperature,vibration", value_delimiter = ',')]
        metrics: Vec<String>,

        /// Readings per stream
        #[arg(long, default_value = "60")]
        readings: usize,

        /// Seconds between readings
        #[arg(long, default_value = "10")]
        interval: u32,

        /// Inject a spike every N readings (0 = never)
        #[arg(long, default_value = "0")]
        spike_every: usize,

        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List incidents, most recently updated first
    List {
        #[arg(long)]
        status: Option<IncidentStatus>,

        #[arg(long, default_value = "50")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print an incident with its reports, evidence, plans and audit trail (JSON)
    Show { id: Uuid },

    /// Close a RESOLVED incident
    Close {
        id: Uuid,

        #[arg(long, default_value = "operator")]
        actor: String,

        #[arg(long, default_value = "")]
        comment: String,
    },

    /// Add a free-form note to the audit trail
    Note {
        id: Uuid,

        #[arg(long, default_value = "operator")]
        actor: String,

        #[arg(long)]
        comment: String,
    },

    /// Write the audit trail as JSON lines
    Export {
        id: Uuid,

        #[arg(long)]
        output: PathBuf,
    },

    /// Replay the audit trail and print the status path
    Verify { id: Uuid },
}

#[derive(Subcommand)]
enum ForecastAction {
    /// Forecast every stream now (or one stream)
    Run {
        #[arg(long, requires = "metric")]
        machine: Option<String>,

        #[arg(long, requires = "machine")]
        metric: Option<String>,
    },

    /// Stored forecasts for one stream
    List {
        #[arg(long)]
        machine: String,

        #[arg(long)]
        metric: String,

        /// RFC 3339 lower bound (default: 24h ago)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// RFC 3339 upper bound (default: 24h ahead)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_readings(file: Option<&PathBuf>) -> Result<Vec<SensorReading>> {
    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut readings = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SensorReading>(&line) {
            Ok(r) => readings.push(r),
            Err(e) => tracing::warn!(line = n + 1, error = %e, "skipping unparseable reading"),
        }
    }
    Ok(readings)
}

async fn respond(pipeline: Pipeline, ids: Vec<Uuid>) -> Result<()> {
    let pipeline = Arc::new(pipeline);
    for (id, result) in pipeline.respond_all(ids).await {
        match result {
            Ok(outcome) => {
                let accepted = outcome
                    .investigation
                    .as_ref()
                    .and_then(|i| i.accepted.as_ref())
                    .map(|r| r.hypothesis.clone())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}  {:<13} {}", id, outcome.incident.status.as_str(), accepted);
            }
            Err(e) => println!("{}  FAILED        {:#}", id, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    init_tracing(&config);

    match cli.command {
        Commands::Ingest { file, respond: and_respond } => {
            let readings = read_readings(file.as_ref())?;
            tracing::info!(count = readings.len(), "Ingesting readings");
            let pipeline = Pipeline::open(&config)?;
            let report = pipeline.ingest_batch(readings).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if and_respond && !report.opened.is_empty() {
                respond(pipeline, report.opened).await?;
            }
        }
        Commands::Respond { ids } => {
            let pipeline = Pipeline::open(&config)?;
            let ids = if ids.is_empty() {
                let mut active = Vec::new();
                for status in [IncidentStatus::Open, IncidentStatus::Investigating, IncidentStatus::Resolving] {
                    active.extend(pipeline.incidents().list(Some(status), usize::MAX)?.into_iter().map(|i| i.incident_id));
                }
                active
            } else {
                ids
            };
            if ids.is_empty() {
                println!("No active incidents.");
            } else {
                respond(pipeline, ids).await?;
            }
        }
        Commands::Incident { action } => {
            let pipeline = Pipeline::open(&config)?;
            match action {
                IncidentAction::List { status, limit, json } => {
                    let list = pipeline.incidents().list(status, limit)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&list)?);
                    } else if list.is_empty() {
                        println!("No incidents found.");
                    } else {
                        println!(
                            "{:<36} | {:<13} | {:<8} | {:<24} | Updated",
                            "Incident", "Status", "Priority", "Stream"
                        );
                        println!("{:-<36}-|-{:-<13}-|-{:-<8}-|-{:-<24}-|-{:-<25}", "", "", "", "", "");
                        for i in list {
                            println!(
                                "{:<36} | {:<13} | {:<8} | {:<24} | {}",
                                i.incident_id,
                                i.status.as_str(),
                                i.priority.as_str(),
                                i.key().to_string(),
                                i.updated_at.to_rfc3339()
                            );
                        }
                    }
                }
                IncidentAction::Show { id } => {
                    let dossier = pipeline.dossier(id)?;
                    println!("{}", serde_json::to_string_pretty(&dossier)?);
                }
                IncidentAction::Close { id, actor, comment } => {
                    let incident = pipeline.incidents().close(id, &actor, &comment).await?;
                    println!("Incident {} {}.", incident.incident_id, incident.status);
                }
                IncidentAction::Note { id, actor, comment } => {
                    let audit = pipeline.audit().note(id, &actor, &comment)?;
                    println!("Note {} added (sequence {}).", audit.audit_id, audit.sequence);
                }
                IncidentAction::Export { id, output } => {
                    let n = pipeline.audit().export_jsonl(id, &output).await?;
                    println!("Wrote {} audit entries to {}.", n, output.display());
                }
                IncidentAction::Verify { id } => {
                    let path = pipeline.audit().status_path(id)?;
                    let path: Vec<_> = path.iter().map(|s| s.as_str()).collect();
                    println!("{}", path.join(" -> "));
                }
            }
        }
        Commands::Forecast { action } => {
            let pipeline = Pipeline::open(&config)?;
            match action {
                ForecastAction::Run { machine, metric } => match (machine, metric) {
                    (Some(machine), Some(metric)) => {
                        let outcome = pipeline.forecaster().forecast(&DedupKey::new(machine, metric)).await?;
                        println!("{}", serde_json::to_string_pretty(&outcome)?);
                    }
                    _ => {
                        let report = pipeline.forecaster().run_scan().await?;
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    }
                },
                ForecastAction::List { machine, metric, from, to } => {
                    let now = Utc::now();
                    let from = from.unwrap_or(now - chrono::Duration::hours(24));
                    let to = to.unwrap_or(now + chrono::Duration::hours(24));
                    let series = pipeline.forecaster().series(&DedupKey::new(machine, metric), from, to)?;
                    if series.is_empty() {
                        println!("No forecasts in range.");
                    } else {
                        println!("{:<25} | {:>12} | Confidence", "Forecast time", "Predicted");
                        println!("{:-<25}-|-{:->12}-|-{:-<10}", "", "", "");
                        for f in series {
                            println!(
                                "{:<25} | {:>12.3} | {:.2}",
                                f.forecast_time.to_rfc3339(),
                                f.predicted_value,
                                f.confidence
                            );
                        }
                    }
                }
            }
        }
        Commands::Watch => {
            faultline::watch(&config).await?;
        }
        Commands::Simulate {
            machines,
            metrics,
            readings,
            interval,
            spike_every,
            seed,
        } => {
            let sim = faultline::simulate::Simulation {
                machines,
                metrics,
                readings,
                interval: chrono::Duration::seconds(i64::from(interval)),
                spike_every,
                seed,
                ..Default::default()
            };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for reading in faultline::simulate::generate(&sim) {
                writeln!(out, "{}", serde_json::to_string(&reading)?)?;
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
