//! captura - court portal capture and recovery
//!
//! Operator CLI over a DuckDB database: register credentials and portals,
//! run and audit capture batches, reconcile recorded payloads, inspect rate
//! limits and run schedules.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use captura_core::{
    CapturaConfig, CaptureStatus, CaptureType, Credential, CustomTimeouts, ElementFilter,
    ExtractionMode, FailMode, InstanceLevel, NewSchedule, Periodicity, TribunalCode,
    TribunalConfig, next_run_after, parse_time_of_day,
};
use captura_core::ports::ScheduleStore;
use captura_engine::{
    CaptureOrchestrator, CaptureRequest, ElementReconciler, RateLimitConfig, RateLimiter,
    Scheduler, Scope, Tier,
};
use captura_portal::{ApiCapturePerformer, EnvSecretResolver, PortalAuthenticator};
use captura_store::DuckStore;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod display;

/// captura - court portal capture and recovery
#[derive(Parser, Debug)]
#[command(name = "captura")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the DuckDB database
    #[arg(long, env = "CAPTURA_DB", default_value = "captura.duckdb", global = true)]
    db: PathBuf,

    /// Rate limiter behaviour when its store is unreachable (open, closed)
    #[arg(long, env = "RATE_LIMIT_FAIL_MODE", default_value = "closed", global = true)]
    fail_mode: FailMode,

    /// Portal login timeout in milliseconds
    #[arg(long, env = "CAPTURA_AUTH_TIMEOUT_MS", default_value_t = 30_000, global = true)]
    auth_timeout_ms: u64,

    /// Capture batches allowed to run at once
    #[arg(long, env = "CAPTURA_MAX_BATCHES", default_value_t = 4, global = true)]
    max_batches: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database and apply the schema
    Init,

    /// Portal credentials
    #[command(subcommand)]
    Credential(CredentialCommands),

    /// Portal endpoints per tribunal and instance
    #[command(subcommand)]
    Tribunal(TribunalCommands),

    /// Run and audit capture batches
    #[command(subcommand)]
    Capture(CaptureCommands),

    /// Reconcile recorded payloads against the live store
    #[command(subcommand)]
    Recovery(RecoveryCommands),

    /// Inspect and reset rate-limit windows
    #[command(subcommand)]
    RateLimit(RateLimitCommands),

    /// Recurring captures
    #[command(subcommand)]
    Schedule(ScheduleCommands),
}

#[derive(Subcommand, Debug)]
enum CredentialCommands {
    /// Register a credential
    Add {
        id: i64,
        #[arg(long)]
        advogado: i64,
        #[arg(long)]
        tribunal: TribunalCode,
        #[arg(long, default_value = "primeiro_grau")]
        grau: InstanceLevel,
        /// Secret reference, e.g. env:TRT2_SECRET
        #[arg(long)]
        secret_ref: String,
    },
}

#[derive(Subcommand, Debug)]
enum TribunalCommands {
    /// Register or replace a portal configuration
    Add {
        tribunal: TribunalCode,
        #[arg(long, default_value = "primeiro_grau")]
        grau: InstanceLevel,
        #[arg(long, default_value = "PJE")]
        sistema: String,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        login_url: String,
        #[arg(long)]
        api_url: String,
        #[arg(long)]
        login_timeout_ms: Option<u64>,
        #[arg(long)]
        api_timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum CaptureCommands {
    /// Start a capture batch
    Start {
        /// Capture type (acervo_geral, arquivados, audiencias, pendentes, partes, ...)
        tipo: CaptureType,
        #[arg(long)]
        advogado: i64,
        /// Credential ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        credentials: Vec<i64>,
        /// JSON object passed to the performer
        #[arg(long)]
        params: Option<String>,
        /// Print the final log once the batch finishes
        #[arg(long)]
        wait: bool,
    },

    /// Show one capture log
    Log { id: i64 },

    /// Recent capture logs
    History {
        #[arg(long)]
        advogado: Option<i64>,
        #[arg(long)]
        tipo: Option<CaptureType>,
        #[arg(long)]
        status: Option<CaptureStatus>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Audit rows of one capture log
    Raw { log_id: i64 },
}

#[derive(Subcommand, Debug)]
enum RecoveryCommands {
    /// Classify the elements of a raw capture
    Elements {
        external_id: String,
        #[arg(long, default_value = "todos")]
        filter: ElementFilter,
        #[arg(long, default_value = "generico")]
        mode: ExtractionMode,
    },

    /// Re-persist one element
    Repersist {
        external_id: String,
        identifier: String,
    },

    /// Re-persist every missing element
    RepersistMissing { external_id: String },
}

#[derive(Subcommand, Debug)]
enum RateLimitCommands {
    /// Record one request and show the verdict
    Check {
        identifier: String,
        #[arg(long, default_value = "anonymous")]
        tier: Tier,
        #[arg(long, conflicts_with = "tool")]
        endpoint: Option<String>,
        #[arg(long)]
        tool: Option<String>,
    },

    /// Show the verdict a check would get, without recording
    Status {
        identifier: String,
        #[arg(long, default_value = "anonymous")]
        tier: Tier,
        #[arg(long, conflicts_with = "tool")]
        endpoint: Option<String>,
        #[arg(long)]
        tool: Option<String>,
    },

    /// Clear every window of an identifier
    Reset {
        identifier: String,
        #[arg(long, default_value = "anonymous")]
        tier: Tier,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// Add a recurring capture
    Add {
        tipo: CaptureType,
        #[arg(long)]
        advogado: i64,
        #[arg(long, value_delimiter = ',', required = true)]
        credentials: Vec<i64>,
        /// diario or a_cada_<n>_dias
        #[arg(long, default_value = "diario")]
        periodicidade: Periodicity,
        /// HH:MM, UTC
        #[arg(long)]
        horario: String,
        #[arg(long)]
        params: Option<String>,
    },

    /// Fire due schedules
    Run {
        /// Fire what is due now and exit
        #[arg(long)]
        once: bool,
    },
}

fn scope<'a>(endpoint: &'a Option<String>, tool: &'a Option<String>) -> Scope<'a> {
    match (endpoint, tool) {
        (Some(path), _) => Scope::Endpoint(path),
        (None, Some(tool)) => Scope::Tool(tool),
        (None, None) => Scope::Generic,
    }
}

fn parse_params(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("parsing --params as JSON")?;
    if !value.is_object() {
        bail!("--params must be a JSON object");
    }
    Ok(value)
}

fn orchestrator(store: &Arc<DuckStore>, config: &CapturaConfig) -> CaptureOrchestrator {
    let authenticator = Arc::new(PortalAuthenticator::new(Arc::new(EnvSecretResolver)));
    CaptureType::ALL
        .into_iter()
        .fold(
            CaptureOrchestrator::builder(
                store.clone(),
                store.clone(),
                authenticator,
                store.clone(),
                store.clone(),
            )
            .config(config.clone()),
            |builder, t| builder.performer(t, Arc::new(ApiCapturePerformer::new(t))),
        )
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = CapturaConfig {
        auth_timeout: Duration::from_millis(cli.auth_timeout_ms),
        max_concurrent_batches: cli.max_batches,
        rate_limit_fail_mode: cli.fail_mode,
        ..CapturaConfig::default()
    };

    let store = Arc::new(
        DuckStore::open_persistent(&cli.db)
            .with_context(|| format!("opening {}", cli.db.display()))?,
    );

    match cli.command {
        Commands::Init => {
            println!("Database ready at {}", cli.db.display());
        }

        Commands::Credential(CredentialCommands::Add {
            id,
            advogado,
            tribunal,
            grau,
            secret_ref,
        }) => {
            let credential = Credential {
                id,
                advogado_id: advogado,
                tribunal,
                instance: grau,
                secret_ref,
            };
            store
                .insert_credential(&credential)
                .context("inserting credential")?;
            println!(
                "Credential {} added ({} {})",
                credential.id, credential.tribunal, credential.instance
            );
        }

        Commands::Tribunal(TribunalCommands::Add {
            tribunal,
            grau,
            sistema,
            base_url,
            login_url,
            api_url,
            login_timeout_ms,
            api_timeout_ms,
        }) => {
            let config = TribunalConfig {
                tribunal,
                instance: grau,
                system: sistema,
                base_url,
                login_url,
                api_url,
                custom_timeouts: CustomTimeouts {
                    login_ms: login_timeout_ms,
                    api_ms: api_timeout_ms,
                },
            };
            store
                .insert_tribunal_config(&config)
                .context("saving tribunal configuration")?;
            println!("Tribunal {} {} configured", config.tribunal, config.instance);
        }

        Commands::Capture(cmd) => capture(cmd, &store, &config).await?,
        Commands::Recovery(cmd) => recovery(cmd, &store).await?,

        Commands::RateLimit(cmd) => {
            let limiter = RateLimiter::new(
                store.clone(),
                RateLimitConfig::default().with_fail_mode(config.rate_limit_fail_mode),
            );
            let now = Utc::now();
            match cmd {
                RateLimitCommands::Check {
                    identifier,
                    tier,
                    endpoint,
                    tool,
                } => {
                    let result = limiter
                        .check_at(&identifier, tier, scope(&endpoint, &tool), now)
                        .await;
                    display::print_rate_limit(&result, now);
                }
                RateLimitCommands::Status {
                    identifier,
                    tier,
                    endpoint,
                    tool,
                } => {
                    let result = limiter
                        .status(&identifier, tier, scope(&endpoint, &tool), now)
                        .await;
                    display::print_rate_limit(&result, now);
                }
                RateLimitCommands::Reset { identifier, tier } => {
                    limiter.reset(&identifier, tier).await;
                    println!("Rate-limit windows cleared for {tier}:{identifier}");
                }
            }
        }

        Commands::Schedule(cmd) => schedule(cmd, &store, &config).await?,
    }

    Ok(())
}

async fn capture(cmd: CaptureCommands, store: &Arc<DuckStore>, config: &CapturaConfig) -> Result<()> {
    let orchestrator = orchestrator(store, config);
    match cmd {
        CaptureCommands::Start {
            tipo,
            advogado,
            credentials,
            params,
            wait,
        } => {
            let ack = orchestrator
                .start_capture(CaptureRequest {
                    capture_type: tipo,
                    advogado_id: advogado,
                    credential_ids: credentials,
                    params: parse_params(params.as_deref())?,
                })
                .await
                .context("starting capture")?;
            println!("Capture log {} started", ack.log_id);

            // The batch runs on this process's runtime; leaving early would
            // abandon it in_progress.
            orchestrator.drain().await;
            if wait {
                let log = orchestrator.get_capture_log(ack.log_id).await?;
                display::print_capture_log(&log);
            }
        }

        CaptureCommands::Log { id } => {
            let log = orchestrator.get_capture_log(id).await?;
            display::print_capture_log(&log);
        }

        CaptureCommands::History {
            advogado,
            tipo,
            status,
            limit,
        } => {
            let mut filters = Vec::new();
            if let Some(id) = advogado {
                filters.push(format!("advogado_id = {id}"));
            }
            if let Some(t) = tipo {
                filters.push(format!("tipo_captura = '{}'", t.as_str()));
            }
            if let Some(s) = status {
                filters.push(format!("status = '{}'", s.as_str()));
            }
            let predicate = if filters.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", filters.join(" AND "))
            };
            let sql = format!(
                "SELECT id, tipo_captura, advogado_id, credencial_ids, status, criado_em, \
                 finalizado_em, erro FROM capture_logs {predicate} ORDER BY id DESC LIMIT {limit}"
            );
            let batches = store.query_arrow(&sql).context("querying capture history")?;
            let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
            if rows == 0 {
                println!("No capture logs.");
            } else {
                arrow::util::pretty::print_batches(&batches)?;
                println!("{rows} log(s)");
            }
        }

        CaptureCommands::Raw { log_id } => {
            let records = orchestrator.raw_records(log_id).await?;
            display::print_raw_records(&records);
        }
    }
    Ok(())
}

async fn recovery(cmd: RecoveryCommands, store: &Arc<DuckStore>) -> Result<()> {
    let reconciler = ElementReconciler::new(store.clone(), store.clone());
    match cmd {
        RecoveryCommands::Elements {
            external_id,
            filter,
            mode,
        } => {
            let report = reconciler.extract_elements(&external_id, filter, mode).await;
            display::print_elements(&report);
        }
        RecoveryCommands::Repersist {
            external_id,
            identifier,
        } => {
            let outcome = reconciler
                .repersist_element(&external_id, &identifier)
                .await
                .with_context(|| format!("re-persisting {identifier}"))?;
            println!(
                "{} -> record {} ({})",
                outcome.identifier,
                outcome.record_id,
                if outcome.created { "created" } else { "updated" }
            );
        }
        RecoveryCommands::RepersistMissing { external_id } => {
            let attempts = reconciler
                .repersist_missing(&external_id)
                .await
                .with_context(|| format!("re-persisting missing elements of {external_id}"))?;
            println!("{}", serde_json::to_string_pretty(&attempts)?);
        }
    }
    Ok(())
}

async fn schedule(cmd: ScheduleCommands, store: &Arc<DuckStore>, config: &CapturaConfig) -> Result<()> {
    match cmd {
        ScheduleCommands::Add {
            tipo,
            advogado,
            credentials,
            periodicidade,
            horario,
            params,
        } => {
            let time_of_day = parse_time_of_day(&horario)?;
            let created = store
                .create(NewSchedule {
                    capture_type: tipo,
                    advogado_id: advogado,
                    credential_ids: credentials,
                    periodicity: periodicidade,
                    time_of_day,
                    params: parse_params(params.as_deref())?,
                    active: true,
                    next_run: next_run_after(periodicidade, time_of_day, Utc::now()),
                })
                .await
                .context("creating schedule")?;
            println!("Schedule {} added, next run {}", created.id, created.next_run);
        }

        ScheduleCommands::Run { once } => {
            let orchestrator = Arc::new(orchestrator(store, config));
            let scheduler = Scheduler::new(store.clone(), orchestrator.clone());
            if once {
                let runs = scheduler.run_due(Utc::now()).await?;
                println!("{}", serde_json::to_string_pretty(&runs)?);
                orchestrator.drain().await;
            } else {
                info!(
                    poll_secs = config.scheduler_poll_interval.as_secs(),
                    "scheduler running"
                );
                scheduler.run(config.scheduler_poll_interval).await;
            }
        }
    }
    Ok(())
}
