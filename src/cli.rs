use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::application::InitBuilder;
use crate::types::{
    DefinitionStatus, EventFilter, ExecuteStepParams, InstanceListFilter, InstanceStatus,
    StartInstanceParams,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence - a workflow definition and execution engine", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// List workflow definitions
    Definitions {
        /// Filter by status (draft, active, archived)
        #[arg(short = 's', long = "status")]
        status: Option<String>,

        /// Number of results
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i32,
    },

    /// Show a definition, including its step graph
    ShowDefinition {
        definition_id: String,
    },

    /// Activate a draft definition (archives the prior active version)
    Activate {
        definition_id: String,
    },

    /// Archive a definition
    Archive {
        definition_id: String,
    },

    /// Start a workflow instance
    Start {
        definition_id: String,

        /// External case reference
        #[arg(long = "case")]
        case_ref: String,

        /// Initial context (JSON object)
        #[arg(long, default_value = "{}")]
        context: String,

        /// Acting user
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Instance priority
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Show an instance with its step instances
    Status {
        instance_id: String,
    },

    /// List workflow instances
    List {
        /// Filter by definition id
        #[arg(short = 'd', long = "definition")]
        definition_id: Option<String>,

        /// Filter by status (running, suspended, completed, cancelled, failed)
        #[arg(short = 's', long = "status")]
        status: Option<String>,

        /// Number of results
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i32,
    },

    /// Complete an active step
    Execute {
        instance_id: String,
        step_instance_id: String,

        /// Action name recorded on the completion
        #[arg(long, default_value = "complete")]
        action: String,

        /// Execution data (JSON object), merged into the context
        #[arg(long, default_value = "{}")]
        data: String,

        /// Acting user
        #[arg(long, default_value = "cli")]
        actor: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Suspend a running instance
    Suspend {
        instance_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume a suspended instance
    Resume {
        instance_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Cancel a running or suspended instance
    Cancel {
        instance_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// List workflow events
    Events {
        /// Filter by instance id
        #[arg(short = 'i', long = "instance")]
        instance_id: Option<String>,

        /// Number of results
        #[arg(short = 'l', long = "limit", default_value = "50")]
        limit: i32,

        #[arg(long, default_value = "0")]
        offset: i32,
    },

    /// Per-day event counts
    Timeline {
        /// Scope to one instance
        #[arg(short = 'i', long = "instance")]
        instance_id: Option<String>,
    },

    /// Event log summary statistics
    Stats,

    /// Run the wait-step timeout watcher until interrupted
    Timers,
}

pub async fn run_cli() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut builder = InitBuilder::new().auto_migrate(matches!(&cli.command, Commands::Migrate));
    if let Some(url) = cli.database_url.clone() {
        builder = builder.database_url(url);
    }
    if let Some(path) = cli.config.clone() {
        builder = builder.config_path(path);
    }
    let app = builder.init().await?;

    match cli.command {
        Commands::Migrate => {
            // Migrations already ran during init.
            println!("Migrations applied");
        }

        Commands::Definitions { status, limit } => {
            let status = status
                .map(|s| parse_enum::<DefinitionStatus>(&s, "status"))
                .transpose()?;
            let definitions = app.definition_service.list(status, limit).await?;
            for def in definitions {
                println!(
                    "{}  {} v{}  [{:?}]  {} steps",
                    def.id,
                    def.name,
                    def.version,
                    def.status,
                    def.steps.len()
                );
            }
        }

        Commands::ShowDefinition { definition_id } => {
            let definition = app
                .definition_service
                .get(&definition_id)
                .await?
                .context("definition not found")?;
            println!("{}", serde_json::to_string_pretty(&definition)?);
        }

        Commands::Activate { definition_id } => {
            let definition = app.definition_service.activate(&definition_id).await?;
            println!("Activated '{}' v{}", definition.name, definition.version);
        }

        Commands::Archive { definition_id } => {
            app.definition_service.archive(&definition_id).await?;
            println!("Archived {definition_id}");
        }

        Commands::Start {
            definition_id,
            case_ref,
            context,
            actor,
            priority,
        } => {
            let context: JsonValue =
                serde_json::from_str(&context).context("context must be valid JSON")?;
            let detail = app
                .engine
                .start(StartInstanceParams {
                    definition_id,
                    case_ref,
                    context,
                    started_by: actor,
                    priority,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }

        Commands::Status { instance_id } => {
            let detail = app.engine.get_instance(&instance_id).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }

        Commands::List {
            definition_id,
            status,
            limit,
        } => {
            let status = status
                .map(|s| parse_enum::<InstanceStatus>(&s, "status"))
                .transpose()?;
            let instances = app
                .engine
                .list_instances(&InstanceListFilter {
                    definition_id,
                    status,
                    limit: Some(limit),
                })
                .await?;
            for instance in instances {
                println!(
                    "{}  case={}  [{:?}]  started {} by {}",
                    instance.id,
                    instance.case_ref,
                    instance.status,
                    instance.started_at.format("%Y-%m-%d %H:%M:%S"),
                    instance.started_by
                );
            }
        }

        Commands::Execute {
            instance_id,
            step_instance_id,
            action,
            data,
            actor,
            comment,
        } => {
            let data: JsonValue = serde_json::from_str(&data).context("data must be valid JSON")?;
            let detail = app
                .engine
                .execute_step(ExecuteStepParams {
                    instance_id,
                    step_instance_id,
                    action,
                    data,
                    executed_by: actor,
                    comment,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }

        Commands::Suspend {
            instance_id,
            actor,
            reason,
        } => {
            let detail = app
                .engine
                .suspend(&instance_id, &actor, reason.as_deref())
                .await?;
            println!("Suspended {} ({:?})", detail.instance.id, detail.instance.status);
        }

        Commands::Resume { instance_id, actor } => {
            let detail = app.engine.resume(&instance_id, &actor).await?;
            println!("Resumed {} ({:?})", detail.instance.id, detail.instance.status);
        }

        Commands::Cancel {
            instance_id,
            actor,
            reason,
        } => {
            let detail = app
                .engine
                .cancel(&instance_id, &actor, reason.as_deref())
                .await?;
            println!("Cancelled {} ({:?})", detail.instance.id, detail.instance.status);
        }

        Commands::Events {
            instance_id,
            limit,
            offset,
        } => {
            let events = app
                .event_service
                .list(&EventFilter {
                    instance_id,
                    event_type: None,
                    limit: Some(limit),
                    offset: Some(offset),
                })
                .await?;
            for event in events {
                println!(
                    "{}  {:?}  instance={}  actor={}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.instance_id,
                    event.actor.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::Timeline { instance_id } => {
            let buckets = app.event_service.timeline(instance_id.as_deref()).await?;
            for bucket in buckets {
                println!("{}  {}", bucket.day.format("%Y-%m-%d"), bucket.count);
            }
        }

        Commands::Stats => {
            let stats = app.event_service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Timers => {
            let watcher = app.timeout_watcher();
            let shutdown = CancellationToken::new();

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            watcher.run(shutdown).await;
        }
    }

    Ok(())
}

/// Parse a lowercase status string through its serde representation.
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> Result<T> {
    serde_json::from_value(JsonValue::String(value.to_string()))
        .with_context(|| format!("invalid {what} '{value}'"))
}
