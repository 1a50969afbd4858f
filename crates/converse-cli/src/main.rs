// ============================================================================
// converse - chat with the reranking context manager and inspect its state
// ============================================================================
// Usage:
//   converse chat --user alice               Interactive chat (/rate <id> <label>)
//   converse health                          Probe completion, embedding, store
//   converse models list                     List stored ranking models
//   converse models show --user alice        Details for one model
//   converse models delete --user alice      Delete a model and its training log
//   converse train --user alice --file s.json  Batch-train from [{text,label}]
//   converse retrain --user alice            Replay the logged feedback
//   converse stats                           Database statistics
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use converse_core::{ConverseConfig, ConverseDb, ConverseService, TextSample, TurnOutcome};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Converse: conversational context manager with per-user reranking
#[derive(Parser)]
#[command(name = "converse", version, about = "Chat with per-user reranked responses and manage learned models")]
struct Cli {
    /// Path to the database file (default: ~/.converse/converse.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat session
    Chat {
        #[arg(long)]
        user: String,

        /// Conversation id (default: a fresh one)
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Probe the completion service, embedding service and model store
    Health,

    /// Inspect or delete stored ranking models
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Batch-train a user's model from a JSON file of {"text", "label"} samples
    Train {
        #[arg(long)]
        user: String,

        #[arg(long)]
        file: String,
    },

    /// Retrain a user's model from their logged feedback
    Retrain {
        #[arg(long)]
        user: String,
    },

    /// Show database statistics
    Stats,
}

#[derive(Subcommand)]
enum ModelsAction {
    /// List every stored model
    List,

    /// Show one user's model and training log
    Show {
        #[arg(long)]
        user: String,
    },

    /// Delete a user's model and training log
    Delete {
        #[arg(long)]
        user: String,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("converse=info".parse()?)
                .add_directive("converse_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConverseConfig::from_env()?;
    let db_path = cli.db_path.clone().or_else(|| config.db_path.clone());
    let db = ConverseDb::open(db_path.as_deref())?;

    match cli.command {
        Commands::Chat { user, conversation } => cmd_chat(&config, db, &user, conversation).await,
        Commands::Health => cmd_health(&config, db, cli.json).await,
        Commands::Models { action } => match action {
            ModelsAction::List => cmd_models_list(&db, cli.json),
            ModelsAction::Show { user } => cmd_models_show(&db, &user, cli.json),
            ModelsAction::Delete { user } => cmd_models_delete(&db, &user),
        },
        Commands::Train { user, file } => cmd_train(&config, db, &user, &file, cli.json).await,
        Commands::Retrain { user } => cmd_retrain(&config, db, &user, cli.json).await,
        Commands::Stats => cmd_stats(&db, cli.json),
    }
}

async fn cmd_chat(config: &ConverseConfig, db: ConverseDb, user: &str, conversation: Option<String>) -> Result<()> {
    let service = ConverseService::from_config(config, db)?;
    let maintenance = service.spawn_maintenance();
    let conversation = conversation.unwrap_or_else(|| Uuid::new_v4().to_string());

    info!("Chatting as {} in conversation {}", user, conversation);
    println!("Conversation {}: type /rate <id> <label> to give feedback, /quit to exit", conversation);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        if let Some(args) = line.strip_prefix("/rate") {
            match parse_rating(args) {
                Ok((response_id, label)) => match service.feedback(response_id, label).await {
                    Ok(ack) if ack.accepted => match ack.loss {
                        Some(loss) => println!("[feedback applied, loss {:.4}]", loss),
                        None => println!("[feedback applied]"),
                    },
                    Ok(_) => println!("[unknown or expired response id]"),
                    Err(e) => println!("[{}]", e),
                },
                Err(e) => println!("[{}]", e),
            }
            continue;
        }

        let response = service.turn(user, &conversation, line).await?;
        println!("{}", response.response_text);
        match response.outcome {
            TurnOutcome::Ranked { score, considered } => println!(
                "  [id {} | score {:.3} of {} candidates]",
                response.response_id, score, considered
            ),
            TurnOutcome::Degraded { reason } => {
                println!("  [id {} | degraded: {:?}]", response.response_id, reason)
            }
        }
    }

    maintenance.stop().await;
    service.shutdown().await;
    Ok(())
}

fn parse_rating(args: &str) -> Result<(Uuid, f32)> {
    let mut parts = args.split_whitespace();
    let id = parts.next().ok_or_else(|| anyhow!("usage: /rate <response id> <label 0..1>"))?;
    let label = parts.next().ok_or_else(|| anyhow!("usage: /rate <response id> <label 0..1>"))?;
    let id = Uuid::parse_str(id).map_err(|e| anyhow!("bad response id: {}", e))?;
    let label: f32 = label.parse().map_err(|e| anyhow!("bad label: {}", e))?;
    Ok((id, label))
}

async fn cmd_health(config: &ConverseConfig, db: ConverseDb, json: bool) -> Result<()> {
    let service = ConverseService::from_config(config, db)?;
    let report = service.health().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== Converse Health ===");
    println!("Completion:  {}", report.completion);
    println!("Embedding:   {}", report.embedding);
    println!("Model store: {}", report.model_store);
    println!("Cached models: {}", report.cached_models);

    if !report.is_healthy() {
        anyhow::bail!("one or more services are unavailable");
    }
    Ok(())
}

fn cmd_models_list(db: &ConverseDb, json: bool) -> Result<()> {
    let models = db.list_models()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }
    if models.is_empty() {
        println!("No models stored.");
        return Ok(());
    }

    println!("{:<36}  {:>10}  {:>6}  {:>10}", "USER", "STEPS", "DIM", "BYTES");
    println!("{}", "-".repeat(68));
    for model in &models {
        println!(
            "{:<36}  {:>10}  {:>6}  {:>10}",
            model.user_id,
            model.train_steps.map_or("corrupt".to_string(), |s| s.to_string()),
            model.dim.map_or("-".to_string(), |d| d.to_string()),
            model.bytes
        );
    }
    println!("\n{} model(s)", models.len());
    Ok(())
}

fn cmd_models_show(db: &ConverseDb, user: &str, json: bool) -> Result<()> {
    let info = db.list_models()?.into_iter().find(|m| m.user_id == user);
    let samples = db.list_samples(user)?;

    if json {
        let export = serde_json::json!({
            "model": info,
            "logged_samples": samples.len(),
            "last_feedback_at": samples.last().map(|s| s.recorded_at),
        });
        println!("{}", serde_json::to_string_pretty(&export)?);
        return Ok(());
    }

    println!("=== Model: {} ===", user);
    match info {
        Some(info) => {
            println!("Stored:        {} bytes", info.bytes);
            match (info.train_steps, info.dim) {
                (Some(steps), Some(dim)) => {
                    println!("Train steps:   {}", steps);
                    println!("Dimension:     {}", dim);
                }
                _ => println!("State:         unreadable (will be reinitialised on next use)"),
            }
        }
        None => println!("Stored:        no model"),
    }

    let positive = samples.iter().filter(|s| s.label >= 0.5).count();
    println!(
        "Training log:  {} samples ({} positive, {} negative)",
        samples.len(),
        positive,
        samples.len() - positive
    );
    if let Some(last) = samples.last() {
        println!("Last feedback: {}", format_timestamp(last.recorded_at));
    }
    Ok(())
}

fn cmd_models_delete(db: &ConverseDb, user: &str) -> Result<()> {
    let removed = db.delete_model(user)?;
    let samples = db.clear_samples(user)?;

    if removed {
        println!("Deleted model for {} and {} logged samples.", user, samples);
    } else {
        println!("No model stored for {} ({} logged samples removed).", user, samples);
    }
    Ok(())
}

async fn cmd_train(config: &ConverseConfig, db: ConverseDb, user: &str, file: &str, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file).map_err(|e| anyhow!("Failed to read {}: {}", file, e))?;
    let samples: Vec<TextSample> =
        serde_json::from_str(&raw).map_err(|e| anyhow!("Failed to parse {}: {}", file, e))?;

    let service = ConverseService::from_config(config, db)?;
    let summary = service.batch_train(user, samples).await?;
    service.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Trained {} on {} samples (avg loss {:.4})", user, summary.trained, summary.avg_loss);
    }
    Ok(())
}

async fn cmd_retrain(config: &ConverseConfig, db: ConverseDb, user: &str, json: bool) -> Result<()> {
    let service = ConverseService::from_config(config, db)?;
    let summary = service.retrain_from_log(user).await?;
    service.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if summary.trained == 0 {
        println!("No logged feedback for {}.", user);
    } else {
        println!(
            "Retrained {} on {} logged samples (avg loss {:.4})",
            user, summary.trained, summary.avg_loss
        );
    }
    Ok(())
}

fn cmd_stats(db: &ConverseDb, json: bool) -> Result<()> {
    let stats = db.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("=== Converse Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Models:          {}", stats.total_models);
    println!("Logged samples:  {}", stats.total_samples);
    println!("Users with logs: {}", stats.users_with_samples);
    Ok(())
}
