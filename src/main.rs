//! Grid/DCA Trading Bot CLI
//!
//! Manage activation keys and bots, and run the supervisor against a live or
//! recorded price feed with paper execution.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use gridbot_engine::services::{replay_file, ActivationService, PaperExecutor, PriceFeed};
use gridbot_engine::types::ActivityLogEntry;
use gridbot_engine::{Bot, BotId, BotStatus, BotType, Config, Database, StartBotRequest, Supervisor};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Time for in-flight fills to land after a replay finishes
const REPLAY_SETTLE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "gridbot")]
#[command(about = "DCA and Grid trading bot engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage activation keys
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Create and start a bot from a JSON request file
    Start {
        /// Path to the start request (user, name, pair, key, config)
        #[arg(short, long)]
        config: String,
    },

    /// Recover bots and run them against the price feed until Ctrl-C
    Run {
        /// Replay ticks from a JSON-lines file instead of PRICE_FEED_URL
        #[arg(long)]
        replay: Option<String>,

        /// Delay between replayed ticks in milliseconds
        #[arg(long, default_value = "0")]
        pace_ms: u64,
    },

    /// Pause a running bot
    Pause { bot_id: BotId },

    /// Resume a paused or failed bot
    Resume { bot_id: BotId },

    /// Stop a bot and cancel its open orders
    Stop { bot_id: BotId },

    /// Show one bot or all bots
    Status { bot_id: Option<BotId> },

    /// Show the activity log
    Log {
        /// Only entries for this bot
        #[arg(short, long)]
        bot: Option<BotId>,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Issue new keys
    Generate {
        /// dca or grid
        #[arg(short = 't', long)]
        bot_type: BotType,

        #[arg(short, long, default_value = "1")]
        count: u32,

        #[arg(long, default_value = "admin")]
        admin: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Redeem a key for a user
    Redeem {
        key: String,

        #[arg(short, long)]
        user: String,
    },

    /// Revoke an unused or redeemed key
    Revoke {
        key: String,

        #[arg(long, default_value = "admin")]
        admin: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = Config::from_env()?;
    let db = Arc::new(
        Database::new(&config.database_path)
            .await
            .with_context(|| format!("open database {}", config.database_path))?,
    );

    match cli.command {
        Commands::Keys { command } => run_keys(&config, db, command).await?,
        Commands::Start { config: path } => start_bot(&config, db, &path).await?,
        Commands::Run { replay, pace_ms } => {
            if replay.is_some() {
                // Recorded ticks are old by definition
                config.supervisor.max_tick_age = None;
            }
            run(&config, db, replay, pace_ms).await?
        }
        Commands::Pause { bot_id } => {
            let supervisor = supervisor(&config, db);
            let bot = supervisor.pause_bot(bot_id).await?;
            supervisor.shutdown().await;
            print_bot(&bot);
        }
        Commands::Resume { bot_id } => {
            let supervisor = supervisor(&config, db);
            let bot = supervisor.resume_bot(bot_id).await?;
            supervisor.shutdown().await;
            print_bot(&bot);
        }
        Commands::Stop { bot_id } => {
            let supervisor = supervisor(&config, db);
            let bot = supervisor.stop_bot(bot_id).await?;
            supervisor.shutdown().await;
            print_bot(&bot);
        }
        Commands::Status { bot_id } => match bot_id {
            Some(id) => print_bot(&db.get_bot(id).await?),
            None => print_bots(&db.list_bots().await?),
        },
        Commands::Log { bot, limit } => {
            let entries = match bot {
                Some(id) => db.activity_for_bot(id, limit).await?,
                None => db.recent_activity(limit).await?,
            };
            print_log(&entries);
        }
    }

    Ok(())
}

/// Supervisor with paper execution and its fill router running
fn supervisor(config: &Config, db: Arc<Database>) -> Arc<Supervisor> {
    let (executor, fills) = PaperExecutor::new(config.taker_fee_rate(), config.supervisor.queue_capacity);
    let supervisor = Arc::new(Supervisor::new(db, Arc::new(executor), config.supervisor.clone()));
    supervisor.spawn_fill_router(fills);
    supervisor
}

async fn run_keys(config: &Config, db: Arc<Database>, command: KeyCommands) -> Result<()> {
    let keys = ActivationService::new(db, config.supervisor.key_generation_attempts);

    match command {
        KeyCommands::Generate {
            bot_type,
            count,
            admin,
            notes,
        } => {
            let generated = keys.generate(bot_type, &admin, notes.as_deref(), count).await?;
            println!("\n{} {} key(s):", "Generated".green().bold(), bot_type);
            for key in generated {
                println!("  {}", key.key);
            }
            println!();
        }
        KeyCommands::Redeem { key, user } => {
            let redeemed = keys.redeem(&key, &user).await?;
            println!(
                "{} {} key for {}",
                "Redeemed".green().bold(),
                redeemed.bot_type,
                user
            );
        }
        KeyCommands::Revoke { key, admin } => {
            keys.revoke(&key, &admin).await?;
            println!("{} {}", "Revoked".yellow().bold(), key);
        }
    }

    Ok(())
}

async fn start_bot(config: &Config, db: Arc<Database>, path: &str) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read start request {}", path))?;
    let request: StartBotRequest =
        serde_json::from_str(&raw).with_context(|| format!("parse start request {}", path))?;

    let supervisor = supervisor(config, db);
    let bot = supervisor.start_bot(request).await?;
    supervisor.shutdown().await;

    println!("\n{} bot {}", "Started".green().bold(), bot.id);
    print_bot(&bot);
    println!("Use `gridbot run` to trade it against the price feed.\n");
    Ok(())
}

async fn run(config: &Config, db: Arc<Database>, replay: Option<String>, pace_ms: u64) -> Result<()> {
    println!("\n{}", "=".repeat(70));
    println!("  GRIDBOT ENGINE");
    println!(
        "  Feed: {} | Execution: paper ({} bps)",
        replay
            .as_deref()
            .map(|p| format!("replay {}", p))
            .or_else(|| config.price_feed_url.clone())
            .unwrap_or_else(|| "none".to_string()),
        config.taker_fee_bps
    );
    println!("{}\n", "=".repeat(70));

    let supervisor = supervisor(config, db.clone());
    let recovered = supervisor.recover().await?;
    info!("{} bot(s) running", recovered);

    let (tick_tx, mut tick_rx) = mpsc::channel(config.supervisor.price_channel_capacity);
    let feed = match (replay, config.price_feed_url.clone()) {
        (Some(path), _) => {
            let pace = (pace_ms > 0).then(|| Duration::from_millis(pace_ms));
            tokio::spawn(async move {
                if let Err(e) = replay_file(&path, tick_tx, pace).await {
                    warn!("Replay failed: {:#}", e);
                }
            })
        }
        (None, Some(url)) => {
            let pairs: BTreeSet<String> = db
                .bots_with_status(&[BotStatus::Running, BotStatus::Paused])
                .await?
                .into_iter()
                .map(|b| b.pair)
                .collect();
            let metrics = supervisor.metrics_handle();
            tokio::spawn(PriceFeed::run(url, pairs.into_iter().collect(), tick_tx, metrics))
        }
        (None, None) => anyhow::bail!("Set PRICE_FEED_URL or pass --replay <file>"),
    };

    println!("Running (Ctrl+C to stop)...\n");
    loop {
        tokio::select! {
            tick = tick_rx.recv() => match tick {
                Some(tick) => supervisor.on_price_tick(tick).await,
                None => {
                    info!("Price feed finished");
                    tokio::time::sleep(REPLAY_SETTLE).await;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    feed.abort();
    supervisor.shutdown().await;

    let m = supervisor.metrics();
    println!("\n{}", "-".repeat(70));
    println!(
        "Ticks: {} received, {} dropped | Orders: {} submitted ({} retries), {} filled, {} rejected, {} cancelled",
        m.ticks_received,
        m.ticks_dropped,
        m.orders_submitted,
        m.order_retries,
        m.orders_filled,
        m.orders_rejected,
        m.orders_cancelled
    );
    print_bots(&db.list_bots().await?);
    Ok(())
}

fn status_label(status: BotStatus) -> colored::ColoredString {
    match status {
        BotStatus::Running => status.as_str().green(),
        BotStatus::Paused => status.as_str().yellow(),
        BotStatus::Stopped => status.as_str().dimmed(),
        BotStatus::Error => status.as_str().red().bold(),
    }
}

fn print_bot(bot: &Bot) {
    println!("\n#{} \"{}\" ({} {} for {})", bot.id, bot.name, bot.bot_type, bot.pair, bot.user_id);
    println!("   Status:   {}", status_label(bot.status));
    if let Some(err) = &bot.error_message {
        println!("   Error:    {}", err.red());
    }
    println!(
        "   Invested: {:.2} | Value: {:.2} | PnL: {:.2} | Trades: {}",
        bot.invested_amount, bot.current_value, bot.total_pnl, bot.trade_count
    );
    println!("   Updated:  {}", bot.updated_at.format("%Y-%m-%d %H:%M:%S"));
}

fn print_bots(bots: &[Bot]) {
    if bots.is_empty() {
        println!("No bots yet.\n");
        return;
    }
    println!(
        "{:>4}  {:<20} {:<5} {:<12} {:<8} {:>12} {:>12} {:>7}",
        "ID", "NAME", "TYPE", "PAIR", "STATUS", "VALUE", "PNL", "TRADES"
    );
    println!("{}", "-".repeat(90));
    for bot in bots {
        let name: String = bot.name.chars().take(20).collect();
        let pnl = format!("{:.2}", bot.total_pnl);
        let pnl = if bot.total_pnl.is_sign_negative() { pnl.red() } else { pnl.green() };
        println!(
            "{:>4}  {:<20} {:<5} {:<12} {:<8} {:>12.2} {:>12} {:>7}",
            bot.id,
            name,
            bot.bot_type.as_str(),
            bot.pair,
            status_label(bot.status),
            bot.current_value,
            pnl,
            bot.trade_count
        );
    }
    println!();
}

fn print_log(entries: &[ActivityLogEntry]) {
    if entries.is_empty() {
        println!("No activity.\n");
        return;
    }
    for entry in entries {
        let bot = entry
            .bot_id
            .map(|id| format!("#{}", id))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:>5}  {:<22} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            bot,
            entry.action.cyan(),
            entry.details
        );
    }
    println!();
}
