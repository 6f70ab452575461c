//! # CourseHub
//!
//! Weekly activity compliance tracking for course facilitators: HTTP API,
//! reminder and overdue alert scheduling, and email delivery.
//!
//! Usage:
//!   coursehub serve                 # HTTP API + notification worker
//!   coursehub worker                # Notification worker only
//!   coursehub sweep                 # Queue due reminders and overdue alerts once
//!   coursehub queue-stats           # Print job counts
//!   coursehub clean-queue           # Recover stalled jobs and apply retention
//!   coursehub init-config           # Write a default config file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coursehub_core::config::expand_path;
use coursehub_core::{Clock, CourseHubConfig, SystemClock};
use coursehub_queue::{JobQueue, RetentionPolicy, RetryPolicy};
use coursehub_scheduler::{Dispatcher, NotificationWorker, Scheduler};
use coursehub_tracker::{ActivityLogService, SqliteDirectory, TrackerDb};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "coursehub",
    version,
    about = "📚 CourseHub: activity log compliance tracking and notifications"
)]
struct Cli {
    /// Config file (default: ~/.coursehub/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the notification worker
    Serve,
    /// Run the notification worker without the HTTP API
    Worker,
    /// Queue due reminders and overdue alerts once, then exit
    Sweep,
    /// Print notification queue counts
    QueueStats,
    /// Requeue stalled jobs and remove old finished ones
    CleanQueue,
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

struct App {
    service: Arc<ActivityLogService>,
    scheduler: Arc<Scheduler>,
    worker: Arc<NotificationWorker>,
    queue: Arc<JobQueue>,
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(CourseHubConfig::default_path)
}

fn load_config(path: &Path) -> Result<CourseHubConfig> {
    if path.exists() {
        Ok(CourseHubConfig::load_from(path)?)
    } else {
        tracing::info!("No config at {}, using defaults", path.display());
        Ok(CourseHubConfig::parse("")?)
    }
}

fn build_app(config: &CourseHubConfig) -> Result<App> {
    let db_path = expand_path(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tracker = Arc::new(TrackerDb::open(&db_path)?);
    let directory = Arc::new(SqliteDirectory::open(&db_path)?);
    let queue = Arc::new(JobQueue::open(
        &db_path,
        clock.clone(),
        RetryPolicy::from_config(&config.queue),
    )?);

    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        tracker.clone(),
        clock.clone(),
        chrono::Duration::hours(config.scheduler.reminder_lead_hours),
    ));
    let service = Arc::new(
        ActivityLogService::new(tracker.clone(), directory.clone(), clock.clone())
            .with_observer(scheduler.clone()),
    );
    let mailer = coursehub_channels::from_config(&config.email)?;
    let dispatcher = Arc::new(Dispatcher::new(
        tracker,
        directory,
        mailer,
        clock.clone(),
        &config.frontend_url,
    ));
    let worker = Arc::new(NotificationWorker::new(
        scheduler.clone(),
        dispatcher,
        clock,
        config.scheduler.clone(),
        config.queue.clone(),
    ));

    tracing::info!("🗄️ Database: {}", db_path.display());
    Ok(App {
        service,
        scheduler,
        worker,
        queue,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "coursehub=debug,coursehub_core=debug,coursehub_tracker=debug,coursehub_queue=debug,\
         coursehub_scheduler=debug,coursehub_channels=debug,coursehub_gateway=debug,tower_http=debug"
    } else {
        "coursehub=info,coursehub_tracker=info,coursehub_queue=info,coursehub_scheduler=info,\
         coursehub_channels=info,coursehub_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);

    if let Command::InitConfig { force } = cli.command {
        if path.exists() && !force {
            println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
            return Ok(());
        }
        CourseHubConfig::default().save_to(&path)?;
        println!("✅ Default config written to {}", path.display());
        return Ok(());
    }

    let config = load_config(&path)?;
    let app = build_app(&config)?;

    match cli.command {
        Command::Serve => {
            app.worker.start().await?;
            println!("📚 CourseHub v{}", env!("CARGO_PKG_VERSION"));
            println!("   🌐 API:    http://{}:{}/api/v1", config.gateway.host, config.gateway.port);
            println!("   ❤️  Health: http://{}:{}/health", config.gateway.host, config.gateway.port);
            println!();
            let state = coursehub_gateway::AppState::new(app.service.clone(), app.worker.clone(), app.queue.clone());
            let served = coursehub_gateway::start(&config.gateway, state, shutdown_signal()).await;
            if !app.worker.stop().await {
                tracing::warn!("⚠️ Some notification jobs were still running at shutdown");
            }
            served?;
        }
        Command::Worker => {
            app.worker.start().await?;
            shutdown_signal().await;
            if !app.worker.stop().await {
                tracing::warn!("⚠️ Some notification jobs were still running at shutdown");
            }
        }
        Command::Sweep => {
            let report = app.scheduler.sweep()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::QueueStats => {
            let stats = app.queue.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::CleanQueue => {
            let stalled = app.queue.requeue_stalled(chrono::Duration::seconds(
                config.queue.stall_timeout_secs as i64,
            ))?;
            let cleaned = app.queue.clean(&RetentionPolicy::from_config(&config.queue))?;
            println!(
                "🧹 {} stalled job(s) requeued, {} completed and {} failed job(s) removed",
                stalled.len(),
                cleaned.completed_removed,
                cleaned.failed_removed
            );
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
