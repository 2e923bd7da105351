use std::sync::Arc;

use clap::Parser;
use ember_core::{EmberConfig, Settings};
use ember_events::{AppEvent, EventBus};
use ember_scheduler::JobManager;
use tracing::{info, warn};

mod jobs;

#[derive(Parser)]
#[command(author, version, about = "Ember application host", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Run the startup sequence, print the job registry as JSON and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember_app=info,ember_scheduler=info,ember_events=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > EMBER_CONFIG env > ./ember.toml
    let config_path = cli.config.or_else(|| std::env::var("EMBER_CONFIG").ok());
    let settings = Settings::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        Settings::from_config(EmberConfig::default())
    });
    let settings = Arc::new(settings);

    let bus = Arc::new(EventBus::new());
    let manager = JobManager::builder(&settings.config.jobs)
        .instance_id(settings.config.app.instance_id.clone())
        .placeholders(settings.clone())
        .build(&bus)?;
    info!(
        app = %settings.config.app.name,
        instance_id = manager.instance_id(),
        pool_size = settings.config.jobs.pool_size,
        "application starting"
    );

    jobs::register(&manager, &settings)?;

    // Lifecycle dispatch runs "before" work inline; keep it off the async workers.
    let startup = Arc::clone(&bus);
    tokio::task::spawn_blocking(move || startup.emit_all_through(AppEvent::Start)).await?;

    if cli.check {
        println!("{}", serde_json::to_string_pretty(&manager.jobs())?);
    } else {
        info!("application started, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    let stopping = Arc::clone(&bus);
    tokio::task::spawn_blocking(move || stopping.emit(AppEvent::Stop)).await?;
    // Waits up to the shutdown grace period for running jobs.
    tokio::task::spawn_blocking(move || manager.shutdown()).await?;
    info!("application stopped");
    Ok(())
}
