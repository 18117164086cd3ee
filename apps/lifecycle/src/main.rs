use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lifecycle_service::config::Config;
use lifecycle_service::db::LifecycleDb;
use lifecycle_service::{build_engine, serve};

#[derive(Parser, Debug)]
#[command(name = "lifecycle-service", about = "Subscription and token lifecycle service")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until ctrl-c (default).
    Serve,
    /// Run the subscription expiration sweep once and print the report.
    Sweep,
    /// Run one registered task now and print its outcome.
    Trigger { task_id: String },
    /// Print every registered task with its recent audit history.
    Tasks,
    /// Apply the database schema and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load lifecycle config")?;
    init_tracing(config.log_json);

    match Args::parse().command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Sweep => {
            let engine = build_engine(config).await?;
            engine.subscriptions().ensure_free_plan().await?;
            let report = engine.process_expired_subscriptions().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Trigger { task_id } => {
            let engine = build_engine(config).await?;
            engine.prepare().await?;
            let outcome = engine.trigger_task(&task_id).await;
            engine.stop().await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
            Ok(())
        }
        Command::Tasks => {
            let engine = build_engine(config).await?;
            engine.prepare().await?;
            let tasks = engine.list_tasks().await;
            engine.stop().await;
            println!("{}", serde_json::to_string_pretty(&tasks?)?);
            Ok(())
        }
        Command::Migrate => {
            let url = config
                .db_url
                .as_deref()
                .context("DB_URL or DATABASE_URL is required for migrate")?;
            LifecycleDb::connect(url).await?.migrate().await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
