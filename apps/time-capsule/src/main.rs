use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use time_capsule_service::config::{Config, LogFormat};
use time_capsule_service::db::CapsuleDb;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "time-capsule", about = "Time capsule lifecycle service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the expiry worker (default).
    Serve,
    /// Apply the database schema and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => time_capsule_service::serve(config).await,
        Command::Migrate => {
            let Some(url) = config.db_url.as_deref() else {
                bail!("DB_URL is required for migrate");
            };
            CapsuleDb::connect(url).await?.migrate().await?;
            tracing::info!("schema is up to date");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
