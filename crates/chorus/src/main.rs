mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chorusconf::{ChorusConfig, RedisConfig};
use chorusstore::{
    check_database_before_upgrade, prepare_database, DataStore, SqliteDatabase, StoreConfig,
    SystemClock,
};
use clap::{Parser, Subcommand};

/// Chorus homeserver persistence layer
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load instead of ./chorus.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare the database and run until interrupted (default)
    Start,
    /// Verify the database was created for the configured server name
    Check,
    /// Print the effective configuration
    PrintConfig,
    /// Print a sample [redis] section
    RedisSample,
    /// Prepare the database and print every stream's current token as JSON
    Tokens,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ChorusConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Command::Start) {
        Command::PrintConfig => {
            print!("{}", config.to_toml());
            Ok(())
        }
        Command::RedisSample => {
            print!("{}", RedisConfig::generate_section());
            Ok(())
        }
        Command::Check => {
            telemetry::init(&config.telemetry).context("Failed to initialize telemetry")?;
            let db = open_database(&config)?;
            check_database_before_upgrade(&db, &config.server.server_name).await?;
            println!(
                "{}: database matches server name {}",
                config.database.path.display(),
                config.server.server_name
            );
            telemetry::shutdown();
            Ok(())
        }
        Command::Tokens => {
            telemetry::init(&config.telemetry).context("Failed to initialize telemetry")?;
            let store = build_store(&config).await?;
            println!("{}", serde_json::to_string_pretty(&store.current_tokens())?);
            telemetry::shutdown();
            Ok(())
        }
        Command::Start => {
            telemetry::init(&config.telemetry).context("Failed to initialize telemetry")?;
            let store = build_store(&config).await?;

            if let Some(shards) = config.redis.cache_shard_tier() {
                tracing::info!(
                    hosts = shards.hosts.len(),
                    expire_caches = shards.expire_caches,
                    "remote cache shard tier configured"
                );
            }
            tracing::info!(tokens = ?store.current_tokens(), "chorus started, waiting for shutdown signal");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;

            tracing::info!(
                events = %store.get_room_max_stream_ordering(),
                device_lists = %store.get_device_stream_token(),
                "shutting down"
            );
            telemetry::shutdown();
            Ok(())
        }
    }
}

fn open_database(config: &ChorusConfig) -> Result<SqliteDatabase> {
    tracing::info!(path = %config.database.path.display(), "opening database");
    SqliteDatabase::open(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))
}

async fn build_store(config: &ChorusConfig) -> Result<DataStore> {
    let db = Arc::new(open_database(config)?);
    prepare_database(db.as_ref(), &config.server.server_name)
        .await
        .context("Database is not usable with this configuration")?;

    let store = DataStore::new(db, Arc::new(SystemClock), StoreConfig::from_config(config))
        .await
        .context("Failed to construct data store")?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["chorus", "--config", "/tmp/chorus.toml", "tokens"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/chorus.toml")));
        assert!(matches!(cli.command, Some(Command::Tokens)));

        let cli = Cli::parse_from(["chorus"]);
        assert!(cli.command.is_none());
    }

    #[tokio::test]
    async fn test_build_store_against_temp_database() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = ChorusConfig::default();
        config.server.server_name = "example.org".to_string();
        config.database.path = temp.path().join("homeserver.db");

        let store = build_store(&config).await.unwrap();
        assert_eq!(store.server_name(), "example.org");
        assert!(store.current_tokens().contains_key("events"));
    }
}
