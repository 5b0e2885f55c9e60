use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::{Parser, ValueEnum};
use mcs_collector::{
    actors::CollectorHandle,
    config::{
        Config, EncoderConfig, McsConfig, PostgresConfig, StorageConfig, Tuning,
        read_tuning_file,
    },
    ingest::CollectorLoop,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    Postgres,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Parser)]
#[command(about = "Collects MCS alarms into a relational database")]
struct Args {
    /// Tuning file (JSON)
    #[arg(short)]
    file: Option<String>,

    #[arg(long, env = "MCS_IP_PRIMARY")]
    mcs_ip_primary: Option<String>,

    #[arg(long, env = "MCS_IP_SECONDARY")]
    mcs_ip_secondary: Option<String>,

    #[arg(long, env = "MCS_PORT", default_value_t = 443)]
    mcs_port: u16,

    #[arg(long, env = "MCS_SCHEME", default_value = "https")]
    mcs_scheme: String,

    #[arg(long, env = "MCS_USERNAME")]
    mcs_username: Option<String>,

    #[arg(long, env = "MCS_PASSWORD", hide_env_values = true)]
    mcs_password: Option<String>,

    /// Accept self-signed MCS certificates
    #[arg(long, env = "MCS_INSECURE_TLS", value_parser = FalseyValueParser::new())]
    mcs_insecure_tls: bool,

    /// Poll encoder outputs directly; leave unset to skip that step
    #[arg(long, env = "ENCODER_USERNAME")]
    encoder_username: Option<String>,

    #[arg(long, env = "ENCODER_PASSWORD", hide_env_values = true)]
    encoder_password: Option<String>,

    #[arg(long, env = "ENCODER_SCHEME", default_value = "http")]
    encoder_scheme: String,

    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value = "postgres")]
    storage: StorageKind,

    #[arg(long, env = "SQLITE_PATH", default_value = "./alarms.db")]
    sqlite_path: PathBuf,

    #[arg(long, env = "SQL_SERVER")]
    sql_server: Option<String>,

    #[arg(long, env = "SQL_PORT", default_value_t = 5432)]
    sql_port: u16,

    #[arg(long, env = "SQL_DATABASE")]
    sql_database: Option<String>,

    #[arg(long, env = "SQL_USERNAME")]
    sql_username: Option<String>,

    #[arg(long, env = "SQL_PASSWORD", hide_env_values = true)]
    sql_password: Option<String>,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 60)]
    poll_interval_secs: u64,

    #[arg(long, env = "TOKEN_PATH", default_value = "./tokens/token_storage.json")]
    token_path: PathBuf,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

impl Args {
    fn into_config(self, tuning: Tuning) -> Config {
        let storage = match self.storage {
            StorageKind::Memory => StorageConfig::None,
            StorageKind::Sqlite => StorageConfig::Sqlite {
                path: self.sqlite_path,
            },
            StorageKind::Postgres => StorageConfig::Postgres(PostgresConfig {
                host: self.sql_server.unwrap_or_default(),
                port: self.sql_port,
                database: self.sql_database.unwrap_or_default(),
                username: self.sql_username.unwrap_or_default(),
                password: self.sql_password,
            }),
        };

        let encoders = self.encoder_username.map(|username| EncoderConfig {
            username,
            password: self.encoder_password.unwrap_or_default(),
            scheme: self.encoder_scheme,
        });

        Config {
            mcs: McsConfig {
                primary: self.mcs_ip_primary.unwrap_or_default(),
                secondary: self.mcs_ip_secondary.unwrap_or_default(),
                port: self.mcs_port,
                scheme: self.mcs_scheme,
                username: self.mcs_username.unwrap_or_default(),
                password: self.mcs_password.unwrap_or_default(),
                insecure_tls: self.mcs_insecure_tls,
            },
            storage,
            encoders,
            token_path: self.token_path,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            tuning,
        }
    }
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_target("mcs_collector", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => { result?; info!("received SIGINT"); }
            _ = sigterm.recv() => { info!("received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("received CTRL+C");
    }

    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let tuning = match &args.file {
        Some(path) => read_tuning_file(path)?,
        None => Tuning::default(),
    };

    let config = args.into_config(tuning);
    trace!("configuration: {config:?}");
    config.validate()?;

    let collector = CollectorLoop::from_config(&config)?;
    info!(
        "polling MCS at {} / {} every {:?}",
        config.mcs.primary_url(),
        config.mcs.secondary_url(),
        config.poll_interval
    );

    let handle = CollectorHandle::spawn(collector, config.poll_interval);

    wait_for_shutdown_signal().await?;
    handle.shutdown().await?;

    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {:?}", args.file);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
