use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use salon_translator::relay::{RelayConfig, RelayServer};
use std::time::Duration;
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "salon-relay")]
#[command(about = "Translation and summary relay for the conference companion app")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Address to bind the relay server to
    #[arg(long, default_value = salon_translator::DEFAULT_BIND_ADDR)]
    pub bind: String,

    /// Upstream chat-completions endpoint
    #[arg(long, default_value = salon_translator::UPSTREAM_COMPLETIONS_URL)]
    pub upstream_url: String,

    /// Environment variable holding the upstream API key
    #[arg(long, default_value = salon_translator::API_KEY_ENV)]
    pub api_key_env: String,

    /// Model used for streamed translations
    #[arg(long, default_value = "llama3-8b-8192")]
    pub translate_model: String,

    /// Model used for summaries
    #[arg(long, default_value = "llama3-70b-8192")]
    pub summarize_model: String,

    /// Upstream timeout for non-streaming calls, in seconds
    #[arg(long, default_value = "30")]
    pub upstream_timeout: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind.clone(),
            upstream_url: self.upstream_url.clone(),
            api_key_env: self.api_key_env.clone(),
            translate_model: self.translate_model.clone(),
            summarize_model: self.summarize_model.clone(),
            upstream_timeout: Duration::from_secs(self.upstream_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Salon Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Bind address: {}", args.bind);
    info!("  Upstream URL: {}", args.upstream_url);
    info!("  API key env var: {}", args.api_key_env);
    info!("  Translate model: {}", args.translate_model);
    info!("  Summarize model: {}", args.summarize_model);
    info!("  Log level: {:?}", args.log_level);

    if std::env::var(&args.api_key_env).map_or(true, |k| k.trim().is_empty()) {
        // The relay still starts; requests fail with a 500 until the key
        // is provided.
        tracing::warn!("{} is not set, requests will be rejected", args.api_key_env);
    }

    let mut server =
        RelayServer::start(args.relay_config()).context("Failed to start relay server")?;

    wait_for_shutdown().await;
    info!("Shutting down relay");
    server.stop();

    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal");
        }
        _ = wait_for_term_signal() => {
            info!("Received TERM signal");
        }
    }
}

#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    std::future::pending::<()>().await;
}
