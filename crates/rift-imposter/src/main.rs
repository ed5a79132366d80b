use anyhow::Context;
use clap::{Parser, ValueEnum};
use rift_imposter::config::{load_imposters, EngineConfig};
use rift_imposter::imposter::ImposterManager;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rift-imposter")]
#[command(version, about = "Virtual TCP, HTTP and SMTP services", long_about = None)]
struct Args {
    /// Engine configuration file (YAML or JSON)
    #[arg(short, long, env = "RIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Imposter declarations to create at startup
    #[arg(short, long, env = "RIFT_IMPOSTERS")]
    imposters: Option<PathBuf>,

    /// Allow inject predicates, responses and end-of-request resolvers
    #[arg(long, env = "RIFT_ALLOW_INJECTION")]
    allow_injection: bool,

    /// Default bind host for imposters
    #[arg(long, env = "RIFT_HOST")]
    host: Option<String>,

    /// Bounded wait for inject responses, in milliseconds
    #[arg(long, env = "RIFT_INJECTION_TIMEOUT_MS")]
    injection_timeout_ms: Option<u64>,

    /// Bounded wait for proxied round trips, in milliseconds
    #[arg(long, env = "RIFT_PROXY_TIMEOUT_MS")]
    proxy_timeout_ms: Option<u64>,

    #[arg(long, value_enum, default_value = "text", env = "RIFT_LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if self.allow_injection {
            config.allow_injection = true;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(ms) = self.injection_timeout_ms {
            config.injection_timeout_ms = ms;
        }
        if let Some(ms) = self.proxy_timeout_ms {
            config.proxy_timeout_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = args.engine_config()?;
    if config.allow_injection {
        warn!("Injection is enabled; imposters may run user-supplied scripts");
    }
    let manager = ImposterManager::new(config).context("failed to initialise upstream clients")?;

    if let Some(path) = &args.imposters {
        for declaration in load_imposters(path)? {
            match manager.create_imposter(declaration).await {
                Ok(port) => info!("Created imposter on port {}", port),
                Err(e) => error!("Failed to create imposter: {}", e),
            }
        }
    }

    info!("rift-imposter running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}
