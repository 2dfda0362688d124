//! parley — real-time LLM chat gateway.

use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    clap::Parser,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    parley_auth::{AuthValidator, StaticUserRepository, TokenVerifier, User, parse_algorithm},
    parley_config::ParleyConfig,
    parley_gateway::{GatewayState, NoopMessageRepository, serve},
    parley_history::{HistoryBuffer, HistoryConfig},
    parley_kv::{KvStore, MemoryKv, RedisKv},
    parley_limits::{RateLimitConfig, RateLimiter},
    parley_providers::{LlmBridge, OpenAiCompatProvider, RequestParams, ResponseCache},
};

#[derive(Parser)]
#[command(name = "parley", about = "Parley — real-time LLM chat gateway")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides PARLEY_LISTEN_ADDR).
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = ParleyConfig::from_env()?;

    let kv: Arc<dyn KvStore> = match &config.kv.url {
        Some(url) => Arc::new(
            RedisKv::connect(url)
                .await
                .with_context(|| format!("connecting to kv store at {url}"))?,
        ),
        None => {
            info!("no kv endpoint configured, using in-memory store");
            Arc::new(MemoryKv::new())
        },
    };

    let limiter = RateLimiter::new(Arc::clone(&kv), RateLimitConfig {
        max_connections_per_ip: config.limits.max_connections_per_ip,
        max_connections_per_user: config.limits.max_connections_per_user,
        messages_per_second: config.limits.messages_per_second,
        messages_per_minute: config.limits.messages_per_minute,
        messages_per_hour: config.limits.messages_per_hour,
        messages_per_day: config.limits.messages_per_day,
        connect_timeout: config.limits.connect_timeout,
        message_timeout: config.limits.message_timeout,
    });

    let history = HistoryBuffer::new(Arc::clone(&kv), HistoryConfig {
        max_length: config.history.max_length,
        retention: config.history.retention,
    });

    let algorithm = parse_algorithm(&config.auth.token_algorithm)
        .with_context(|| format!("unsupported token algorithm {}", config.auth.token_algorithm))?;
    let verifier = TokenVerifier::new(config.auth.token_secret.clone(), algorithm);
    // User persistence is a collaborator; without one wired in, a single
    // static dev user is available.
    warn!("using the static dev user repository; supply a real UserRepository for production");
    let users = StaticUserRepository::new([User {
        id: "dev".into(),
        is_active: true,
        is_admin: true,
    }]);
    let auth = AuthValidator::new(verifier, Arc::new(users));

    let provider = OpenAiCompatProvider::new(
        config.llm.endpoint.clone(),
        config.llm.model.clone(),
        config.llm.api_key.clone(),
    );
    let cache = ResponseCache::new(Arc::clone(&kv), config.llm.cache_enabled);
    let bridge = LlmBridge::new(Arc::new(provider), cache, RequestParams {
        temperature: config.llm.temperature,
        max_tokens: config.llm.max_tokens,
    });

    if let Some(endpoint) = &config.telemetry.endpoint {
        info!(endpoint, "telemetry sink configured; exporter wiring is external");
    }

    let state = GatewayState::new(
        limiter,
        history,
        auth,
        bridge,
        Arc::new(NoopMessageRepository),
    );

    let shutdown_state = Arc::clone(&state);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_state.begin_shutdown().await;
        }
    });

    let addr: SocketAddr = cli
        .bind
        .unwrap_or_else(|| config.transport.listen_addr.clone())
        .parse()
        .context("invalid listen address")?;
    let tls = match (&config.transport.tls_cert, &config.transport.tls_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };

    serve(state, addr, tls).await?;
    Ok(())
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()?;
    }
    Ok(())
}
