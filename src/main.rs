mod auth;
mod extract;
mod jobs;
mod policy;
mod store;

use anyhow::{Context, Result};
use axum::{Router, middleware};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, TokenStore};
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "identity and access backend: oauth2/oidc tokens, introspection and policy enforcement")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "WARDEN_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "WARDEN_PORT", default_value = "8000")]
    port: u16,

    /// Public origin used as the token issuer (e.g., https://auth.example.com).
    /// If not set, the issuer is derived from the request Host header
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// Seconds subtracted from iat/nbf to absorb clock drift between servers
    #[arg(long, env = "TOKEN_CLOCK_SKEW", default_value = "0")]
    token_clock_skew: i64,

    /// Seconds between expired-token sweeps (0 = never sweep)
    #[arg(long, env = "TOKEN_SWEEP_INTERVAL", default_value = "300")]
    token_sweep_interval: u64,

    /// PEM public key for the built-in certificate (RS256)
    #[arg(long, env = "CERT_PUBLIC_KEY_FILE")]
    cert_public_key_file: Option<String>,

    /// PEM private key for the built-in certificate (RS256)
    #[arg(long, env = "CERT_PRIVATE_KEY_FILE")]
    cert_private_key_file: Option<String>,

    /// Token endpoint requests per second per client ip
    #[arg(long, env = "RATE_LIMIT_PER_SECOND", default_value = "5")]
    rate_limit_per_second: u64,

    /// Token endpoint burst size per client ip
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "10")]
    rate_limit_burst: u32,
}

fn read_cert_keys(args: &Args) -> Result<policy::CertKeys> {
    let read = |path: &Option<String>| -> Result<Option<String>> {
        path.as_deref()
            .map(|p| {
                std::fs::read_to_string(p).with_context(|| format!("failed to read key file {}", p))
            })
            .transpose()
    };
    let keys = policy::CertKeys {
        public_pem: read(&args.cert_public_key_file)?,
        private_pem: read(&args.cert_private_key_file)?,
    };
    if keys.public_pem.is_some() != keys.private_pem.is_some() {
        anyhow::bail!("CERT_PUBLIC_KEY_FILE and CERT_PRIVATE_KEY_FILE must be set together");
    }
    Ok(keys)
}

fn normalise_public_url(public_url: Option<&str>) -> Result<Option<String>> {
    public_url
        .map(|raw| {
            let parsed = url::Url::parse(raw)
                .with_context(|| format!("PUBLIC_URL '{}' is not a valid url", raw))?;
            Ok(parsed.as_str().trim_end_matches('/').to_string())
        })
        .transpose()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let public_url = normalise_public_url(args.public_url.as_deref())?;
    let keys = read_cert_keys(&args)?;

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(policy::EnforcerRegistry::new(store.clone()));
    let compiler = Arc::new(policy::PolicyCompiler::new(store.clone(), registry.clone()));

    if policy::init_built_in_data(store.as_ref(), &compiler, &keys).await? {
        tracing::info!("fresh store, built-in data seeded");
    }
    if compiler.migrate_permission_rules().await? {
        tracing::info!("permission rule tables migrated");
    }

    let settings = auth::IssuerSettings {
        public_url: public_url.clone(),
        clock_skew: args.token_clock_skew,
    };
    let oauth_service = Arc::new(auth::OAuthService::new(
        store.clone(),
        store.clone(),
        settings,
    ));

    let jobs = jobs::JobRegistry::new();
    if args.token_sweep_interval > 0 {
        let tokens: Arc<dyn TokenStore> = store.clone();
        jobs.start(
            "token-sweep",
            Duration::from_secs(args.token_sweep_interval),
            move || {
                let tokens = tokens.clone();
                async move {
                    let removed = tokens.delete_expired(chrono::Utc::now()).await?;
                    if removed > 0 {
                        tracing::info!("swept {} expired token row(s)", removed);
                    }
                    Ok::<_, anyhow::Error>(())
                }
            },
        );
    }

    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(args.rate_limit_per_second)
            .burst_size(args.rate_limit_burst)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit settings"))?,
    );
    let limiter = governor_conf.limiter().clone();
    jobs.start("rate-limit-gc", Duration::from_secs(60), move || {
        limiter.retain_recent();
        std::future::ready(Ok::<_, anyhow::Error>(()))
    });

    let oauth_state = auth::OAuthAppState {
        oauth_service: oauth_service.clone(),
    };
    let authz = auth::AuthzConfig {
        validator: oauth_service.validator().clone(),
        registry: registry.clone(),
    };
    let policy_state = policy::PolicyAppState {
        registry,
        compiler,
    };

    let token_routes = auth::token_routes()
        .layer(GovernorLayer::new(governor_conf))
        .with_state(oauth_state.clone());
    let guarded_routes = auth::session_routes()
        .merge(auth::admin_routes())
        .with_state(oauth_state.clone())
        .merge(policy::policy_routes().with_state(policy_state))
        .layer(middleware::from_fn_with_state(authz, auth::authz_middleware));
    let app = Router::new()
        .merge(token_routes)
        .merge(guarded_routes)
        .merge(auth::discovery_routes().with_state(oauth_state))
        .layer(TraceLayer::new_for_http());

    // TcpListener::bind resolves hostnames like "localhost"
    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("warden listening on {}", bind_addr);
    if let Some(public) = &public_url {
        tracing::info!("issuer: {}", public);
    }

    // connect info gives the rate limiter a peer ip when no proxy headers are present
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    jobs.shutdown();
    Ok(())
}
