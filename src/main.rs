//! Athena relay server binary.
//!
//! Selects the message store and identity provider from the environment,
//! starts the hub, and serves the HTTP/WebSocket API until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use athena_relay::auth::{DevTokenVerifier, GoTrueVerifier, TokenVerifier};
use athena_relay::store::{MessageStore, RestMessageStore, SqliteMessageStore};
use athena_relay::{api, RelayConfig, RelayState};

/// How long shutdown waits for queued chat messages to be stored.
const PERSIST_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "athena-relay", version, about = "Athena chat and call signaling relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// Outbound frames buffered per connection before it is dropped
    #[arg(long, default_value_t = 256, env = "OUTBOUND_QUEUE_CAPACITY")]
    queue_capacity: usize,

    /// Pending events per hub channel
    #[arg(long, default_value_t = 1024, env = "HUB_CHANNEL_CAPACITY")]
    hub_channel_capacity: usize,

    /// Chat messages waiting to be stored
    #[arg(long, default_value_t = 1024, env = "PERSIST_QUEUE_CAPACITY")]
    persist_queue_capacity: usize,

    /// Number of persistence workers
    #[arg(long, default_value_t = 2, env = "PERSIST_WORKERS")]
    persist_workers: usize,

    /// SQLite database file. In-memory when unset.
    #[arg(long = "database", env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Supabase project URL (REST message store + GoTrue auth)
    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: Option<String>,

    /// Supabase API key
    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    supabase_key: Option<String>,

    /// Web client origin allowed by CORS
    #[arg(long, default_value = "http://localhost:3000", env = "FRONTEND_URL")]
    frontend_url: String,

    /// Accept any non-empty token as the user ID. Never use in production.
    #[arg(long, default_value_t = false, env = "DEV_AUTH")]
    dev_auth: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn config(&self) -> RelayConfig {
        RelayConfig {
            port: self.port,
            queue_capacity: self.queue_capacity,
            hub_channel_capacity: self.hub_channel_capacity,
            persist_queue_capacity: self.persist_queue_capacity,
            persist_workers: self.persist_workers,
            frontend_url: self.frontend_url.clone(),
        }
    }

    /// Supabase URL and key, when both are set and non-empty.
    fn supabase(&self) -> Option<(&str, &str)> {
        let url = self.supabase_url.as_deref().filter(|s| !s.is_empty())?;
        let key = self.supabase_key.as_deref().filter(|s| !s.is_empty())?;
        Some((url, key))
    }
}

type Backends = (Arc<dyn MessageStore>, Arc<dyn TokenVerifier>);

fn select_backends(args: &Args) -> Result<Backends, String> {
    if let Some((url, key)) = args.supabase() {
        tracing::info!(supabase_url = url, "Using Supabase message store and auth");
        let store: Arc<dyn MessageStore> = Arc::new(RestMessageStore::new(url, key));
        let verifier: Arc<dyn TokenVerifier> = if args.dev_auth {
            tracing::warn!("Development auth enabled, tokens are not verified");
            Arc::new(DevTokenVerifier)
        } else {
            Arc::new(GoTrueVerifier::new(url, key))
        };
        return Ok((store, verifier));
    }

    if !args.dev_auth {
        return Err(
            "no identity provider configured: set SUPABASE_URL and SUPABASE_KEY, or pass --dev-auth"
                .to_string(),
        );
    }

    let store = match args.database_path.as_deref() {
        Some(path) => {
            tracing::info!(path, "Using SQLite message store");
            SqliteMessageStore::open(path)
        }
        None => {
            tracing::warn!("Using in-memory message store, history is lost on restart");
            SqliteMessageStore::open_in_memory()
        }
    }
    .map_err(|e| e.to_string())?;

    tracing::warn!("Development auth enabled, tokens are not verified");
    Ok((Arc::new(store), Arc::new(DevTokenVerifier)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "athena_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let (store, verifier) = match select_backends(&args) {
        Ok(backends) => backends,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let state = RelayState::start(args.config(), store, verifier);
    let app = api::router(state.clone());

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Athena relay server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = addr.as_str(), error = %e, "Failed to bind address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    state.shutdown(PERSIST_DRAIN_TIMEOUT).await;
    tracing::info!("Athena relay server stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
