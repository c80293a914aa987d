use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use courier_api::state::{AppState, AppStateInner};
use courier_api::{accounts, conversations, envelope, messages};
use courier_db::Database;
use courier_gateway::connection;
use courier_gateway::presence::PresenceDirectory;

/// Expired auth tokens and key-pair records are unreadable as valid the
/// moment they lapse; this sweep only keeps the tables from growing
/// without bound.
const REAPER_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
struct GatewayState {
    db: Arc<Database>,
    presence: PresenceDirectory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("COURIER_DB_PATH").unwrap_or_else(|_| "courier.db".into());
    let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("COURIER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let presence = PresenceDirectory::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        presence: presence.clone(),
    });

    tokio::spawn(run_reaper(db.clone()));

    // Routes. Every API body passes the sealed-envelope layer first, so
    // handlers always see the effective (decrypted) payload.
    let api_routes = Router::new()
        .route("/auth/salts", post(accounts::salts))
        .route("/auth/register", post(accounts::register))
        .route("/auth/login", post(accounts::login))
        .route("/auth/session", post(accounts::whoami))
        .route("/keys/negotiate", post(envelope::negotiate))
        .route("/conversations", post(conversations::create))
        .route("/conversations/list", post(conversations::list))
        .route("/conversations/messages", post(conversations::messages))
        .route("/conversations/keys", post(conversations::keys))
        .route("/conversations/last-message", post(conversations::last_message))
        .route("/messages", post(messages::send))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            envelope::sealed_envelope,
        ))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayState { db, presence });

    let app = Router::new()
        .merge(api_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Courier relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.db, state.presence))
}

async fn run_reaper(db: Arc<Database>) {
    let mut tick = tokio::time::interval(REAPER_INTERVAL);
    loop {
        tick.tick().await;
        let db = db.clone();
        let swept = tokio::task::spawn_blocking(move || {
            let now = Utc::now().timestamp_millis();
            let tokens = db.delete_expired_auth_tokens(now)?;
            let records = db.delete_expired_key_pair_records(now)?;
            Ok::<_, anyhow::Error>((tokens, records))
        })
        .await;

        match swept {
            Ok(Ok((tokens, records))) if tokens + records > 0 => {
                info!("reaped {} expired tokens, {} expired key records", tokens, records);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("expiry sweep failed: {e}"),
            Err(e) => warn!("expiry sweep task failed: {e}"),
        }
    }
}
