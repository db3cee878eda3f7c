use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lastclick::config::{random_name, AppConfig};
use lastclick::persist::{resume_snapshot, JsonFileStore, SessionSnapshot, SessionStore};
use lastclick::session::{GuestSession, HostSession, SessionContext};
use lastclick::stimulus::load_stimulus_file;
use lastclick::transport::ChannelConnection;
use lastclick::types::Role;
use lastclick::ws;

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lastclick=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting lastclick as {:?}", config.role);

    let store: Option<Arc<dyn SessionStore>> = config
        .state_file
        .as_ref()
        .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn SessionStore>);
    let saved = store
        .as_deref()
        .and_then(|store| resume_snapshot(store, config.role));

    let mut ctx = SessionContext {
        scheduler: config.scheduler.clone(),
        ..SessionContext::default()
    };
    if let Some(store) = store {
        ctx = ctx.with_store(store);
    }

    match config.role {
        Role::Host => run_host(config, ctx, saved).await,
        Role::Guest => run_guest(config, ctx, saved).await,
    }
}

async fn run_host(config: AppConfig, ctx: SessionContext, saved: Option<SessionSnapshot>) {
    let room_id = config
        .room_id
        .clone()
        .or_else(|| saved.as_ref().map(|s| s.room_id.clone()));
    let name = config
        .display_name
        .clone()
        .or_else(|| saved.map(|s| s.display_name))
        .unwrap_or_else(random_name);

    let (session, events) = HostSession::new(ctx, name, room_id, Box::new(StdRng::from_os_rng()));
    let handle = session.handle();
    let app = ws::router(ws::WsState::new(session.room_id().clone(), handle.events()));
    tracing::info!(
        "Guests join with LASTCLICK_HOST_URL=ws://{}/ws LASTCLICK_ROOM={}",
        config.bind,
        session.room_id()
    );
    tracing::info!("Join link: {}", session.join_link(&format!("http://{}/", config.bind)));
    tokio::spawn(session.run(events));

    if let Some(path) = &config.stimulus {
        match load_stimulus_file(path).await {
            Ok(payload) => {
                if let Err(e) = handle.select_stimulus(payload).await {
                    tracing::error!("Could not select {}: {}", path.display(), e);
                }
            }
            Err(e) => tracing::error!("Could not load {}: {}", path.display(), e),
        }
    }

    tracing::info!("Listening on http://{}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await.unwrap();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server stopped: {}", e);
        }
    });

    tracing::info!("Commands: load <file.wav> | begin | abort | click (or enter) | again | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("load", path) => match load_stimulus_file(path.trim()).await {
                Ok(payload) => handle.select_stimulus(payload).await,
                Err(e) => {
                    tracing::error!("Could not load {}: {}", path, e);
                    continue;
                }
            },
            ("begin", _) => handle.begin_round().await,
            ("abort", _) => handle.abort_round().await,
            ("click", _) | ("", _) => handle.click().await,
            ("again", _) => handle.play_again().await,
            ("quit", _) => break,
            (other, _) => {
                tracing::warn!("Unknown command {:?}", other);
                continue;
            }
        };
        if let Err(e) = result {
            tracing::warn!("{}", e);
        }
    }

    handle.shutdown();
}

async fn run_guest(config: AppConfig, ctx: SessionContext, saved: Option<SessionSnapshot>) {
    let Some(host_url) = config.host_url.clone() else {
        tracing::error!("LASTCLICK_HOST_URL is required for guests");
        return;
    };
    let Some(room_id) = config
        .room_id
        .clone()
        .or_else(|| saved.as_ref().map(|s| s.room_id.clone()))
    else {
        tracing::error!("LASTCLICK_ROOM is required for guests");
        return;
    };
    let name = config
        .display_name
        .clone()
        .or_else(|| saved.map(|s| s.display_name))
        .unwrap_or_else(random_name);

    let peer_id = ulid::Ulid::new().to_string();
    let (conn, outbox) = ChannelConnection::pair(peer_id.clone());
    let (session, events) =
        GuestSession::new(ctx, name, room_id.clone(), Arc::new(conn));
    let handle = session.handle();

    let url = ws::client::guest_url(&host_url, &room_id, &peer_id);
    if let Err(e) = ws::client::dial(&url, outbox, handle.events()).await {
        tracing::error!("Could not reach the host at {}: {}", host_url, e);
        return;
    }
    let task = tokio::spawn(session.run(events));

    tracing::info!("Press enter to click, or type quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "quit" => break,
            _ => {
                if let Err(e) = handle.click().await {
                    tracing::warn!("{}", e);
                }
            }
        }
    }

    handle.shutdown();
    let _ = task.await;
}
