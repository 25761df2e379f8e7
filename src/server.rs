//! Long-running service mode.
//!
//! A background task fetches the feed on a timer, ingests it and evaluates
//! every region. The latest results are served over HTTP:
//! - `/health` liveness probe
//! - `/alarms` latest results as JSON
//! - `/events/recent?limit=N` newest stored events
//! - `/stream` SSE, one message per evaluation run

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::client::FeedClient;
use crate::cluster::window_start;
use crate::config::Config;
use crate::models::{AlarmResult, Event};
use crate::normalize::Normalizer;
use crate::pipeline::{self, IngestReport};
use crate::store::EventStore;

/// Default and upper bound for `/events/recent`.
const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 500;

/// Listener and timer settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub poll_interval: Duration,
}

/// Outcome of the most recent cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub ingest: Option<IngestReport>,
    pub results: Vec<AlarmResult>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<EventStore>>,
    latest: watch::Receiver<Snapshot>,
    /// Serialized snapshots for SSE clients
    tx: broadcast::Sender<String>,
}

/// Everything one ingestion cycle needs.
struct Cycle {
    config: Config,
    normalizer: Normalizer,
    client: FeedClient,
}

impl Cycle {
    /// Fetch, ingest, then evaluate. The store lock is held for the write
    /// and the window read only.
    fn run(&self, store: &Mutex<EventStore>) -> anyhow::Result<Snapshot> {
        let rows = self.client.fetch_rows().context("failed to fetch feed")?;
        let now = Utc::now();

        let (report, events) = {
            let mut store = store.lock().map_err(|_| anyhow!("event store lock poisoned"))?;
            let report = pipeline::ingest(
                &mut store,
                &self.normalizer,
                rows.iter().map(String::as_str),
                self.config.storage_capacity_max_rows,
            )?;
            let events = store.query_window(window_start(now, self.config.longest_window()), now)?;
            (report, events)
        };

        Ok(Snapshot {
            updated_at: Some(now),
            ingest: Some(report),
            results: pipeline::evaluate_events(&events, &self.config, now),
        })
    }
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/alarms", get(alarms_handler))
        .route("/events/recent", get(recent_events_handler))
        .route("/stream", get(sse_handler))
        .with_state(state)
}

/// Start the service.
///
/// The blocking feed client is built by the caller, outside the runtime.
///
/// # Errors
///
/// Returns an error if the configuration is unusable or the listener
/// cannot bind.
pub async fn run_server(
    config: Config,
    client: FeedClient,
    server: ServerConfig,
    store: EventStore,
) -> anyhow::Result<()> {
    let cycle = Arc::new(Cycle {
        normalizer: config.normalizer()?,
        client,
        config,
    });

    let store = Arc::new(Mutex::new(store));
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
    let (tx, _rx) = broadcast::channel::<String>(16);

    let state = AppState {
        store: store.clone(),
        latest: snapshot_rx,
        tx: tx.clone(),
    };

    tokio::spawn(poll_feed(cycle, store, snapshot_tx, tx, server.poll_interval));

    let app = create_router(state);

    let addr = format!("{}:{}", server.host, server.port);
    info!("seismoalarm listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Background task: the single writer to the store.
async fn poll_feed(
    cycle: Arc<Cycle>,
    store: Arc<Mutex<EventStore>>,
    snapshots: watch::Sender<Snapshot>,
    tx: broadcast::Sender<String>,
    interval: Duration,
) {
    loop {
        let (cycle_ref, store_ref) = (cycle.clone(), store.clone());
        match tokio::task::spawn_blocking(move || cycle_ref.run(&store_ref)).await {
            Ok(Ok(snapshot)) => {
                match serde_json::to_string(&snapshot) {
                    Ok(json) => {
                        let _ = tx.send(json);
                    }
                    Err(e) => warn!("failed to encode snapshot: {e}"),
                }
                snapshots.send_replace(snapshot);
            }
            Ok(Err(e)) => warn!("cycle failed, will retry: {e:#}"),
            Err(e) => warn!("cycle task aborted: {e}"),
        }

        tokio::time::sleep(interval).await;
    }
}

/// Health check endpoint.
async fn health_handler() -> &'static str {
    "OK"
}

/// Latest evaluation snapshot.
async fn alarms_handler(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.latest.borrow().clone())
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

/// Newest stored events.
async fn recent_events_handler(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<Event>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
    let store = state.store.clone();

    let events = tokio::task::spawn_blocking(move || {
        let store = store.lock().map_err(|_| anyhow!("event store lock poisoned"))?;
        store.query_recent(limit).map_err(anyhow::Error::from)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;

    Ok(Json(events))
}

/// SSE stream of evaluation snapshots.
async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(json) => Some(Ok(SseEvent::default().event("alarms").data(json))),
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
