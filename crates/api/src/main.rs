use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use earngate_core::domain::snapshot::TickerRecord;
use earngate_core::storage::blob::PgBlobStore;
use earngate_core::storage::snapshots::SnapshotStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = earngate_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let snapshots: Option<SnapshotStore> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match earngate_core::storage::migrate(&pool).await {
                Ok(()) => Some(SnapshotStore::new(Arc::new(PgBlobStore::new(pool)))),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(
                        error = %e,
                        "db migrations failed; starting API in degraded mode"
                    );
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let app = router(AppState { snapshots });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Read-only view of published snapshots. Staging is never served.
#[derive(Clone)]
struct AppState {
    snapshots: Option<SnapshotStore>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/snapshots/latest", get(get_latest_snapshot))
        .route("/snapshots/:day", get(get_snapshot_by_day))
        .route("/snapshots/:day/:ticker", get(get_record_by_day_and_ticker))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %format!("{e:#}"), "snapshot read failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn parse_day(day: &str) -> Result<NaiveDate, StatusCode> {
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)
}

/// The stored blob, byte for byte.
fn raw_json(blob: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], blob).into_response()
}

async fn get_latest_snapshot(State(state): State<AppState>) -> Result<Response, StatusCode> {
    let Some(snapshots) = &state.snapshots else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let pointer = snapshots
        .load_latest()
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let blob = snapshots
        .load_published_raw(pointer.day)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(raw_json(blob))
}

async fn get_snapshot_by_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> Result<Response, StatusCode> {
    let Some(snapshots) = &state.snapshots else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let day = parse_day(&day)?;
    let blob = snapshots
        .load_published_raw(day)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(raw_json(blob))
}

async fn get_record_by_day_and_ticker(
    State(state): State<AppState>,
    Path((day, ticker)): Path<(String, String)>,
) -> Result<Json<TickerRecord>, StatusCode> {
    let Some(snapshots) = &state.snapshots else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let day = parse_day(&day)?;
    let mut snapshot = snapshots
        .load_published(day)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let record = snapshot
        .records
        .remove(&ticker.trim().to_ascii_uppercase())
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(record))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &earngate_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
