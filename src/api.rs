use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use nalu_bus::{DecodingStats, FeederState, Session, VideoRatio};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::player;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("ApiError: {:?}", self.0);
        (StatusCode::SERVICE_UNAVAILABLE, format!("{}", self.0)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Serialize)]
struct StatusResponse {
    state: FeederState,
    source: String,
    ratio: Option<VideoRatio>,
    queue_len: usize,
    stats: DecodingStats,
}

pub(crate) fn start_api_server(addr: String, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/", get(index))
            .route("/stats", get(stats))
            .route("/info", get(info));

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("API server bind {} error: {}", addr, e);
                return;
            }
        };
        log::info!("API server started on {}", addr);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error running API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn session() -> ApiResult<std::sync::Arc<Session>> {
    player::current_session()
        .await
        .ok_or_else(|| ApiError(anyhow::anyhow!("no session running")))
}

async fn index() -> &'static str {
    "lowlag-player"
}

async fn stats() -> ApiJsonResult<StatusResponse> {
    let session = session().await?;
    Ok(Json(StatusResponse {
        state: session.state(),
        source: session.source().describe(),
        ratio: session.latest_ratio(),
        queue_len: session.queue_len(),
        stats: session.stats(),
    }))
}

async fn info() -> ApiResult<String> {
    Ok(session().await?.info_string())
}
