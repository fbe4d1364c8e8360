use std::sync::Arc;

use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::status::StatusRegistry;
use crate::twitch::TimeWindow;

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: StatusRegistry,
}

#[derive(Deserialize)]
pub struct CompileRequest {
    /// Profile URL or bare handle.
    pub streamer: String,
    /// "24 hours", "7 days", "30 days" or "all time" (short forms accepted).
    pub period: String,
}

#[derive(Serialize)]
struct Accepted {
    run_id: Uuid,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_body(message: impl Into<String>) -> ErrorBody {
    ErrorBody {
        error: message.into(),
    }
}

/// Kick off a compilation run.
///
/// # Example
/// ```shell
/// curl -X POST http://localhost:8080/compilations \
///   -H 'Content-Type: application/json' \
///   -d '{"streamer": "https://www.twitch.tv/sodapoppin", "period": "7 days"}'
/// ```
///
/// # Returns
/// `202 Accepted` with
/// ```json
/// { "run_id": "..." }
/// ```
/// The channel and period are validated before the request is accepted; the
/// download/assembly work runs as a detached background task polled via the
/// status endpoint.
#[post("/compilations")]
pub async fn start_compilation(
    state: web::Data<AppState>,
    body: web::Json<CompileRequest>,
) -> impl Responder {
    let window = match TimeWindow::parse(&body.period) {
        Some(window) => window,
        None => {
            return HttpResponse::BadRequest().json(error_body(format!(
                "invalid period '{}'",
                body.period
            )));
        }
    };

    let channel = match state.pipeline.source().resolve_channel(&body.streamer).await {
        Ok(channel) => channel,
        Err(PipelineError::ChannelNotFound(handle)) => {
            return HttpResponse::NotFound()
                .json(error_body(format!("no channel matches '{handle}'")));
        }
        Err(err) => {
            warn!("channel resolution failed: {err}");
            return HttpResponse::BadGateway().json(error_body("upstream lookup failed"));
        }
    };

    let status = state.registry.register();
    let run_id = status.run_id();
    state
        .pipeline
        .spawn(channel, window, status, CancellationToken::new());

    HttpResponse::Accepted().json(Accepted { run_id })
}

/// Current `{phase, progress}` snapshot for a run.
///
/// # Example
/// ```shell
/// curl http://localhost:8080/status/6f2c...
/// ```
#[get("/status/{run_id}")]
pub async fn run_status(state: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match state.registry.get(path.into_inner()) {
        Some(status) => HttpResponse::Ok().json(status),
        None => HttpResponse::NotFound().json(error_body("unknown run id")),
    }
}

/// Run the API server.
pub async fn run_api_server(
    config: &Config,
    pipeline: Arc<Pipeline>,
    registry: StatusRegistry,
) -> std::io::Result<()> {
    let state = web::Data::new(AppState { pipeline, registry });
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(start_compilation)
            .service(run_status)
    })
    .bind(config.bind_addr.clone())?
    .run()
    .await
}
