//! Mock engagement backend for local testing
//!
//! Accepts `POST /engagements`, logs each payload, and rejects every Nth
//! request with 503 so the agent's retry path can be exercised.
//!
//! Usage:
//!   cargo run --bin mock-backend -- --port 8088 --reject-every 3

use beacon_engage::domain::EngagementPayload;
use beacon_engage::io::backend::API_KEY_HEADER;
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock engagement backend for local testing")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8088")]
    port: u16,

    /// Reject every Nth request with 503 (0 = accept all)
    #[arg(long, default_value = "0")]
    reject_every: u64,

    /// Required API key (any key accepted when unset)
    #[arg(long)]
    api_key: Option<String>,
}

struct BackendState {
    requests: AtomicU64,
    accepted: AtomicU64,
    reject_every: u64,
    api_key: Option<String>,
}

/// Milliseconds between event creation and arrival, when `created_at` parses
fn queue_lag_ms(created_at: &str) -> Option<i64> {
    let created = OffsetDateTime::parse(created_at, &Rfc3339).ok()?;
    let lag = OffsetDateTime::now_utc() - created;
    i64::try_from(lag.whole_milliseconds()).ok()
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<BackendState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/engagements") => {}
        (&Method::GET, "/health") => return Ok(respond(StatusCode::OK, "ok")),
        _ => return Ok(respond(StatusCode::NOT_FOUND, "Not Found")),
    }

    let n = state.requests.fetch_add(1, Ordering::Relaxed) + 1;

    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(expected) = &state.api_key {
        if api_key.as_deref() != Some(expected.as_str()) {
            warn!(request = %n, "engagement_unauthorized");
            return Ok(respond(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request = %n, error = %e, "engagement_body_read_failed");
            return Ok(respond(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let payload: EngagementPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(request = %n, error = %e, "engagement_payload_invalid");
            return Ok(respond(StatusCode::BAD_REQUEST, "invalid payload"));
        }
    };

    if state.reject_every > 0 && n % state.reject_every == 0 {
        warn!(
            request = %n,
            event_id = %payload.event_id,
            attempt = %payload.attempt,
            "engagement_rejected_simulated"
        );
        return Ok(respond(StatusCode::SERVICE_UNAVAILABLE, "try again"));
    }

    let accepted = state.accepted.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        request = %n,
        accepted = %accepted,
        event_id = %payload.event_id,
        kind = %payload.kind.as_str(),
        advertisement_id = %payload.advertisement_id,
        beacon = %payload.beacon,
        device_id = %payload.device_id,
        user_id = ?payload.user_id,
        attempt = %payload.attempt,
        lag_ms = ?queue_lag_ms(&payload.created_at),
        sdk_version = %payload.sdk_version,
        "engagement_accepted"
    );
    Ok(respond(StatusCode::ACCEPTED, "accepted"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(BackendState {
        requests: AtomicU64::new(0),
        accepted: AtomicU64::new(0),
        reject_every: args.reject_every,
        api_key: args.api_key,
    });

    info!(port = %args.port, reject_every = %args.reject_every, "mock_backend_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "mock_backend_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "mock_backend_accept_error");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(
                    requests = %state.requests.load(Ordering::Relaxed),
                    accepted = %state.accepted.load(Ordering::Relaxed),
                    "mock_backend_shutdown"
                );
                return Ok(());
            }
        }
    }
}
