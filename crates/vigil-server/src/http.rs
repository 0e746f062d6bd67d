//! HTTP control plane.
//!
//! - `/master`: GET lists monitored masters; POST adds, PUT replaces, and
//!   DELETE removes the comma-separated `masters` field
//! - `/cluster`: the same verbs over raft membership with a `peers` field
//!   of `ID:host:port` entries
//! - `/health` and `/metrics`
//!
//! Fields come from the query string or a form-encoded body; the body
//! wins when both carry a field. Bodies over 64 KiB get 413.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigil_core::{parse_peers, Coordinator, CoordinatorError, MasterSet, MastersError, Peer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Form bodies past this size are refused with 413.
const MAX_BODY: usize = 64 * 1024;

/// Shared state behind every request.
pub struct ControlPlane {
    masters: MasterSet,
    metrics: Option<PrometheusHandle>,
}

impl ControlPlane {
    pub fn new(masters: MasterSet, metrics: Option<PrometheusHandle>) -> Self {
        Self { masters, metrics }
    }
}

/// Serves the control plane on `listener` until `shutdown` flips.
///
/// Stops accepting on shutdown; requests already in flight finish on
/// their own tasks.
pub async fn serve(
    listener: TcpListener,
    plane: Arc<ControlPlane>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("control plane on http://{addr}");
    }

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("control plane accept error: {e}");
                        continue;
                    }
                };

                let plane = Arc::clone(&plane);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let plane = Arc::clone(&plane);
                        async move { Ok::<_, Infallible>(handle_request(req, &plane).await) }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("http connection error from {peer}: {e}");
                    }
                });
            }
        }
    }

    info!("control plane stopped");
}

/// Routes one request and records it.
pub async fn handle_request<B>(req: Request<B>, plane: &ControlPlane) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = route(req, plane).await;

    let known = matches!(path.as_str(), "/master" | "/cluster" | "/health" | "/metrics");
    let label = if known { path } else { "other".to_string() };
    counter!(
        "vigil_http_requests_total",
        "method" => method.to_string(),
        "path" => label,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);

    response
}

async fn route<B>(req: Request<B>, plane: &ControlPlane) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/master" => {
            if method == Method::GET {
                return text(StatusCode::OK, plane.masters.current().join(","));
            }
            if !is_mutation(&method) {
                return not_allowed("GET, POST, PUT, DELETE");
            }
            let fields = match read_fields(req).await {
                Ok(f) => f,
                Err(resp) => return resp,
            };
            let addrs = split_list(fields.get("masters"));
            masters_mutation(&method, &addrs, plane).await
        }

        "/cluster" => {
            if !is_mutation(&method) && method != Method::GET {
                return not_allowed("GET, POST, PUT, DELETE");
            }
            let Some(coordinator) = plane.masters.coordinator() else {
                return text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "no cluster coordinator configured",
                );
            };
            if method == Method::GET {
                return match coordinator.peers().await {
                    Ok(peers) => text(StatusCode::OK, join_peers(&peers)),
                    Err(e) => coordinator_error(&e),
                };
            }
            let fields = match read_fields(req).await {
                Ok(f) => f,
                Err(resp) => return resp,
            };
            let peers = match parse_peers(split_list(fields.get("peers"))) {
                Ok(peers) => peers,
                Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
            };
            cluster_mutation(&method, peers, &**coordinator).await
        }

        "/health" => {
            if method != Method::GET {
                return not_allowed("GET");
            }
            text(StatusCode::OK, "ok")
        }

        "/metrics" => {
            if method != Method::GET {
                return not_allowed("GET");
            }
            match &plane.metrics {
                Some(handle) => crate::metrics::render(handle),
                None => text(StatusCode::NOT_FOUND, "metrics disabled"),
            }
        }

        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn masters_mutation(
    method: &Method,
    addrs: &[String],
    plane: &ControlPlane,
) -> Response<Full<Bytes>> {
    let result = match *method {
        Method::POST => plane.masters.add(addrs).await,
        Method::PUT => plane.masters.replace(addrs).await,
        _ => plane.masters.remove(addrs).await,
    };
    match result {
        Ok(()) => {
            info!(method = %method, masters = ?addrs, "master set updated");
            text(StatusCode::OK, "")
        }
        Err(MastersError::InvalidAddress(addr)) => text(
            StatusCode::BAD_REQUEST,
            format!("invalid master address {addr:?}, expected host:port"),
        ),
        Err(MastersError::Coordinator(e)) => coordinator_error(&e),
    }
}

async fn cluster_mutation(
    method: &Method,
    peers: Vec<Peer>,
    coordinator: &dyn Coordinator,
) -> Response<Full<Bytes>> {
    let result = match *method {
        Method::POST => add_all(coordinator, peers).await,
        Method::PUT => coordinator.set_peers(peers).await,
        _ => remove_all(coordinator, peers).await,
    };
    match result {
        Ok(()) => text(StatusCode::OK, ""),
        Err(e) => coordinator_error(&e),
    }
}

async fn add_all(coordinator: &dyn Coordinator, peers: Vec<Peer>) -> Result<(), CoordinatorError> {
    for peer in peers {
        coordinator.add_peer(peer).await?;
    }
    Ok(())
}

async fn remove_all(
    coordinator: &dyn Coordinator,
    peers: Vec<Peer>,
) -> Result<(), CoordinatorError> {
    for peer in peers {
        coordinator.remove_peer(peer).await?;
    }
    Ok(())
}

/// Collects form fields from the query string, then the body.
async fn read_fields<B>(req: Request<B>) -> Result<HashMap<String, String>, Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let mut fields: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let body = match Limited::new(req.into_body(), MAX_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Err(text(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {MAX_BODY} bytes"),
            ))
        }
        Err(e) => {
            return Err(text(
                StatusCode::BAD_REQUEST,
                format!("failed to read body: {e}"),
            ))
        }
    };
    fields.extend(form_urlencoded::parse(&body).into_owned());
    Ok(fields)
}

fn split_list(field: Option<&String>) -> Vec<String> {
    field
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn join_peers(peers: &[Peer]) -> String {
    peers
        .iter()
        .map(Peer::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn is_mutation(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

fn coordinator_error(e: &CoordinatorError) -> Response<Full<Bytes>> {
    text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.into())))
        .unwrap_or_else(|_| internal())
}

fn not_allowed(allow: &'static str) -> Response<Full<Bytes>> {
    let mut resp = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    resp.headers_mut()
        .insert(ALLOW, hyper::header::HeaderValue::from_static(allow));
    resp
}

fn internal() -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}
