//! Prometheus metrics.
//!
//! The recorder is installed once at startup. Failovers are counted by a
//! supervisor handler; leadership, master count, and group count are
//! sampled by a background poller. Everything renders on the control
//! plane's `/metrics` and, when `metrics_port` is set, on a dedicated
//! listener that also answers `/health` and nothing else.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::Supervisor;

/// How often gauges are refreshed and the recorder does upkeep.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the prometheus recorder as the global `metrics` recorder.
pub fn install_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))?;
    Ok(handle)
}

/// Registers a failover handler that counts promotions.
pub fn count_failovers(supervisor: &Supervisor) {
    supervisor.add_handler(|_old, _new| {
        counter!("vigil_failovers_total").increment(1);
        Ok(())
    });
}

/// Records the supervisor's current gauges.
pub fn record_stats(supervisor: &Supervisor) {
    gauge!("vigil_is_leader").set(if supervisor.is_leader() { 1.0 } else { 0.0 });
    gauge!("vigil_monitored_masters").set(supervisor.masters().current().len() as f64);
    gauge!("vigil_groups").set(supervisor.group_count() as f64);
}

/// Spawns the gauge poller and the recorder upkeep task.
pub fn spawn_stats_poller(supervisor: Arc<Supervisor>, handle: PrometheusHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            record_stats(&supervisor);
            handle.run_upkeep();
        }
    })
}

/// Serves `/metrics` and `/health` on a dedicated listener until
/// `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    handle: PrometheusHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("metrics and health endpoint on http://{addr}");
    }

    loop {
        let stream = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("metrics accept error: {e}");
                    continue;
                }
            },
        };

        let handle = handle.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let resp = metrics_response(&req, &handle);
            async move { Ok::<_, Infallible>(resp) }
        });
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection error: {e}");
            }
        });
    }
}

/// The prometheus text exposition of everything recorded so far.
pub fn render(handle: &PrometheusHandle) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(handle.render())));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    resp
}

fn metrics_response<B>(req: &Request<B>, handle: &PrometheusHandle) -> Response<Full<Bytes>> {
    let (status, body) = match req.uri().path() {
        "/metrics" => return render(handle),
        "/health" => (StatusCode::OK, "ok"),
        _ => (StatusCode::NOT_FOUND, "not found"),
    };
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
