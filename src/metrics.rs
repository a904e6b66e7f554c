//! Prometheus metrics, labelled per application
//!
//! The registry is process-global: applications come and go with deployment
//! changes, but their series survive under the `application` label. The
//! updater consumes a serverlist informer channel; the scaled-pods gauge is
//! set wherever the scaled-pod list is already at hand (scaler and
//! watchdog).

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::serverlist::{InformerEvent, Serverlist};

/// Label set applied to every exported series
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AppLabels {
    pub application: String,
}

impl prometheus_client::encoding::EncodeLabelSet for AppLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("application", self.application.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// The exported metrics: current users, free tickets, autoscaled pods, and
/// a counter of all tickets ever issued.
pub struct Metrics {
    current_users: Family<AppLabels, Gauge>,
    current_free_tickets: Family<AppLabels, Gauge>,
    scaled_pods: Family<AppLabels, Gauge>,
    users_total: Family<AppLabels, Counter>,
    registry: Registry,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let current_users = Family::<AppLabels, Gauge>::default();
        registry.register(
            "k8sticket_current_users_total",
            "The total number of current users",
            current_users.clone(),
        );

        let current_free_tickets = Family::<AppLabels, Gauge>::default();
        registry.register(
            "k8sticket_current_free_tickets_total",
            "The number of slots that can be used for client connections",
            current_free_tickets.clone(),
        );

        let scaled_pods = Family::<AppLabels, Gauge>::default();
        registry.register(
            "k8sticket_scaled_pods_total",
            "The number of pods autoscaled for ticket demand",
            scaled_pods.clone(),
        );

        // the exposition adds the _total suffix for counters
        let users_total = Family::<AppLabels, Counter>::default();
        registry.register(
            "k8sticket_users",
            "The total number of users served (tickets issued)",
            users_total.clone(),
        );

        Self {
            current_users,
            current_free_tickets,
            scaled_pods,
            users_total,
            registry,
        }
    }

    pub fn encode_text(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// The process-global metrics registry.
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

fn labels(application: &str) -> AppLabels {
    AppLabels {
        application: application.to_string(),
    }
}

/// Record the current number of autoscaled pods of an application.
pub fn set_scaled_pods(application: &str, count: usize) {
    global()
        .scaled_pods
        .get_or_create(&labels(application))
        .set(count as i64);
}

/// Keep the per-application gauges in sync with the serverlist. Consumes
/// one informer channel; exits when the informers close or the stop signal
/// fires.
pub async fn run_metrics_updater(
    application: String,
    list: Arc<Serverlist>,
    mut informer: mpsc::Receiver<InformerEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let labels = labels(&application);
    loop {
        tokio::select! {
            event = informer.recv() => {
                match event {
                    Some(event) => {
                        if event == InformerEvent::NewTicket {
                            global().users_total.get_or_create(&labels).inc();
                        }
                        global()
                            .current_users
                            .get_or_create(&labels)
                            .set(list.ticket_count() as i64);
                        global()
                            .current_free_tickets
                            .get_or_create(&labels)
                            .set(list.available_tickets() as i64);
                    }
                    None => {
                        debug!(application = %application, "Informer channels closed, metrics updater exiting");
                        return;
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(application = %application, "Metrics updater exiting");
                    return;
                }
            }
        }
    }
}

async fn handle_metrics_request(
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not found")))
            .expect("valid response with StatusCode enum"));
    }

    match global().encode_text() {
        Ok(body) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(
                "Content-Type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Full::new(Bytes::from(body)))
            .expect("valid response with StatusCode enum and static header")),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from("Encoding error")))
                .expect("valid response with StatusCode enum"))
        }
    }
}

/// Serve `/metrics` on a pre-bound listener until shutdown. The listener is
/// bound by the caller so a taken port is a startup failure, not a silent
/// background error.
pub async fn run_metrics_server(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Metrics server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(handle_metrics_request);
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "Metrics connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept metrics connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Metrics server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposition_contains_registered_series() {
        set_scaled_pods("metrics-test-app", 3);
        global()
            .users_total
            .get_or_create(&labels("metrics-test-app"))
            .inc();

        let text = global().encode_text().unwrap();
        assert!(text.contains("k8sticket_scaled_pods_total"));
        assert!(text.contains("k8sticket_users_total"));
        assert!(text.contains("application=\"metrics-test-app\""));
    }
}
