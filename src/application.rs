//! One application: the per-deployment bundle of serverlist, control loops,
//! and HTTP listener
//!
//! Every managed deployment gets its own `Application`. Reconfigurable
//! values live in a shared snapshot consulted by the control loops;
//! structural values (prefix, port, routing mode) are fixed for the
//! application's lifetime, and a change means stop-and-recreate.

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::api::Api;
use kube::Client;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::autoscale::{run_pod_scaler, run_pod_watchdog};
use crate::config::AppSettings;
use crate::metrics::run_metrics_updater;
use crate::podwatch::run_pod_controller;
use crate::proxy::ProxyServer;
use crate::serverlist::Serverlist;

/// How long draining HTTP requests get on shutdown before we move on
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// The reconfigurable part of an application's configuration, shared with
/// its control loops.
pub struct AppState {
    pub max_tickets: usize,
    pub spare_tickets: usize,
    pub max_pods: usize,
    pub pod_template: PodTemplateSpec,
}

pub type SharedAppState = Arc<Mutex<AppState>>;

/// A running application: owns the serverlist, the pod controller, the
/// scaler, the pod watchdog, the ticket watchdog, the metrics updater, and
/// the HTTP listener.
///
/// Each control loop has its own stop signal; restarting one loop (the pod
/// watchdog on a cooldown change) must not disturb the others.
pub struct Application {
    settings: AppSettings,
    state: SharedAppState,
    serverlist: Arc<Serverlist>,
    client: Client,
    namespace: String,
    lease_stop: watch::Sender<bool>,
    podwatch_stop: watch::Sender<bool>,
    scaler_stop: watch::Sender<bool>,
    updater_stop: watch::Sender<bool>,
    watchdog_stop: watch::Sender<bool>,
    http_stop: watch::Sender<bool>,
    watchdog_task: Option<JoinHandle<()>>,
    http_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Application {
    pub fn new(
        client: Client,
        namespace: String,
        settings: AppSettings,
        pod_template: PodTemplateSpec,
    ) -> Self {
        let serverlist = Serverlist::new(settings.prefix.clone());
        let state = Arc::new(Mutex::new(AppState {
            max_tickets: settings.max_tickets,
            spare_tickets: settings.spare_tickets,
            max_pods: settings.max_pods,
            pod_template,
        }));

        Self {
            settings,
            state,
            serverlist,
            client,
            namespace,
            lease_stop: watch::channel(false).0,
            podwatch_stop: watch::channel(false).0,
            scaler_stop: watch::channel(false).0,
            updater_stop: watch::channel(false).0,
            watchdog_stop: watch::channel(false).0,
            http_stop: watch::channel(false).0,
            watchdog_task: None,
            http_task: None,
            tasks: Vec::new(),
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn serverlist(&self) -> &Arc<Serverlist> {
        &self.serverlist
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Spawn all control loops and the HTTP listener.
    pub async fn start(&mut self) {
        let prefix = self.settings.prefix.clone();
        info!(
            prefix = %prefix,
            port = self.settings.port,
            dns_mode = self.settings.dns_mode,
            max_tickets = self.settings.max_tickets,
            spare_tickets = self.settings.spare_tickets,
            max_pods = self.settings.max_pods,
            cooldown_secs = self.settings.cooldown.as_secs(),
            "Starting application"
        );

        self.tasks.push(tokio::spawn(
            Arc::clone(&self.serverlist).run_ticket_watchdog(self.lease_stop.subscribe()),
        ));

        self.tasks.push(tokio::spawn(run_pod_controller(
            self.pods_api(),
            prefix.clone(),
            Arc::clone(&self.serverlist),
            Arc::clone(&self.state),
            self.podwatch_stop.subscribe(),
        )));

        self.tasks.push(tokio::spawn(run_pod_scaler(
            self.pods_api(),
            prefix.clone(),
            Arc::clone(&self.serverlist),
            Arc::clone(&self.state),
            self.serverlist.add_informer_channel(),
            self.scaler_stop.subscribe(),
        )));

        self.spawn_pod_watchdog(self.settings.cooldown);

        self.tasks.push(tokio::spawn(run_metrics_updater(
            prefix.clone(),
            Arc::clone(&self.serverlist),
            self.serverlist.add_informer_channel(),
            self.updater_stop.subscribe(),
        )));

        let addr: SocketAddr = ([0, 0, 0, 0], self.settings.port).into();
        match ProxyServer::bind(
            addr,
            Arc::clone(&self.serverlist),
            self.settings.dns_mode,
            self.http_stop.subscribe(),
        )
        .await
        {
            Ok(server) => {
                self.http_task = Some(tokio::spawn(async move {
                    if let Err(e) = server.run().await {
                        error!(error = %e, "Application proxy error");
                    }
                }));
            }
            Err(e) => {
                // the control loops keep running; clients cannot connect
                // until the next structural reconfiguration
                error!(
                    prefix = %prefix,
                    port = self.settings.port,
                    error = %e,
                    "Failed to bind application listener, proxy degraded"
                );
            }
        }
    }

    fn spawn_pod_watchdog(&mut self, cooldown: Duration) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.watchdog_stop = stop_tx;
        self.watchdog_task = Some(tokio::spawn(run_pod_watchdog(
            self.pods_api(),
            self.settings.prefix.clone(),
            Arc::clone(&self.serverlist),
            Arc::clone(&self.state),
            cooldown,
            stop_rx,
        )));
    }

    /// Apply a non-structural configuration change in place, without
    /// touching live sessions.
    pub fn apply_reconfiguration(&mut self, new: &AppSettings) {
        if new.max_tickets != self.settings.max_tickets {
            info!(
                prefix = %self.settings.prefix,
                max_tickets = new.max_tickets,
                "Changing ticket cap on all backends"
            );
            self.state.lock().max_tickets = new.max_tickets;
            self.serverlist.change_all_max_tickets(new.max_tickets);
        }

        if new.spare_tickets != self.settings.spare_tickets {
            info!(
                prefix = %self.settings.prefix,
                spare_tickets = new.spare_tickets,
                "Changing spare-ticket headroom"
            );
            self.state.lock().spare_tickets = new.spare_tickets;
        }

        if new.max_pods != self.settings.max_pods {
            info!(
                prefix = %self.settings.prefix,
                max_pods = new.max_pods,
                "Changing pod cap"
            );
            self.state.lock().max_pods = new.max_pods;
            // nudge the scaler so the new headroom is evaluated immediately
            self.serverlist.notify_update();
        }

        if new.cooldown != self.settings.cooldown {
            info!(
                prefix = %self.settings.prefix,
                cooldown_secs = new.cooldown.as_secs(),
                "Restarting pod watchdog with new cooldown"
            );
            let _ = self.watchdog_stop.send(true);
            self.spawn_pod_watchdog(new.cooldown);
        }

        self.settings = new.clone();
    }

    /// Store a new pod template for future autoscaled pods. Existing pods
    /// are managed by the orchestrator itself and not touched.
    pub fn update_pod_template(&mut self, template: PodTemplateSpec) {
        let mut state = self.state.lock();
        if state.pod_template != template {
            info!(prefix = %self.settings.prefix, "Pod template updated");
            state.pod_template = template;
        }
    }

    /// Graceful shutdown: stop the ticket watchdog, drain the HTTP
    /// listener, stop the scaler and pod watchdog, then close the informer
    /// channels.
    pub async fn stop(mut self) {
        info!(prefix = %self.settings.prefix, "Stopping application");

        let _ = self.lease_stop.send(true);

        let _ = self.http_stop.send(true);
        if let Some(task) = self.http_task.take() {
            if tokio::time::timeout(SHUTDOWN_DRAIN, task).await.is_err() {
                warn!(
                    prefix = %self.settings.prefix,
                    "Listener did not drain in time"
                );
            }
        }

        let _ = self.scaler_stop.send(true);
        let _ = self.watchdog_stop.send(true);
        let _ = self.podwatch_stop.send(true);
        let _ = self.updater_stop.send(true);
        self.serverlist.close_informers();

        let mut tasks = std::mem::take(&mut self.tasks);
        if let Some(task) = self.watchdog_task.take() {
            tasks.push(task);
        }
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN, futures::future::join_all(tasks)).await;

        info!(prefix = %self.settings.prefix, "Application stopped");
    }
}
