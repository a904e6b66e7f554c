//! Pod controller: orchestrator pod events drive the serverlist
//!
//! A watcher stream filtered on the application label feeds observations
//! into a handler that diffs them against the previously seen state of each
//! pod. Only edges produce serverlist mutations, so replayed or identical
//! events are no-ops.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::SharedAppState;
use crate::config::{BackendConfig, LABEL_APP_NAME};
use crate::error::Error;
use crate::serverlist::Serverlist;

/// What matters about a pod for routing purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    /// Running, Ready, and holding an IP
    pub live: bool,
    pub ip: Option<String>,
}

/// Reduce a pod to the observation the handler diffs on.
pub fn observe(pod: &Pod) -> PodObservation {
    let status = pod.status.as_ref();
    let running = status
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false);
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let ip = status
        .and_then(|s| s.pod_ip.clone())
        .filter(|ip| !ip.is_empty());

    PodObservation {
        live: running && ready && ip.is_some(),
        ip,
    }
}

/// Translates pod observations into serverlist mutations for one
/// application.
pub struct PodHandler {
    list: Arc<Serverlist>,
    state: SharedAppState,
    seen: HashMap<String, PodObservation>,
}

impl PodHandler {
    pub fn new(list: Arc<Serverlist>, state: SharedAppState) -> Self {
        Self {
            list,
            state,
            seen: HashMap::new(),
        }
    }

    /// Handle an add or update event for a pod.
    pub fn apply(&mut self, pod: &Pod) {
        let name = pod.name_any();
        let observation = observe(pod);

        // identical repeated observations must not touch the serverlist
        if self.seen.get(&name) == Some(&observation) {
            return;
        }
        let previous = self.seen.insert(name.clone(), observation.clone());
        let was_live = previous.as_ref().map(|p| p.live).unwrap_or(false);

        if observation.live {
            if was_live {
                // address changed under the same name: drain the old backend
                // and register the new one
                info!(pod = %name, "Pod address changed, replacing backend");
                if let Err(e) = self.list.set_server_deletion(&name) {
                    warn!(pod = %name, error = %e, "Draining replaced backend failed");
                }
            } else {
                info!(pod = %name, "Pod became ready");
            }
            self.add_backend(&name, pod);
        } else if was_live {
            info!(pod = %name, "Pod no longer ready");
            self.drain_backend(&name);
        } else {
            debug!(pod = %name, "Pod not ready yet, waiting for next update");
        }
    }

    /// Handle a delete event for a pod.
    pub fn delete(&mut self, name: &str) {
        info!(pod = %name, "Pod deleted");
        self.seen.remove(name);
        self.drain_backend(name);
    }

    fn add_backend(&self, name: &str, pod: &Pod) {
        let config = match BackendConfig::from_pod(pod) {
            Ok(config) => config,
            Err(e) => {
                // NO_IP: skip, the next update event retries
                debug!(pod = %name, error = %e, "Skipping pod");
                return;
            }
        };
        let max_tickets = self.state.lock().max_tickets;
        if let Err(e) = self.list.add_server(name, max_tickets, config) {
            warn!(pod = %name, error = %e, "AddServer failed");
        }
    }

    fn drain_backend(&self, name: &str) {
        match self.list.set_server_deletion(name) {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!(pod = %name, "Backend already gone");
            }
            Err(e) => {
                warn!(pod = %name, error = %e, "SetServerDeletion failed");
            }
        }
    }
}

/// Watch pods carrying the application label and feed every event into the
/// handler until the stop signal fires.
pub async fn run_pod_controller(
    pods: Api<Pod>,
    prefix: String,
    list: Arc<Serverlist>,
    state: SharedAppState,
    mut stop: watch::Receiver<bool>,
) {
    let selector = format!("{}={}", LABEL_APP_NAME, prefix);
    let stream = watcher(pods, watcher::Config::default().labels(&selector));
    tokio::pin!(stream);

    let mut handler = PodHandler::new(list, state);
    info!(prefix = %prefix, selector = %selector, "Pod controller started");

    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Apply(pod)))
                    | Some(Ok(watcher::Event::InitApply(pod))) => handler.apply(&pod),
                    Some(Ok(watcher::Event::Delete(pod))) => handler.delete(&pod.name_any()),
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Err(e)) => {
                        // the watcher re-establishes itself; nothing to do
                        warn!(prefix = %prefix, error = %e, "Pod watch error");
                    }
                    None => {
                        warn!(prefix = %prefix, "Pod watch stream ended");
                        return;
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(prefix = %prefix, "Pod controller exiting");
                    return;
                }
            }
        }
    }
}
