//! Demand-driven pod creation and idle-driven pod reaping
//!
//! The scaler listens to serverlist informer events and creates one pod from
//! the stored template whenever free tickets fall under the configured
//! headroom. The watchdog periodically reaps autoscaled pods that sat idle
//! through a full cooldown. Neither loop mutates the serverlist: they only
//! talk to the orchestrator, and the pod controller reacts to the outcome.
//! Orchestrator API failures are logged and retried on the next event or
//! tick.

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::application::SharedAppState;
use crate::config::{LABEL_APP_NAME, LABEL_SCALED};
use crate::metrics;
use crate::serverlist::{InformerEvent, Serverlist};

/// Whether removing a backend's slots still leaves the configured headroom.
fn may_reap(available: usize, spare: usize, backend_max_tickets: usize) -> bool {
    available.saturating_sub(backend_max_tickets) >= spare
}

fn is_scaled(pod: &Pod) -> bool {
    pod.labels()
        .get(LABEL_SCALED)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Instantiate one autoscaled pod from the deployment's template.
pub fn build_scaled_pod(template: &PodTemplateSpec, prefix: &str) -> Pod {
    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata.name = None;
    metadata.generate_name = Some(format!("{}-k8sticket-autoscaled-", prefix.to_lowercase()));
    let mut labels = metadata.labels.unwrap_or_default();
    labels.insert(LABEL_SCALED.to_string(), "true".to_string());
    metadata.labels = Some(labels);

    Pod {
        metadata,
        spec: template.spec.clone(),
        ..Default::default()
    }
}

/// The pod scaler: reacts to `NewTicket` and `Update` informer events by
/// checking the free-ticket headroom and creating a pod when it is short.
pub async fn run_pod_scaler(
    pods: Api<Pod>,
    prefix: String,
    list: Arc<Serverlist>,
    state: SharedAppState,
    mut informer: mpsc::Receiver<InformerEvent>,
    mut stop: watch::Receiver<bool>,
) {
    info!(prefix = %prefix, "Pod scaler started");
    loop {
        tokio::select! {
            event = informer.recv() => {
                match event {
                    Some(InformerEvent::NewTicket) | Some(InformerEvent::Update) => {
                        scale_up_if_needed(&pods, &prefix, &list, &state).await;
                    }
                    Some(InformerEvent::DeleteTicket) => {}
                    None => {
                        debug!(prefix = %prefix, "Informer channels closed, pod scaler exiting");
                        return;
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(prefix = %prefix, "Pod scaler exiting");
                    return;
                }
            }
        }
    }
}

async fn scale_up_if_needed(
    pods: &Api<Pod>,
    prefix: &str,
    list: &Arc<Serverlist>,
    state: &SharedAppState,
) {
    let (spare, max_pods, template) = {
        let state = state.lock();
        (
            state.spare_tickets,
            state.max_pods,
            state.pod_template.clone(),
        )
    };

    // advisory check: a burst of events can briefly overshoot by one pod,
    // the cap below bounds it
    let available = list.available_tickets();
    if available >= spare {
        return;
    }

    let selector = format!("{}={},{}=true", LABEL_APP_NAME, prefix, LABEL_SCALED);
    let scaled = match pods.list(&ListParams::default().labels(&selector)).await {
        Ok(listing) => listing.items,
        Err(e) => {
            warn!(prefix = %prefix, error = %e, "Listing scaled pods failed, retrying on next event");
            return;
        }
    };
    metrics::set_scaled_pods(prefix, scaled.len());

    if scaled.len() >= max_pods {
        debug!(
            prefix = %prefix,
            scaled = scaled.len(),
            max_pods,
            "Ticket headroom low but pod cap reached"
        );
        return;
    }

    let pod = build_scaled_pod(&template, prefix);
    match pods.create(&PostParams::default(), &pod).await {
        Ok(created) => {
            info!(prefix = %prefix, pod = %created.name_any(), "Created autoscaled pod");
            metrics::set_scaled_pods(prefix, scaled.len() + 1);
        }
        Err(e) => {
            warn!(prefix = %prefix, error = %e, "Creating autoscaled pod failed, retrying on next event");
        }
    }
}

/// The pod watchdog: every `cooldown` it reaps autoscaled pods that are
/// ticketless, idle past the cooldown, and not needed to keep the headroom.
/// A reconfigured cooldown means the running watchdog is stopped and a new
/// one started.
pub async fn run_pod_watchdog(
    pods: Api<Pod>,
    prefix: String,
    list: Arc<Serverlist>,
    state: SharedAppState,
    cooldown: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(prefix = %prefix, cooldown_secs = cooldown.as_secs(), "Pod watchdog started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(cooldown) => {
                reap_idle_pods(&pods, &prefix, &list, &state, cooldown).await;
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!(prefix = %prefix, "Pod watchdog exiting");
                    return;
                }
            }
        }
    }
}

async fn reap_idle_pods(
    pods: &Api<Pod>,
    prefix: &str,
    list: &Arc<Serverlist>,
    state: &SharedAppState,
    cooldown: Duration,
) {
    debug!(prefix = %prefix, "Pod watchdog starts cleaning");

    let selector = format!("{}={}", LABEL_APP_NAME, prefix);
    let all = match pods.list(&ListParams::default().labels(&selector)).await {
        Ok(listing) => listing.items,
        Err(e) => {
            warn!(prefix = %prefix, error = %e, "Listing pods failed, retrying on next tick");
            return;
        }
    };

    let scaled: Vec<&Pod> = all.iter().filter(|p| is_scaled(p)).collect();
    metrics::set_scaled_pods(prefix, scaled.len());

    let spare = state.lock().spare_tickets;
    if list.available_tickets() <= spare {
        return;
    }

    for pod in scaled {
        let name = pod.name_any();
        match list.server(&name) {
            Some(backend) => {
                debug!(
                    pod = %name,
                    tickets = backend.ticket_count(),
                    "Checking autoscaled pod"
                );
                if backend.has_no_tickets()
                    && backend.idle_for() > cooldown
                    && may_reap(list.available_tickets(), spare, backend.max_tickets())
                {
                    delete_pod(pods, &name).await;
                }
            }
            None => {
                // not Ready yet or already draining; it serves nobody
                warn!(pod = %name, "Autoscaled pod not in the serverlist, deleting");
                delete_pod(pods, &name).await;
            }
        }
    }

    // the reverse case is only observed: the pod handler owns all
    // serverlist mutations
    let known: HashSet<String> = all.iter().map(|p| p.name_any()).collect();
    for name in list.server_names() {
        if !known.contains(&name) {
            warn!(backend = %name, "Backend has no matching pod");
        }
    }
}

async fn delete_pod(pods: &Api<Pod>, name: &str) {
    match pods.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!(pod = %name, "Deleted autoscaled pod"),
        Err(e) => warn!(pod = %name, error = %e, "Deleting pod failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    #[test]
    fn test_may_reap_keeps_headroom() {
        // removing 1 slot from 4 available with spare 2 is fine
        assert!(may_reap(4, 2, 1));
        // removing 3 slots from 4 available with spare 2 is not
        assert!(!may_reap(4, 2, 3));
        // boundary: exactly the spare left after removal
        assert!(may_reap(3, 2, 1));
        assert!(!may_reap(2, 2, 1));
    }

    #[test]
    fn test_build_scaled_pod() {
        let template = PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(
                    [
                        ("k8sticket.deployment.app.name".to_string(), "shiny".to_string()),
                    ]
                    .into(),
                ),
                ..Default::default()
            }),
            spec: Some(Default::default()),
        };

        let pod = build_scaled_pod(&template, "Shiny");
        assert_eq!(
            pod.metadata.generate_name.as_deref(),
            Some("shiny-k8sticket-autoscaled-")
        );
        assert_eq!(pod.metadata.name, None);

        let labels = pod.metadata.labels.unwrap();
        // the template's labels survive and the scaled marker is added
        assert_eq!(
            labels.get("k8sticket.deployment.app.name").map(String::as_str),
            Some("shiny")
        );
        assert_eq!(labels.get(LABEL_SCALED).map(String::as_str), Some("true"));
        assert!(pod.spec.is_some());
    }

    #[test]
    fn test_is_scaled() {
        let mut pod = Pod::default();
        assert!(!is_scaled(&pod));

        pod.metadata.labels = Some([(LABEL_SCALED.to_string(), "true".to_string())].into());
        assert!(is_scaled(&pod));

        pod.metadata.labels = Some([(LABEL_SCALED.to_string(), "false".to_string())].into());
        assert!(!is_scaled(&pod));
    }
}
