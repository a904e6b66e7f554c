//! Deployment meta-controller: one application per labelled deployment
//!
//! Watches deployments labelled `k8sticket=true` and keeps the application
//! map in sync. Annotation changes are classified: structural changes
//! (prefix, port, routing mode) tear the application down and start a fresh
//! one, so live sessions are lost and clients rehandshake; everything else
//! is applied in place.

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::Application;
use crate::config::{AppSettings, LABEL_MANAGED};

fn pod_template(deployment: &Deployment) -> PodTemplateSpec {
    deployment
        .spec
        .as_ref()
        .map(|spec| spec.template.clone())
        .unwrap_or_default()
}

async fn reconcile(
    applications: &mut HashMap<String, Application>,
    client: &Client,
    namespace: &str,
    deployment: &Deployment,
) {
    let name = deployment.name_any();
    let settings = AppSettings::from_deployment(deployment);
    let template = pod_template(deployment);

    if let Some(app) = applications.get_mut(&name) {
        if !app.settings().requires_restart(&settings) {
            app.apply_reconfiguration(&settings);
            app.update_pod_template(template);
            return;
        }
        info!(
            deployment = %name,
            "Structural configuration change, restarting application"
        );
        if let Some(old) = applications.remove(&name) {
            old.stop().await;
        }
    } else {
        info!(deployment = %name, prefix = %settings.prefix, "Adding deployment");
    }

    let mut app = Application::new(client.clone(), namespace.to_string(), settings, template);
    app.start().await;
    applications.insert(name, app);
}

/// Watch managed deployments and reconcile the application map until the
/// stop signal fires; every application is shut down gracefully on exit.
pub async fn run_deployment_controller(
    client: Client,
    namespace: String,
    mut stop: watch::Receiver<bool>,
) {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let selector = format!("{}=true", LABEL_MANAGED);
    let stream = watcher(deployments, watcher::Config::default().labels(&selector));
    tokio::pin!(stream);

    let mut applications: HashMap<String, Application> = HashMap::new();
    info!(namespace = %namespace, selector = %selector, "Deployment controller started");

    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Apply(deployment)))
                    | Some(Ok(watcher::Event::InitApply(deployment))) => {
                        reconcile(&mut applications, &client, &namespace, &deployment).await;
                    }
                    Some(Ok(watcher::Event::Delete(deployment))) => {
                        let name = deployment.name_any();
                        match applications.remove(&name) {
                            Some(app) => {
                                info!(deployment = %name, "Deployment deleted, stopping application");
                                app.stop().await;
                            }
                            None => debug!(deployment = %name, "Unknown deployment deleted"),
                        }
                    }
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Deployment watch error");
                    }
                    None => {
                        warn!("Deployment watch stream ended");
                        break;
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!(count = applications.len(), "Stopping all applications");
    for (_, app) in applications.drain() {
        app.stop().await;
    }
}
