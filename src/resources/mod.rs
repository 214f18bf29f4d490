//! Resource adapters and the static resource table.
//!
//! | resource                 | actions                                   | watch label      |
//! |--------------------------|-------------------------------------------|------------------|
//! | `watch`                  | get                                       |                  |
//! | `pod`                    | list get delete update_yaml + sessions    | `pods`           |
//! | `namespace`              | list get                                  | `namespace`      |
//! | `node`                   | list                                      | `node`           |
//! | `event`                  | list                                      | `event`          |
//! | `deployment`             | list get delete update_yaml update_obj    | `deployment`     |
//! | `statefulset`            | list get delete update_yaml update_obj    | `statefulset`    |
//! | `daemonset` `job` `cronjob` | list get delete update_yaml update_obj | kind name        |
//! | `configMap` `persistentVolume` `persistentVolumeClaim` | list get update_yaml |       |
//! | `storageClass`           | list get                                  |                  |
//! | `horizontalPodAutoscaler`| list get update_yaml delete               |                  |
//! | `service` `ingress` `endpoints` `networkpolicy` `serviceaccount` | list get update_yaml delete | kind name |
//! | `rolebinding`            | list get update_yaml                      | `rolebinding`    |
//! | `role`                   | list get                                  | `role`           |
//! | `secret`                 | list get                                  |                  |
//!
//! Pod session actions (`exec`, `stdin`, `openLog`, `closeLog`) live in
//! [`pod`]; everything else is the generic [`kind::KindResource`].

pub mod kind;
pub mod pod;

use std::sync::Arc;

use tracing::debug;

use crate::cluster::{ClusterClient, EventSource, ResourceKind};
use crate::registry::actions::{DELETE, GET, LIST, UPDATE_OBJ, UPDATE_YAML};
use crate::registry::CommandRegistry;
use crate::watch::WatchGate;
pub use kind::KindResource;
pub use pod::PodSessions;

/// Static description of one resource kind.
#[derive(Debug)]
pub struct KindSpec {
    /// Name used in request envelopes, e.g. `configMap`.
    pub resource: &'static str,
    /// Human name used in messages, e.g. `ConfigMap`.
    pub display: &'static str,
    pub api: ResourceKind,
    pub actions: &'static [&'static str],
    /// Label carried by watch events; `None` when the kind is not watched.
    pub watch: Option<&'static str>,
}

const READ: &[&str] = &[LIST, GET];
const READ_UPDATE: &[&str] = &[LIST, GET, UPDATE_YAML];
const EDITABLE: &[&str] = &[LIST, GET, UPDATE_YAML, DELETE];
const WORKLOAD: &[&str] = &[LIST, GET, DELETE, UPDATE_YAML, UPDATE_OBJ];

impl KindSpec {
    /// Whether `update_obj` sets `spec.replicas` for this kind.
    pub fn scales(&self) -> bool {
        matches!(self.resource, "deployment" | "statefulset")
    }
}

const fn kind(
    resource: &'static str,
    display: &'static str,
    api: ResourceKind,
    actions: &'static [&'static str],
    watch: Option<&'static str>,
) -> KindSpec {
    KindSpec {
        resource,
        display,
        api,
        actions,
        watch,
    }
}

const fn ns(plural: &'static str) -> ResourceKind {
    ResourceKind::namespaced(plural)
}

const fn cluster(plural: &'static str) -> ResourceKind {
    ResourceKind::cluster_scoped(plural)
}

pub static KINDS: &[KindSpec] = &[
    kind("pod", "Pod", ns("pods"), EDITABLE, Some("pods")),
    kind("namespace", "Namespace", cluster("namespaces"), READ, Some("namespace")),
    kind("node", "Node", cluster("nodes"), &[LIST], Some("node")),
    kind("event", "Event", ns("events"), &[LIST], Some("event")),
    kind("deployment", "Deployment", ns("deployments"), WORKLOAD, Some("deployment")),
    kind("statefulset", "StatefulSet", ns("statefulsets"), WORKLOAD, Some("statefulset")),
    kind("daemonset", "DaemonSet", ns("daemonsets"), WORKLOAD, Some("daemonset")),
    kind("job", "Job", ns("jobs"), WORKLOAD, Some("job")),
    kind("cronjob", "CronJob", ns("cronjobs"), WORKLOAD, Some("cronjob")),
    kind("configMap", "ConfigMap", ns("configmaps"), READ_UPDATE, None),
    kind("persistentVolume", "PersistentVolume", cluster("persistentvolumes"), READ_UPDATE, None),
    kind("persistentVolumeClaim", "PersistentVolumeClaim", ns("persistentvolumeclaims"), READ_UPDATE, None),
    kind("storageClass", "StorageClass", cluster("storageclasses"), READ, None),
    kind("horizontalPodAutoscaler", "HorizontalPodAutoscaler", ns("horizontalpodautoscalers"), EDITABLE, None),
    kind("service", "Service", ns("services"), EDITABLE, Some("service")),
    kind("ingress", "Ingress", ns("ingresses"), EDITABLE, Some("ingress")),
    kind("endpoints", "Endpoints", ns("endpoints"), EDITABLE, Some("endpoints")),
    kind("networkpolicy", "NetworkPolicy", ns("networkpolicies"), EDITABLE, Some("networkpolicy")),
    kind("serviceaccount", "ServiceAccount", ns("serviceaccounts"), EDITABLE, Some("serviceAccount")),
    kind("rolebinding", "RoleBinding", ns("rolebindings"), READ_UPDATE, Some("rolebinding")),
    kind("role", "Role", ns("roles"), READ, Some("role")),
    kind("secret", "Secret", ns("secrets"), READ, None),
];

/// Table entry for a request-level resource name.
pub fn spec_for(resource: &str) -> Option<&'static KindSpec> {
    KINDS.iter().find(|spec| spec.resource == resource)
}

/// Install every handler and subscribe every watched kind to the gate.
///
/// Runs once at startup, before the tunnel connects.
pub fn register_all(
    registry: &mut CommandRegistry,
    client: &Arc<dyn ClusterClient>,
    events: &dyn EventSource,
    gate: &WatchGate,
    pod_sessions: &PodSessions,
) {
    let watch_gate = gate.clone();
    registry.register("watch", GET, move |params| {
        let gate = watch_gate.clone();
        async move { gate.set_watch(&params) }
    });

    for spec in KINDS {
        KindResource::new(spec, Arc::clone(client)).register(registry);
        if let Some(label) = spec.watch {
            events.subscribe(spec.api, gate.handlers(label));
            debug!(resource = spec.resource, label, "Watch subscribed");
        }
    }
    pod_sessions.register(registry);
}
