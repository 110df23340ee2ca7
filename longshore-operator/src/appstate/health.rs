//! Per-kind health predicates.
//!
//! Pure functions from an observed object to a [`State`]; the watch tasks
//! feed them and the reducer aggregates. Service health is judged through
//! the service's Endpoints object, ingress health through its backend
//! services plus the external address.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim};
use k8s_openapi::api::networking::v1::Ingress;

use longshore_wire::State;

/// Ready once the ready replica count reaches the desired count; partial
/// availability is degraded. Desired defaults to 1 when unset.
pub fn deployment_state(deployment: &Deployment) -> State {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    replica_state(ready, desired)
}

pub fn stateful_set_state(sts: &StatefulSet) -> State {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    replica_state(ready, desired)
}

fn replica_state(ready: i32, desired: i32) -> State {
    if ready >= desired {
        State::Ready
    } else if ready > 0 {
        State::Degraded
    } else {
        State::Unavailable
    }
}

/// Endpoints carry the service's ready and not-ready pod addresses.
pub fn endpoints_state(endpoints: &Endpoints) -> State {
    let mut ready = 0usize;
    let mut not_ready = 0usize;
    for subset in endpoints.subsets.iter().flatten() {
        ready += subset.addresses.as_ref().map_or(0, Vec::len);
        not_ready += subset.not_ready_addresses.as_ref().map_or(0, Vec::len);
    }
    if ready > 0 && not_ready == 0 {
        State::Ready
    } else if ready > 0 {
        State::Degraded
    } else {
        State::Unavailable
    }
}

pub fn pvc_state(pvc: &PersistentVolumeClaim) -> State {
    match pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
    {
        "Bound" => State::Ready,
        "Pending" => State::Degraded,
        _ => State::Unavailable,
    }
}

/// Service name of the ingress default backend, if one is set.
pub fn default_backend_service(ingress: &Ingress) -> Option<String> {
    ingress
        .spec
        .as_ref()?
        .default_backend
        .as_ref()?
        .service
        .as_ref()
        .map(|s| s.name.clone())
}

/// Distinct service names referenced by the ingress rule paths, in rule
/// order.
pub fn rule_backend_services(ingress: &Ingress) -> Vec<String> {
    let mut names = Vec::new();
    let rules = ingress.spec.iter().flat_map(|s| s.rules.iter().flatten());
    for rule in rules {
        let paths = rule.http.iter().flat_map(|h| h.paths.iter());
        for path in paths {
            if let Some(service) = &path.backend.service {
                if !names.contains(&service.name) {
                    names.push(service.name.clone());
                }
            }
        }
    }
    names
}

/// Ready once the load balancer assigned an address.
pub fn external_address_state(ingress: &Ingress) -> State {
    let assigned = ingress
        .status
        .iter()
        .flat_map(|s| s.load_balancer.iter())
        .flat_map(|lb| lb.ingress.iter().flatten())
        .any(|i| {
            i.ip.as_deref().is_some_and(|v| !v.is_empty())
                || i.hostname.as_deref().is_some_and(|v| !v.is_empty())
        });
    if assigned { State::Ready } else { State::Unavailable }
}
