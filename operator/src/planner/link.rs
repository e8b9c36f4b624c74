use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::selector::selector_matches;
use crate::store::{Kind, Snapshot, get_fqn};
use crate::util::Error;

/// Returns the target's spec extended with its linked elements: the
/// linked VirtualService's selector is appended to the cluster endpoint
/// list and its listener spec overwrites the cluster spec. `None` means
/// the link could not be resolved and the target must contribute nothing.
pub fn target_extended_spec(snap: &Snapshot, target: &Value) -> Option<Value> {
    let mut spec = target.get("spec").cloned().unwrap_or_else(|| json!({}));

    let Some(linked) = spec
        .get("linkedVirtualService")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return Some(spec);
    };
    spec.as_object_mut()?.remove("linkedVirtualService");

    // Look the VirtualService up by FQN first, then fall back to a
    // metadata.name scan.
    let vsvc = snap.get(Kind::VirtualServices, &linked).or_else(|| {
        snap.objects(Kind::VirtualServices).map(|(_, v)| v).find(|v| {
            v.get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                == Some(linked.as_str())
        })
    })?;

    let vsvc_spec = vsvc.get("spec").cloned().unwrap_or_else(|| json!({}));
    let cluster = spec
        .as_object_mut()?
        .entry("cluster")
        .or_insert_with(|| json!({}));
    let cluster = cluster.as_object_mut()?;

    if let Some(selector) = vsvc_spec.get("selector")
        && selector.as_object().is_some_and(|s| !s.is_empty())
    {
        let eps = cluster
            .entry("endpoints")
            .or_insert_with(|| json!([]))
            .as_array_mut()?;
        eps.push(json!({"selector": selector}));
    }

    let listener_spec = vsvc_spec
        .get("listener")
        .and_then(|l| l.get("spec"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    cluster.insert("spec".into(), listener_spec);

    Some(spec)
}

/// Partitions a target's endpoint list into pass-through static entries
/// and dynamic entries materialised from the pods its selector matches.
/// Pods without an observed podIP never produce a dynamic endpoint.
pub fn endpoint_groups(
    snap: &Snapshot,
    target: &Value,
) -> Result<(Vec<Value>, BTreeMap<String, Value>), Error> {
    let mut static_eps = Vec::new();
    let mut dynamic_eps = BTreeMap::new();

    let endpoints = target
        .get("spec")
        .and_then(|s| s.get("cluster"))
        .and_then(|c| c.get("endpoints"))
        .and_then(Value::as_array);
    let Some(endpoints) = endpoints else {
        return Ok((static_eps, dynamic_eps));
    };
    let target_fqn = get_fqn(target).unwrap_or_default();

    for ep in endpoints {
        if ep.get("spec").is_some() {
            static_eps.push(ep.clone());
        } else if let Some(selector) = ep.get("selector") {
            for (_, pod) in snap.objects(Kind::Pods) {
                if !selector_matches(snap, selector, pod)? {
                    continue;
                }
                let Some(pod_ip) = pod
                    .get("status")
                    .and_then(|s| s.get("podIP"))
                    .and_then(Value::as_str)
                    .filter(|ip| !ip.is_empty())
                else {
                    continue;
                };
                let name = format!("{target_fqn}/{pod_ip}");
                dynamic_eps.insert(
                    name.clone(),
                    json!({
                        "metadata": {"name": name},
                        "spec": {"address": pod_ip},
                    }),
                );
            }
        } else {
            // Should have been caught by schema verification earlier.
            tracing::warn!(endpoint = %ep, "Unknown endpoint spec");
        }
    }

    Ok((static_eps, dynamic_eps))
}

pub(super) fn spec_is_empty(spec: &Value) -> bool {
    match spec {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn store_with_vsvc() -> Store {
        let mut store = Store::default();
        store.put(
            Kind::VirtualServices,
            "/l7mp.io/v1/VirtualService/default/V".into(),
            json!({
                "apiVersion": "l7mp.io/v1",
                "kind": "VirtualService",
                "metadata": {"namespace": "default", "name": "V"},
                "spec": {
                    "selector": {"matchLabels": {"app": "x"}},
                    "listener": {"spec": {"UDP": {"port": 18002}}},
                },
            }),
        );
        store
    }

    fn target(linked: &str) -> Value {
        json!({
            "apiVersion": "l7mp.io/v1",
            "kind": "Target",
            "metadata": {"namespace": "default", "name": "T"},
            "spec": {
                "selector": {"matchLabels": {"app": "ingress"}},
                "linkedVirtualService": linked,
                "cluster": {"endpoints": [{"spec": {"address": "1.2.3.4"}}]},
            },
        })
    }

    #[test]
    fn link_splices_listener_spec_and_selector_endpoint() {
        let snap = store_with_vsvc().snapshot();
        let spec = target_extended_spec(&snap, &target("V")).expect("resolvable");

        assert_eq!(spec["cluster"]["spec"], json!({"UDP": {"port": 18002}}));
        let eps = spec["cluster"]["endpoints"].as_array().unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0], json!({"spec": {"address": "1.2.3.4"}}));
        assert_eq!(eps[1], json!({"selector": {"matchLabels": {"app": "x"}}}));
        assert!(spec.get("linkedVirtualService").is_none());
    }

    #[test]
    fn link_resolves_by_name_scan_too() {
        let snap = store_with_vsvc().snapshot();
        // FQN lookup misses, metadata.name scan hits.
        assert!(target_extended_spec(&snap, &target("V")).is_some());
        assert!(
            target_extended_spec(
                &snap,
                &target("/l7mp.io/v1/VirtualService/default/V")
            )
            .is_some()
        );
    }

    #[test]
    fn unresolvable_link_suppresses_the_target() {
        let snap = Store::default().snapshot();
        assert!(target_extended_spec(&snap, &target("missing")).is_none());
    }

    #[test]
    fn target_without_link_passes_its_spec_through() {
        let snap = Store::default().snapshot();
        let t = json!({
            "apiVersion": "l7mp.io/v1",
            "kind": "Target",
            "metadata": {"namespace": "default", "name": "T"},
            "spec": {"selector": {}, "cluster": {"endpoints": []}},
        });
        assert_eq!(
            target_extended_spec(&snap, &t),
            Some(t["spec"].clone())
        );
    }

    #[test]
    fn dynamic_endpoints_skip_pods_without_ip() {
        let mut store = Store::default();
        for (name, ip) in [("p1", Some("10.0.0.1")), ("p2", None)] {
            let mut pod = json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"namespace": "default", "name": name, "labels": {"app": "x"}},
                "status": {},
            });
            if let Some(ip) = ip {
                pod["status"]["podIP"] = json!(ip);
            }
            store.put(Kind::Pods, format!("/v1/Pod/default/{name}"), pod);
        }
        let snap = store.snapshot();
        let t = json!({
            "apiVersion": "l7mp.io/v1",
            "kind": "Target",
            "metadata": {"namespace": "default", "name": "T"},
            "spec": {"cluster": {"endpoints": [{"selector": {"matchLabels": {"app": "x"}}}]}},
        });
        let (static_eps, dynamic_eps) = endpoint_groups(&snap, &t).unwrap();
        assert!(static_eps.is_empty());
        let names: Vec<_> = dynamic_eps.keys().cloned().collect();
        assert_eq!(names, vec!["/l7mp.io/v1/Target/default/T/10.0.0.1"]);
        assert_eq!(
            dynamic_eps["/l7mp.io/v1/Target/default/T/10.0.0.1"]["spec"],
            json!({"address": "10.0.0.1"})
        );
    }
}
