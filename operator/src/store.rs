use serde_json::Value;
use std::collections::BTreeMap;

/// The watched object kinds, in the order they are planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Pods,
    Endpoints,
    VirtualServices,
    Targets,
    Rules,
}

impl Kind {
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Pods => "pods",
            Kind::Endpoints => "endpoints",
            Kind::VirtualServices => "virtualservices",
            Kind::Targets => "targets",
            Kind::Rules => "rules",
        }
    }
}

/// Get a name unambiguously identifying the object.
pub fn get_fqn(obj: &Value) -> Option<String> {
    let api_version = obj.get("apiVersion")?.as_str()?;
    let kind = obj.get("kind")?.as_str()?;
    let metadata = obj.get("metadata")?;
    let namespace = metadata.get("namespace")?.as_str()?;
    let name = metadata.get("name")?.as_str()?;
    Some(format!("/{api_version}/{kind}/{namespace}/{name}"))
}

/// An immutable view of the cluster state at one logical instant. All
/// maps are ordered so iteration anywhere downstream is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    maps: BTreeMap<Kind, BTreeMap<String, Value>>,
}

impl Snapshot {
    pub fn objects(&self, kind: Kind) -> impl Iterator<Item = (&String, &Value)> {
        self.maps.get(&kind).into_iter().flatten()
    }

    pub fn get(&self, kind: Kind, fqn: &str) -> Option<&Value> {
        self.maps.get(&kind)?.get(fqn)
    }

    pub fn contains(&self, kind: Kind, fqn: &str) -> bool {
        self.get(kind, fqn).is_some()
    }
}

/// Authoritative in-memory copy of all watched objects. Mutated only from
/// the event-ingress task; everything else works on snapshots.
#[derive(Debug, Default)]
pub struct Store {
    state: Snapshot,
}

impl Store {
    pub fn put(&mut self, kind: Kind, fqn: String, body: Value) {
        self.state.maps.entry(kind).or_default().insert(fqn, body);
    }

    pub fn delete(&mut self, kind: Kind, fqn: &str) -> Option<Value> {
        self.state.maps.get_mut(&kind)?.remove(fqn)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"namespace": "default", "name": name},
        })
    }

    #[test]
    fn fqn_includes_api_version_kind_namespace_and_name() {
        assert_eq!(
            get_fqn(&pod("p1")).as_deref(),
            Some("/v1/Pod/default/p1")
        );
        assert_eq!(get_fqn(&json!({"kind": "Pod"})), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutations() {
        let mut store = Store::default();
        store.put(Kind::Pods, "/v1/Pod/default/p1".into(), pod("p1"));
        let before = store.snapshot();

        store.put(Kind::Pods, "/v1/Pod/default/p2".into(), pod("p2"));
        store.delete(Kind::Pods, "/v1/Pod/default/p1");

        assert!(before.contains(Kind::Pods, "/v1/Pod/default/p1"));
        assert!(!before.contains(Kind::Pods, "/v1/Pod/default/p2"));
        let after = store.snapshot();
        assert!(after.contains(Kind::Pods, "/v1/Pod/default/p2"));
        assert!(!after.contains(Kind::Pods, "/v1/Pod/default/p1"));
    }

    #[test]
    fn objects_iterates_in_sorted_fqn_order() {
        let mut store = Store::default();
        for name in ["pz", "pa", "pm"] {
            store.put(Kind::Pods, format!("/v1/Pod/default/{name}"), pod(name));
        }
        let names: Vec<_> = store
            .snapshot()
            .objects(Kind::Pods)
            .map(|(fqn, _)| fqn.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "/v1/Pod/default/pa",
                "/v1/Pod/default/pm",
                "/v1/Pod/default/pz"
            ]
        );
    }
}
