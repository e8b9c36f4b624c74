use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::selector::selector_matches;
use crate::store::{Kind, Snapshot};
use crate::util::Error;

pub mod differ;
pub mod link;

use link::{endpoint_groups, spec_is_empty, target_extended_spec};

/// A minimal unit of intended data-plane state on a specific pod. Two
/// actions are equal iff their serialised contents are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub name: String,
    pub spec: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Vsvc,
    Target,
    DynamicEndpoint,
    Rule,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Vsvc => "vsvc",
            ActionType::Target => "target",
            ActionType::DynamicEndpoint => "dynamic_endpoint",
            ActionType::Rule => "rule",
        }
    }
}

/// Actions a single pod should carry, keyed by action id (the object FQN,
/// or `ep_<name>` for dynamic endpoints).
pub type ActionMap = BTreeMap<String, Action>;

/// The complete desired state: pod FQN to its action set.
pub type Plan = BTreeMap<String, ActionMap>;

/// Computes the actions every pod should have under the given snapshot.
/// Pure: equal snapshots produce byte-identical plans.
pub fn plan(snap: &Snapshot) -> Result<Plan, Error> {
    let mut plan = Plan::new();
    for (pod_fqn, pod) in snap.objects(Kind::Pods) {
        let mut actions = ActionMap::new();

        for (fqn, vsvc) in snap.objects(Kind::VirtualServices) {
            if matches_spec_selector(snap, vsvc, pod)? {
                actions.insert(
                    fqn.clone(),
                    Action {
                        action_type: ActionType::Vsvc,
                        name: fqn.clone(),
                        spec: vsvc.get("spec").cloned().unwrap_or_default(),
                        target: None,
                    },
                );
            }
        }

        for (fqn, target) in snap.objects(Kind::Targets) {
            let Some(spec) = target_extended_spec(snap, target) else {
                continue;
            };
            if spec_is_empty(&spec) {
                continue;
            }
            let selector = spec.get("selector").unwrap_or(&Value::Null);
            if !selector_matches(snap, selector, pod)? {
                continue;
            }

            let mut etarget = target.clone();
            etarget["spec"] = spec;
            let (static_eps, dynamic_eps) = endpoint_groups(snap, &etarget)?;
            set_endpoints(&mut etarget, static_eps);

            actions.insert(
                fqn.clone(),
                Action {
                    action_type: ActionType::Target,
                    name: fqn.clone(),
                    spec: etarget["spec"].clone(),
                    target: None,
                },
            );
            for (name, ep) in dynamic_eps {
                actions.insert(
                    format!("ep_{name}"),
                    Action {
                        action_type: ActionType::DynamicEndpoint,
                        name,
                        spec: ep["spec"].clone(),
                        target: Some(fqn.clone()),
                    },
                );
            }
        }

        for (fqn, rule) in snap.objects(Kind::Rules) {
            if matches_spec_selector(snap, rule, pod)? {
                actions.insert(
                    fqn.clone(),
                    Action {
                        action_type: ActionType::Rule,
                        name: fqn.clone(),
                        spec: rule.get("spec").cloned().unwrap_or_default(),
                        target: None,
                    },
                );
            }
        }

        if !actions.is_empty() {
            plan.insert(pod_fqn.clone(), actions);
        }
    }
    Ok(plan)
}

fn matches_spec_selector(snap: &Snapshot, obj: &Value, pod: &Value) -> Result<bool, Error> {
    let selector = obj
        .get("spec")
        .and_then(|s| s.get("selector"))
        .unwrap_or(&Value::Null);
    selector_matches(snap, selector, pod)
}

fn set_endpoints(etarget: &mut Value, static_eps: Vec<Value>) {
    let Some(spec) = etarget.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    let cluster = spec
        .entry("cluster")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(cluster) = cluster.as_object_mut() {
        cluster.insert("endpoints".into(), Value::Array(static_eps));
    }
}
