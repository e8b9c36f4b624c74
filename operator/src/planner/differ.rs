use serde::Serialize;
use std::collections::BTreeSet;

use super::{Action, ActionType, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmd {
    Add,
    Delete,
    Change,
}

/// One operation transforming a pod's applied action set towards the
/// desired one.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOp {
    pub pod_fqn: String,
    /// Action id within the pod's action map.
    pub id: String,
    pub action_type: ActionType,
    pub name: String,
    pub cmd: Cmd,
    pub old: Option<Action>,
    pub new: Option<Action>,
}

/// Compares two plans and emits the operations that turn `old` into
/// `new`, in sorted (pod FQN, action id) order. Equal plans diff to
/// nothing; no side effects.
pub fn diff(old: &Plan, new: &Plan) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    let pod_fqns: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for pod_fqn in pod_fqns {
        let old_actions = old.get(pod_fqn);
        let new_actions = new.get(pod_fqn);
        let ids: BTreeSet<&String> = old_actions
            .into_iter()
            .flat_map(|m| m.keys())
            .chain(new_actions.into_iter().flat_map(|m| m.keys()))
            .collect();
        for id in ids {
            let action_old = old_actions.and_then(|m| m.get(id));
            let action_new = new_actions.and_then(|m| m.get(id));
            let cmd = match (action_old, action_new) {
                (None, Some(_)) => Cmd::Add,
                (Some(_), None) => Cmd::Delete,
                (Some(a), Some(b)) if a == b => continue,
                (Some(_), Some(_)) => Cmd::Change,
                (None, None) => continue,
            };
            let reference = action_new.or(action_old).expect("one side is present");
            ops.push(DiffOp {
                pod_fqn: pod_fqn.clone(),
                id: id.clone(),
                action_type: reference.action_type,
                name: reference.name.clone(),
                cmd,
                old: action_old.cloned(),
                new: action_new.cloned(),
            });
        }
    }
    ops
}
