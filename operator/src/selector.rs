use serde_json::Value;

use crate::store::{Kind, Snapshot};
use crate::util::Error;

/// Evaluates a selector against a pod body. The selector is a mapping of
/// clauses and every clause present must hold; an empty selector matches
/// every pod. Unknown clauses and unknown operators are permanent errors.
pub fn selector_matches(snap: &Snapshot, selector: &Value, pod: &Value) -> Result<bool, Error> {
    let clauses = match selector {
        Value::Null => return Ok(true),
        Value::Object(map) => map,
        other => {
            return Err(Error::UserInput(format!(
                "selector must be a mapping, got: {other}"
            )));
        }
    };
    let mut matches = true;
    for (clause, args) in clauses {
        // Clause names are validated even when the result is already
        // decided, so a bad selector never goes unnoticed.
        let known = matches!(
            clause.as_str(),
            "matchLabels" | "matchExpressions" | "matchFields" | "matchNamespace" | "matchService"
        );
        if !known {
            return Err(Error::UnsupportedSelector(clause.clone()));
        }
        if !matches {
            continue;
        }
        matches = match clause.as_str() {
            "matchLabels" => match_labels(args, pod)?,
            "matchExpressions" => match_expressions(args, pod)?,
            "matchFields" => match_fields(args, pod)?,
            "matchNamespace" => match_namespace(args, pod),
            "matchService" => match_service(snap, args, pod),
            _ => unreachable!(),
        };
    }
    Ok(matches)
}

fn pod_labels(pod: &Value) -> Option<&serde_json::Map<String, Value>> {
    pod.get("metadata")?.get("labels")?.as_object()
}

fn match_labels(args: &Value, pod: &Value) -> Result<bool, Error> {
    let wanted = args
        .as_object()
        .ok_or_else(|| Error::UserInput("matchLabels takes a mapping".into()))?;
    let labels = pod_labels(pod);
    Ok(wanted
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v)))
}

fn match_expressions(args: &Value, pod: &Value) -> Result<bool, Error> {
    let exprs = args
        .as_array()
        .ok_or_else(|| Error::UserInput("matchExpressions takes a list".into()))?;
    for expr in exprs {
        let key = expr.get("key").and_then(Value::as_str).unwrap_or_default();
        let value = pod_labels(pod).and_then(|l| l.get(key));
        if !operator_matches(value, expr)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_fields(args: &Value, pod: &Value) -> Result<bool, Error> {
    let exprs = args
        .as_array()
        .ok_or_else(|| Error::UserInput("matchFields takes a list".into()))?;
    for expr in exprs {
        let key = expr.get("key").and_then(Value::as_str).unwrap_or_default();
        if !operator_matches(lookup_path(pod, key), expr)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_namespace(args: &Value, pod: &Value) -> bool {
    pod.get("metadata").and_then(|m| m.get("namespace")) == Some(args)
}

/// True when the pod's UID shows up in some Endpoints object with the
/// given name, under subsets[*].addresses[*].targetRef.uid.
fn match_service(snap: &Snapshot, service: &Value, pod: &Value) -> bool {
    let Some(ep) = snap
        .objects(Kind::Endpoints)
        .map(|(_, body)| body)
        .find(|body| body.get("metadata").and_then(|m| m.get("name")) == Some(service))
    else {
        return false;
    };
    let Some(pod_uid) = pod
        .get("metadata")
        .and_then(|m| m.get("uid"))
        .and_then(Value::as_str)
    else {
        return false;
    };
    let subsets = ep.get("subsets").and_then(Value::as_array);
    subsets.into_iter().flatten().any(|subset| {
        subset
            .get("addresses")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .any(|addr| {
                addr.get("targetRef")
                    .and_then(|r| r.get("uid"))
                    .and_then(Value::as_str)
                    == Some(pod_uid)
            })
    })
}

/// Walks a dotted path into the pod body. Missing nodes and empty leaf
/// objects resolve to the absent sentinel before operator evaluation.
fn lookup_path<'a>(pod: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = pod;
    for key in path.split('.') {
        node = node.as_object()?.get(key)?;
    }
    if node.as_object().is_some_and(|m| m.is_empty()) {
        return None;
    }
    Some(node)
}

fn operator_matches(value: Option<&Value>, expr: &Value) -> Result<bool, Error> {
    let operator = expr
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let values = expr.get("values").and_then(Value::as_array);
    let listed = |v: &Value| values.is_some_and(|vs| vs.contains(v));
    match operator {
        "In" => Ok(value.is_some_and(listed)),
        "NotIn" => Ok(!value.is_some_and(listed)),
        "Exists" => Ok(value.is_some()),
        "DoesNotExist" => Ok(value.is_none()),
        other => Err(Error::UnknownOperator(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    fn pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": "default",
                "name": "p1",
                "uid": "uid-1",
                "labels": {"app": "worker", "tier": "backend"},
            },
            "status": {"podIP": "10.0.0.1"},
        })
    }

    fn empty() -> Snapshot {
        Store::default().snapshot()
    }

    #[test]
    fn empty_selector_matches_every_pod() {
        assert!(selector_matches(&empty(), &json!({}), &pod()).unwrap());
        assert!(selector_matches(&empty(), &Value::Null, &pod()).unwrap());
    }

    #[test]
    fn match_labels_requires_every_pair() {
        let s = json!({"matchLabels": {"app": "worker"}});
        assert!(selector_matches(&empty(), &s, &pod()).unwrap());
        let s = json!({"matchLabels": {"app": "worker", "tier": "frontend"}});
        assert!(!selector_matches(&empty(), &s, &pod()).unwrap());
    }

    #[test]
    fn clauses_are_conjunctive() {
        let s = json!({
            "matchLabels": {"app": "worker"},
            "matchNamespace": "kube-system",
        });
        assert!(!selector_matches(&empty(), &s, &pod()).unwrap());
        let s = json!({
            "matchLabels": {"app": "worker"},
            "matchNamespace": "default",
        });
        assert!(selector_matches(&empty(), &s, &pod()).unwrap());
    }

    #[test]
    fn expression_operators() {
        let cases = [
            (json!({"key": "app", "operator": "In", "values": ["worker", "x"]}), true),
            (json!({"key": "app", "operator": "In", "values": ["x"]}), false),
            (json!({"key": "app", "operator": "NotIn", "values": ["x"]}), true),
            (json!({"key": "missing", "operator": "NotIn", "values": ["x"]}), true),
            (json!({"key": "app", "operator": "Exists"}), true),
            (json!({"key": "missing", "operator": "Exists"}), false),
            (json!({"key": "missing", "operator": "DoesNotExist"}), true),
            (json!({"key": "app", "operator": "DoesNotExist"}), false),
        ];
        for (expr, expected) in cases {
            let s = json!({"matchExpressions": [expr]});
            assert_eq!(
                selector_matches(&empty(), &s, &pod()).unwrap(),
                expected,
                "selector: {s}"
            );
        }
    }

    #[test]
    fn unknown_operator_is_a_permanent_error() {
        let s = json!({"matchExpressions": [{"key": "app", "operator": "Like", "values": []}]});
        let err = selector_matches(&empty(), &s, &pod()).unwrap_err();
        assert!(matches!(err, Error::UnknownOperator(op) if op == "Like"));
    }

    #[test]
    fn unknown_clause_is_a_permanent_error() {
        let s = json!({"matchEverything": true});
        let err = selector_matches(&empty(), &s, &pod()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSelector(c) if c == "matchEverything"));
    }

    #[test]
    fn unknown_clause_is_flagged_even_after_a_mismatch() {
        let s = json!({
            "matchNamespace": "other",
            "matchEverything": true,
        });
        assert!(selector_matches(&empty(), &s, &pod()).is_err());
    }

    #[test]
    fn field_paths_resolve_dotted_keys_and_missing_nodes() {
        let s = json!({"matchFields": [
            {"key": "status.podIP", "operator": "In", "values": ["10.0.0.1"]}
        ]});
        assert!(selector_matches(&empty(), &s, &pod()).unwrap());
        let s = json!({"matchFields": [
            {"key": "status.hostIP", "operator": "DoesNotExist"}
        ]});
        assert!(selector_matches(&empty(), &s, &pod()).unwrap());
    }

    #[test]
    fn empty_object_field_counts_as_absent() {
        let mut p = pod();
        p["status"]["limits"] = json!({});
        let s = json!({"matchFields": [
            {"key": "status.limits", "operator": "DoesNotExist"}
        ]});
        assert!(selector_matches(&empty(), &s, &p).unwrap());
    }

    #[test]
    fn match_service_scans_endpoints_target_refs() {
        let mut store = Store::default();
        store.put(
            Kind::Endpoints,
            "/v1/Endpoints/default/svc".into(),
            json!({
                "apiVersion": "v1",
                "kind": "Endpoints",
                "metadata": {"namespace": "default", "name": "svc"},
                "subsets": [
                    {"addresses": [{"ip": "10.0.0.1", "targetRef": {"uid": "uid-1"}}]}
                ],
            }),
        );
        let snap = store.snapshot();
        let s = json!({"matchService": "svc"});
        assert!(selector_matches(&snap, &s, &pod()).unwrap());
        let s = json!({"matchService": "other-svc"});
        assert!(!selector_matches(&snap, &s, &pod()).unwrap());
    }
}
