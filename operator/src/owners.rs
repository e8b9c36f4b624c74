use kube::api::{Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Api, Client};
use serde_json::{Value, json};

use crate::store::{Kind, Snapshot};
use crate::util::{Error, MANAGER_NAME};

/// Propagates "generation applied" onto the owners of a resource that
/// opted in with `spec.updateOwners`. Cross-namespace owner references
/// are disallowed by Kubernetes, so only same-namespace owners exist.
pub async fn set_owner_status(
    client: Client,
    snap: &Snapshot,
    kind: Kind,
    fqn: &str,
) -> Result<(), Error> {
    let Some(obj) = snap.get(kind, fqn) else {
        return Ok(());
    };
    let update_owners = obj
        .pointer("/spec/updateOwners")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let generation = obj
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if !update_owners || generation == 0 {
        return Ok(());
    }
    let Some(namespace) = obj
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
    else {
        return Ok(());
    };

    let owners = obj
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for owner in owners {
        let (Some(api_version), Some(owner_kind), Some(owner_name)) = (
            owner.get("apiVersion").and_then(Value::as_str),
            owner.get("kind").and_then(Value::as_str),
            owner.get("name").and_then(Value::as_str),
        ) else {
            continue;
        };
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let resource = ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: api_version.to_string(),
            kind: owner_kind.to_string(),
            // Naive pluralisation, same guess the CRD registration makes.
            plural: format!("{}s", owner_kind.to_lowercase()),
        };
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);
        let patch = json!({"status": {"children": {"applied": {fqn: generation}}}});
        tracing::info!(owner = %owner_name, child = %fqn, generation, "updating owner status");
        api.patch_status(owner_name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch))
            .await?;
    }
    Ok(())
}
