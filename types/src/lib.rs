use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A pod selector. Every clause present must hold for the selector to
/// match; an empty selector matches everything. Clauses the controller
/// does not know about are kept verbatim so evaluation can reject them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Selector {
    #[serde(rename = "matchLabels", skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    #[serde(rename = "matchExpressions", skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SelectorRequirement>>,

    #[serde(rename = "matchFields", skip_serializing_if = "Option::is_none")]
    pub match_fields: Option<Vec<SelectorRequirement>>,

    #[serde(rename = "matchNamespace", skip_serializing_if = "Option::is_none")]
    pub match_namespace: Option<String>,

    #[serde(rename = "matchService", skip_serializing_if = "Option::is_none")]
    pub match_service: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

/// Listener part of a VirtualService. The `spec` body is handed to the
/// data plane as-is, so it stays schemaless here.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ListenerConf {
    pub spec: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "l7mp.io",
    version = "v1",
    kind = "VirtualService",
    plural = "virtualservices",
    derive = "PartialEq",
    status = "OwnedStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct VirtualServiceSpec {
    #[serde(default)]
    pub selector: Selector,
    pub listener: ListenerConf,
    #[serde(rename = "updateOwners", default)]
    pub update_owners: bool,
}

/// One entry in a cluster's endpoint list: either a static endpoint with
/// an inline `spec`, or a dynamic one materialised from a pod selector.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EndpointEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "l7mp.io",
    version = "v1",
    kind = "Target",
    plural = "targets",
    derive = "PartialEq",
    status = "OwnedStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.linkedVirtualService\", \"name\": \"LINKED\", \"type\": \"string\" }"
)]
pub struct TargetSpec {
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub cluster: ClusterConf,
    #[serde(rename = "linkedVirtualService", skip_serializing_if = "Option::is_none")]
    pub linked_virtual_service: Option<String>,
    #[serde(rename = "updateOwners", default)]
    pub update_owners: bool,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "l7mp.io",
    version = "v1",
    kind = "Rule",
    plural = "rules",
    derive = "PartialEq",
    status = "OwnedStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.rulelist\", \"name\": \"RULELIST\", \"type\": \"string\" }"
)]
pub struct RuleSpec {
    #[serde(default)]
    pub selector: Selector,
    pub rulelist: String,
    pub position: u32,
    pub rule: Value,
    #[serde(rename = "updateOwners", default)]
    pub update_owners: bool,
}

/// Status written back by the owner-status reporter: which children have
/// been applied, keyed by child FQN, valued by the applied generation.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OwnedStatus {
    #[serde(default)]
    pub children: ChildrenRefs,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ChildrenRefs {
    #[serde(default)]
    pub applied: BTreeMap<String, i64>,
}
