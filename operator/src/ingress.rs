//! Normalises watch callbacks into store mutations and drives the
//! reconcile pipeline: plan the post snapshot, diff against what was
//! applied, dispatch to both backends, remember what stuck.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::core::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use l7mp_types::{Rule, Target, VirtualService};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::convert::ConvDb;
use crate::planner::differ::{Cmd, DiffOp, diff};
use crate::planner::{Plan, plan};
use crate::rest::RestDispatcher;
use crate::store::{Kind, Snapshot, Store, get_fqn};
use crate::util::{Error, FG1, FG2, POD_IP_RETRY_DELAY, RETRY_DELAY};
use crate::xds::{self, XdsState};

/// Name of the proxy container whose readiness gates a pod.
const PROXY_CONTAINER: &str = "l7mp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    Apply,
    Delete,
}

#[derive(Debug, Clone)]
pub struct IngressEvent {
    pub kind: Kind,
    pub op: EventOp,
    pub body: Value,
}

fn normalize<K>(obj: &K) -> Option<Value>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut body = serde_json::to_value(obj).ok()?;
    let map = body.as_object_mut()?;
    // Typed objects do not serialise their identity; the FQN needs it.
    map.entry("apiVersion")
        .or_insert_with(|| json!(K::api_version(&()).as_ref()));
    map.entry("kind").or_insert_with(|| json!(K::kind(&()).as_ref()));
    Some(body)
}

async fn watch_kind<K>(
    client: Client,
    namespace: String,
    kind: Kind,
    tx: mpsc::UnboundedSender<IngressEvent>,
) where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + 'static,
{
    let api: Api<K> = Api::namespaced(client, &namespace);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        let forward = match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                normalize(&obj).map(|body| IngressEvent {
                    kind,
                    op: EventOp::Apply,
                    body,
                })
            }
            Ok(watcher::Event::Delete(obj)) => normalize(&obj).map(|body| IngressEvent {
                kind,
                op: EventOp::Delete,
                body,
            }),
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
            Err(err) => {
                // The watcher recovers on its own; nothing to mutate.
                tracing::warn!(kind = kind.plural(), %err, "watch error");
                None
            }
        };
        if let Some(event) = forward
            && tx.send(event).is_err()
        {
            break;
        }
    }
}

pub fn pod_ready(pod: &Value) -> bool {
    let statuses = pod
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array);
    let Some(container) = statuses
        .into_iter()
        .flatten()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(PROXY_CONTAINER))
    else {
        // Pods without the proxy container are not gated.
        return true;
    };
    container
        .get("ready")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn pod_ip(pod: &Value) -> Option<&str> {
    pod.pointer("/status/podIP")
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty())
}

pub struct Reconciler {
    store: Store,
    /// What each pod's data plane is known to carry; the "old" side of
    /// every diff. Updated per successfully dispatched operation so a
    /// rescheduled reconcile re-emits only what is still missing.
    applied: Plan,
    rest: RestDispatcher,
    xds: Arc<XdsState>,
    tx: mpsc::UnboundedSender<IngressEvent>,
}

impl Reconciler {
    pub fn new(
        rest: RestDispatcher,
        xds: Arc<XdsState>,
        tx: mpsc::UnboundedSender<IngressEvent>,
    ) -> Self {
        Reconciler {
            store: Store::default(),
            applied: Plan::new(),
            rest,
            xds,
            tx,
        }
    }

    pub async fn handle(&mut self, event: IngressEvent) {
        let label = format!(
            "{}:{}",
            event.kind.plural(),
            get_fqn(&event.body).unwrap_or_default()
        );
        match self.process(&event).await {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                let delay = err.retry_delay().unwrap_or(RETRY_DELAY);
                tracing::warn!(%label, %err, ?delay, "transient failure, rescheduling");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(event);
                });
            }
            Err(err) => {
                eprintln!(
                    "{}",
                    format!("Reconciliation error: {err:?} {label}").red()
                );
            }
        }
    }

    async fn process(&mut self, event: &IngressEvent) -> Result<(), Error> {
        let body = &event.body;
        let fqn = get_fqn(body)
            .ok_or_else(|| Error::UserInput(format!("object without identity: {body}")))?;

        let mut op = event.op;
        if event.kind == Kind::Pods && op == EventOp::Apply {
            if !pod_ready(body) {
                // The proxy container wiped its config when it went down;
                // treat the pod as absent and withdraw everything.
                tracing::info!(pod = %fqn, "proxy container is not ready");
                op = EventOp::Delete;
            } else if pod_ip(body).is_none() {
                return Err(Error::temporary(
                    format!("No podIP in {fqn}"),
                    POD_IP_RETRY_DELAY,
                ));
            }
        }

        let pre = self.store.snapshot();
        match op {
            EventOp::Apply => self.store.put(event.kind, fqn.clone(), body.clone()),
            EventOp::Delete => {
                self.store.delete(event.kind, &fqn);
            }
        }
        let post = self.store.snapshot();

        let result = self.reconcile(&pre, &post).await;
        if event.kind == Kind::Pods
            && op == EventOp::Delete
            && let Some(uid) = body.pointer("/metadata/uid").and_then(Value::as_str)
        {
            self.xds.close_pod(uid);
        }
        result
    }

    async fn reconcile(&mut self, pre: &Snapshot, post: &Snapshot) -> Result<(), Error> {
        let desired = plan(post)?;
        let ops = diff(&self.applied, &desired);
        if ops.is_empty() {
            return Ok(());
        }
        tracing::info!(ops = ops.len(), "dispatching operations");
        xds::enqueue_diff(&self.xds, &ops, &self.applied, &desired, post, pre);

        let mut transient: Option<Error> = None;
        for op in &ops {
            println!(
                "🔧 {}{}{}{}",
                op.pod_fqn.color(FG2),
                " OP: ".color(FG1),
                format!("{:?} ", op.cmd).color(FG2),
                op.name.color(FG2),
            );
            match self.rest.apply(post, op).await {
                Ok(()) => self.record(op),
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        pod = %op.pod_fqn,
                        id = %op.id,
                        %err,
                        "operation hit a transient failure"
                    );
                    if transient.is_none() {
                        transient = Some(err);
                    }
                }
                Err(err) => {
                    eprintln!(
                        "{}",
                        format!(
                            "Failed to apply {}/{}/{}: {err:?}",
                            op.pod_fqn,
                            op.action_type.as_str(),
                            op.name
                        )
                        .red()
                    );
                }
            }
        }
        match transient {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, op: &DiffOp) {
        match op.cmd {
            Cmd::Add | Cmd::Change => {
                if let Some(new) = &op.new {
                    self.applied
                        .entry(op.pod_fqn.clone())
                        .or_default()
                        .insert(op.id.clone(), new.clone());
                }
            }
            Cmd::Delete => {
                if let Some(actions) = self.applied.get_mut(&op.pod_fqn) {
                    actions.remove(&op.id);
                    if actions.is_empty() {
                        self.applied.remove(&op.pod_fqn);
                    }
                }
            }
        }
    }
}

/// Starts one watcher per kind and processes events until cancelled.
/// Store mutations and dispatch all happen on this task.
pub async fn run(
    client: Client,
    args: &Args,
    conv: Arc<ConvDb>,
    xds: Arc<XdsState>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ns = &args.namespace;
    tokio::spawn(watch_kind::<Pod>(
        client.clone(),
        ns.clone(),
        Kind::Pods,
        tx.clone(),
    ));
    tokio::spawn(watch_kind::<Endpoints>(
        client.clone(),
        ns.clone(),
        Kind::Endpoints,
        tx.clone(),
    ));
    tokio::spawn(watch_kind::<VirtualService>(
        client.clone(),
        ns.clone(),
        Kind::VirtualServices,
        tx.clone(),
    ));
    tokio::spawn(watch_kind::<Target>(
        client.clone(),
        ns.clone(),
        Kind::Targets,
        tx.clone(),
    ));
    tokio::spawn(watch_kind::<Rule>(
        client.clone(),
        ns.clone(),
        Kind::Rules,
        tx.clone(),
    ));

    let rest = RestDispatcher::new(conv, args.admin_port, Some(client));
    let mut reconciler = Reconciler::new(rest, xds, tx);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => reconciler.handle(event).await,
                None => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Action, ActionType};
    use serde_json::json;

    fn pod(ready: Option<bool>, ip: &str) -> Value {
        let mut body = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"namespace": "default", "name": "p1", "uid": "uid-1"},
            "status": {"podIP": ip},
        });
        if let Some(ready) = ready {
            body["status"]["containerStatuses"] = json!([
                {"name": "sidecar", "ready": true},
                {"name": "l7mp", "ready": ready},
            ]);
        }
        body
    }

    #[test]
    fn readiness_follows_the_proxy_container_only() {
        assert!(pod_ready(&pod(Some(true), "10.0.0.1")));
        assert!(!pod_ready(&pod(Some(false), "10.0.0.1")));
        // No proxy container, nothing to gate on.
        assert!(pod_ready(&pod(None, "10.0.0.1")));
    }

    #[test]
    fn empty_pod_ip_counts_as_missing() {
        assert_eq!(pod_ip(&pod(None, "10.0.0.1")), Some("10.0.0.1"));
        assert_eq!(pod_ip(&pod(None, "")), None);
        assert_eq!(pod_ip(&json!({"status": {}})), None);
    }

    #[test]
    fn recording_ops_converges_the_applied_ledger() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conv = Arc::new(ConvDb::default());
        let rest = RestDispatcher::new(conv, 1234, None);
        let mut reconciler = Reconciler::new(rest, Arc::new(XdsState::default()), tx);

        let action = Action {
            action_type: ActionType::Vsvc,
            name: "/l7mp.io/v1/VirtualService/default/vs".into(),
            spec: json!({"listener": {"spec": {"UDP": {"port": 18002}}}}),
            target: None,
        };
        let mut desired = Plan::new();
        desired.insert(
            "/v1/Pod/default/p1".into(),
            [(action.name.clone(), action.clone())].into_iter().collect(),
        );

        for op in diff(&reconciler.applied, &desired) {
            reconciler.record(&op);
        }
        assert_eq!(reconciler.applied, desired);
        assert!(diff(&reconciler.applied, &desired).is_empty());

        for op in diff(&reconciler.applied, &Plan::new()) {
            reconciler.record(&op);
        }
        assert!(reconciler.applied.is_empty());
    }
}
