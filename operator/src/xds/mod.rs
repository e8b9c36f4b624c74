//! Incremental xDS dispatcher: per-pod outboxes feeding Delta LDS/CDS
//! streams, with ack-gated state tracking per `(pod UID, kind)`.

use anyhow::Result;
use futures::Stream;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::planner::differ::{Cmd, DiffOp};
use crate::planner::{Action, ActionType, Plan};
use crate::proto::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use crate::proto::envoy::service::discovery::v3::{DeltaDiscoveryRequest, DeltaDiscoveryResponse};
use crate::proto::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use crate::store::{Kind, Snapshot};

pub mod encode;
pub mod outbox;
pub mod stream;

use outbox::{Outbox, XdsOp};
use stream::{AckOutcome, OpDisposition, StreamState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Listeners,
    Clusters,
}

impl ResourceKind {
    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceKind::Listeners => encode::LISTENER_TYPE_URL,
            ResourceKind::Clusters => encode::CLUSTER_TYPE_URL,
        }
    }
}

/// Shared state for one `(pod UID, kind)` stream: the outbox the
/// reconciler fills, the ack bookkeeping the handler owns, and the token
/// that tears the server side down.
#[derive(Debug, Default)]
pub struct StreamEntry {
    pub outbox: Outbox,
    pub state: Mutex<StreamState>,
    pub cancel: CancellationToken,
}

/// Registry of stream entries, created implicitly on first touch from
/// either side (reconciler push or client connect).
#[derive(Debug, Default)]
pub struct XdsState {
    entries: Mutex<HashMap<(String, ResourceKind), Arc<StreamEntry>>>,
}

impl XdsState {
    pub fn entry(&self, uid: &str, kind: ResourceKind) -> Arc<StreamEntry> {
        self.entries
            .lock()
            .unwrap()
            .entry((uid.to_string(), kind))
            .or_default()
            .clone()
    }

    fn remove(&self, uid: &str, kind: ResourceKind) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(uid.to_string(), kind));
    }

    /// A deleted pod gets a close on both of its outboxes; the stream
    /// terminates when the op is dequeued and the client reconnects if
    /// the pod ever comes back.
    pub fn close_pod(&self, uid: &str) {
        for kind in [ResourceKind::Listeners, ResourceKind::Clusters] {
            self.entry(uid, kind).outbox.push(XdsOp::Close);
        }
    }
}

fn pod_uid(snap: &Snapshot, pod_fqn: &str) -> Option<String> {
    snap.get(Kind::Pods, pod_fqn)?
        .pointer("/metadata/uid")?
        .as_str()
        .map(str::to_owned)
}

fn push_listener_add(entry: &StreamEntry, action: Option<&Action>, name: String) {
    let Some(listener) = action.and_then(encode::build_listener) else {
        return;
    };
    entry.outbox.push(XdsOp::Add {
        name,
        payload: encode::pack_listener(&listener),
    });
}

/// Converts one reconcile's diff into xDS ops on the affected pods'
/// outboxes. Cluster payloads fold the target action together with its
/// dynamic endpoints, so any of them changing re-announces the cluster.
pub fn enqueue_diff(
    state: &XdsState,
    ops: &[DiffOp],
    old_plan: &Plan,
    new_plan: &Plan,
    post: &Snapshot,
    pre: &Snapshot,
) {
    let mut affected: BTreeSet<(String, String)> = BTreeSet::new();
    for op in ops {
        match op.action_type {
            ActionType::Rule => {}
            ActionType::Vsvc => {
                let Some(uid) =
                    pod_uid(post, &op.pod_fqn).or_else(|| pod_uid(pre, &op.pod_fqn))
                else {
                    continue;
                };
                let entry = state.entry(&uid, ResourceKind::Listeners);
                let name = encode::listener_name(&op.name);
                match op.cmd {
                    Cmd::Add => push_listener_add(&entry, op.new.as_ref(), name),
                    Cmd::Delete => entry.outbox.push(XdsOp::Delete { name }),
                    Cmd::Change => {
                        entry.outbox.push(XdsOp::Delete { name: name.clone() });
                        push_listener_add(&entry, op.new.as_ref(), name);
                    }
                }
            }
            ActionType::Target => {
                affected.insert((op.pod_fqn.clone(), op.name.clone()));
            }
            ActionType::DynamicEndpoint => {
                let parent = op
                    .new
                    .as_ref()
                    .or(op.old.as_ref())
                    .and_then(|a| a.target.clone());
                if let Some(parent) = parent {
                    affected.insert((op.pod_fqn.clone(), parent));
                }
            }
        }
    }

    for (pod_fqn, target_fqn) in affected {
        let Some(uid) = pod_uid(post, &pod_fqn).or_else(|| pod_uid(pre, &pod_fqn)) else {
            continue;
        };
        let entry = state.entry(&uid, ResourceKind::Clusters);
        let name = encode::cluster_name(&target_fqn);
        let actions = new_plan.get(&pod_fqn);
        match actions.and_then(|m| m.get(&target_fqn)) {
            Some(action) => {
                let dynamic: Vec<&Action> = actions
                    .into_iter()
                    .flat_map(|m| m.values())
                    .filter(|a| {
                        a.action_type == ActionType::DynamicEndpoint
                            && a.target.as_deref() == Some(target_fqn.as_str())
                    })
                    .collect();
                let payload = encode::pack_cluster(&encode::build_cluster(action, &dynamic));
                let existed = old_plan
                    .get(&pod_fqn)
                    .is_some_and(|m| m.contains_key(&target_fqn));
                if existed {
                    entry.outbox.push(XdsOp::Delete { name: name.clone() });
                }
                entry.outbox.push(XdsOp::Add { name, payload });
            }
            None => entry.outbox.push(XdsOp::Delete { name }),
        }
    }
}

/// One stream's serving loop. Exactly one inbound request is consumed
/// before each outbox dequeue: the client's requests pace the sends, the
/// same way the proxy drives the flow on reconnect.
fn run_stream(
    state: Arc<XdsState>,
    kind: ResourceKind,
    mut inbound: Streaming<DeltaDiscoveryRequest>,
) -> mpsc::Receiver<Result<DeltaDiscoveryResponse, Status>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut entry: Option<(String, Arc<StreamEntry>)> = None;
        loop {
            let request = match inbound.message().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(status) => {
                    tracing::warn!(?kind, %status, "stream receive failed");
                    break;
                }
            };
            let (uid, entry) = entry.get_or_insert_with(|| {
                let uid = request
                    .node
                    .as_ref()
                    .map(|n| n.id.clone())
                    .unwrap_or_default();
                tracing::info!(%uid, ?kind, "discovery stream connected");
                let entry = state.entry(&uid, kind);
                (uid, entry)
            });

            let error_message = request
                .error_detail
                .as_ref()
                .map(|s| s.message.clone())
                .unwrap_or_default();
            let outcome = entry
                .state
                .lock()
                .unwrap()
                .apply_request(&request.response_nonce, &error_message);
            match outcome {
                AckOutcome::Ack { nonce } => {
                    tracing::info!(%uid, ?kind, %nonce, "ACK");
                }
                AckOutcome::Nack { nonce, message } => {
                    tracing::warn!(%uid, ?kind, %nonce, %message, "NACK");
                }
                AckOutcome::None => {}
            }

            let op = tokio::select! {
                _ = entry.cancel.cancelled() => break,
                op = entry.outbox.pop() => op,
            };
            let disposition = entry.state.lock().unwrap().handle_op(op, kind.type_url());
            match disposition {
                OpDisposition::Respond(response) => {
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
                OpDisposition::Suppressed => {}
                OpDisposition::Close => {
                    tracing::info!(%uid, ?kind, "closing discovery stream");
                    entry.cancel.cancel();
                    state.remove(uid, kind);
                    break;
                }
            }
        }
    });
    rx
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

pub struct LdsService {
    state: Arc<XdsState>,
}

#[tonic::async_trait]
impl ListenerDiscoveryService for LdsService {
    type DeltaListenersStream = ResponseStream;

    async fn delta_listeners(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        let rx = run_stream(
            self.state.clone(),
            ResourceKind::Listeners,
            request.into_inner(),
        );
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

pub struct CdsService {
    state: Arc<XdsState>,
}

#[tonic::async_trait]
impl ClusterDiscoveryService for CdsService {
    type DeltaClustersStream = ResponseStream;

    async fn delta_clusters(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        let rx = run_stream(
            self.state.clone(),
            ResourceKind::Clusters,
            request.into_inner(),
        );
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Runs the plaintext Delta LDS/CDS server until cancelled.
pub async fn run_server(state: Arc<XdsState>, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!(%addr, "starting xDS server");
    Server::builder()
        .add_service(ListenerDiscoveryServiceServer::new(LdsService {
            state: state.clone(),
        }))
        .add_service(ClusterDiscoveryServiceServer::new(CdsService { state }))
        .serve_with_shutdown(addr, async move {
            cancel.cancelled().await;
        })
        .await?;
    tracing::info!("xDS server stopped gracefully");
    Ok(())
}
