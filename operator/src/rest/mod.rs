//! Applies diff operations by calling the proxy admin API on the target
//! pod's IP. Listeners and clusters are immutable on the proxy side, so a
//! change is always a delete followed by an add.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::convert::ConvDb;
use crate::owners;
use crate::planner::differ::{Cmd, DiffOp};
use crate::planner::{Action, ActionType};
use crate::store::{Kind, Snapshot};
use crate::util::Error;

pub mod client;

use client::{AdminApi, ApiOutcome};

pub struct RestDispatcher {
    http: reqwest::Client,
    conv: Arc<ConvDb>,
    admin_port: u16,
    kube: Option<kube::Client>,
}

impl RestDispatcher {
    pub fn new(conv: Arc<ConvDb>, admin_port: u16, kube: Option<kube::Client>) -> Self {
        RestDispatcher {
            http: reqwest::Client::new(),
            conv,
            admin_port,
            kube,
        }
    }

    /// Applies a single operation against the pod named in it. A pod that
    /// is no longer in the snapshot has nothing to configure, so the
    /// operation is a no-op.
    pub async fn apply(&self, snap: &Snapshot, op: &DiffOp) -> Result<(), Error> {
        let Some(pod) = snap.get(Kind::Pods, &op.pod_fqn) else {
            tracing::info!(pod = %op.pod_fqn, "pod not found, skipping");
            return Ok(());
        };
        let api = self.instance(pod)?;
        match op.cmd {
            Cmd::Add => self.exec_add(snap, &api, op.new.as_ref()).await,
            Cmd::Delete => self.exec_delete(snap, &api, op.old.as_ref()).await,
            Cmd::Change => {
                self.exec_delete(snap, &api, op.old.as_ref()).await?;
                self.exec_add(snap, &api, op.new.as_ref()).await
            }
        }
    }

    fn instance(&self, pod: &Value) -> Result<AdminApi, Error> {
        let pod_ip = pod
            .pointer("/status/podIP")
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                let name = pod
                    .pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                Error::temporary(format!("no podIP for {name}"), Duration::from_secs(4))
            })?;
        Ok(AdminApi::new(self.http.clone(), pod_ip, self.admin_port))
    }

    async fn exec_add(
        &self,
        snap: &Snapshot,
        api: &AdminApi,
        action: Option<&Action>,
    ) -> Result<(), Error> {
        let Some(action) = action else { return Ok(()) };
        match action.action_type {
            ActionType::Vsvc => {
                let spec = self.conv.downgrade("virtualservices", &action.spec)?;
                let listener = json!({
                    "name": action.name,
                    "spec": spec.pointer("/listener/spec"),
                    "rules": spec.pointer("/listener/rules"),
                });
                tracing::info!(vsvc = %action.name, "configuring listener");
                check_add(api.add_listener(listener).await?, &action.name)?;
                self.set_owner_status(snap, Kind::VirtualServices, &action.name)
                    .await
            }
            ActionType::Target => {
                let spec = self.conv.downgrade("targets", &action.spec)?;
                let mut cluster = spec.get("cluster").cloned().unwrap_or_else(|| json!({}));
                cluster["name"] = json!(action.name);
                tracing::info!(target = %action.name, "configuring cluster");
                check_add(api.add_cluster(cluster).await?, &action.name)?;
                self.set_owner_status(snap, Kind::Targets, &action.name).await
            }
            ActionType::DynamicEndpoint => {
                let Some(cluster) = action.target.as_deref() else {
                    return Ok(());
                };
                let endpoint = json!({"name": action.name, "spec": action.spec});
                tracing::info!(endpoint = %action.name, %cluster, "configuring endpoint");
                check_add(api.add_endpoint(cluster, endpoint).await?, &action.name)
            }
            ActionType::Rule => {
                let spec = self.conv.downgrade("rules", &action.spec)?;
                let rulelist = spec
                    .get("rulelist")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::UserInput(format!("rule {} has no rulelist", action.name))
                    })?;
                let position = spec.get("position").and_then(Value::as_u64).unwrap_or(0);
                let mut rule = spec.get("rule").cloned().unwrap_or_else(|| json!({}));
                rule["name"] = json!(action.name);
                tracing::info!(rule = %action.name, %rulelist, position, "configuring rule");
                check_add(api.add_rule(rulelist, position, rule).await?, &action.name)?;
                self.set_owner_status(snap, Kind::Rules, &action.name).await
            }
        }
    }

    async fn exec_delete(
        &self,
        snap: &Snapshot,
        api: &AdminApi,
        action: Option<&Action>,
    ) -> Result<(), Error> {
        let Some(action) = action else { return Ok(()) };
        match action.action_type {
            ActionType::Vsvc => {
                tracing::info!(vsvc = %action.name, "deleting listener");
                check_delete(api.delete_listener(&action.name).await?, &action.name, true)
            }
            ActionType::Target => {
                tracing::info!(target = %action.name, "deleting cluster");
                check_delete(api.delete_cluster(&action.name).await?, &action.name, false)
            }
            ActionType::DynamicEndpoint => {
                let Some(cluster) = action.target.as_deref() else {
                    return Ok(());
                };
                // Deleting a cluster removes its endpoints with it.
                if !snap.contains(Kind::Targets, cluster) {
                    tracing::info!(
                        endpoint = %action.name,
                        %cluster,
                        "skipping deletion, owning target is gone"
                    );
                    return Ok(());
                }
                check_delete(
                    api.delete_endpoint(cluster, &action.name).await?,
                    &action.name,
                    false,
                )
            }
            ActionType::Rule => {
                let rulelist = action
                    .spec
                    .get("rulelist")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                tracing::info!(rule = %action.name, %rulelist, "deleting rule");
                check_delete(
                    api.delete_rule_from_rulelist(rulelist, &action.name).await?,
                    &action.name,
                    false,
                )?;
                check_delete(api.delete_rule(&action.name).await?, &action.name, false)
            }
        }
    }

    async fn set_owner_status(
        &self,
        snap: &Snapshot,
        kind: Kind,
        fqn: &str,
    ) -> Result<(), Error> {
        match &self.kube {
            Some(client) => owners::set_owner_status(client.clone(), snap, kind, fqn).await,
            None => Ok(()),
        }
    }
}

/// An add that the proxy rejects as already present has converged.
fn check_add(outcome: ApiOutcome, name: &str) -> Result<(), Error> {
    match outcome {
        ApiOutcome::Ok => Ok(()),
        ApiOutcome::Rejected {
            status: 400,
            content,
        } if content.ends_with(" already defined") => {
            tracing::warn!(%name, "already defined");
            Ok(())
        }
        ApiOutcome::Rejected { status, content } => Err(Error::Admin { status, content }),
    }
}

/// A delete for something the proxy never heard of has converged too.
/// Only the listener teardown path answers "Not running" after the
/// deletion already went through; elsewhere that message is a real
/// failure.
fn check_delete(outcome: ApiOutcome, name: &str, tolerate_not_running: bool) -> Result<(), Error> {
    match outcome {
        ApiOutcome::Ok => Ok(()),
        ApiOutcome::Rejected {
            status: 400,
            content,
        } if (content.starts_with("Cannot delete") && content.contains("Unknown"))
            || content.starts_with("Not Found")
            || (tolerate_not_running && content.starts_with("Not running")) =>
        {
            tracing::warn!(%name, %content, "it's not there");
            Ok(())
        }
        ApiOutcome::Rejected { status, content } => Err(Error::Admin { status, content }),
    }
}
