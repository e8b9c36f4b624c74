use std::collections::{BTreeMap, BTreeSet};

use crate::proto::envoy::service::discovery::v3::{DeltaDiscoveryResponse, Resource};

use super::outbox::XdsOp;

/// All resources are announced under this constant version; commit state
/// is tracked with nonces, not versions.
const RESOURCE_VERSION: &str = "1";
const RESOURCE_TTL_SECONDS: i64 = 120;

/// Bookkeeping for one `(pod UID, resource kind)` discovery stream.
/// `current_state` only ever contains payloads the client has
/// acknowledged; everything in flight sits in `pending_adds` keyed by
/// the nonce it was sent under.
#[derive(Debug, Default)]
pub struct StreamState {
    pub current_state: BTreeMap<String, prost_types::Any>,
    pending_acks: BTreeSet<String>,
    pending_adds: BTreeMap<String, BTreeMap<String, prost_types::Any>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The request acknowledged a nonce; its payloads are now committed.
    Ack { nonce: String },
    /// The client rejected a response; nothing was committed.
    Nack { nonce: String, message: String },
    /// Plain subscription request, nothing to account for.
    None,
}

#[derive(Debug, PartialEq)]
pub enum OpDisposition {
    /// Send this response and wait for the client's next request.
    Respond(DeltaDiscoveryResponse),
    /// Nothing to send; the op collapsed against current state.
    Suppressed,
    /// Terminate the stream.
    Close,
}

impl StreamState {
    /// Accounts for an inbound DeltaDiscoveryRequest. An ACK is a request
    /// carrying a known response_nonce with an empty error detail.
    pub fn apply_request(&mut self, response_nonce: &str, error_message: &str) -> AckOutcome {
        if self.pending_acks.contains(response_nonce) && error_message.is_empty() {
            self.pending_acks.remove(response_nonce);
            if let Some(adds) = self.pending_adds.remove(response_nonce) {
                self.current_state.extend(adds);
            }
            return AckOutcome::Ack {
                nonce: response_nonce.to_string(),
            };
        }
        if !error_message.is_empty() {
            // The nonce is answered, but its payloads stay uncommitted; a
            // later op may re-send or supersede them.
            self.pending_acks.remove(response_nonce);
            self.pending_adds.remove(response_nonce);
            return AckOutcome::Nack {
                nonce: response_nonce.to_string(),
                message: error_message.to_string(),
            };
        }
        AckOutcome::None
    }

    /// Turns a dequeued outbox op into the wire response, if any.
    pub fn handle_op(&mut self, op: XdsOp, type_url: &str) -> OpDisposition {
        match op {
            XdsOp::Add { name, payload } => {
                if self.current_state.contains_key(&name) {
                    return OpDisposition::Suppressed;
                }
                let nonce = uuid::Uuid::new_v4().to_string();
                self.pending_adds
                    .entry(nonce.clone())
                    .or_default()
                    .insert(name.clone(), payload.clone());
                self.pending_acks.insert(nonce.clone());
                OpDisposition::Respond(DeltaDiscoveryResponse {
                    system_version_info: "0".to_string(),
                    resources: vec![Resource {
                        version: RESOURCE_VERSION.to_string(),
                        resource: Some(payload),
                        name,
                        aliases: vec![],
                        ttl: Some(prost_types::Duration {
                            seconds: RESOURCE_TTL_SECONDS,
                            nanos: 0,
                        }),
                    }],
                    type_url: type_url.to_string(),
                    removed_resources: vec![],
                    nonce,
                })
            }
            XdsOp::Delete { name } => {
                if self.current_state.remove(&name).is_none() {
                    return OpDisposition::Suppressed;
                }
                OpDisposition::Respond(DeltaDiscoveryResponse {
                    system_version_info: "0".to_string(),
                    resources: vec![],
                    type_url: type_url.to_string(),
                    removed_resources: vec![name],
                    nonce: uuid::Uuid::new_v4().to_string(),
                })
            }
            XdsOp::Close => OpDisposition::Close,
        }
    }

    /// True while some response still awaits its ACK.
    pub fn has_pending(&self) -> bool {
        !self.pending_acks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

    fn payload(marker: &str) -> prost_types::Any {
        prost_types::Any {
            type_url: TYPE_URL.to_string(),
            value: marker.as_bytes().to_vec(),
        }
    }

    fn add(name: &str) -> XdsOp {
        XdsOp::Add {
            name: name.into(),
            payload: payload(name),
        }
    }

    fn respond(state: &mut StreamState, op: XdsOp) -> DeltaDiscoveryResponse {
        match state.handle_op(op, TYPE_URL) {
            OpDisposition::Respond(response) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn add_is_committed_only_after_its_nonce_is_acked() {
        let mut state = StreamState::default();
        let response = respond(&mut state, add("listener-l"));
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.resources[0].version, "1");
        assert_eq!(response.resources[0].ttl.as_ref().unwrap().seconds, 120);
        assert!(state.current_state.is_empty());
        assert!(state.has_pending());

        let outcome = state.apply_request(&response.nonce, "");
        assert_eq!(
            outcome,
            AckOutcome::Ack {
                nonce: response.nonce.clone()
            }
        );
        assert!(state.current_state.contains_key("listener-l"));
        assert!(!state.has_pending());
    }

    #[test]
    fn committed_names_suppress_repeated_adds() {
        let mut state = StreamState::default();
        let response = respond(&mut state, add("listener-l"));
        state.apply_request(&response.nonce, "");
        assert_eq!(state.handle_op(add("listener-l"), TYPE_URL), OpDisposition::Suppressed);
    }

    #[test]
    fn nack_leaves_the_payload_uncommitted() {
        let mut state = StreamState::default();
        let response = respond(&mut state, add("listener-l"));
        let outcome = state.apply_request(&response.nonce, "cannot parse");
        assert!(matches!(outcome, AckOutcome::Nack { message, .. } if message == "cannot parse"));
        assert!(state.current_state.is_empty());
        // A later op may re-send the same name.
        assert!(matches!(
            state.handle_op(add("listener-l"), TYPE_URL),
            OpDisposition::Respond(_)
        ));
    }

    #[test]
    fn unknown_nonce_is_not_an_ack() {
        let mut state = StreamState::default();
        respond(&mut state, add("listener-l"));
        assert_eq!(state.apply_request("bogus", ""), AckOutcome::None);
        assert!(state.current_state.is_empty());
    }

    #[test]
    fn delete_removes_committed_state_and_announces_removal() {
        let mut state = StreamState::default();
        let response = respond(&mut state, add("listener-l"));
        state.apply_request(&response.nonce, "");

        let response = respond(&mut state, XdsOp::Delete { name: "listener-l".into() });
        assert_eq!(response.removed_resources, vec!["listener-l".to_string()]);
        assert!(state.current_state.is_empty());

        // Deleting something never committed sends nothing.
        assert_eq!(
            state.handle_op(XdsOp::Delete { name: "listener-l".into() }, TYPE_URL),
            OpDisposition::Suppressed
        );
    }

    #[test]
    fn close_terminates_the_stream() {
        let mut state = StreamState::default();
        assert_eq!(state.handle_op(XdsOp::Close, TYPE_URL), OpDisposition::Close);
    }
}
