//! Builds the Envoy resources announced over LDS/CDS. A VirtualService
//! maps to a UDP listener fronting a udp_proxy filter; a Target maps to
//! a Maglev cluster over its resolved upstream addresses.

use prost::Message;
use serde_json::Value;

use crate::planner::Action;
use crate::proto::envoy::config::cluster::v3 as cluster;
use crate::proto::envoy::config::core::v3 as core;
use crate::proto::envoy::config::endpoint::v3 as endpoint;
use crate::proto::envoy::config::listener::v3 as listener;
use crate::proto::envoy::extensions::filters::udp::udp_proxy::v3 as udp_proxy;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
const UDP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.udp.udp_proxy.v3.UdpProxyConfig";

const UDP_PROXY_FILTER: &str = "envoy.filters.udp_listener.udp_proxy";
const HEALTH_CHECK_PORT: u32 = 1233;

pub fn listener_name(fqn: &str) -> String {
    format!("{fqn}-l")
}

pub fn cluster_name(fqn: &str) -> String {
    format!("{fqn}-c")
}

fn pack<M: Message>(type_url: &str, message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

pub fn pack_listener(listener: &listener::Listener) -> prost_types::Any {
    pack(LISTENER_TYPE_URL, listener)
}

pub fn pack_cluster(cluster: &cluster::Cluster) -> prost_types::Any {
    pack(CLUSTER_TYPE_URL, cluster)
}

/// Accepts both the CRD shape `{"UDP": {"port": N}}` and the flattened
/// legacy shape `{"protocol": "UDP", "port": N}`.
fn port_and_protocol(spec: &Value) -> Option<(String, u32)> {
    if let Some(port) = spec.get("port").and_then(Value::as_u64) {
        let protocol = spec
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or("UDP");
        return Some((protocol.to_string(), port as u32));
    }
    let (protocol, body) = spec.as_object()?.iter().next()?;
    let port = body.get("port").and_then(Value::as_u64)?;
    Some((protocol.clone(), port as u32))
}

fn udp_socket_address(address: &str, port: u32) -> core::Address {
    core::Address {
        address: Some(core::address::Address::SocketAddress(core::SocketAddress {
            protocol: core::socket_address::Protocol::Udp as i32,
            address: address.to_string(),
            resolver_name: String::new(),
            ipv4_compat: false,
            port_specifier: Some(core::socket_address::PortSpecifier::PortValue(port)),
        })),
    }
}

/// Encodes a VirtualService action. Only UDP listeners exist on this
/// data plane; anything else is skipped with a warning.
pub fn build_listener(action: &Action) -> Option<listener::Listener> {
    let spec = action.spec.pointer("/listener/spec")?;
    let (protocol, port) = port_and_protocol(spec)?;
    if !protocol.eq_ignore_ascii_case("udp") {
        tracing::warn!(vsvc = %action.name, %protocol, "only UDP listeners can be encoded");
        return None;
    }
    let name = listener_name(&action.name);
    let proxy_config = udp_proxy::UdpProxyConfig {
        stat_prefix: name.clone(),
        route_specifier: Some(udp_proxy::udp_proxy_config::RouteSpecifier::Cluster(
            cluster_name(&action.name),
        )),
        idle_timeout: None,
        use_original_src_ip: false,
        hash_policies: vec![udp_proxy::udp_proxy_config::HashPolicy {
            policy_specifier: Some(
                udp_proxy::udp_proxy_config::hash_policy::PolicySpecifier::SourceIp(true),
            ),
        }],
    };
    Some(listener::Listener {
        name,
        address: Some(udp_socket_address("0.0.0.0", port)),
        listener_filters: vec![listener::ListenerFilter {
            name: UDP_PROXY_FILTER.to_string(),
            config_type: Some(listener::listener_filter::ConfigType::TypedConfig(pack(
                UDP_PROXY_TYPE_URL,
                &proxy_config,
            ))),
        }],
        reuse_port: true,
    })
}

/// Encodes a Target action plus the dynamic endpoints resolved for the
/// same pod. Selector-derived endpoints carry a consistent-hash key and
/// a health-check port; static ones are plain addresses.
pub fn build_cluster(action: &Action, dynamic: &[&Action]) -> cluster::Cluster {
    let name = cluster_name(&action.name);
    let upstream_port = action
        .spec
        .pointer("/cluster/spec")
        .and_then(port_and_protocol)
        .map(|(_, port)| port)
        .unwrap_or(0);

    let mut lb_endpoints = Vec::new();
    let static_eps = action
        .spec
        .pointer("/cluster/endpoints")
        .and_then(Value::as_array);
    for ep in static_eps.into_iter().flatten() {
        let Some(address) = ep.pointer("/spec/address").and_then(Value::as_str) else {
            continue;
        };
        let port = ep
            .pointer("/spec/port")
            .and_then(Value::as_u64)
            .map(|p| p as u32)
            .unwrap_or(upstream_port);
        lb_endpoints.push(lb_endpoint(address, port, false));
    }
    for ep in dynamic {
        let Some(address) = ep.spec.get("address").and_then(Value::as_str) else {
            continue;
        };
        lb_endpoints.push(lb_endpoint(address, upstream_port, true));
    }

    cluster::Cluster {
        name: name.clone(),
        connect_timeout: Some(prost_types::Duration {
            seconds: 1,
            nanos: 0,
        }),
        lb_policy: cluster::cluster::LbPolicy::Maglev as i32,
        cluster_discovery_type: Some(cluster::cluster::ClusterDiscoveryType::Type(
            cluster::cluster::DiscoveryType::Static as i32,
        )),
        load_assignment: Some(endpoint::ClusterLoadAssignment {
            cluster_name: name,
            endpoints: vec![endpoint::LocalityLbEndpoints {
                lb_endpoints,
                priority: 0,
            }],
        }),
    }
}

fn lb_endpoint(address: &str, port: u32, hashed: bool) -> endpoint::LbEndpoint {
    let metadata = hashed.then(|| core::Metadata {
        filter_metadata: [(
            "envoy.lb".to_string(),
            prost_types::Struct {
                fields: [(
                    "hash_key".to_string(),
                    prost_types::Value {
                        kind: Some(prost_types::value::Kind::StringValue(address.to_string())),
                    },
                )]
                .into_iter()
                .collect(),
            },
        )]
        .into_iter()
        .collect(),
    });
    endpoint::LbEndpoint {
        metadata,
        host_identifier: Some(endpoint::lb_endpoint::HostIdentifier::Endpoint(
            endpoint::Endpoint {
                address: Some(udp_socket_address(address, port)),
                health_check_config: hashed.then(|| endpoint::endpoint::HealthCheckConfig {
                    port_value: HEALTH_CHECK_PORT,
                    hostname: String::new(),
                }),
                hostname: String::new(),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ActionType;
    use serde_json::json;

    fn vsvc_action() -> Action {
        Action {
            action_type: ActionType::Vsvc,
            name: "/l7mp.io/v1/VirtualService/default/vs".into(),
            spec: json!({
                "selector": {"matchLabels": {"app": "x"}},
                "listener": {"spec": {"UDP": {"port": 18002}}},
            }),
            target: None,
        }
    }

    #[test]
    fn listener_encoding_matches_the_udp_proxy_shape() {
        let built = build_listener(&vsvc_action()).expect("udp listener");
        assert_eq!(built.name, "/l7mp.io/v1/VirtualService/default/vs-l");
        assert!(built.reuse_port);

        let Some(core::address::Address::SocketAddress(socket)) =
            built.address.as_ref().and_then(|a| a.address.as_ref())
        else {
            panic!("expected a socket address");
        };
        assert_eq!(socket.address, "0.0.0.0");
        assert_eq!(socket.protocol, core::socket_address::Protocol::Udp as i32);
        assert_eq!(
            socket.port_specifier,
            Some(core::socket_address::PortSpecifier::PortValue(18002))
        );

        assert_eq!(built.listener_filters.len(), 1);
        let filter = &built.listener_filters[0];
        assert_eq!(filter.name, "envoy.filters.udp_listener.udp_proxy");
        let Some(listener::listener_filter::ConfigType::TypedConfig(any)) = &filter.config_type
        else {
            panic!("expected a typed filter config");
        };
        let config = udp_proxy::UdpProxyConfig::decode(any.value.as_slice()).unwrap();
        assert_eq!(config.stat_prefix, "/l7mp.io/v1/VirtualService/default/vs-l");
        assert_eq!(
            config.route_specifier,
            Some(udp_proxy::udp_proxy_config::RouteSpecifier::Cluster(
                "/l7mp.io/v1/VirtualService/default/vs-c".into()
            ))
        );
        assert!(matches!(
            config.hash_policies[0].policy_specifier,
            Some(udp_proxy::udp_proxy_config::hash_policy::PolicySpecifier::SourceIp(true))
        ));
    }

    #[test]
    fn non_udp_listener_specs_are_not_encoded() {
        let mut action = vsvc_action();
        action.spec["listener"]["spec"] = json!({"TCP": {"port": 80}});
        assert!(build_listener(&action).is_none());
    }

    #[test]
    fn cluster_encoding_marks_selector_endpoints_for_hashing() {
        let target = Action {
            action_type: ActionType::Target,
            name: "/l7mp.io/v1/Target/default/t".into(),
            spec: json!({
                "selector": {"matchLabels": {"app": "y"}},
                "cluster": {
                    "spec": {"UDP": {"port": 18000}},
                    "endpoints": [{"spec": {"address": "1.2.3.4"}}],
                },
            }),
            target: None,
        };
        let dynamic = Action {
            action_type: ActionType::DynamicEndpoint,
            name: "/l7mp.io/v1/Target/default/t/10.0.0.1".into(),
            spec: json!({"address": "10.0.0.1"}),
            target: Some("/l7mp.io/v1/Target/default/t".into()),
        };

        let built = build_cluster(&target, &[&dynamic]);
        assert_eq!(built.name, "/l7mp.io/v1/Target/default/t-c");
        assert_eq!(built.connect_timeout.as_ref().unwrap().seconds, 1);
        assert_eq!(built.lb_policy, cluster::cluster::LbPolicy::Maglev as i32);

        let assignment = built.load_assignment.as_ref().unwrap();
        assert_eq!(assignment.endpoints.len(), 1);
        let endpoints = &assignment.endpoints[0].lb_endpoints;
        assert_eq!(endpoints.len(), 2);

        // Static endpoint: plain address, no metadata.
        assert!(endpoints[0].metadata.is_none());

        // Dynamic endpoint: hash key + health check port.
        let hashed = &endpoints[1];
        let metadata = hashed.metadata.as_ref().unwrap();
        let lb = metadata.filter_metadata.get("envoy.lb").unwrap();
        assert_eq!(
            lb.fields.get("hash_key").and_then(|v| v.kind.as_ref()),
            Some(&prost_types::value::Kind::StringValue("10.0.0.1".into()))
        );
        let Some(endpoint::lb_endpoint::HostIdentifier::Endpoint(ep)) = &hashed.host_identifier
        else {
            panic!("expected an endpoint host identifier");
        };
        assert_eq!(ep.health_check_config.as_ref().unwrap().port_value, 1233);
        let Some(core::address::Address::SocketAddress(socket)) =
            ep.address.as_ref().and_then(|a| a.address.as_ref())
        else {
            panic!("expected a socket address");
        };
        assert_eq!(socket.address, "10.0.0.1");
        assert_eq!(
            socket.port_specifier,
            Some(core::socket_address::PortSpecifier::PortValue(18000))
        );
    }
}
