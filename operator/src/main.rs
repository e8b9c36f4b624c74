use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod args;
mod convert;
mod ingress;
mod owners;
mod planner;
mod rest;
mod selector;
mod store;
mod util;
mod xds;

pub mod proto {
    pub mod envoy {
        pub mod config {
            pub mod cluster {
                pub mod v3 {
                    tonic::include_proto!("envoy.config.cluster.v3");
                }
            }
            pub mod core {
                pub mod v3 {
                    tonic::include_proto!("envoy.config.core.v3");
                }
            }
            pub mod endpoint {
                pub mod v3 {
                    tonic::include_proto!("envoy.config.endpoint.v3");
                }
            }
            pub mod listener {
                pub mod v3 {
                    tonic::include_proto!("envoy.config.listener.v3");
                }
            }
        }
        pub mod extensions {
            pub mod filters {
                pub mod udp {
                    pub mod udp_proxy {
                        pub mod v3 {
                            tonic::include_proto!("envoy.extensions.filters.udp.udp_proxy.v3");
                        }
                    }
                }
            }
        }
        pub mod service {
            pub mod cluster {
                pub mod v3 {
                    tonic::include_proto!("envoy.service.cluster.v3");
                }
            }
            pub mod discovery {
                pub mod v3 {
                    tonic::include_proto!("envoy.service.discovery.v3");
                }
            }
            pub mod listener {
                pub mod v3 {
                    tonic::include_proto!("envoy.service.listener.v3");
                }
            }
        }
    }
    pub mod google {
        pub mod rpc {
            tonic::include_proto!("google.rpc");
        }
    }
}

use args::Args;
use convert::ConvDb;
use xds::XdsState;

#[tokio::main]
async fn main() -> Result<()> {
    l7mp_common::init();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    println!("{}", "⚙️ Starting l7mp operator...".green());

    let conv = Arc::new(ConvDb::load(&args.conv_path)?);
    let client = kube::Client::try_default().await?;
    let xds_state = Arc::new(XdsState::default());

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        l7mp_common::shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    let server = tokio::spawn(xds::run_server(
        xds_state.clone(),
        args.xds_port,
        cancel.clone(),
    ));

    l7mp_common::signal_ready();
    println!("{}", "🚀 l7mp operator started.".green());

    ingress::run(client, &args, conv, xds_state, cancel).await?;
    server.await??;
    Ok(())
}
