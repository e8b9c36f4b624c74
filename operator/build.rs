use kube::CustomResourceExt;
use l7mp_types::*;
use std::fs;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use bundled protoc
    // SAFETY: This is safe in a build script context where we control the environment
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(
            &[
                "proto/envoy/service/listener/v3/lds.proto",
                "proto/envoy/service/cluster/v3/cds.proto",
                "proto/envoy/config/listener/v3/listener.proto",
                "proto/envoy/config/cluster/v3/cluster.proto",
                "proto/envoy/extensions/filters/udp/udp_proxy/v3/udp_proxy.proto",
            ],
            &["proto/"],
        )?;

    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/l7mp.io_virtualservices_crd.yaml",
        serde_yaml::to_string(&VirtualService::crd())?,
    )?;
    fs::write(
        "../crds/l7mp.io_targets_crd.yaml",
        serde_yaml::to_string(&Target::crd())?,
    )?;
    fs::write(
        "../crds/l7mp.io_rules_crd.yaml",
        serde_yaml::to_string(&Rule::crd())?,
    )?;
    Ok(())
}
