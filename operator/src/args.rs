use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Namespace the controller watches and reconciles
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// TCP port the incremental xDS server listens on
    #[arg(long, env = "XDS_PORT", default_value_t = 9090)]
    pub xds_port: u16,

    /// Port of the proxy admin API on every managed pod
    #[arg(long, env = "ADMIN_PORT", default_value_t = 1234)]
    pub admin_port: u16,

    /// Schema downgrade database, located alongside the executable
    #[arg(long, env = "CONV_PATH", default_value = "conv.yml")]
    pub conv_path: PathBuf,
}
