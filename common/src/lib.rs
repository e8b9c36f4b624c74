use owo_colors::OwoColorize;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Keys the controller leaves on managed objects. Progress and diff-base
/// storage under this prefix belongs to the watch client; the core only
/// needs the names to agree across components.
pub mod annotations {
    pub const PREFIX: &str = "operator.l7mp.io";
    pub const FINALIZER: &str = "operator.l7mp.io/kopf-finalizer";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Resolves once the operator is asked to stop: SIGINT at a terminal, or
/// the SIGTERM the kubelet sends on pod shutdown. The caller cancels its
/// token and lets the watchers and the xDS server drain.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => eprintln!("{}", "🛑 SIGINT, stopping the operator".red()),
            _ = sigterm.recv() => eprintln!("{}", "🛑 SIGTERM, stopping the operator".red()),
        }
    }

    #[cfg(not(unix))]
    {
        // No SIGTERM off Unix; Ctrl+C is all there is.
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}
