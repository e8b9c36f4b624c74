use owo_colors::Rgb;
use std::time::Duration;

mod error;

pub use error::*;

/// Accent colors for console output: dim labels and highlighted values.
pub(crate) const FG1: Rgb = Rgb(60, 130, 200);
pub(crate) const FG2: Rgb = Rgb(120, 160, 70);

/// Delay before a reconcile hit by a transport failure is redispatched.
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay before a pod event without a podIP is redelivered.
pub(crate) const POD_IP_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "l7mp-operator";
