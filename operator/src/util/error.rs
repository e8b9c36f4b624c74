use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Yaml error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP transport error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Selector not supported: {0}")]
    UnsupportedSelector(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Downgrade schema error: {0}")]
    Downgrade(String),

    #[error("Proxy admin API error {status}: {content}")]
    Admin { status: u16, content: String },

    #[error("Temporary failure ({reason}), retry in {delay:?}")]
    Temporary { reason: String, delay: Duration },
}

impl Error {
    pub fn temporary(reason: impl Into<String>, delay: Duration) -> Self {
        Error::Temporary {
            reason: reason.into(),
            delay,
        }
    }

    /// Transient errors reschedule the triggering reconcile; everything
    /// else fails the affected object without a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Temporary { .. } | Error::Http { .. })
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Error::Temporary { delay, .. } => Some(*delay),
            Error::Http { .. } => Some(crate::util::RETRY_DELAY),
            _ => None,
        }
    }
}
