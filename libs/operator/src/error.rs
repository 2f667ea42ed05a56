use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors surfaced by the operator core.
#[derive(Error, Debug)]
pub enum Error {
    /// Startup misconfiguration: unreadable or invalid watches file.
    #[error("invalid watches configuration: {0}")]
    ConfigError(String),

    /// Any error originating from the `kube` client.
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),

    /// Error in user input or CR definition, typically missing fields.
    #[error("invalid resource: {0}")]
    UserInputError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("io error: {0}")]
    IoError(#[source] std::io::Error),

    /// The event receiver could not be set up or failed while serving.
    #[error("event api error: {0}")]
    EventApiError(String),

    /// The child engine process could not be launched.
    #[error("runner error: {0}")]
    RunnerError(String),

    /// The run finished without emitting its terminal stats event.
    #[error("did not receive playbook_on_stats event")]
    MissingStatsEvent,

    /// Per-run kubeconfig could not be written.
    #[error("kubeconfig error: {0}")]
    KubeconfigError(#[source] ansible_operator_proxy::kubeconfig::Error),

    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::ConfigError(_) => "config_error",
            Error::KubeError(_) => "kube_error",
            Error::UserInputError(_) => "user_input_error",
            Error::SerializationError(_) => "serialization_error",
            Error::IoError(_) => "io_error",
            Error::EventApiError(_) => "event_api_error",
            Error::RunnerError(_) => "runner_error",
            Error::MissingStatsEvent => "missing_stats_event",
            Error::KubeconfigError(_) => "kubeconfig_error",
            Error::InvalidTraceId => "invalid_trace_id",
        }
        .to_string()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}
