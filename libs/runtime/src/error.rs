//! Error kinds the core engine distinguishes, and how each maps to requeue behavior.
//!
//! See `spec.md §7`: transient transport errors and malformed handler output both
//! requeue with backoff; conflicts requeue immediately with no backoff increment;
//! invalid-dependent errors drop the reconcile without requeue; unrecoverable
//! errors kill the controller's workers.

use std::process::ExitStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube` crate itself.
    #[error("Kubernetes reported error: {0}")]
    KubeError(#[from] kube::Error),

    /// The configured handler subprocess exited non-zero.
    #[error("handler exited with {status}: {stderr}")]
    HandlerExit { status: ExitStatus, stderr: String },

    /// Spawning or communicating with the handler subprocess failed outright.
    #[error("failed to run handler process: {0}")]
    HandlerIo(#[source] std::io::Error),

    /// The handler subprocess did not return within its configured timeout.
    #[error("handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),

    /// The handler HTTP endpoint returned a non-2xx status, or an empty body.
    #[error("handler http error: status {status}, body: {body}")]
    HandlerHttp { status: u16, body: String },

    /// Transport-level failure talking to an HTTP handler (connect, TLS, etc).
    #[error("handler http transport error: {0}")]
    HandlerHttpTransport(#[source] reqwest::Error),

    /// The handler's response body was not valid JSON, or not the expected shape.
    #[error("malformed handler output: {0}")]
    MalformedHandlerOutput(String),

    /// A dependent in the handler's response was missing a name or GVK.
    #[error("invalid dependent: {0}")]
    InvalidDependent(String),

    /// The API server reported a conflicting `resourceVersion` on write.
    #[error("conflict applying {kind}/{name}")]
    Conflict { kind: String, name: String },

    /// A configuration invariant was violated at runtime (not caught at load time).
    #[error("unrecoverable configuration error: {0}")]
    Unrecoverable(String),

    /// The primary resource had no namespace set.
    #[error("resource {0} must be namespaced")]
    Unnamespaced(String),

    /// The current tracing span has no valid OpenTelemetry trace id attached.
    #[error("no valid trace id in the current span")]
    InvalidTraceId,
}

impl Error {
    /// Whether this error should trigger a requeue (possibly with backoff),
    /// as opposed to being dropped until the next informer event.
    pub fn should_requeue(&self) -> bool {
        !matches!(self, Error::InvalidDependent(_) | Error::Unrecoverable(_))
    }

    /// Whether the requeue should reset/skip backoff (conflicts retry immediately).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// A short, stable label suitable for a metrics label value.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube_error",
            Error::HandlerExit { .. } => "handler_exit",
            Error::HandlerIo(_) => "handler_io",
            Error::HandlerTimeout(_) => "handler_timeout",
            Error::HandlerHttp { .. } => "handler_http",
            Error::HandlerHttpTransport(_) => "handler_http_transport",
            Error::MalformedHandlerOutput(_) => "malformed_handler_output",
            Error::InvalidDependent(_) => "invalid_dependent",
            Error::Conflict { .. } => "conflict",
            Error::Unrecoverable(_) => "unrecoverable",
            Error::Unnamespaced(_) => "unnamespaced",
            Error::InvalidTraceId => "invalid_trace_id",
        }
        .to_owned()
    }
}
