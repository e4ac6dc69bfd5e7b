//! Handler transport (`spec.md §4.1`): invoke an external program with a JSON
//! request and get a JSON response back. Exactly one variant is configured
//! per handler slot (`config::HandlerConfig`); the transport never parses the
//! payload, it only moves opaque bytes.

mod exec;
mod func;
mod http;

pub use exec::ExecTransport;
pub use func::FnTransport;
pub use http::HttpTransport;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait HandlerTransport: Send + Sync {
    async fn invoke(&self, request: Vec<u8>) -> Result<Vec<u8>>;
}

/// Build the configured transport for a handler slot. `context` is used only
/// for log/error messages (e.g. "myctrl.reconciler").
pub fn from_config(
    handler: &crate::config::HandlerConfig,
    context: &str,
) -> Result<Box<dyn HandlerTransport>> {
    match handler
        .validate(context)
        .map_err(|e| crate::error::Error::Unrecoverable(e.to_string()))?
    {
        crate::config::HandlerVariant::Exec(exec) => Ok(Box::new(ExecTransport::new(exec.clone()))),
        crate::config::HandlerVariant::Http(http) => {
            Ok(Box::new(HttpTransport::new(http.clone())?))
        }
    }
}
