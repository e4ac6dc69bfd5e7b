use async_trait::async_trait;

use crate::error::Result;

use super::HandlerTransport;

type HandlerFn = Box<dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync>;

/// A direct in-process call, with no timeout — used by tests that want to
/// swap a real handler program for a plain Rust closure, the way the
/// teacher's test module swaps a real API server for `tower_test::mock`.
pub struct FnTransport {
    f: HandlerFn,
}

impl FnTransport {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl HandlerTransport for FnTransport {
    async fn invoke(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        (self.f)(request)
    }
}
