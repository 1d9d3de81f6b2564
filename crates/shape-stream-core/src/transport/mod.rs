//! Transport seam
//!
//! The stream never talks to the network itself. Each request is handed to a
//! [`Transport`] together with its [`CancelSignal`]; the transport is expected
//! to abort promptly once the signal fires.

mod http;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::error::TransportError;
use crate::protocol::{ShapeRequest, TransportResponse};

pub use http::HttpTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request
    ///
    /// Non-success statuses are returned as responses, not errors; only
    /// connection-level failures and honoured cancellations are errors.
    async fn fetch(
        &self,
        request: ShapeRequest,
        signal: CancelSignal,
    ) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn fetch(
        &self,
        request: ShapeRequest,
        signal: CancelSignal,
    ) -> Result<TransportResponse, TransportError> {
        (**self).fetch(request, signal).await
    }
}

/// Transport backed by a closure, mostly for tests and embedding
pub struct FnTransport<F> {
    f: F,
}

impl<F> FnTransport<F>
where
    F: Fn(ShapeRequest, CancelSignal) -> BoxFuture<'static, Result<TransportResponse, TransportError>>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(ShapeRequest, CancelSignal) -> BoxFuture<'static, Result<TransportResponse, TransportError>>
        + Send
        + Sync,
{
    async fn fetch(
        &self,
        request: ShapeRequest,
        signal: CancelSignal,
    ) -> Result<TransportResponse, TransportError> {
        (self.f)(request, signal).await
    }
}

impl<F> std::fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}
