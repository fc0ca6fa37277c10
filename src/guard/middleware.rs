use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use super::{ChatGuard, UpstreamOutcome};
use crate::error::GuardedCallError;
use crate::telemetry::{LogSink, TelemetrySink};

/// Requests that can name the client they come from.
pub trait ClientIdentified {
    /// Key for per-client rate limiting, e.g. from
    /// [`client_identifier`](crate::chat::client_identifier).
    fn client_identifier(&self) -> String;
}

/// A layer that runs every call through a [`ChatGuard`].
#[derive(Clone, Debug)]
pub struct GuardLayer<S = LogSink> {
    guard: ChatGuard<S>,
}

impl<S> GuardLayer<S> {
    /// Create a new guard layer.
    pub fn new(guard: ChatGuard<S>) -> Self {
        Self { guard }
    }
}

impl<Svc, S: Clone> Layer<Svc> for GuardLayer<S> {
    type Service = GuardService<Svc, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        GuardService { inner: service, guard: self.guard.clone() }
    }
}

/// Middleware service produced by [`GuardLayer`].
///
/// Admission and the breaker check run before the inner service is called; its
/// result is reported back as the upstream outcome.
#[derive(Clone, Debug)]
pub struct GuardService<Svc, S = LogSink> {
    inner: Svc,
    guard: ChatGuard<S>,
}

impl<Svc, S, Req> Service<Req> for GuardService<Svc, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Response: Send + 'static,
    Svc::Error: fmt::Display + Send + 'static,
    S: TelemetrySink,
    Req: ClientIdentified + Send + 'static,
{
    type Response = Svc::Response;
    type Error = GuardedCallError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardedCallError::Upstream)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let guard = self.guard.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let identifier = req.client_identifier();
            guard.admit(&identifier).await.map_err(GuardedCallError::Rejected)?;

            match inner.call(req).await {
                Ok(response) => {
                    let _ = guard.report_outcome(UpstreamOutcome::Success).await;
                    Ok(response)
                }
                Err(error) => {
                    let outcome = UpstreamOutcome::Failure(error.to_string());
                    let _ = guard.report_outcome(outcome).await;
                    Err(GuardedCallError::Upstream(error))
                }
            }
        })
    }
}
