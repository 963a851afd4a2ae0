//! Resilience layers around the completion provider: timeout and retry
//!
//! What this module provides
//! - `TimeoutLayer`: bounds a single provider call
//! - `RetryLayer<C>`: bounded retries with fixed or exponential backoff for
//!   errors the classifier deems transient
//! - `TransientOnly`: classifier that retries network/server/timeout failures
//!   and never retries typed logic errors
//! - `harden(provider, &GroupChatConfig)`: the stack sessions use by default
//!
//! Composition
//! - `ServiceBuilder::new().layer(RetryLayer::new(policy, TransientOnly)).layer(TimeoutLayer::new(dur)).service(p)`
//!   gives every attempt its own timeout
//! - Decision parsing happens above the provider seam, so a malformed
//!   selection or termination answer never reaches this layer and is never
//!   retried
//!
//! Testing strategy
//! - Fake services failing in a scripted pattern; assert attempt counts and
//!   which errors stop the retry loop

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_openai::error::OpenAIError;
use tokio::time::{sleep, timeout};
use tower::{BoxError, Layer, Service, ServiceBuilder, ServiceExt};
use tracing::warn;

use crate::config::{GroupChatConfig, RetryConfig};
use crate::error::GroupChatError;
use crate::provider::{boxed, BoxModelService, ModelService};

// ===== Retry =====

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub factor: f32,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            factor,
            max,
        }
    }

    /// Delay before retry number `attempt + 1`, at millisecond resolution.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let mult = f64::from(self.factor).powi(exponent);
                let millis = (self.initial.as_millis() as f64 * mult).round();
                if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
                    return self.max;
                }
                Duration::from_millis(millis as u64).min(self.max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: Backoff::exponential(
                cfg.initial_delay(),
                cfg.backoff_multiplier,
                cfg.max_delay(),
            ),
        }
    }
}

pub trait ErrorClassifier: Send + Sync + 'static {
    fn retryable(&self, error: &BoxError) -> bool;
}

/// Retries transport, server and timeout failures only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl ErrorClassifier for TransientOnly {
    fn retryable(&self, error: &BoxError) -> bool {
        if let Some(typed) = error.downcast_ref::<GroupChatError>() {
            return typed.is_transient();
        }
        if let Some(openai) = error.downcast_ref::<OpenAIError>() {
            return match openai {
                OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) => true,
                OpenAIError::ApiError(api) => {
                    let kind = api.r#type.as_deref().unwrap_or_default();
                    let code = api.code.as_deref().unwrap_or_default();
                    kind == "server_error" || kind == "rate_limit_exceeded" || code == "rate_limit_exceeded"
                }
                _ => false,
            };
        }
        if error.is::<serde_json::Error>() {
            return false;
        }
        // Untyped errors come from transports and fakes; treat them as I/O.
        true
    }
}

pub struct RetryLayer<C> {
    policy: RetryPolicy,
    classifier: C,
}

impl<C> RetryLayer<C> {
    pub fn new(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }
}

pub struct Retry<S, C> {
    inner: S,
    policy: RetryPolicy,
    classifier: C,
}

impl<S: Clone, C: Clone> Clone for Retry<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy,
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C> Layer<S> for RetryLayer<C>
where
    C: Clone,
{
    type Service = Retry<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy,
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C, Req> Service<Req> for Retry<S, C>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    C: ErrorClassifier + Clone,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Readiness is awaited per attempt inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let policy = self.policy;
        let classifier = self.classifier.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut attempts: usize = 0;
            loop {
                let mut svc = inner.clone();
                let result = ServiceExt::ready(&mut svc).await?.call(req.clone()).await;
                match result {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if attempts >= policy.max_retries || !classifier.retryable(&e) {
                            return Err(e);
                        }
                        let delay = policy.backoff.delay_for_attempt(attempts);
                        attempts += 1;
                        warn!(attempt = attempts, max = policy.max_retries, ?delay, error = %e, "retrying provider call");
                        sleep(delay).await;
                    }
                }
            }
        })
    }
}

// ===== Timeout =====

pub struct TimeoutLayer {
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

#[derive(Clone)]
pub struct Timeout<S> {
    inner: S,
    dur: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            dur: self.dur,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let dur = self.dur;
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err(Box::new(GroupChatError::Provider(format!(
                    "provider call timed out after {:?}",
                    dur
                ))) as BoxError),
            }
        })
    }
}

/// Wrap `provider` in the configured timeout and retry layers.
pub fn harden<P>(provider: P, config: &GroupChatConfig) -> BoxModelService
where
    P: ModelService + Clone + Send + 'static,
    P::Future: Send + 'static,
{
    let svc = ServiceBuilder::new()
        .layer(RetryLayer::new(RetryPolicy::from(&config.retry), TransientOnly))
        .layer(TimeoutLayer::new(config.provider_timeout()))
        .service(provider);
    boxed(svc)
}
