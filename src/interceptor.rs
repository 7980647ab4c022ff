//! Comment submission interceptor.
//!
//! Takes ownership of a matching request, tries live delivery and, when the
//! network fails, queues a snapshot and answers with the fallback response.
//! The caller never sees a network error; other errors (a refused redirect, a
//! request hook veto, a used body) are returned as-is and nothing is queued.

use crate::{
    Error,
    queue::{EntryId, SharedQueue},
    request::{InterceptedRequest, Request, Response},
    responder::FallbackResponder,
    route::{RouteHandler, RoutePattern},
    transport::DynAsyncTransport,
};
use async_trait::async_trait;
use http::Method;
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::{Origin, Url};

#[cfg(feature = "tracing")]
use crate::util::url::sanitize_url_for_logs;

/// Context handed to the persistence-failure hook.
pub struct PersistFailure<'a> {
    pub queue: &'a str,
    pub url: &'a Url,
    pub error: &'a Error,
}

/// Out-of-band notification that a submission acknowledged as queued was not
/// stored.
pub type PersistFailureHook =
    Arc<dyn for<'a> Fn(PersistFailure<'a>) + Send + Sync + 'static>;

/// Durability of a queued submission, resolved after the caller got its answer.
pub struct PendingEnqueue {
    state: PendingState,
}

enum PendingState {
    Spawned(JoinHandle<Result<EntryId, Error>>),
    Failed(Error),
}

impl PendingEnqueue {
    /// Wait until the entry is durable (or storing it failed).
    pub async fn wait(self) -> Result<EntryId, Error> {
        match self.state {
            PendingState::Spawned(handle) => handle.await.map_err(|source| Error::Task { source })?,
            PendingState::Failed(err) => Err(err),
        }
    }
}

/// Which branch `dispatch` took.
pub enum Outcome {
    /// The server answered; its response is returned untouched, whatever the status.
    Delivered(Response),
    /// The network failed; the submission was handed to the queue.
    Queued {
        response: Response,
        persistence: PendingEnqueue,
    },
}

impl Outcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    #[must_use]
    pub fn response(&self) -> &Response {
        match self {
            Self::Delivered(response) | Self::Queued { response, .. } => response,
        }
    }

    /// Drop the persistence handle; the enqueue keeps running detached.
    #[must_use]
    pub fn into_response(self) -> Response {
        match self {
            Self::Delivered(response) | Self::Queued { response, .. } => response,
        }
    }
}

#[derive(Clone)]
pub struct CommentInterceptor {
    pattern: RoutePattern,
    method: Method,
    site_origin: Origin,
    transport: DynAsyncTransport,
    queue: SharedQueue,
    responder: FallbackResponder,
    on_persist_failure: Option<PersistFailureHook>,
}

impl CommentInterceptor {
    /// Interceptor for AMP-converted comment posts (`POST`).
    #[must_use]
    pub fn new(
        site_origin: Origin,
        transport: DynAsyncTransport,
        queue: SharedQueue,
        responder: FallbackResponder,
    ) -> Self {
        Self {
            pattern: RoutePattern::comment_submission(),
            method: Method::POST,
            site_origin,
            transport,
            queue,
            responder,
            on_persist_failure: None,
        }
    }

    #[must_use]
    pub fn pattern(mut self, pattern: RoutePattern) -> Self {
        self.pattern = pattern;
        self
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn on_persist_failure(mut self, hook: PersistFailureHook) -> Self {
        self.on_persist_failure = Some(hook);
        self
    }

    #[must_use]
    pub fn route_pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    #[must_use]
    pub fn route_method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn matches(&self, request: &Request) -> bool {
        request.method == self.method && self.pattern.matches(&request.url, &self.site_origin)
    }

    /// Live response, or the fallback response once the submission is queued.
    pub async fn handle(&self, request: Request) -> Result<Response, Error> {
        Ok(self.dispatch(request).await?.into_response())
    }

    pub async fn dispatch(&self, request: Request) -> Result<Outcome, Error> {
        #[cfg(feature = "tracing")]
        let outcome = {
            use tracing::Instrument;

            let span = tracing::info_span!(
                "offline_comments.intercept",
                queue = %self.queue.name(),
                http.url = %sanitize_url_for_logs(&request.url),
                outcome = tracing::field::Empty,
            );
            let outcome = self.attempt(request).instrument(span.clone()).await;
            span.record(
                "outcome",
                match &outcome {
                    Ok(outcome) if outcome.is_queued() => "queued",
                    Ok(_) => "delivered",
                    Err(_) => "failed",
                },
            );
            outcome
        };
        #[cfg(not(feature = "tracing"))]
        let outcome = self.attempt(request).await;

        outcome
    }

    async fn attempt(&self, request: Request) -> Result<Outcome, Error> {
        #[cfg(feature = "metrics")]
        let _inflight = crate::transport::metrics::InFlightGuard::new();
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        // Must happen before the live attempt reads the body.
        let reserved = request.try_clone();
        let url = request.url.clone();

        let mut live = request;
        let result = match live.enforce_policy(&self.site_origin) {
            Ok(()) => self.transport.send(live).await,
            Err(err) => Err(err),
        };

        #[cfg(feature = "metrics")]
        crate::transport::metrics::record_live(
            result.as_ref().ok().map(|response| response.status),
            start.elapsed(),
        );

        match result {
            Ok(response) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(http.status = response.status.as_u16(), "live submission answered");
                Ok(Outcome::Delivered(response))
            }
            Err(err) if err.is_network_failure() => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "live submission failed, queuing for replay");
                let persistence = self.enqueue_detached(reserved, url);
                Ok(Outcome::Queued {
                    response: self.responder.respond(),
                    persistence,
                })
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "live submission refused, not queued");
                Err(err)
            }
        }
    }

    fn enqueue_detached(&self, reserved: Result<Request, Error>, url: Url) -> PendingEnqueue {
        let captured = match reserved.and_then(InterceptedRequest::capture) {
            Ok(captured) => captured,
            Err(err) => {
                report_persist_failure(
                    self.queue.name(),
                    &url,
                    &err,
                    self.on_persist_failure.as_ref(),
                );
                return PendingEnqueue {
                    state: PendingState::Failed(err),
                };
            }
        };

        let queue = self.queue.clone();
        let hook = self.on_persist_failure.clone();
        let handle = tokio::spawn(async move {
            let result = queue.enqueue(captured).await;
            match &result {
                Ok(_id) => {
                    #[cfg(feature = "metrics")]
                    crate::transport::metrics::record_enqueue(queue.name(), None);
                    #[cfg(feature = "tracing")]
                    tracing::info!(queue = %queue.name(), entry = %_id, "submission queued");
                }
                Err(err) => report_persist_failure(queue.name(), &url, err, hook.as_ref()),
            }
            result
        });

        PendingEnqueue {
            state: PendingState::Spawned(handle),
        }
    }
}

fn report_persist_failure(
    queue: &str,
    url: &Url,
    error: &Error,
    hook: Option<&PersistFailureHook>,
) {
    #[cfg(feature = "metrics")]
    crate::transport::metrics::record_enqueue(queue, Some(error.kind()));
    #[cfg(feature = "tracing")]
    tracing::error!(
        queue = %queue,
        url = %sanitize_url_for_logs(url),
        error = %error,
        "submission acknowledged as queued but not stored"
    );

    if let Some(hook) = hook {
        hook(PersistFailure { queue, url, error });
    }
}

#[async_trait]
impl RouteHandler for CommentInterceptor {
    async fn handle(&self, request: Request) -> Result<Response, Error> {
        CommentInterceptor::handle(self, request).await
    }
}
