//! Per-request execution context threaded through every repository call.
//!
//! Carries the caller's bearer token (if any), a cancellation token and an
//! optional deadline.  Outbound work wrapped in [`RequestContext::guard`] is
//! dropped as soon as the request is cancelled or its deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::repository::RepositoryError;

#[derive(Clone, Default)]
pub struct RequestContext {
    token: Option<String>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("has_token", &self.token.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the caller's bearer token.  Empty tokens are treated as absent.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    /// Set a deadline `timeout` from now.  A zero timeout leaves the context
    /// without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.deadline = Some(Instant::now() + timeout);
        }
        self
    }

    /// The caller's token, falling back to `default` when none was supplied.
    pub fn token_or<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.token
            .as_deref()
            .or(default)
            .filter(|token| !token.is_empty())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the context is cancelled or its deadline passes.  The
    /// returned future owns its state, so it can outlive `self` (e.g. inside a
    /// blocking task).
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(at) => tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep_until(at) => {}
                },
                None => cancel.cancelled().await,
            }
        }
    }

    /// The error describing why [`Self::done`] resolved.
    pub fn done_error(&self) -> RepositoryError {
        if self.cancel.is_cancelled() {
            RepositoryError::Cancelled
        } else {
            RepositoryError::DeadlineExceeded
        }
    }

    /// Run `fut`, giving up early if the context is cancelled or its deadline
    /// passes.  Dropping `fut` aborts any in-flight I/O it owns.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        tokio::select! {
            biased;
            () = self.done() => Err(self.done_error()),
            result = fut => result,
        }
    }
}
