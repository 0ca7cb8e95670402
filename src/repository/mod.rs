//! Module repository abstraction.
//!
//! [`Repository`] is the capability the HTTP layer talks to: list the
//! versions of a module and stream a rewritten archive of one version.
//! [`github::GitHubRepository`] implements it against the GitHub REST API;
//! [`caching::CachingRepository`] wraps any other implementation with a
//! version-list cache and an archive content store.

pub mod archive;
pub mod caching;
pub mod github;

use std::io;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::context::RequestContext;

/// Destination of a streamed archive.
pub type ByteSink = dyn AsyncWrite + Send + Unpin;

// ---------------------------------------------------------------------------
// Coordinate
// ---------------------------------------------------------------------------

/// A module as addressed by a client: the namespace `system` (mapped to an
/// upstream owner), the repository holding it and the module directory
/// inside that repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleCoordinate {
    pub system: String,
    pub repo: String,
    pub module: String,
}

impl ModuleCoordinate {
    pub fn new(
        system: impl Into<String>,
        repo: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            repo: repo.into(),
            module: module.into(),
        }
    }
}

impl std::fmt::Display for ModuleCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.system, self.repo, self.module)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The repository is not in the configured allow-list.
    #[error("not a valid repository")]
    Forbidden,
    /// The upstream API answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    /// The request never produced a response (DNS, TLS, connection reset...).
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    /// The upstream body was not the gzip/tar/json it claimed to be.
    #[error("{context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    /// Copying a single archive entry to the output failed.
    #[error("copying archive entry {name}: {source}")]
    EntryCopy {
        name: String,
        #[source]
        source: io::Error,
    },
    /// Writing to the caller's sink failed (usually a disconnected client).
    #[error("writing archive output: {0}")]
    Sink(#[source] io::Error),
    #[error("{0}")]
    Internal(String),
}

impl RepositoryError {
    /// HTTP-equivalent status for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::Upstream { status, .. } => *status,
            Self::Transport(_) => 502,
            Self::Cancelled => 503,
            Self::DeadlineExceeded => 504,
            Self::Decode { .. }
            | Self::EntryCopy { .. }
            | Self::Sink(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Whether the failure came from the transport or the caller's context
    /// rather than from an upstream decision.  Only these are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Cancelled | Self::DeadlineExceeded
        )
    }

    pub(crate) fn decode(context: &'static str, source: io::Error) -> Self {
        Self::Decode { context, source }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Source of module versions and archives.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Versions of `coordinate.module`, in the order the backend reports
    /// them.
    async fn list_versions(
        &self,
        ctx: &RequestContext,
        coordinate: &ModuleCoordinate,
    ) -> Result<Vec<String>, RepositoryError>;

    /// Write a gzip-compressed tar of the module at `version` to `sink`, with
    /// the module directory's contents at the archive root.
    async fn proxy_download(
        &self,
        ctx: &RequestContext,
        coordinate: &ModuleCoordinate,
        version: &str,
        sink: &mut ByteSink,
    ) -> Result<(), RepositoryError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::io::AsyncWriteExt;

    use super::*;

    /// In-memory [`Repository`] that counts calls and can be switched to fail.
    #[derive(Default)]
    pub(crate) struct FakeRepository {
        pub(crate) versions: Vec<String>,
        pub(crate) archive: Vec<u8>,
        /// Fail every call with an upstream 502.
        pub(crate) fail: AtomicBool,
        /// Write half of the archive, then fail.
        pub(crate) truncate: AtomicBool,
        pub(crate) list_calls: AtomicUsize,
        pub(crate) download_calls: AtomicUsize,
        /// Token carried by the most recent call.
        pub(crate) last_token: Mutex<Option<String>>,
    }

    impl FakeRepository {
        pub(crate) fn new(versions: &[&str], archive: &[u8]) -> Self {
            Self {
                versions: versions.iter().map(|v| v.to_string()).collect(),
                archive: archive.to_vec(),
                ..Self::default()
            }
        }

        pub(crate) fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn lists(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn downloads(&self) -> usize {
            self.download_calls.load(Ordering::SeqCst)
        }

        fn remember_token(&self, ctx: &RequestContext) {
            *self.last_token.lock().unwrap() = ctx.token_or(None).map(str::to_owned);
        }

        fn upstream_failure() -> RepositoryError {
            RepositoryError::Upstream {
                status: 502,
                body: "upstream unavailable".into(),
            }
        }
    }

    #[async_trait]
    impl Repository for FakeRepository {
        async fn list_versions(
            &self,
            ctx: &RequestContext,
            _coordinate: &ModuleCoordinate,
        ) -> Result<Vec<String>, RepositoryError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.remember_token(ctx);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Self::upstream_failure());
            }
            Ok(self.versions.clone())
        }

        async fn proxy_download(
            &self,
            ctx: &RequestContext,
            _coordinate: &ModuleCoordinate,
            _version: &str,
            sink: &mut ByteSink,
        ) -> Result<(), RepositoryError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            self.remember_token(ctx);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Self::upstream_failure());
            }
            if self.truncate.load(Ordering::SeqCst) {
                let half = self.archive.len() / 2;
                sink.write_all(&self.archive[..half])
                    .await
                    .map_err(RepositoryError::Sink)?;
                return Err(RepositoryError::Internal("truncated".into()));
            }
            sink.write_all(&self.archive)
                .await
                .map_err(RepositoryError::Sink)?;
            Ok(())
        }
    }

    #[test]
    fn coordinate_display() {
        let c = ModuleCoordinate::new("aws", "infra", "vpc");
        assert_eq!(c.to_string(), "aws/infra/vpc");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(RepositoryError::Forbidden.status(), 403);
        assert_eq!(
            RepositoryError::Upstream {
                status: 404,
                body: "Not Found".into()
            }
            .status(),
            404
        );
        assert_eq!(RepositoryError::DeadlineExceeded.status(), 504);
        assert_eq!(
            RepositoryError::decode("read gzip", io::Error::other("bad magic")).status(),
            500
        );
    }

    #[test]
    fn only_transport_and_context_errors_are_retryable() {
        assert!(RepositoryError::Cancelled.is_retryable());
        assert!(RepositoryError::DeadlineExceeded.is_retryable());
        assert!(!RepositoryError::Forbidden.is_retryable());
        assert!(
            !RepositoryError::Upstream {
                status: 502,
                body: String::new()
            }
            .is_retryable()
        );
    }
}
