//! Read-through caching decorator for any [`Repository`].
//!
//! Version lists are memoised in an [`ExpiringCache`]; archives are kept in a
//! [`ContentStore`] and filled by teeing the inner repository's output.
//! Failures are never cached, and concurrent misses for the same key each
//! call through to the inner repository.

use std::sync::Arc;

use async_trait::async_trait;
use prometheus_client::metrics::counter::Counter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::{ByteSink, ModuleCoordinate, Repository, RepositoryError};
use crate::cache::ExpiringCache;
use crate::cache::store::{ContentStore, StagedArchive};
use crate::context::RequestContext;
use crate::metrics::Metrics;

/// Capacity of the pipe between the inner repository and the tee.
const TEE_CAPACITY: usize = 64 * 1024;

pub type VersionCache = ExpiringCache<String, Vec<String>>;

pub struct CachingRepository {
    inner: Arc<dyn Repository>,
    versions: Arc<VersionCache>,
    store: Option<Arc<dyn ContentStore>>,
    metrics: Option<Arc<Metrics>>,
}

impl CachingRepository {
    pub fn new(inner: Arc<dyn Repository>, versions: Arc<VersionCache>) -> Self {
        Self {
            inner,
            versions,
            store: None,
            metrics: None,
        }
    }

    /// Serve and persist archives through `store`.
    pub fn with_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn count(&self, pick: impl FnOnce(&Metrics) -> &Counter) {
        if let Some(metrics) = &self.metrics {
            pick(metrics).inc();
        }
    }

    /// Run the inner download through a pipe, copying every chunk to both
    /// `sink` and `staged`.  The archive is committed only if the inner
    /// repository and the sink both succeed.
    async fn tee_download(
        &self,
        ctx: &RequestContext,
        coordinate: &ModuleCoordinate,
        version: &str,
        sink: &mut ByteSink,
        staged: Box<dyn StagedArchive>,
    ) -> Result<(), RepositoryError> {
        let (mut reader, writer) = tokio::io::duplex(TEE_CAPACITY);

        let produce = async move {
            let mut writer = writer;
            let result = self
                .inner
                .proxy_download(ctx, coordinate, version, &mut writer)
                .await;
            // Closing the writer is what ends the copy loop below.
            drop(writer);
            result
        };

        let consume = async move {
            let mut staged = staged;
            let mut storing = true;
            let mut buf = vec![0u8; TEE_CAPACITY];
            let copied = async {
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    sink.write_all(&buf[..n]).await?;
                    if storing && let Err(e) = staged.write_all(&buf[..n]).await {
                        warn!(error = %e, "archive store write failed, not caching");
                        storing = false;
                    }
                }
                sink.flush().await
            }
            .await;
            // Dropping the reader unblocks the producer if the sink failed.
            drop(reader);
            (copied, staged, storing)
        };

        let (produced, (copied, staged, storing)) = tokio::join!(produce, consume);

        match (produced, copied) {
            (Ok(()), Ok(())) if storing => {
                if let Err(e) = staged.commit().await {
                    warn!(error = %e, "failed to commit archive to store");
                }
                Ok(())
            }
            (Ok(()), Ok(())) => {
                staged.abort().await;
                Ok(())
            }
            (_, Err(e)) => {
                staged.abort().await;
                Err(RepositoryError::Sink(e))
            }
            (Err(e), Ok(())) => {
                staged.abort().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Repository for CachingRepository {
    #[instrument(skip_all, fields(coordinate = %coordinate))]
    async fn list_versions(
        &self,
        ctx: &RequestContext,
        coordinate: &ModuleCoordinate,
    ) -> Result<Vec<String>, RepositoryError> {
        let key = coordinate.to_string();
        if let Some(versions) = self.versions.get(&key) {
            debug!("version cache hit");
            self.count(|m| &m.version_cache_hits);
            return Ok(versions);
        }

        self.count(|m| &m.version_cache_misses);
        let versions = self.inner.list_versions(ctx, coordinate).await?;
        self.versions.set(key, versions.clone());
        debug!(cached = self.versions.count(), "version list cached");
        Ok(versions)
    }

    #[instrument(skip_all, fields(coordinate = %coordinate, version = %version))]
    async fn proxy_download(
        &self,
        ctx: &RequestContext,
        coordinate: &ModuleCoordinate,
        version: &str,
        sink: &mut ByteSink,
    ) -> Result<(), RepositoryError> {
        let Some(store) = &self.store else {
            return self
                .inner
                .proxy_download(ctx, coordinate, version, sink)
                .await;
        };

        match store.open(coordinate, version).await {
            Ok(Some(mut archive)) => {
                debug!("archive store hit");
                self.count(|m| &m.archive_cache_hits);
                return ctx
                    .guard(async {
                        tokio::io::copy(&mut archive, sink)
                            .await
                            .map_err(RepositoryError::Sink)?;
                        sink.flush().await.map_err(RepositoryError::Sink)
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "archive store lookup failed"),
        }
        self.count(|m| &m.archive_cache_misses);

        match store.create(coordinate, version).await {
            Ok(staged) => {
                self.tee_download(ctx, coordinate, version, sink, staged)
                    .await
            }
            Err(e) => {
                warn!(error = %e, "cannot stage archive, serving uncached");
                self.inner
                    .proxy_download(ctx, coordinate, version, sink)
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::cache::FsContentStore;
    use crate::cache::expiring::tests::ManualClock;
    use crate::metrics::MetricsRegistry;
    use crate::repository::tests::FakeRepository;

    fn coordinate() -> ModuleCoordinate {
        ModuleCoordinate::new("acme", "infra", "vpc")
    }

    fn caching(inner: &Arc<FakeRepository>) -> CachingRepository {
        CachingRepository::new(
            Arc::clone(inner) as Arc<dyn Repository>,
            Arc::new(VersionCache::new(Duration::from_secs(60))),
        )
    }

    // ── ListVersions ────────────────────────────────────────────────────

    #[tokio::test]
    async fn cached_versions_survive_inner_failure() {
        let inner = Arc::new(FakeRepository::new(&["v1.0.0", "v1.1.0"], b""));
        let repo = caching(&inner);
        let ctx = RequestContext::new();

        let first = repo.list_versions(&ctx, &coordinate()).await.unwrap();
        inner.set_failing(true);
        let second = repo.list_versions(&ctx, &coordinate()).await.unwrap();

        assert_eq!(first, vec!["v1.0.0", "v1.1.0"]);
        assert_eq!(second, first);
        assert_eq!(inner.lists(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = Arc::new(FakeRepository::new(&["v1.0.0"], b""));
        inner.set_failing(true);
        let repo = caching(&inner);
        let ctx = RequestContext::new();

        let err = repo.list_versions(&ctx, &coordinate()).await.unwrap_err();
        assert_eq!(err.status(), 502);

        inner.set_failing(false);
        let versions = repo.list_versions(&ctx, &coordinate()).await.unwrap();
        assert_eq!(versions, vec!["v1.0.0"]);
        assert_eq!(inner.lists(), 2);
    }

    #[tokio::test]
    async fn keys_are_per_coordinate() {
        let inner = Arc::new(FakeRepository::new(&["v1.0.0"], b""));
        let repo = caching(&inner);
        let ctx = RequestContext::new();

        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        repo.list_versions(&ctx, &ModuleCoordinate::new("acme", "infra", "eks"))
            .await
            .unwrap();
        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        assert_eq!(inner.lists(), 2);
    }

    #[tokio::test]
    async fn expired_versions_are_refetched() {
        let inner = Arc::new(FakeRepository::new(&["v1.0.0"], b""));
        let clock = ManualClock::new();
        let repo = CachingRepository::new(
            Arc::clone(&inner) as Arc<dyn Repository>,
            Arc::new(VersionCache::with_clock(Duration::from_secs(10), clock.clone())),
        );
        let ctx = RequestContext::new();

        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        clock.advance(Duration::from_secs(10));
        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        assert_eq!(inner.lists(), 1);

        clock.advance(Duration::from_millis(1));
        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        assert_eq!(inner.lists(), 2);
    }

    // ── ProxyDownload ───────────────────────────────────────────────────

    #[tokio::test]
    async fn download_without_store_passes_through() {
        let inner = Arc::new(FakeRepository::new(&[], b"archive bytes"));
        let repo = caching(&inner);
        let ctx = RequestContext::new();

        for _ in 0..2 {
            let mut sink = Vec::new();
            repo.proxy_download(&ctx, &coordinate(), "v1", &mut sink)
                .await
                .unwrap();
            assert_eq!(sink, b"archive bytes");
        }
        assert_eq!(inner.downloads(), 2);
    }

    #[tokio::test]
    async fn download_miss_is_teed_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsContentStore::new(dir.path()));
        let archive: Vec<u8> = (0..3 * TEE_CAPACITY).map(|i| (i % 251) as u8).collect();
        let inner = Arc::new(FakeRepository::new(&[], &archive));
        let repo = caching(&inner).with_store(store.clone());
        let ctx = RequestContext::new();

        let mut sink = Vec::new();
        repo.proxy_download(&ctx, &coordinate(), "v1", &mut sink)
            .await
            .unwrap();
        assert_eq!(sink, archive);

        let stored = std::fs::read(store.archive_path(&coordinate(), "v1").unwrap()).unwrap();
        assert_eq!(stored, archive);

        // Served from the store even though the inner repository now fails.
        inner.set_failing(true);
        let mut sink = Vec::new();
        repo.proxy_download(&ctx, &coordinate(), "v1", &mut sink)
            .await
            .unwrap();
        assert_eq!(sink, archive);
        assert_eq!(inner.downloads(), 1);
    }

    #[tokio::test]
    async fn failed_download_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsContentStore::new(dir.path()));
        let inner = Arc::new(FakeRepository::new(&[], b"0123456789"));
        inner.truncate.store(true, Ordering::SeqCst);
        let repo = caching(&inner).with_store(store.clone());
        let ctx = RequestContext::new();

        let mut sink = Vec::new();
        let err = repo
            .proxy_download(&ctx, &coordinate(), "v1", &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Internal(_)), "{err:?}");
        assert_eq!(sink, b"01234");
        assert!(store.open(&coordinate(), "v1").await.unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        inner.truncate.store(false, Ordering::SeqCst);
        let mut sink = Vec::new();
        repo.proxy_download(&ctx, &coordinate(), "v1", &mut sink)
            .await
            .unwrap();
        assert_eq!(sink, b"0123456789");
        assert_eq!(inner.downloads(), 2);
    }

    #[tokio::test]
    async fn rejected_download_leaves_store_root_empty() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(FakeRepository::new(&[], b"archive"));
        inner.set_failing(true);
        let repo = caching(&inner).with_store(Arc::new(FsContentStore::new(dir.path())));

        for version in ["v1", "v2", "v3"] {
            let mut sink = Vec::new();
            let err = repo
                .proxy_download(&RequestContext::new(), &coordinate(), version, &mut sink)
                .await
                .unwrap_err();
            assert!(matches!(err, RepositoryError::Upstream { status: 502, .. }), "{err:?}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cache_activity_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MetricsRegistry::new();
        let inner = Arc::new(FakeRepository::new(&["v1"], b"bytes"));
        let repo = caching(&inner)
            .with_store(Arc::new(FsContentStore::new(dir.path())))
            .with_metrics(Arc::clone(&registry.metrics));
        let ctx = RequestContext::new();

        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        repo.list_versions(&ctx, &coordinate()).await.unwrap();
        for _ in 0..2 {
            let mut sink = Vec::new();
            repo.proxy_download(&ctx, &coordinate(), "v1", &mut sink)
                .await
                .unwrap();
        }

        let metrics = &registry.metrics;
        assert_eq!(metrics.version_cache_hits.get(), 1);
        assert_eq!(metrics.version_cache_misses.get(), 1);
        assert_eq!(metrics.archive_cache_hits.get(), 1);
        assert_eq!(metrics.archive_cache_misses.get(), 1);
    }
}
