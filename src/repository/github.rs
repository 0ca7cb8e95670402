//! GitHub / GitHub Enterprise implementation of [`Repository`].
//!
//! Versions are discovered from repository tags named `{module}/{version}`;
//! downloads fetch the tag's tarball and rewrite it so the module directory
//! becomes the archive root.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument, warn};

use super::archive::{ArchiveRewriteRule, EntryErrorPolicy, stream_rewrite};
use super::{ByteSink, ModuleCoordinate, Repository, RepositoryError};
use crate::config::GithubConfig;
use crate::context::RequestContext;
use crate::metrics::Metrics;

pub const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";
pub const TAGS_PER_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

// ---------------------------------------------------------------------------
// Repository struct
// ---------------------------------------------------------------------------

pub struct GitHubRepository {
    client: reqwest::Client,
    api_url: String,
    default_token: Option<String>,
    org_mappings: HashMap<String, String>,
    repositories: HashMap<String, Vec<String>>,
    on_entry_error: EntryErrorPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl GitHubRepository {
    pub fn new(
        config: &GithubConfig,
        default_token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            default_token: default_token.filter(|token| !token.is_empty()),
            org_mappings: config.org_mappings.clone(),
            repositories: config.repositories.clone(),
            on_entry_error: config.on_entry_error,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn map_org<'a>(&'a self, system: &'a str) -> &'a str {
        self.org_mappings
            .get(system)
            .map(String::as_str)
            .unwrap_or(system)
    }

    /// Fail closed when an allow-list is configured and `owner/repo` is not
    /// on it.
    fn check_allowed(&self, owner: &str, repo: &str) -> Result<(), RepositoryError> {
        if self.repositories.is_empty() {
            return Ok(());
        }
        match self.repositories.get(owner) {
            Some(repos) if repos.iter().any(|r| r == repo) => Ok(()),
            _ => {
                debug!(owner, repo, "repository not in allow-list");
                Err(RepositoryError::Forbidden)
            }
        }
    }

    fn record_upstream(&self, endpoint: &str, status: Option<u16>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream(endpoint, status);
        }
    }

    /// Issue a GET against the API and return the response if it is a 200.
    /// Anything else becomes [`RepositoryError::Upstream`] carrying the
    /// response body.
    async fn get(
        &self,
        ctx: &RequestContext,
        endpoint: &'static str,
        url: &str,
    ) -> Result<reqwest::Response, RepositoryError> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = ctx.token_or(self.default_token.as_deref()) {
            request = request.bearer_auth(token);
        }

        let response = ctx
            .guard(async { request.send().await.map_err(RepositoryError::Transport) })
            .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, RepositoryError::Transport(_)) {
                    self.record_upstream(endpoint, None);
                }
                return Err(e);
            }
        };

        let status = response.status();
        self.record_upstream(endpoint, Some(status.as_u16()));
        if status == reqwest::StatusCode::OK {
            return Ok(response);
        }

        let body = ctx
            .guard(async { response.text().await.map_err(RepositoryError::Transport) })
            .await;
        let body = match body {
            Ok(body) => body,
            Err(RepositoryError::Transport(e)) => e.to_string(),
            Err(e) => return Err(e),
        };
        warn!(endpoint, %status, "upstream API returned non-success status");
        Err(RepositoryError::Upstream {
            status: status.as_u16(),
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Repository for GitHubRepository {
    #[instrument(skip_all, fields(coordinate = %coordinate))]
    async fn list_versions(
        &self,
        ctx: &RequestContext,
        coordinate: &ModuleCoordinate,
    ) -> Result<Vec<String>, RepositoryError> {
        let owner = self.map_org(&coordinate.system);
        self.check_allowed(owner, &coordinate.repo)?;

        let prefix = format!("{}/", coordinate.module);
        let mut versions = Vec::new();

        for page in 1usize.. {
            let url = format!(
                "{}/repos/{owner}/{}/tags?per_page={TAGS_PER_PAGE}&page={page}",
                self.api_url, coordinate.repo
            );
            let response = self.get(ctx, "tags", &url).await?;
            let body = ctx
                .guard(async { response.bytes().await.map_err(RepositoryError::Transport) })
                .await?;
            let tags: Vec<Tag> = serde_json::from_slice(&body)
                .map_err(|e| RepositoryError::decode("decoding tags", e.into()))?;

            versions.extend(
                tags.iter()
                    .filter_map(|tag| tag.name.strip_prefix(&prefix))
                    .map(str::to_owned),
            );

            if tags.len() < TAGS_PER_PAGE {
                debug!(pages = page, versions = versions.len(), "listed module versions");
                break;
            }
        }

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
        let owner = self.map_org(&coordinate.system);
        self.check_allowed(owner, &coordinate.repo)?;

        let url = format!(
            "{}/repos/{owner}/{}/tarball/refs/tags/{}/{version}",
            self.api_url, coordinate.repo, coordinate.module
        );
        let response = self.get(ctx, "tarball", &url).await?;

        // The body stream ends as soon as the request is done, which unblocks
        // the rewrite worker if it is waiting on upstream bytes.
        let body = response
            .bytes_stream()
            .map_err(io::Error::other)
            .take_until(ctx.done());
        let upstream = StreamReader::new(Box::pin(body));

        let rule = ArchiveRewriteRule::new(owner, &coordinate.repo, &coordinate.module);
        ctx.guard(stream_rewrite(upstream, sink, rule, self.on_entry_error))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;
    use crate::repository::archive::tests::{tarball, untar};

    fn config(server: &MockServer) -> GithubConfig {
        GithubConfig {
            api_url: server.uri(),
            ..GithubConfig::default()
        }
    }

    fn repository(config: &GithubConfig, token: Option<&str>) -> GitHubRepository {
        GitHubRepository::new(config, token.map(str::to_owned), reqwest::Client::new())
    }

    fn tags(names: &[&str]) -> serde_json::Value {
        serde_json::Value::Array(
            names
                .iter()
                .map(|name| serde_json::json!({ "name": name, "commit": { "sha": "abc" } }))
                .collect(),
        )
    }

    struct NoAuthorization;

    impl wiremock::Match for NoAuthorization {
        fn matches(&self, request: &Request) -> bool {
            !request.headers.contains_key("authorization")
        }
    }

    // ── ListVersions ────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_versions_filters_by_module_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tags"))
            .and(query_param("per_page", "100"))
            .and(query_param("page", "1"))
            .and(header("X-GitHub-Api-Version", API_VERSION))
            .and(header("accept", ACCEPT))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[
                "mod/v1.0.0",
                "mod/v1.1.0",
                "other/v2.0.0",
                "module/v9.0.0",
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let versions = repo
            .list_versions(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "mod"),
            )
            .await
            .unwrap();
        assert_eq!(versions, vec!["v1.0.0", "v1.1.0"]);
    }

    #[tokio::test]
    async fn list_versions_follows_full_pages() {
        let server = MockServer::start().await;
        let first: Vec<String> = (0..TAGS_PER_PAGE).map(|i| format!("mod/v0.{i}.0")).collect();
        let first: Vec<&str> = first.iter().map(String::as_str).collect();

        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tags"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&first)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tags"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&["mod/v1.0.0"])))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let versions = repo
            .list_versions(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "mod"),
            )
            .await
            .unwrap();
        assert_eq!(versions.len(), TAGS_PER_PAGE + 1);
        assert_eq!(versions[0], "v0.0.0");
        assert_eq!(versions[TAGS_PER_PAGE], "v1.0.0");
    }

    #[tokio::test]
    async fn list_versions_maps_system_to_owner() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&["vpc/v1.0.0"])))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config(&server);
        config
            .org_mappings
            .insert("aws".to_string(), "acme".to_string());
        let repo = repository(&config, None);

        let versions = repo
            .list_versions(
                &RequestContext::new(),
                &ModuleCoordinate::new("aws", "infra", "vpc"),
            )
            .await
            .unwrap();
        assert_eq!(versions, vec!["v1.0.0"]);
    }

    #[tokio::test]
    async fn allow_list_rejects_without_upstream_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = config(&server);
        config
            .repositories
            .insert("acme".to_string(), vec!["infra".to_string()]);
        let repo = repository(&config, Some("service"));
        let ctx = RequestContext::new();

        for coordinate in [
            ModuleCoordinate::new("acme", "secret", "vpc"),
            ModuleCoordinate::new("other", "infra", "vpc"),
        ] {
            let err = repo.list_versions(&ctx, &coordinate).await.unwrap_err();
            assert!(matches!(err, RepositoryError::Forbidden), "{err:?}");
            assert_eq!(err.status(), 403);

            let mut sink = Vec::new();
            let err = repo
                .proxy_download(&ctx, &coordinate, "v1.0.0", &mut sink)
                .await
                .unwrap_err();
            assert!(matches!(err, RepositoryError::Forbidden), "{err:?}");
            assert!(sink.is_empty());
        }
    }

    #[tokio::test]
    async fn allow_list_admits_listed_repositories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config(&server);
        config
            .repositories
            .insert("acme".to_string(), vec!["infra".to_string()]);
        let repo = repository(&config, None);

        let versions = repo
            .list_versions(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "vpc"),
            )
            .await
            .unwrap();
        assert!(versions.is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_keep_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tags"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let err = repo
            .list_versions(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "vpc"),
            )
            .await
            .unwrap_err();
        match err {
            RepositoryError::Upstream { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "Not Found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_tag_listing_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let err = repo
            .list_versions(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "vpc"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Decode { .. }), "{err:?}");
        assert!(!err.is_retryable());
    }

    // ── Credentials ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn request_token_overrides_service_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer caller"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), Some("service"));
        let ctx = RequestContext::new().with_token("caller");
        repo.list_versions(&ctx, &ModuleCoordinate::new("acme", "infra", "vpc"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn service_token_used_without_request_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer service"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), Some("service"));
        repo.list_versions(
            &RequestContext::new(),
            &ModuleCoordinate::new("acme", "infra", "vpc"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn no_authorization_header_without_any_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(NoAuthorization)
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), Some(""));
        repo.list_versions(
            &RequestContext::new(),
            &ModuleCoordinate::new("acme", "infra", "vpc"),
        )
        .await
        .unwrap();
    }

    // ── ProxyDownload ───────────────────────────────────────────────────

    #[tokio::test]
    async fn proxy_download_rewrites_tarball() {
        let server = MockServer::start().await;
        let upstream = tarball(&[
            ("acme-infra-1a2b3c/README.md", b"root readme"),
            ("acme-infra-1a2b3c/vpc/main.tf", b"resource {}"),
            ("acme-infra-1a2b3c/vpc/modules/subnet/main.tf", b"subnet"),
            ("acme-infra-1a2b3c/eks/main.tf", b"eks"),
        ]);
        Mock::given(method("GET"))
            .and(path("/repos/acme/infra/tarball/refs/tags/vpc/v1.2.0"))
            .and(header("X-GitHub-Api-Version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(upstream))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let mut sink = Vec::new();
        repo.proxy_download(
            &RequestContext::new(),
            &ModuleCoordinate::new("acme", "infra", "vpc"),
            "v1.2.0",
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(
            untar(&sink),
            vec![
                ("main.tf".to_string(), b"resource {}".to_vec()),
                ("modules/subnet/main.tf".to_string(), b"subnet".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn proxy_download_surfaces_upstream_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Bad credentials"))
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let mut sink = Vec::new();
        let err = repo
            .proxy_download(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "vpc"),
                "v1.0.0",
                &mut sink,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, RepositoryError::Upstream { status: 403, ref body } if body == "Bad credentials"),
            "{err:?}"
        );
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn proxy_download_rejects_corrupt_tarball() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a tarball".to_vec()))
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let mut sink = Vec::new();
        let err = repo
            .proxy_download(
                &RequestContext::new(),
                &ModuleCoordinate::new("acme", "infra", "vpc"),
                "v1.0.0",
                &mut sink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Decode { .. }), "{err:?}");
    }

    // ── Cancellation ────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelled_context_makes_no_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .expect(0)
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let ctx = RequestContext::new();
        ctx.cancel();

        let err = repo
            .list_versions(&ctx, &ModuleCoordinate::new("acme", "infra", "vpc"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Cancelled), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn deadline_unblocks_slow_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(tags(&[]))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let repo = repository(&config(&server), None);
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = repo
            .list_versions(&ctx, &ModuleCoordinate::new("acme", "infra", "vpc"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::DeadlineExceeded), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_unblocks_stalled_tarball_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Upstream sends headers and half the tarball, then goes quiet with
        // the connection held open.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = tarball(&[("acme-infra-abc/vpc/main.tf", &[9u8; 256 * 1024][..])]);
        let (streaming_tx, streaming_rx) = tokio::sync::oneshot::channel();
        let upstream = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/x-gzip\r\ncontent-length: {}\r\n\r\n",
                body.len() + 4096
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body[..body.len() / 2]).await.unwrap();
            socket.flush().await.unwrap();
            let _ = streaming_tx.send(());
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let config = GithubConfig {
            api_url: format!("http://{addr}"),
            ..GithubConfig::default()
        };
        let repo = repository(&config, None);
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            let _ = streaming_rx.await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let mut sink = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            repo.proxy_download(
                &ctx,
                &ModuleCoordinate::new("acme", "infra", "vpc"),
                "v1.0.0",
                &mut sink,
            ),
        )
        .await
        .expect("download should stop once the request is cancelled");
        assert!(matches!(result, Err(RepositoryError::Cancelled)), "{result:?}");
        upstream.abort();
    }

    #[tokio::test]
    async fn upstream_calls_are_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags(&[])))
            .mount(&server)
            .await;

        let registry = crate::metrics::MetricsRegistry::new();
        let repo =
            repository(&config(&server), None).with_metrics(Arc::clone(&registry.metrics));
        repo.list_versions(
            &RequestContext::new(),
            &ModuleCoordinate::new("acme", "infra", "vpc"),
        )
        .await
        .unwrap();

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"forgemod_upstream_requests_total{endpoint="tags",status="200"} 1"#));
    }
}
