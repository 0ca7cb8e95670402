//! Streaming rewrite of GitHub release tarballs.
//!
//! GitHub wraps tarball contents in a `{owner}-{repo}-{ref}/` directory.  A
//! module lives in a subdirectory of that, so the rewrite keeps only the
//! entries under `{owner}-{repo}-{ref}/{module}/`, strips that prefix, and
//! re-emits them into a fresh gzip-compressed tar.
//!
//! The tar/gzip codecs are synchronous, so the rewrite runs on the blocking
//! pool, pulling upstream bytes through a [`SyncIoBridge`] and pushing output
//! through a bounded in-memory pipe that the async side drains into the
//! caller's sink.  At most one entry is in flight at a time and the pipe
//! capacity bounds buffered output, so memory use does not grow with archive
//! size.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use tar::EntryType;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error};

use super::{ByteSink, RepositoryError};

/// Capacity of the pipe between the blocking rewrite and the async sink.
const PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// Recognises `{owner}-{repo}-{ref}/{module}/{rest}` entry names and maps them
/// to `{rest}`.
///
/// The owner/repo prefix is compared case-insensitively because GitHub names
/// the wrapping directory with the repository's canonical casing, which need
/// not match the casing the client used.
#[derive(Debug, Clone)]
pub struct ArchiveRewriteRule {
    owner_repo_prefix: String,
    module_dir: String,
}

impl ArchiveRewriteRule {
    pub fn new(owner: &str, repo: &str, module: &str) -> Self {
        Self {
            owner_repo_prefix: format!("{owner}-{repo}-"),
            module_dir: format!("{module}/"),
        }
    }

    /// Archive-root-relative name for `name`, or `None` if the entry lies
    /// outside the module.
    pub fn rewrite<'a>(&self, name: &'a str) -> Option<&'a str> {
        let prefix_len = self.owner_repo_prefix.len();
        let head = name.get(..prefix_len)?;
        if !head.eq_ignore_ascii_case(&self.owner_repo_prefix) {
            return None;
        }

        let (reference, rest) = name[prefix_len..].split_once('/')?;
        if reference.is_empty() {
            return None;
        }

        let relative = rest.strip_prefix(&self.module_dir)?;
        (!relative.is_empty()).then_some(relative)
    }
}

// ---------------------------------------------------------------------------
// Entry error policy
// ---------------------------------------------------------------------------

/// What to do when copying a single entry fails part way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryErrorPolicy {
    /// Fail the whole download.
    #[default]
    Abort,
    /// Log the failure and carry on with the next entry.  The output archive
    /// may be truncated or corrupt.
    Skip,
}

/// Decide whether a failed entry copy ends the rewrite.  A closed output is
/// always fatal: there is nobody left to write to.
fn on_entry_error(
    policy: EntryErrorPolicy,
    name: &str,
    err: io::Error,
) -> Result<(), RepositoryError> {
    if err.kind() == io::ErrorKind::BrokenPipe {
        return Err(RepositoryError::Sink(err));
    }
    match policy {
        EntryErrorPolicy::Abort => Err(RepositoryError::EntryCopy {
            name: name.to_string(),
            source: err,
        }),
        EntryErrorPolicy::Skip => {
            error!(name, error = %err, "error copying tar entry, skipping");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronous rewrite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub written: usize,
    pub dropped: usize,
}

/// Rewrite the gzip-compressed tar read from `upstream` into a new
/// gzip-compressed tar written to `output`, keeping only entries accepted by
/// `rule`.
pub fn rewrite_archive<R: Read, W: Write>(
    upstream: R,
    output: W,
    rule: &ArchiveRewriteRule,
    policy: EntryErrorPolicy,
) -> Result<RewriteStats, RepositoryError> {
    let mut archive = tar::Archive::new(GzDecoder::new(upstream));
    let mut builder = tar::Builder::new(GzEncoder::new(output, Compression::default()));
    let mut stats = RewriteStats::default();

    let entries = archive
        .entries()
        .map_err(|e| RepositoryError::decode("reading tar", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| RepositoryError::decode("reading tar", e))?;

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(relative) = rule.rewrite(&name).map(str::to_owned) else {
            stats.dropped += 1;
            continue;
        };

        let mut header = fresh_header(entry.header(), entry.size())
            .map_err(|e| RepositoryError::decode("reading tar header", e))?;
        let copied = match header.entry_type() {
            EntryType::Symlink => match entry.link_name() {
                Ok(Some(target)) => {
                    let target = target.into_owned();
                    builder.append_link(&mut header, &relative, target)
                }
                Ok(None) => Err(io::Error::other("symlink without target")),
                Err(e) => Err(e),
            },
            EntryType::Link => {
                // Hard link targets carry the same wrapping prefix.
                let target = entry
                    .link_name_bytes()
                    .map(|t| String::from_utf8_lossy(&t).into_owned());
                match target.as_deref().and_then(|t| rule.rewrite(t)) {
                    Some(target) => builder.append_link(&mut header, &relative, target),
                    None => {
                        stats.dropped += 1;
                        continue;
                    }
                }
            }
            _ => builder.append_data(&mut header, &relative, &mut entry),
        };

        match copied {
            Ok(()) => stats.written += 1,
            Err(e) => {
                on_entry_error(policy, &relative, e)?;
                stats.dropped += 1;
            }
        }
    }

    let encoder = builder.into_inner().map_err(RepositoryError::Sink)?;
    let mut output = encoder.finish().map_err(RepositoryError::Sink)?;
    output.flush().map_err(RepositoryError::Sink)?;

    Ok(stats)
}

/// A GNU header carrying only the metadata worth keeping from `source`.
/// Name fields (including a ustar `prefix`) are left empty for the builder to
/// fill in with the rewritten path.
fn fresh_header(source: &tar::Header, size: u64) -> io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(source.entry_type());
    header.set_mode(source.mode()?);
    header.set_size(size);
    header.set_mtime(source.mtime()?);
    header.set_uid(source.uid()?);
    header.set_gid(source.gid()?);
    Ok(header)
}

// ---------------------------------------------------------------------------
// Async driver
// ---------------------------------------------------------------------------

/// Run [`rewrite_archive`] over an async upstream body, streaming the result
/// into `sink` as it is produced.
pub async fn stream_rewrite<R>(
    upstream: R,
    sink: &mut ByteSink,
    rule: ArchiveRewriteRule,
    policy: EntryErrorPolicy,
) -> Result<RewriteStats, RepositoryError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (mut pipe_reader, pipe_writer) = tokio::io::duplex(PIPE_CAPACITY);
    let reader = SyncIoBridge::new(upstream);
    let writer = SyncIoBridge::new(pipe_writer);

    let rewrite =
        tokio::task::spawn_blocking(move || rewrite_archive(reader, writer, &rule, policy));

    // `pipe_reader` moves into this future so that it is dropped as soon as
    // the copy stops; the blocking side then sees a broken pipe instead of
    // waiting forever on a full buffer.
    let copy = async move {
        let bytes = tokio::io::copy(&mut pipe_reader, sink).await?;
        sink.flush().await?;
        Ok::<_, io::Error>(bytes)
    };

    let (rewritten, copied) = tokio::join!(rewrite, copy);
    let rewritten = rewritten
        .map_err(|e| RepositoryError::Internal(format!("archive rewrite task failed: {e}")))?;

    match (rewritten, copied) {
        (Ok(stats), Ok(bytes)) => {
            debug!(
                written = stats.written,
                dropped = stats.dropped,
                bytes,
                "archive rewritten"
            );
            Ok(stats)
        }
        // A sink failure makes the rewrite fail with a broken pipe; report
        // the root cause.
        (_, Err(e)) => Err(RepositoryError::Sink(e)),
        (Err(e), Ok(_)) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
