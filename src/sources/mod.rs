//! Source resolution: turn a `SourceDescriptor` into a validated bundle in
//! a private staging directory.
//!
//! The three source kinds are a closed set; `resolve` dispatches on the
//! descriptor's tag. Nothing here touches the final install path.

pub mod archive;
pub mod fetch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::FetchSection;
use crate::error::{PandemicError, Result, SourceError};
use crate::infection::{SourceDescriptor, SourceKind};
use crate::manifest::{Manifest, MANIFEST_FILE};

use archive::ArchiveKind;
pub use fetch::{FetchError, Fetcher, HttpFetcher};

/// A fetched, unpacked and validated infection payload.
#[derive(Debug)]
pub struct Bundle {
    /// Directory holding `infection.yaml`.
    pub root_dir: PathBuf,
    pub manifest: Manifest,
    /// Scratch directory owning `root_dir`; removed by `discard`.
    pub staging: PathBuf,
}

impl Bundle {
    pub async fn discard(self) {
        remove_staging(&self.staging).await;
    }
}

pub struct SourceResolver {
    fetcher: Arc<dyn Fetcher>,
    staging_root: PathBuf,
    fetch: FetchSection,
}

impl SourceResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, staging_root: PathBuf, fetch: FetchSection) -> Self {
        Self {
            fetcher,
            staging_root,
            fetch,
        }
    }

    /// Prefix allowlist. An empty list allows every source.
    pub fn check_allowed(descriptor: &SourceDescriptor, allowed: &[String]) -> Result<()> {
        if allowed.is_empty() || allowed.iter().any(|prefix| descriptor.uri.starts_with(prefix.as_str())) {
            return Ok(());
        }
        warn!(uri = %descriptor.uri, "Source rejected by allowlist");
        Err(SourceError::Forbidden(descriptor.uri.clone()).into())
    }

    /// Fetch, unpack and validate. On error nothing is left in staging.
    pub async fn resolve(&self, descriptor: &SourceDescriptor) -> Result<Bundle> {
        let staging = self
            .staging_root
            .join(uuid::Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&staging).await?;
        debug!(uri = %descriptor.uri, staging = %staging.display(), "Resolving source");

        match self.resolve_into(descriptor, &staging).await {
            Ok((root_dir, manifest)) => {
                info!(
                    uri = %descriptor.uri,
                    name = manifest.name().unwrap_or_default(),
                    "Resolved bundle"
                );
                Ok(Bundle {
                    root_dir,
                    manifest,
                    staging,
                })
            }
            Err(e) => {
                remove_staging(&staging).await;
                Err(e)
            }
        }
    }

    async fn resolve_into(
        &self,
        descriptor: &SourceDescriptor,
        staging: &Path,
    ) -> Result<(PathBuf, Manifest)> {
        let target = staging.join("bundle");
        let root = match descriptor.kind {
            SourceKind::Github => self.stage_github(descriptor, &target).await?,
            SourceKind::Http => self.stage_http(descriptor, &target).await?,
            SourceKind::Local => stage_local(descriptor, &target).await?,
        };
        let manifest = load_manifest(&descriptor.uri, &root).await?;
        manifest.validate()?;
        Ok((root, manifest))
    }

    async fn stage_github(&self, descriptor: &SourceDescriptor, target: &Path) -> Result<PathBuf> {
        let repo = descriptor
            .github_repo()
            .ok_or_else(|| SourceError::UnsupportedScheme(descriptor.uri.clone()))?;
        let git_ref = descriptor.git_ref.as_deref().unwrap_or("main");
        let url = format!(
            "{}/{repo}/archive/{git_ref}.tar.gz",
            self.fetch.github_base_url.trim_end_matches('/')
        );
        let bytes = self.download(&url).await?;
        unpack_blocking(&descriptor.uri, ArchiveKind::TarGz, bytes, target).await
    }

    async fn stage_http(&self, descriptor: &SourceDescriptor, target: &Path) -> Result<PathBuf> {
        let bytes = self.download(&descriptor.uri).await?;
        let file_name = url_file_name(&descriptor.uri);
        match ArchiveKind::from_name(&file_name) {
            Some(kind) => unpack_blocking(&descriptor.uri, kind, bytes, target).await,
            None => {
                tokio::fs::create_dir_all(target).await?;
                tokio::fs::write(target.join(&file_name), bytes).await?;
                Ok(target.to_path_buf())
            }
        }
    }

    /// Download with retry on transient failures, exponential backoff
    /// between attempts.
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let attempts = self.fetch.attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match self.fetcher.fetch(url).await {
                Ok(bytes) => {
                    debug!(url = %url, attempt, bytes = bytes.len(), "Downloaded");
                    return Ok(bytes);
                }
                Err(FetchError::NotFound) => {
                    return Err(SourceError::NotFound(url.to_string()).into());
                }
                Err(FetchError::Fatal(reason)) => {
                    return Err(SourceError::Network {
                        uri: url.to_string(),
                        attempts: attempt,
                        reason,
                    }
                    .into());
                }
                Err(FetchError::Transient(reason)) => {
                    warn!(url = %url, attempt, attempts, reason = %reason, "Download attempt failed");
                    last_reason = reason;
                    if attempt < attempts {
                        tokio::time::sleep(self.fetch.backoff(attempt - 1)).await;
                    }
                }
            }
        }

        Err(SourceError::Network {
            uri: url.to_string(),
            attempts,
            reason: last_reason,
        }
        .into())
    }
}

async fn stage_local(descriptor: &SourceDescriptor, target: &Path) -> Result<PathBuf> {
    let path = descriptor.local_path()?;
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SourceError::NotFound(descriptor.uri.clone()).into());
        }
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        let (src, dst) = (path.clone(), target.to_path_buf());
        run_blocking(&descriptor.uri, move || {
            archive::copy_dir(&src, &dst).map_err(|e| e.to_string())
        })
        .await?;
        return Ok(target.to_path_buf());
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    match ArchiveKind::from_name(&file_name) {
        Some(kind) => {
            let bytes = tokio::fs::read(&path).await?;
            unpack_blocking(&descriptor.uri, kind, bytes, target).await
        }
        None => {
            tokio::fs::create_dir_all(target).await?;
            tokio::fs::copy(&path, target.join(&file_name)).await?;
            Ok(target.to_path_buf())
        }
    }
}

async fn unpack_blocking(
    uri: &str,
    kind: ArchiveKind,
    bytes: Vec<u8>,
    target: &Path,
) -> Result<PathBuf> {
    let target = target.to_path_buf();
    run_blocking(uri, move || {
        archive::unpack(kind, &bytes, &target)?;
        archive::single_root(&target).map_err(|e| e.to_string())
    })
    .await
}

async fn run_blocking<T, F>(uri: &str, f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    let archive_error = |reason: String| -> PandemicError {
        SourceError::Archive {
            uri: uri.to_string(),
            reason,
        }
        .into()
    };
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| archive_error(e.to_string()))?
        .map_err(archive_error)
}

async fn load_manifest(uri: &str, root: &Path) -> Result<Manifest> {
    let invalid = |reason: String| -> PandemicError {
        SourceError::InvalidManifest {
            source_uri: uri.to_string(),
            reason,
        }
        .into()
    };
    let text = match tokio::fs::read_to_string(root.join(MANIFEST_FILE)).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(invalid(format!("{MANIFEST_FILE} not found at bundle root")));
        }
        Err(e) => return Err(invalid(e.to_string())),
    };
    Manifest::from_yaml(&text).map_err(invalid)
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

/// Last path segment of a URL, without query or fragment.
fn url_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let name = after_scheme
        .split_once('/')
        .map(|(_, path)| path.rsplit('/').next().unwrap_or_default())
        .unwrap_or_default();
    if name.is_empty() {
        "bundle".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::archive::fixtures;
    use crate::testing::FakeFetcher;
    use tempfile::TempDir;

    const MANIFEST: &str = "metadata:\n  name: demo\nexecution:\n  command: ./bin/demo\n";

    fn fast_fetch() -> FetchSection {
        FetchSection {
            attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..FetchSection::default()
        }
    }

    fn resolver(dir: &TempDir, fetcher: Arc<FakeFetcher>) -> SourceResolver {
        SourceResolver::new(fetcher, dir.path().join("staging"), fast_fetch())
    }

    fn staging_is_empty(dir: &TempDir) -> bool {
        std::fs::read_dir(dir.path().join("staging"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn resolves_local_directory() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("demo");
        std::fs::create_dir_all(src.join("bin")).expect("mkdir");
        std::fs::write(src.join(MANIFEST_FILE), MANIFEST).expect("manifest");
        std::fs::write(src.join("bin/demo"), "#!/bin/sh\n").expect("bin");

        let resolver = resolver(&dir, Arc::new(FakeFetcher::default()));
        let descriptor = SourceDescriptor::parse(&format!("local://{}", src.display())).expect("source");
        let bundle = resolver.resolve(&descriptor).await.expect("resolve");
        assert_eq!(bundle.manifest.name(), Some("demo"));
        assert!(bundle.root_dir.join("bin/demo").is_file());

        bundle.discard().await;
        assert!(staging_is_empty(&dir));
    }

    #[tokio::test]
    async fn missing_command_is_validation_error() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("demo");
        std::fs::create_dir_all(&src).expect("mkdir");
        std::fs::write(src.join(MANIFEST_FILE), "metadata:\n  name: demo\n").expect("manifest");

        let resolver = resolver(&dir, Arc::new(FakeFetcher::default()));
        let descriptor = SourceDescriptor::parse(&format!("local://{}", src.display())).expect("source");
        let err = resolver.resolve(&descriptor).await.expect_err("must fail");
        assert_eq!(err.kind(), "ValidationError");
        assert!(staging_is_empty(&dir));
    }

    #[tokio::test]
    async fn missing_manifest_is_invalid_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("demo");
        std::fs::create_dir_all(&src).expect("mkdir");
        std::fs::write(src.join("README"), "hi").expect("write");

        let resolver = resolver(&dir, Arc::new(FakeFetcher::default()));
        let descriptor = SourceDescriptor::parse(&format!("local://{}", src.display())).expect("source");
        let err = resolver.resolve(&descriptor).await.expect_err("must fail");
        assert!(matches!(
            err,
            PandemicError::Source(SourceError::InvalidManifest { .. })
        ));
    }

    #[tokio::test]
    async fn local_missing_path_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let resolver = resolver(&dir, Arc::new(FakeFetcher::default()));
        let descriptor = SourceDescriptor::parse("local:///nonexistent/pandemic/demo").expect("source");
        let err = resolver.resolve(&descriptor).await.expect_err("must fail");
        assert!(matches!(err, PandemicError::Source(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn github_archive_is_fetched_and_stripped() {
        let dir = TempDir::new().expect("tempdir");
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(
            "https://github.com/org/repo/archive/v1.0.0.tar.gz",
            fixtures::tar_gz(&[
                ("repo-1.0.0/infection.yaml", MANIFEST),
                ("repo-1.0.0/bin/demo", "#!/bin/sh\n"),
            ]),
        );
        let resolver = resolver(&dir, Arc::clone(&fetcher));
        let descriptor = SourceDescriptor::parse("github://org/repo@v1.0.0").expect("source");
        let bundle = resolver.resolve(&descriptor).await.expect("resolve");
        assert!(bundle.root_dir.ends_with("repo-1.0.0"));
        assert_eq!(fetcher.attempts(), 1);
    }

    #[tokio::test]
    async fn network_failure_exhausts_retries() {
        let dir = TempDir::new().expect("tempdir");
        let fetcher = Arc::new(FakeFetcher::failing());
        let resolver = resolver(&dir, Arc::clone(&fetcher));
        let descriptor = SourceDescriptor::parse("github://org/repo@v1.0.0").expect("source");

        let err = resolver.resolve(&descriptor).await.expect_err("must fail");
        match err {
            PandemicError::Source(SourceError::Network { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fetcher.attempts(), 3);
        assert!(staging_is_empty(&dir));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let dir = TempDir::new().expect("tempdir");
        let fetcher = Arc::new(FakeFetcher::default());
        let resolver = resolver(&dir, Arc::clone(&fetcher));
        let descriptor = SourceDescriptor::parse("https://example.com/missing.tar.gz").expect("source");
        let err = resolver.resolve(&descriptor).await.expect_err("must fail");
        assert!(matches!(err, PandemicError::Source(SourceError::NotFound(_))));
        assert_eq!(fetcher.attempts(), 1);
    }

    #[tokio::test]
    async fn http_zip_bundle() {
        let dir = TempDir::new().expect("tempdir");
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(
            "https://example.com/dl/demo.zip?token=x",
            fixtures::zip(&[("demo/infection.yaml", MANIFEST)]),
        );
        let resolver = resolver(&dir, Arc::clone(&fetcher));
        let descriptor = SourceDescriptor::parse("https://example.com/dl/demo.zip?token=x").expect("source");
        let bundle = resolver.resolve(&descriptor).await.expect("resolve");
        assert!(bundle.root_dir.ends_with("demo"));
    }

    #[test]
    fn allowlist_is_prefix_based() {
        let descriptor = SourceDescriptor::parse("github://acme/sensor@v2").expect("source");
        assert!(SourceResolver::check_allowed(&descriptor, &[]).is_ok());
        assert!(SourceResolver::check_allowed(&descriptor, &["github://acme/".to_string()]).is_ok());
        let err = SourceResolver::check_allowed(&descriptor, &["github://other/".to_string()])
            .expect_err("forbidden");
        assert!(matches!(err, PandemicError::Source(SourceError::Forbidden(_))));
    }

    #[test]
    fn file_name_from_url() {
        assert_eq!(url_file_name("https://h/a/b/agent.tgz?x=1"), "agent.tgz");
        assert_eq!(url_file_name("https://h/"), "bundle");
        assert_eq!(url_file_name("https://h"), "bundle");
    }
}
