//! Container Image Cache: resolves a container image reference to a local
//! `.sif` file path, pulling or downloading it once and caching by a
//! deterministic name thereafter.
//!
//! Grounded in `task_runner.apptainer_utils.ApptainerImagesManager`. The
//! fsspec-backed generic remote-storage filesystem from the source has no
//! equivalent crate in this stack; remote-storage lookups here go through
//! the same artifact store client used for task I/O (see DESIGN.md).

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};

use crate::artifact_store::ArtifactStoreClient;
use crate::types::{ContainerImageEntry, ImageSource};

const USER_STORAGE_PREFIX: &str = "inductiva://";

pub struct ImageCache {
    local_cache_dir: PathBuf,
    remote_storage_url: Option<String>,
}

impl ImageCache {
    pub fn new(local_cache_dir: PathBuf, remote_storage_url: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(&local_cache_dir).context("failed to create image cache dir")?;
        Ok(Self {
            local_cache_dir,
            remote_storage_url,
        })
    }

    /// Resolve `image` to a local file, downloading/pulling it if not
    /// already cached. Returns the local path, elapsed fetch time, source,
    /// and file size.
    pub async fn get(
        &self,
        image: &str,
        artifact_store: &ArtifactStoreClient,
    ) -> Result<ContainerImageEntry> {
        if let Some(path) = image.strip_prefix(USER_STORAGE_PREFIX) {
            return self.get_user_storage_image(path, artifact_store).await;
        }
        self.get_hub_image(image).await
    }

    async fn get_user_storage_image(
        &self,
        image_path: &str,
        artifact_store: &ArtifactStoreClient,
    ) -> Result<ContainerImageEntry> {
        let file_name = Path::new(image_path)
            .file_name()
            .context("user-storage image path has no file name")?
            .to_string_lossy();
        let sif_local_path = self.local_cache_dir.join(format!("inductiva_{file_name}"));

        if sif_local_path.exists() {
            return cached_entry(&sif_local_path, ImageSource::Local);
        }

        let started = Instant::now();
        artifact_store
            .download_file(image_path, &sif_local_path)
            .await
            .context("failed to download user-storage container image")?;
        let elapsed_s = started.elapsed().as_secs_f64();
        sized_entry(&sif_local_path, ImageSource::UserStorage, elapsed_s)
    }

    async fn get_hub_image(&self, image: &str) -> Result<ContainerImageEntry> {
        let image_uri = normalize_image_uri(image);
        let sif_local_path = self.local_cache_dir.join(image_uri_to_sif_name(&image_uri));

        if sif_local_path.exists() {
            return cached_entry(&sif_local_path, ImageSource::Local);
        }

        let started = Instant::now();

        let source = if self.try_remote_storage(&image_uri, &sif_local_path).await? {
            ImageSource::Cache
        } else {
            apptainer_pull(&image_uri, &sif_local_path).await?;
            ImageSource::Hub
        };

        if !sif_local_path.exists() {
            bail!("image not found after fetch attempt: {image}");
        }

        let elapsed_s = started.elapsed().as_secs_f64();
        sized_entry(&sif_local_path, source, elapsed_s)
    }

    /// Mirrors `_get_from_remote_storage`: a plain existence+copy check
    /// against the configured remote storage directory.
    async fn try_remote_storage(&self, image_uri: &str, sif_local_path: &Path) -> Result<bool> {
        let Some(remote_storage_url) = &self.remote_storage_url else {
            return Ok(false);
        };
        let Some((_, remote_dir)) = remote_storage_url.split_once("://") else {
            return Ok(false);
        };
        let remote_path = Path::new(remote_dir).join(image_uri_to_sif_name(image_uri));
        if !remote_path.exists() {
            return Ok(false);
        }
        tokio::fs::copy(&remote_path, sif_local_path).await?;
        Ok(true)
    }
}

fn cached_entry(path: &Path, source: ImageSource) -> Result<ContainerImageEntry> {
    sized_entry(path, source, 0.0)
}

fn sized_entry(path: &Path, source: ImageSource, elapsed_s: f64) -> Result<ContainerImageEntry> {
    let size_bytes = std::fs::metadata(path)?.len();
    Ok(ContainerImageEntry {
        local_path: path.to_path_buf(),
        size_bytes,
        source,
        elapsed_s,
    })
}

/// Defaults a bare image name (no `scheme://`) to `docker://`.
fn normalize_image_uri(image_uri: &str) -> String {
    if image_uri.contains("://") {
        image_uri.to_string()
    } else {
        format!("docker://{image_uri}")
    }
}

/// `docker://inductiva/kutu:openfoam-foundation_v8_dev` ->
/// `docker_inductiva_kutu_openfoam-foundation_v8_dev.sif`
fn image_uri_to_sif_name(image_uri: &str) -> String {
    let mut name = String::with_capacity(image_uri.len() + 4);
    let mut chars = image_uri.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&'/') {
            chars.next(); // consume first '/'
            if chars.peek() == Some(&'/') {
                chars.next(); // consume second '/'
            }
            name.push('_');
        } else if c == ':' || c == '/' {
            name.push('_');
        } else {
            name.push(c);
        }
    }
    name.push_str(".sif");
    name
}

async fn apptainer_pull(image_uri: &str, sif_local_path: &Path) -> Result<()> {
    let mut command = tokio::process::Command::new("apptainer");
    command.args(["pull", &sif_local_path.display().to_string(), image_uri]);

    if let (Ok(host), Ok(port)) = (
        std::env::var("SOCKS_PROXY_HOST"),
        std::env::var("SOCKS_PROXY_PORT"),
    ) {
        let proxy_url = format!("socks5://{host}:{port}");
        command.env("HTTP_PROXY", &proxy_url);
        command.env("HTTPS_PROXY", &proxy_url);
    }

    let status = command
        .status()
        .await
        .context("apptainer command not available")?;
    if !status.success() {
        bail!("failed to pull image: {image_uri}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_image_name_to_docker_scheme() {
        assert_eq!(normalize_image_uri("ubuntu:22.04"), "docker://ubuntu:22.04");
        assert_eq!(
            normalize_image_uri("library://ubuntu:22.04"),
            "library://ubuntu:22.04"
        );
    }

    #[test]
    fn converts_image_uri_to_sif_name() {
        assert_eq!(
            image_uri_to_sif_name("docker://inductiva/kutu:openfoam-foundation_v8_dev"),
            "docker_inductiva_kutu_openfoam-foundation_v8_dev.sif"
        );
    }

    #[tokio::test]
    async fn returns_cached_entry_without_fetching() {
        let cache_dir = tempfile::tempdir().unwrap();
        let sif_name = image_uri_to_sif_name("docker://ubuntu:22.04");
        std::fs::write(cache_dir.path().join(&sif_name), b"fake sif contents").unwrap();

        let cache = ImageCache::new(cache_dir.path().to_path_buf(), None).unwrap();
        let entry = cache.get_hub_image("ubuntu:22.04").await.unwrap();
        assert_eq!(entry.source, ImageSource::Local);
        assert_eq!(entry.size_bytes, "fake sif contents".len() as u64);
    }
}
