//! Artifact Store Client: moves task input/output archives and arbitrary
//! storage files over signed URLs obtained from the API.
//!
//! Grounded in `task_runner.file_manager.WebApiFileManager` and
//! `task_runner.utils.files` (the ZIP_64 streaming writer). The zip crate
//! requires a seekable sink to patch local-file-header sizes after writing,
//! so unlike the Python generator that streams compressed bytes straight
//! into the HTTP request body, archives here are built into an anonymous,
//! already-unlinked temp file (`tempfile::tempfile`) and then streamed from
//! that file to the request -- resident memory is still bounded by the
//! compression buffer, not the archive size, and there is no path on disk
//! to clean up since the file is never linked into a directory.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::api_client::ApiClient;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
const COMPRESSION_LEVEL: i64 = 1;

pub struct ArtifactStoreClient {
    http: reqwest::Client,
    api: std::sync::Arc<ApiClient>,
}

impl ArtifactStoreClient {
    pub fn new(api: std::sync::Arc<ApiClient>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build artifact store HTTP client")?;
        Ok(Self { http, api })
    }

    /// Download the task's input archive and extract it into `dest_dir`.
    /// Returns `(zipped_bytes, uncompressed_bytes, uncompress_time_s)`: the
    /// on-wire byte count and the size/timing of the extraction step, for
    /// the `input_zipped_bytes`/`input_size_bytes`/`uncompress_input_s`
    /// metrics.
    pub async fn download_input(&self, task_id: &str, dest_dir: &Path) -> Result<(u64, u64, f64)> {
        let url = self
            .api
            .get_download_input_url(task_id)
            .await
            .context("failed to get download-input URL")?;
        let zip_path = dest_dir.join("input.zip");
        let zipped_bytes = self.stream_url_to_file(&url, &zip_path).await?;

        let zip_path_owned = zip_path.clone();
        let dest_dir_owned = dest_dir.to_path_buf();
        let uncompress_started = std::time::Instant::now();
        tokio::task::spawn_blocking(move || extract_zip_archive(&zip_path_owned, &dest_dir_owned))
            .await
            .context("input extraction task panicked")??;
        let uncompress_input_s = uncompress_started.elapsed().as_secs_f64();

        tokio::fs::remove_file(&zip_path)
            .await
            .context("failed to remove extracted input archive")?;
        let uncompressed_bytes = dir_size_bytes(dest_dir);
        Ok((zipped_bytes, uncompressed_bytes, uncompress_input_s))
    }

    /// Download a single file referenced by a storage path (used for
    /// `inductiva://`-prefixed container images).
    pub async fn download_file(&self, remote_path: &str, dest_path: &Path) -> Result<()> {
        let url = self
            .api
            .get_storage_download_url(remote_path)
            .await
            .context("failed to get storage download URL")?;
        self.stream_url_to_file(&url, dest_path).await?;
        Ok(())
    }

    /// Zip `local_dir` and upload it as the task's output archive. Returns
    /// `(uncompressed_bytes, compressed_bytes, total_files, compress_output_s)`.
    pub async fn upload_output(
        &self,
        task_id: &str,
        local_dir: &Path,
    ) -> Result<(u64, u64, u64, f64)> {
        let upload_info = self
            .api
            .get_upload_output_url(task_id)
            .await
            .context("failed to get upload-output URL")?;

        let local_dir_owned = local_dir.to_path_buf();
        let compress_started = std::time::Instant::now();
        let (temp_file, uncompressed_bytes, total_files) =
            tokio::task::spawn_blocking(move || zip_directory_to_temp_file(&local_dir_owned))
                .await
                .context("output archiving task panicked")??;
        let compress_output_s = compress_started.elapsed().as_secs_f64();

        let compressed_bytes = temp_file
            .metadata()
            .context("failed to stat temp archive")?
            .len();

        let method = reqwest::Method::from_bytes(upload_info.method.as_bytes())
            .context("upload URL specified an invalid HTTP method")?;

        let policy = crate::retry::RetryPolicy::bounded(std::time::Duration::from_secs(2), 5)
            .with_backoff(2.0);
        crate::retry::retry(
            policy,
            || self.try_upload_output(method.clone(), &upload_info.url, &temp_file),
            |attempt, err| {
                tracing::warn!(attempt, %err, "retrying artifact upload");
            },
        )
        .await
        .context("output upload request failed")?;

        Ok((uncompressed_bytes, compressed_bytes, total_files, compress_output_s))
    }

    async fn try_upload_output(&self, method: reqwest::Method, url: &str, temp_file: &File) -> Result<()> {
        use tokio::io::AsyncSeekExt;
        let cloned = temp_file.try_clone().context("failed to clone temp archive handle")?;
        let mut cloned = tokio::fs::File::from_std(cloned);
        cloned
            .seek(std::io::SeekFrom::Start(0))
            .await
            .context("failed to rewind temp archive")?;
        let stream = tokio_util::io::ReaderStream::new(cloned);
        let body = reqwest::Body::wrap_stream(stream);

        let resp = self
            .http
            .request(method, url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }

    async fn stream_url_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let policy = crate::retry::RetryPolicy::bounded(std::time::Duration::from_secs(2), 5)
            .with_backoff(2.0);
        let total = crate::retry::retry(
            policy,
            || self.try_stream_url_to_file(url, dest),
            |attempt, err| {
                tracing::warn!(attempt, %err, "retrying artifact download");
            },
        )
        .await?;

        Ok(total)
    }

    async fn try_stream_url_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let mut stream = resp.bytes_stream();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut total = 0u64;
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(total)
    }
}

/// Extract every entry of `zip_path` into `dest_dir`, rejecting paths that
/// would escape it (`enclosed_name` already guards against `..` components
/// and absolute paths).
fn extract_zip_archive(zip_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("malformed input archive")?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(enclosed) = entry.enclosed_name() else {
            bail!("archive entry has an unsafe path: {}", entry.name());
        };
        let out_path = dest_dir.join(enclosed);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out_path)
            .with_context(|| format!("creating {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out_file)?;
    }
    Ok(())
}

/// Walk `root` in deterministic order and write every regular file into a
/// new ZIP_64 archive backed by an anonymous temp file. Returns the file
/// handle (rewound to the start), the sum of uncompressed file sizes, and
/// the file count.
fn zip_directory_to_temp_file(root: &Path) -> Result<(File, u64, u64)> {
    let mut temp_file = tempfile::tempfile().context("failed to create temp archive file")?;
    let mut uncompressed_bytes = 0u64;
    let mut total_files = 0u64;

    {
        let mut writer = zip::ZipWriter::new(&mut temp_file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(COMPRESSION_LEVEL))
            .large_file(true)
            .unix_permissions(0o600);

        let mut entries: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));

        for entry in entries {
            let rel = entry
                .path()
                .strip_prefix(root)
                .context("walked entry outside of archive root")?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let name = rel.to_string_lossy().replace('\\', "/");

            if entry.file_type().is_dir() {
                let dir_options = options.clone().unix_permissions(0o700);
                writer.add_directory(format!("{name}/"), dir_options)?;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            writer.start_file(&name, options)?;
            let mut src = File::open(entry.path())
                .with_context(|| format!("opening {}", entry.path().display()))?;
            let mut buf = [0u8; 65536];
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n])?;
                uncompressed_bytes += n as u64;
            }
            total_files += 1;
        }

        writer.finish().context("failed to finalize output archive")?;
    }

    temp_file.seek(std::io::SeekFrom::Start(0))?;
    Ok((temp_file, uncompressed_bytes, total_files))
}

/// Number of regular files under `root`, used for the `output_total_files`
/// metric independently of the archive (e.g. when upload is skipped).
pub fn count_files(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

/// Total size in bytes of every regular file under `root`.
pub fn dir_size_bytes(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zips_and_extracts_round_trip_a_small_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let (file, uncompressed, files) = zip_directory_to_temp_file(src.path()).unwrap();
        assert_eq!(uncompressed, 10);
        assert_eq!(files, 2);

        let dest = tempfile::tempdir().unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        archive.extract(dest.path()).unwrap();

        assert_eq!(std::fs::read_to_string(dest.path().join("a.txt")).unwrap(), "hello");
        assert_eq!(
            std::fs::read_to_string(dest.path().join("sub/b.txt")).unwrap(),
            "world"
        );
    }

    #[test]
    fn counts_and_sizes_files_under_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one"), b"1234").unwrap();
        std::fs::write(dir.path().join("two"), b"12").unwrap();

        assert_eq!(count_files(dir.path()), 2);
        assert_eq!(dir_size_bytes(dir.path()), 6);
    }
}
