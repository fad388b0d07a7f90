//! HTTP fetch + export file utilities for the facility photo pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fpipe-storage";

#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    pub replaced: bool,
}

/// Writes final CSV/JSON exports exactly once per run, via temp file + rename.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Absolute paths are kept as given; relative ones resolve against the store root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    pub async fn write_bytes(
        &self,
        path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<ExportedFile> {
        let absolute_path = self.resolve(path);
        let parent = absolute_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let replaced = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking export path {}", absolute_path.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp export {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), bytes = bytes.len(), replaced, "export written");
        Ok(ExportedFile {
            sha256: Self::sha256_hex(bytes),
            path: absolute_path,
            byte_size: bytes.len(),
            replaced,
        })
    }

    pub async fn write_csv<I>(
        &self,
        path: impl AsRef<Path>,
        header: &[&str],
        rows: I,
    ) -> anyhow::Result<ExportedFile>
    where
        I: IntoIterator,
        I::Item: IntoIterator,
        <I::Item as IntoIterator>::Item: AsRef<[u8]>,
    {
        let bytes = encode_csv(header, rows)?;
        self.write_bytes(path, &bytes).await
    }

    pub async fn write_pretty_json<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> anyhow::Result<ExportedFile> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing json export")?;
        self.write_bytes(path, &bytes).await
    }
}

/// Header row once, then one row per record.
pub fn encode_csv<I>(header: &[&str], rows: I) -> anyhow::Result<Vec<u8>>
where
    I: IntoIterator,
    I::Item: IntoIterator,
    <I::Item as IntoIterator>::Item: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header).context("writing csv header")?;
    for row in rows {
        writer.write_record(row).context("writing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing csv buffer: {}", e.error()))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-attempt JSON fetcher; a failed request is reported, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", url, ?query);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn export_hashing_is_stable() {
        let hash = ExportStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_previous_export() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path());

        let first = store
            .write_bytes("out/photos.json", b"{}")
            .await
            .expect("first write");
        let second = store
            .write_bytes("out/photos.json", b"{\"a\": []}")
            .await
            .expect("second write");

        assert!(!first.replaced);
        assert!(second.replaced);
        assert_ne!(first.sha256, second.sha256);
        assert_eq!(
            std::fs::read_to_string(&second.path).expect("read back"),
            "{\"a\": []}"
        );

        let leftovers = std::fs::read_dir(dir.path().join("out"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn csv_encoding_writes_header_then_rows() {
        let rows = vec![
            vec!["AKRO".to_string(), "".to_string(), "Visitor Center, Main".to_string()],
            vec!["ANIA".to_string(), "3100".to_string(), "".to_string()],
        ];
        let bytes = encode_csv(&["Park", "Asset_Code", "Description"], rows).expect("csv");
        let text = String::from_utf8(bytes).expect("utf8");
        assert_eq!(
            text,
            "Park,Asset_Code,Description\nAKRO,,\"Visitor Center, Main\"\nANIA,3100,\n"
        );
    }

    #[tokio::test]
    async fn pretty_json_export_is_indented() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path());
        let value = serde_json::json!({"b": ["x.jpg"], "a": []});
        let written = store
            .write_pretty_json("photos.json", &value)
            .await
            .expect("json write");
        let text = std::fs::read_to_string(written.path).expect("read back");
        assert!(text.contains("\n  \"a\": []"));
    }
}
