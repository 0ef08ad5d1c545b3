//! Streaming image download into a temporary file.

use futures::StreamExt;
use reqwest::Url;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const COPY_CHUNK: usize = 1 << 20;

/// Where a base image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImageSource {
    Http(Url),
    Local(PathBuf),
}

impl ImageSource {
    pub(crate) fn parse(source: &str) -> ScratchResult<Self> {
        if source.starts_with('/') {
            return Ok(ImageSource::Local(PathBuf::from(source)));
        }
        let url = Url::parse(source)
            .map_err(|e| ScratchError::Fetch(format!("invalid image URL '{}': {}", source, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(ImageSource::Http(url)),
            "file" => url
                .to_file_path()
                .map(ImageSource::Local)
                .map_err(|_| ScratchError::Fetch(format!("invalid file URL '{}'", source))),
            other => Err(ScratchError::Fetch(format!(
                "unsupported image URL scheme '{}'",
                other
            ))),
        }
    }

    /// Last path segment, used to keep cache file names recognisable.
    pub(crate) fn file_name(&self) -> String {
        let raw = match self {
            ImageSource::Http(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .unwrap_or_default(),
            ImageSource::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let cleaned: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            "image".to_string()
        } else {
            cleaned
        }
    }
}

/// A finished download that has not been moved into the cache yet.
pub(crate) struct Download {
    pub temp: NamedTempFile,
    pub sha256: String,
    pub bytes: u64,
}

impl Download {
    /// Enforce the non-empty and checksum invariants.
    pub(crate) fn verify(&self, source: &str, expected_sha256: Option<&str>) -> ScratchResult<()> {
        if self.bytes == 0 {
            return Err(ScratchError::Fetch(format!(
                "image from {} is empty",
                source
            )));
        }
        if let Some(expected) = expected_sha256
            && !expected.eq_ignore_ascii_case(&self.sha256)
        {
            return Err(ScratchError::Fetch(format!(
                "checksum mismatch for {}: expected {}, got {}",
                source, expected, self.sha256
            )));
        }
        Ok(())
    }
}

pub(crate) async fn download(
    client: &reqwest::Client,
    source: &ImageSource,
    temp_dir: &Path,
) -> ScratchResult<Download> {
    let temp = NamedTempFile::new_in(temp_dir).map_err(|e| {
        ScratchError::Storage(format!(
            "Failed to create temp file in {}: {}",
            temp_dir.display(),
            e
        ))
    })?;
    let mut out = tokio::fs::File::from_std(temp.reopen()?);
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;

    match source {
        ImageSource::Http(url) => {
            let response = client
                .get(url.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| ScratchError::Fetch(format!("GET {} failed: {}", url, e)))?;

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk
                    .map_err(|e| ScratchError::Fetch(format!("reading {} failed: {}", url, e)))?;
                hasher.update(&chunk);
                out.write_all(&chunk).await?;
                bytes += chunk.len() as u64;
            }
        }
        ImageSource::Local(path) => {
            let mut input = tokio::fs::File::open(path).await.map_err(|e| {
                ScratchError::Fetch(format!("cannot read {}: {}", path.display(), e))
            })?;
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = input.read(&mut buf).await.map_err(|e| {
                    ScratchError::Fetch(format!("reading {} failed: {}", path.display(), e))
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n]).await?;
                bytes += n as u64;
            }
        }
    }

    out.flush().await?;
    out.sync_all().await?;

    Ok(Download {
        temp,
        sha256: hex::encode(hasher.finalize()),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            ImageSource::parse("/srv/base.img").unwrap(),
            ImageSource::Local(PathBuf::from("/srv/base.img"))
        );
        assert_eq!(
            ImageSource::parse("file:///srv/base.img").unwrap(),
            ImageSource::Local(PathBuf::from("/srv/base.img"))
        );
        assert!(matches!(
            ImageSource::parse("https://example.com/a/jammy.img").unwrap(),
            ImageSource::Http(_)
        ));
        assert_eq!(
            ImageSource::parse("ftp://example.com/x").unwrap_err().kind(),
            "FetchError"
        );
    }

    #[test]
    fn test_file_name_is_sanitized() {
        let source = ImageSource::parse("https://example.com/images/jammy%20server.img").unwrap();
        assert_eq!(source.file_name(), "jammy_20server.img");
        let source = ImageSource::parse("https://example.com/").unwrap();
        assert_eq!(source.file_name(), "image");
    }
}
