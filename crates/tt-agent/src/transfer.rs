//! Receiving side of file transfer
//!
//! Every step answers with one terminated reply: `OK`, `ERROR <reason>`, or
//! for downloads `DATA <hex>`.

use std::path::PathBuf;

use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use tt_protocol::constants::{DATA_PREFIX, REPLY_ERROR, REPLY_OK};
use tt_protocol::{decode_payload, encode_payload, terminate, ProtocolError};

#[derive(Debug, Error)]
enum StepError {
    #[error("no upload in progress")]
    NoUpload,

    #[error("{path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Payload(#[from] ProtocolError),
}

fn reply(result: Result<(), StepError>) -> String {
    match result {
        Ok(()) => terminate(REPLY_OK),
        Err(e) => {
            tracing::warn!("Transfer step failed: {}", e);
            terminate(&format!("{} {}", REPLY_ERROR, e))
        }
    }
}

/// The upload currently being received, if any
#[derive(Default)]
pub struct UploadState {
    current: Option<(PathBuf, File)>,
}

impl UploadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// `START_UPLOAD`: create or truncate the target, making parent dirs
    pub async fn start(&mut self, path: &str) -> String {
        if let Some((previous, _)) = self.current.take() {
            tracing::warn!("Abandoning unfinished upload to {:?}", previous);
        }
        reply(self.open(PathBuf::from(path)).await)
    }

    async fn open(&mut self, path: PathBuf) -> Result<(), StepError> {
        let file_err = |source| StepError::File {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(file_err)?;
        }
        let file = File::create(&path).await.map_err(file_err)?;
        tracing::info!("Receiving upload into {:?}", path);
        self.current = Some((path, file));
        Ok(())
    }

    /// `UPLOAD_CHUNK`: decode and append
    pub async fn chunk(&mut self, payload: &str) -> String {
        reply(self.append(payload).await)
    }

    async fn append(&mut self, payload: &str) -> Result<(), StepError> {
        let (path, file) = self.current.as_mut().ok_or(StepError::NoUpload)?;
        let data = decode_payload(payload)?;
        file.write_all(&data).await.map_err(|source| StepError::File {
            path: path.clone(),
            source,
        })?;
        tracing::trace!("Appended {} bytes to {:?}", data.len(), path);
        Ok(())
    }

    /// `END_UPLOAD`: flush and close
    pub async fn finish(&mut self) -> String {
        reply(self.close().await)
    }

    async fn close(&mut self) -> Result<(), StepError> {
        let (path, mut file) = self.current.take().ok_or(StepError::NoUpload)?;
        file.flush()
            .await
            .and(file.sync_all().await)
            .map_err(|source| StepError::File {
                path: path.clone(),
                source,
            })?;
        tracing::info!("Upload to {:?} complete", path);
        Ok(())
    }
}

/// `DOWNLOAD`: the whole file as `DATA <hex>`
pub async fn download(path: &str) -> String {
    let result = async {
        let data = fs::read(path).await.map_err(|source| StepError::File {
            path: PathBuf::from(path),
            source,
        })?;
        tracing::info!("Sending {} ({} bytes)", path, data.len());
        Ok::<_, StepError>(encode_payload(&data)?)
    }
    .await;

    match result {
        Ok(hex) => terminate(&format!("{}{}", DATA_PREFIX, hex)),
        Err(e) => reply(Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use tt_protocol::strip_terminator;

    use super::*;

    #[tokio::test]
    async fn test_upload_creates_parents_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/file.bin");
        let target_str = target.to_str().unwrap();
        let mut uploads = UploadState::new();

        assert_eq!(strip_terminator(&uploads.start(target_str).await), "OK");
        assert!(uploads.in_progress());
        let first = encode_payload(b"hello ").unwrap();
        let second = encode_payload(b"world").unwrap();
        assert_eq!(strip_terminator(&uploads.chunk(&first).await), "OK");
        assert_eq!(strip_terminator(&uploads.chunk(&second).await), "OK");
        assert_eq!(strip_terminator(&uploads.finish().await), "OK");
        assert!(!uploads.in_progress());

        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_start_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.txt");
        std::fs::write(&target, "old contents that are long").unwrap();

        let mut uploads = UploadState::new();
        uploads.start(target.to_str().unwrap()).await;
        uploads.chunk(&encode_payload(b"new").unwrap()).await;
        uploads.finish().await;
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_chunk_without_upload() {
        let mut uploads = UploadState::new();
        let response = uploads.chunk(&encode_payload(b"x").unwrap()).await;
        assert!(response.ends_with(tt_protocol::END_OF_OUTPUT));
        assert_eq!(strip_terminator(&response), "ERROR no upload in progress");
        assert!(strip_terminator(&uploads.finish().await).starts_with("ERROR"));
    }

    #[tokio::test]
    async fn test_bad_chunk_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploads = UploadState::new();
        uploads
            .start(dir.path().join("f").to_str().unwrap())
            .await;
        assert!(strip_terminator(&uploads.chunk("zz").await).starts_with("ERROR"));
        // The upload is still open for the next chunk
        assert!(uploads.in_progress());
    }

    #[tokio::test]
    async fn test_download() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.txt");
        std::fs::write(&source, "quarterly numbers").unwrap();

        let response = download(source.to_str().unwrap()).await;
        let body = strip_terminator(&response);
        let hex = body.strip_prefix(DATA_PREFIX).unwrap();
        assert_eq!(decode_payload(hex).unwrap(), b"quarterly numbers");

        let missing = download(dir.path().join("missing").to_str().unwrap()).await;
        assert!(strip_terminator(&missing).starts_with("ERROR"));
    }
}
