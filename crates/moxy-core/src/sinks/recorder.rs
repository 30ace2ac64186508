//! Trace file recorder.
//!
//! One append-only file per session, named after the client's address. Each
//! PDU becomes a record: a separator line, a blank line, a JSON object
//! `{"NanoTime": <i64>, "DataB64": "<base64>"}`, then a blank line.
//!
//! The recorder handle is cheap to clone so that both directions of a session
//! can share one file; the session coordinator closes it exactly once.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SinkError;

use super::{PduObservation, PduSink};

/// Suffix appended to the sanitized peer address.
pub const TRACE_FILE_SUFFIX: &str = ".trace";

const RECORD_SEPARATOR: &[u8] = b"#########\n\n";
const RECORD_TERMINATOR: &[u8] = b"\n\n";

/// One persisted PDU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Wall-clock time in nanoseconds since the Unix epoch.
    #[serde(rename = "NanoTime")]
    pub nano_time: i64,
    /// Raw PDU bytes, standard base64 with padding.
    #[serde(rename = "DataB64")]
    pub data_b64: String,
}

impl TraceRecord {
    /// Record `data` with an explicit timestamp.
    #[must_use]
    pub fn new(nano_time: i64, data: &[u8]) -> Self {
        Self {
            nano_time,
            data_b64: STANDARD.encode(data),
        }
    }

    /// Record `data` stamped with the current wall-clock time.
    #[must_use]
    pub fn now(data: &[u8]) -> Self {
        let nano_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self::new(nano_time, data)
    }

    /// Decode the recorded PDU bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `data_b64` is not valid base64.
    pub fn data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data_b64)
    }

    /// Serialize with its separator and trailing blank line.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn to_trace_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        let mut out =
            Vec::with_capacity(RECORD_SEPARATOR.len() + json.len() + RECORD_TERMINATOR.len());
        out.extend_from_slice(RECORD_SEPARATOR);
        out.extend_from_slice(&json);
        out.extend_from_slice(RECORD_TERMINATOR);
        Ok(out)
    }
}

/// File name for a session's trace: the peer address with every character
/// outside `[A-Za-z0-9.]` replaced by `-`, plus [`TRACE_FILE_SUFFIX`].
#[must_use]
pub fn trace_file_name(peer: &SocketAddr) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9.]").expect("valid regex"));
    format!("{}{TRACE_FILE_SUFFIX}", re.replace_all(&peer.to_string(), "-"))
}

/// Append-only trace file shared by the pipelines of one session.
#[derive(Clone)]
pub struct TraceRecorder {
    path: Arc<PathBuf>,
    file: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl TraceRecorder {
    /// Open (or append to) the trace file for `peer` inside `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn create(directory: &Path, peer: &SocketAddr) -> Result<Self, SinkError> {
        Self::open(directory.join(trace_file_name(peer))).await
    }

    /// Open (or append to) the trace file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "trace file opened");

        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(Some(BufWriter::new(file)))),
        })
    }

    /// Path of the trace file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to the file.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails, or if the recorder has
    /// already been closed.
    pub async fn save(&self, record: &TraceRecord) -> Result<(), SinkError> {
        let bytes = record.to_trace_bytes()?;
        let mut guard = self.file.lock().await;
        let writer = guard.as_mut().ok_or_else(closed_error)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Flush and close the file. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub async fn close(&self) -> Result<(), SinkError> {
        let writer = self.file.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
            debug!(path = %self.path.display(), "trace file closed");
        }
        Ok(())
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.file.lock().await.is_none()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "trace file already closed")
}

#[async_trait]
impl PduSink for TraceRecorder {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn accept(&mut self, observation: &PduObservation<'_>) -> Result<(), SinkError> {
        self.save(&TraceRecord::now(observation.pdu.as_bytes())).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.file.lock().await.as_mut() {
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trace_file_name_ipv4() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(trace_file_name(&peer), "127.0.0.1-5000.trace");
    }

    #[test]
    fn test_trace_file_name_ipv6() {
        let peer: SocketAddr = "[::1]:6000".parse().unwrap();
        let name = trace_file_name(&peer);
        assert_eq!(name, "---1--6000.trace");
        assert!(!name.contains(':'));
    }

    #[test]
    fn test_record_json_field_names() {
        let record = TraceRecord::new(1_700_000_000_000_000_000, &[0xC0, 0x00]);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"NanoTime":1700000000000000000,"DataB64":"wAA="}"#);
    }

    #[test]
    fn test_record_trace_bytes_layout() {
        let record = TraceRecord::new(42, &[0xE0, 0x00]);
        let bytes = record.to_trace_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "#########\n\n{\"NanoTime\":42,\"DataB64\":\"4AA=\"}\n\n");
    }

    #[test]
    fn test_record_data_round_trip() {
        let raw = [0x30u8, 0x03, 0x00, 0x01, b'x'];
        let record = TraceRecord::now(&raw);
        assert!(record.nano_time > 0);
        assert_eq!(record.data().unwrap(), raw);
    }

    #[tokio::test]
    async fn test_recorder_appends_records() {
        let dir = TempDir::new().unwrap();
        let peer: SocketAddr = "10.0.0.7:40000".parse().unwrap();

        let recorder = TraceRecorder::create(dir.path(), &peer).await.unwrap();
        assert_eq!(recorder.path(), dir.path().join("10.0.0.7-40000.trace"));

        recorder.save(&TraceRecord::new(1, &[0xC0, 0x00])).await.unwrap();
        recorder.save(&TraceRecord::new(2, &[0xE0, 0x00])).await.unwrap();
        recorder.close().await.unwrap();

        let text = std::fs::read_to_string(recorder.path()).unwrap();
        assert_eq!(text.matches("#########").count(), 2);
        assert!(text.contains(r#""NanoTime":1"#));
        assert!(text.contains(r#""NanoTime":2"#));
    }

    #[tokio::test]
    async fn test_recorder_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.trace");

        let first = TraceRecorder::open(&path).await.unwrap();
        first.save(&TraceRecord::new(1, &[0xC0, 0x00])).await.unwrap();
        first.close().await.unwrap();

        let second = TraceRecorder::open(&path).await.unwrap();
        second.save(&TraceRecord::new(2, &[0xC0, 0x00])).await.unwrap();
        second.close().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("#########").count(), 2);
    }

    #[tokio::test]
    async fn test_recorder_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let recorder = TraceRecorder::open(dir.path().join("a.trace")).await.unwrap();
        let clone = recorder.clone();

        recorder.close().await.unwrap();
        assert!(clone.is_closed().await);
        clone.close().await.unwrap();

        let result = clone.save(&TraceRecord::new(1, &[0xC0, 0x00])).await;
        assert!(matches!(result, Err(SinkError::Io(_))));
    }

    #[tokio::test]
    async fn test_recorder_open_missing_directory() {
        let result = TraceRecorder::open("/nonexistent/dir/x.trace").await;
        assert!(matches!(result, Err(SinkError::Io(_))));
    }
}
