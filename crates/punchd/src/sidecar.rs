//! Detector/embedder sidecar process.
//!
//! Requests are one JSON header line followed by `len` raw grayscale bytes;
//! every request gets exactly one JSON line back. Each call, write included,
//! is bounded by a timeout; a child that misses it is killed and respawned on
//! the next call. Pipe I/O runs on a writer and a reader thread so a child
//! that stops reading cannot block the caller.

use punch_core::analysis::crop_gray;
use punch_core::{AttributeAnalyzer, BoundingBox, Detection, EmbedderError, FaceAttributes, FaceEmbedder};
use serde::Deserialize;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("no sidecar command configured")]
    NotConfigured,
    #[error("failed to spawn sidecar {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("sidecar pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar did not answer within {0:?}")]
    Timeout(Duration),
    #[error("sidecar exited")]
    Exited,
    #[error("unparseable sidecar response: {0}")]
    Protocol(String),
    #[error("sidecar reported: {0}")]
    Remote(String),
}

impl From<SidecarError> for EmbedderError {
    fn from(e: SidecarError) -> Self {
        match e {
            SidecarError::Timeout(d) => EmbedderError::Timeout(d),
            SidecarError::NotConfigured | SidecarError::Spawn { .. } => {
                EmbedderError::Unavailable(e.to_string())
            }
            SidecarError::Protocol(msg) => EmbedderError::Malformed(msg),
            other => EmbedderError::Failed(other.to_string()),
        }
    }
}

struct Running {
    child: Child,
    /// Encoded requests for the writer thread.
    requests: Sender<Vec<u8>>,
    /// Response lines from the reader thread, or the pipe error that ended
    /// either thread.
    replies: Receiver<std::io::Result<String>>,
}

impl Running {
    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct SidecarEmbedder {
    command: Vec<String>,
    timeout: Duration,
    want_age: bool,
    want_emotion: bool,
    process: Mutex<Option<Running>>,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<Detection>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct AttributeResponse {
    #[serde(flatten)]
    attributes: FaceAttributes,
    error: Option<String>,
}

impl SidecarEmbedder {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            want_age: false,
            want_emotion: false,
            process: Mutex::new(None),
        }
    }

    /// Which attributes `analyze` asks the sidecar for.
    pub fn with_attributes(mut self, age: bool, emotion: bool) -> Self {
        self.want_age = age;
        self.want_emotion = emotion;
        self
    }

    fn spawn(&self) -> Result<Running, SidecarError> {
        let (program, args) = self.command.split_first().ok_or(SidecarError::NotConfigured)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SidecarError::Spawn {
                command: program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(SidecarError::Exited);
        };

        let (reply_tx, replies) = mpsc::channel();
        let (requests, request_rx) = mpsc::channel::<Vec<u8>>();

        let writer_tx = reply_tx.clone();
        let writer = std::thread::Builder::new()
            .name("punch-sidecar-writer".into())
            .spawn(move || {
                let mut stdin = stdin;
                for request in request_rx {
                    if let Err(e) = stdin.write_all(&request).and_then(|_| stdin.flush()) {
                        let _ = writer_tx.send(Err(e));
                        break;
                    }
                }
            });
        let reader = writer.and_then(|_| {
            std::thread::Builder::new()
                .name("punch-sidecar-reader".into())
                .spawn(move || {
                    for line in BufReader::new(stdout).lines() {
                        let failed = line.is_err();
                        if reply_tx.send(line).is_err() || failed {
                            return;
                        }
                    }
                    let _ = reply_tx.send(Err(ErrorKind::UnexpectedEof.into()));
                })
        });
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SidecarError::Io(e));
        }

        tracing::info!(command = %program, pid = child.id(), "sidecar spawned");
        Ok(Running {
            child,
            requests,
            replies,
        })
    }

    /// Send one request and wait for its response line.
    fn call(&self, header: serde_json::Value, payload: &[u8]) -> Result<String, SidecarError> {
        let mut guard = self.process.lock().unwrap_or_else(|p| p.into_inner());
        let mut running = match guard.take() {
            Some(r) => r,
            None => self.spawn()?,
        };

        let mut request = format!("{header}\n").into_bytes();
        request.extend_from_slice(payload);
        if running.requests.send(request).is_err() {
            running.kill();
            return Err(SidecarError::Exited);
        }

        match running.replies.recv_timeout(self.timeout) {
            Ok(Ok(line)) => {
                *guard = Some(running);
                Ok(line)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                running.kill();
                Err(SidecarError::Exited)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sidecar pipe failed, dropping process");
                running.kill();
                Err(SidecarError::Io(e))
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "sidecar timed out, killing");
                running.kill();
                Err(SidecarError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                running.kill();
                Err(SidecarError::Exited)
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(running) = self.process.lock().unwrap_or_else(|p| p.into_inner()).take() {
            running.kill();
        }
    }
}

impl Drop for SidecarEmbedder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_frame(frame: &[u8], width: u32, height: u32) -> Result<usize, EmbedderError> {
    let expected = width as usize * height as usize;
    if frame.len() < expected {
        return Err(EmbedderError::InvalidFrame {
            expected,
            actual: frame.len(),
        });
    }
    Ok(expected)
}

fn parse_detect(line: &str) -> Result<Vec<Detection>, SidecarError> {
    let resp: DetectResponse =
        serde_json::from_str(line).map_err(|e| SidecarError::Protocol(e.to_string()))?;
    match resp.error {
        Some(err) => Err(SidecarError::Remote(err)),
        None => Ok(resp.faces),
    }
}

fn parse_attributes(line: &str) -> Result<FaceAttributes, SidecarError> {
    let resp: AttributeResponse =
        serde_json::from_str(line).map_err(|e| SidecarError::Protocol(e.to_string()))?;
    match resp.error {
        Some(err) => Err(SidecarError::Remote(err)),
        None => Ok(resp.attributes),
    }
}

impl FaceEmbedder for SidecarEmbedder {
    fn detect_and_embed(
        &self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, EmbedderError> {
        let len = check_frame(frame, width, height)?;
        let header = serde_json::json!({
            "op": "detect",
            "width": width,
            "height": height,
            "len": len,
        });
        let line = self.call(header, &frame[..len])?;
        Ok(parse_detect(&line)?)
    }
}

impl AttributeAnalyzer for SidecarEmbedder {
    fn analyze(
        &self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<FaceAttributes, EmbedderError> {
        check_frame(frame, width, height)?;
        if !self.want_age && !self.want_emotion {
            return Ok(FaceAttributes::default());
        }
        let Some((crop, cw, ch)) = crop_gray(frame, width, height, face) else {
            return Ok(FaceAttributes::default());
        };
        let header = serde_json::json!({
            "op": "attributes",
            "width": cw,
            "height": ch,
            "len": crop.len(),
            "age": self.want_age,
            "emotion": self.want_emotion,
        });
        let line = self.call(header, &crop)?;
        Ok(parse_attributes(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> SidecarEmbedder {
        SidecarEmbedder::new(vec!["sh".into(), "-c".into(), script.into()], timeout)
    }

    #[test]
    fn test_parse_detect_response() {
        let faces = parse_detect(
            r#"{"faces":[{"box":{"x":1,"y":2,"width":3,"height":4,"confidence":0.9},"embedding":[0.1,0.2]}]}"#,
        )
        .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox.width, 3.0);
        assert_eq!(faces[0].embedding.values, vec![0.1, 0.2]);
        assert!(parse_detect(r#"{"faces":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_error_response() {
        assert!(matches!(parse_detect(r#"{"error":"model missing"}"#), Err(SidecarError::Remote(_))));
        assert!(matches!(parse_detect("not json"), Err(SidecarError::Protocol(_))));
    }

    #[test]
    fn test_parse_attributes_response() {
        let a = parse_attributes(r#"{"age":31,"emotion":"happy"}"#).unwrap();
        assert_eq!(a.age, Some(31));
        assert_eq!(a.emotion.as_deref(), Some("happy"));
        assert!(parse_attributes("{}").unwrap().is_empty());
    }

    #[test]
    fn test_detect_round_trip_through_process() {
        let embedder = sh(
            r#"read header; head -c 4 > /dev/null; echo '{"faces":[{"box":{"x":0,"y":0,"width":2,"height":2},"embedding":[1.0]}]}'; sleep 1"#,
            Duration::from_secs(5),
        );
        let faces = embedder.detect_and_embed(&[0u8; 4], 2, 2).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding.values, vec![1.0]);
    }

    #[test]
    fn test_timeout_kills_child() {
        let embedder = sh("sleep 30", Duration::from_millis(100));
        let err = embedder.detect_and_embed(&[0u8; 4], 2, 2).unwrap_err();
        assert!(matches!(err, EmbedderError::Timeout(_)));
        assert!(embedder.process.lock().unwrap().is_none());
    }

    #[test]
    fn test_child_that_stops_reading_times_out() {
        let embedder = sh(
            r#"read header; head -c 4 > /dev/null; echo '{"faces":[]}'; sleep 30"#,
            Duration::from_millis(200),
        );
        assert!(embedder.detect_and_embed(&[0u8; 4], 2, 2).unwrap().is_empty());

        // far larger than a pipe buffer, and nobody reads it
        let frame = vec![0u8; 1024 * 1024];
        let started = std::time::Instant::now();
        let err = embedder.detect_and_embed(&frame, 1024, 1024).unwrap_err();
        assert!(matches!(err, EmbedderError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(embedder.process.lock().unwrap().is_none());
    }

    #[test]
    fn test_exited_child_is_reported() {
        let embedder = sh("exit 0", Duration::from_secs(2));
        let err = embedder.detect_and_embed(&[0u8; 4], 2, 2).unwrap_err();
        assert!(matches!(err, EmbedderError::Failed(_)));
        assert!(embedder.process.lock().unwrap().is_none());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let embedder = SidecarEmbedder::new(
            vec!["/nonexistent/punch-embedder".into()],
            Duration::from_millis(100),
        );
        let err = embedder.detect_and_embed(&[0u8; 4], 2, 2).unwrap_err();
        assert!(matches!(err, EmbedderError::Unavailable(_)));
    }

    #[test]
    fn test_short_frame_rejected() {
        let embedder = SidecarEmbedder::new(vec![], Duration::from_millis(100));
        let err = embedder.detect_and_embed(&[0u8; 3], 2, 2).unwrap_err();
        assert!(matches!(err, EmbedderError::InvalidFrame { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_attributes_disabled_skips_process() {
        let embedder = SidecarEmbedder::new(vec![], Duration::from_millis(100));
        let face = BoundingBox { x: 0.0, y: 0.0, width: 2.0, height: 2.0, confidence: 1.0 };
        let attrs = embedder.analyze(&[0u8; 4], 2, 2, &face).unwrap();
        assert!(attrs.is_empty());
    }
}
