//! Serial console monitor.
//!
//! Connects to the unix socket a VM exposes its first serial port on and
//! accumulates everything it prints until a termination signature shows up
//! or the wall-clock budget runs out.

use std::borrow::Cow;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use crate::error::{Error, Result};

/// Default per-iteration wait for the socket to become readable
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 1024;

/// Delay between connection attempts while the VM has not created the socket yet
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bytes read from a console, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript(Vec<u8>);

impl Transcript {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        find(&self.0, needle.as_bytes())
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<Vec<u8>> for Transcript {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Incremental signature search over a growing buffer.
///
/// After a miss the next search starts `signature.len()` bytes before the
/// end, so a signature split across reads is still found without rescanning
/// everything read so far.
#[derive(Debug)]
pub struct SignatureScanner<'a> {
    signature: &'a [u8],
    scan_from: usize,
}

impl<'a> SignatureScanner<'a> {
    pub fn new(signature: &'a [u8]) -> Self {
        Self {
            signature,
            scan_from: 0,
        }
    }

    /// Search the unscanned tail of `transcript`. `transcript` must only grow
    /// between calls.
    pub fn scan(&mut self, transcript: &[u8]) -> bool {
        let start = self.scan_from.min(transcript.len());
        if find(&transcript[start..], self.signature) {
            return true;
        }
        self.scan_from = transcript.len().saturating_sub(self.signature.len());
        false
    }

    #[cfg(test)]
    fn scan_from(&self) -> usize {
        self.scan_from
    }
}

/// Read from the console at `path` until `signature` appears.
///
/// Waits at most `poll_interval` at a time for data, drains whatever is
/// available without blocking, and gives up with [`Error::ReadTimeout`] once
/// `timeout` has elapsed. The error carries everything read so far.
pub async fn read_until(
    path: &Path,
    signature: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Transcript> {
    let mut transcript = Vec::new();
    read_into(path, signature, timeout, poll_interval, &mut transcript).await?;
    Ok(transcript.into())
}

/// Like [`read_until`], but appends to a caller-owned buffer.
///
/// Whatever was read stays in `transcript` even if this future is dropped
/// before it resolves.
pub async fn read_into(
    path: &Path,
    signature: &str,
    timeout: Duration,
    poll_interval: Duration,
    transcript: &mut Vec<u8>,
) -> Result<()> {
    info!(target: "console", path = %path.display(), signature, ?timeout, "waiting for console signature");

    let start = Instant::now();
    let deadline = start + timeout;
    let timed_out = |transcript: &[u8]| Error::ReadTimeout {
        path: path.to_owned(),
        timeout,
        transcript: transcript.to_vec().into(),
    };
    let io_error = |source: std::io::Error| Error::Console {
        path: path.to_owned(),
        source,
    };

    let Some(stream) = connect(path, deadline).await.map_err(io_error)? else {
        return Err(timed_out(transcript.as_slice()));
    };

    let mut scanner = SignatureScanner::new(signature.as_bytes());
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let wait = poll_interval.min(deadline.saturating_duration_since(Instant::now()));
        if let Ok(ready) = tokio::time::timeout(wait, stream.readable()).await {
            ready.map_err(io_error)?;
            loop {
                match stream.try_read(&mut buf) {
                    Ok(0) => {
                        return Err(Error::ConsoleClosed {
                            path: path.to_owned(),
                            transcript: transcript.clone().into(),
                        });
                    }
                    Ok(n) => {
                        transcript.extend_from_slice(&buf[..n]);
                        trace!(target: "console", bytes = n, total = transcript.len(), "read console output");
                        if scanner.scan(transcript.as_slice()) {
                            info!(
                                target: "console",
                                elapsed_ms = start.elapsed().as_millis() as u64,
                                bytes = transcript.len(),
                                "console signature found"
                            );
                            return Ok(());
                        }
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(io_error(e)),
                }
            }
        }

        if Instant::now() >= deadline {
            debug!(target: "console", bytes = transcript.len(), "console read timed out");
            return Err(timed_out(transcript.as_slice()));
        }
    }
}

/// Connect to the console socket, retrying while it does not exist yet.
///
/// Returns `None` if the deadline passes first.
async fn connect(path: &Path, deadline: Instant) -> std::io::Result<Option<UnixStream>> {
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(Some(stream)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                debug!(target: "console", path = %path.display(), error = %e, "console not ready, retrying");
                sleep(CONNECT_RETRY_DELAY.min(remaining)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
