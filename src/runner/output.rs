/// Bounded stream collection
///
/// One thread per worker stream. Each collector keeps reading after its cap is
/// reached so the worker never blocks on a full pipe; the extra bytes are
/// discarded and the stream is marked truncated.
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::Read;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Appended to a text stream that hit its cap
pub const TRUNCATION_MARKER: &str = "\n[... output truncated ...]\n";

/// Bytes collected from one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedStream {
    pub data: Vec<u8>,
    pub truncated: bool,
    /// Bytes read past the cap and discarded
    pub dropped: u64,
}

impl CollectedStream {
    /// Lossy UTF-8 text with the truncation marker appended when capped
    pub fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// A collector thread for one stream
pub struct StreamCollector {
    name: &'static str,
    rx: Receiver<CollectedStream>,
    handle: JoinHandle<()>,
}

impl StreamCollector {
    /// Start draining `stream` on its own thread
    pub fn spawn<R: Read + Send + 'static>(name: &'static str, stream: R, limit: usize) -> Self {
        let (tx, rx) = bounded(1);
        let handle = thread::spawn(move || {
            let _ = tx.send(collect_stream(stream, limit));
        });
        Self { name, rx, handle }
    }

    /// Wait until `deadline` for the stream to reach EOF
    ///
    /// A stream still open at the deadline (a grandchild holding the pipe)
    /// is reported as truncated with whatever was read so far lost.
    pub fn finish(self, deadline: Instant) -> CollectedStream {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(collected) => {
                let _ = self.handle.join();
                collected
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{} collector did not reach EOF before the deadline", self.name);
                CollectedStream {
                    truncated: true,
                    ..CollectedStream::default()
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("{} collector exited without a result", self.name);
                CollectedStream::default()
            }
        }
    }
}

/// Collect from a single stream with limit
fn collect_stream<R: Read>(mut stream: R, limit: usize) -> CollectedStream {
    let mut collected = CollectedStream::default();
    let mut chunk = [0u8; 8192];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(collected.data.len());
                if n > room {
                    collected.data.extend_from_slice(&chunk[..room]);
                    collected.dropped += (n - room) as u64;
                    collected.truncated = true;
                } else {
                    collected.data.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("stream read ended with error: {}", e);
                break;
            }
        }
    }

    collected
}

/// Deadline helper for a group of collectors
pub fn collection_deadline(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_small_stream_complete() {
        let collected = collect_stream(Cursor::new(b"hello\n".to_vec()), 1024);
        assert_eq!(collected.data, b"hello\n");
        assert!(!collected.truncated);
        assert_eq!(collected.into_text(), "hello\n");
    }

    #[test]
    fn test_overflow_truncates_and_keeps_draining() {
        let input = vec![b'x'; 100_000];
        let collected = collect_stream(Cursor::new(input), 10);
        assert_eq!(collected.data.len(), 10);
        assert!(collected.truncated);
        assert_eq!(collected.dropped, 99_990);
        assert!(collected.into_text().ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_collector_thread_delivers() {
        let collector = StreamCollector::spawn("stdout", Cursor::new(b"abc".to_vec()), 16);
        let collected = collector.finish(collection_deadline(Duration::from_secs(5)));
        assert_eq!(collected.data, b"abc");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let collected = CollectedStream {
            data: vec![b'a', 0xff, b'b'],
            truncated: false,
            dropped: 0,
        };
        assert_eq!(collected.into_text(), "a\u{fffd}b");
    }
}
