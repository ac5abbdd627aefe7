//! Standard stream multiplexing over named pipes
//!
//! Each run gets a private directory holding three FIFOs. While the body is
//! evaluated the remote program reads `in` and writes `out`/`err`; local
//! tasks shuttle bytes between those pipes and the console:
//!
//! - the feeder copies local stdin into `in`, then closes it so the remote
//!   side sees end-of-input
//! - two drains copy `out` and `err` to the console until the end-of-stream
//!   marker written by the remote side appears
//!
//! The directory and every task are released on [`Multiplexer::finish`],
//! [`Multiplexer::abort`] or drop, whichever comes first.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::console::LocalIo;

/// Paths of a run's pipes and the marker that ends each output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    pub input: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
    pub marker: String,
}

impl Channels {
    fn in_dir(dir: &Path, run_id: &str) -> Self {
        Self {
            input: dir.join("in"),
            output: dir.join("out"),
            error: dir.join("err"),
            marker: end_of_stream_marker(run_id),
        }
    }
}

/// Marker the remote program writes after its last output
pub fn end_of_stream_marker(run_id: &str) -> String {
    format!("__REVAL_EOS_{}__", run_id)
}

/// Whether named pipes are available on this platform
pub fn is_supported() -> bool {
    cfg!(unix)
}

/// Finds the end-of-stream marker in a chunked byte stream
///
/// Bytes that could be the start of a marker split across reads are held
/// back until the next chunk decides them.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: Vec<u8>,
    held: Vec<u8>,
    found: bool,
}

impl MarkerScanner {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            held: Vec::new(),
            found: false,
        }
    }

    /// Feed a chunk, returning the bytes that are safe to emit
    ///
    /// Once the marker has been seen, it and everything after it are
    /// discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.found {
            return Vec::new();
        }

        let mut buf = std::mem::take(&mut self.held);
        buf.extend_from_slice(chunk);

        if let Some(pos) = find(&buf, &self.marker) {
            self.found = true;
            buf.truncate(pos);
            return buf;
        }

        let keep = partial_marker_len(&buf, &self.marker);
        self.held = buf.split_off(buf.len() - keep);
        buf
    }

    pub fn is_finished(&self) -> bool {
        self.found
    }

    /// Release held bytes when the stream ends without a marker
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `marker`
fn partial_marker_len(buf: &[u8], marker: &[u8]) -> usize {
    (1..marker.len())
        .rev()
        .find(|&n| n <= buf.len() && buf.ends_with(&marker[..n]))
        .unwrap_or(0)
}

/// Named-pipe multiplexer for one run
#[derive(Debug)]
pub struct Multiplexer {
    dir: PathBuf,
    channels: Channels,
    feeder: Option<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
    removed: bool,
}

impl Multiplexer {
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Wait for the output pipes to drain, then release everything
    ///
    /// Drains are given at most `grace`; the feeder is stopped afterwards
    /// whether or not it finished.
    pub async fn finish(mut self, grace: Duration) {
        let drains = futures::future::join_all(self.drains.iter_mut());
        if tokio::time::timeout(grace, drains).await.is_err() {
            tracing::warn!(
                "Output pipes in {:?} did not drain within {:?}",
                self.dir,
                grace
            );
        }
        self.teardown();
    }

    /// Stop every task immediately and release the pipes
    pub fn abort(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        for drain in self.drains.drain(..) {
            drain.abort();
        }

        if !self.removed {
            self.removed = true;
            match std::fs::remove_dir_all(&self.dir) {
                Ok(()) => tracing::debug!("Removed pipe directory {:?}", self.dir),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove pipe directory {:?}: {}", self.dir, e),
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(unix)]
impl Multiplexer {
    /// Create the run's pipes under `root` and start shuttling
    ///
    /// Must be called inside a tokio runtime: the drains and the feeder are
    /// spawned onto it.
    ///
    /// # Arguments
    /// * `root` - Directory that receives the private `reval-<run_id>` dir
    /// * `run_id` - Run identifier, also embedded in the end-of-stream marker
    /// * `io` - Local streams; drains write to its sinks and the feeder takes
    ///   its stdin
    ///
    /// # Returns
    /// A running multiplexer whose [`Multiplexer::channels`] are bound into
    /// the evaluated code.
    ///
    /// # Errors
    /// Any I/O error creating the directory or the FIFOs. `io.stdin` is taken
    /// only once every pipe is in place, so a failed start leaves it
    /// available to the caller.
    pub fn start(root: &Path, run_id: &str, io: &mut LocalIo) -> io::Result<Self> {
        use std::os::unix::fs::DirBuilderExt;

        let dir = root.join(format!("reval-{}", run_id));
        std::fs::DirBuilder::new().mode(0o700).create(&dir)?;

        let mut mux = Self {
            channels: Channels::in_dir(&dir, run_id),
            dir,
            feeder: None,
            drains: Vec::new(),
            removed: false,
        };

        let channels = mux.channels.clone();
        for path in [&channels.input, &channels.output, &channels.error] {
            fifo::create(path)?;
        }

        let output = fifo::open_drain(&channels.output)?;
        let error = fifo::open_drain(&channels.error)?;

        mux.drains.push(tokio::spawn(fifo::drain(
            output,
            io.stdout.clone(),
            channels.marker.clone(),
            "out",
        )));
        mux.drains.push(tokio::spawn(fifo::drain(
            error,
            io.stderr.clone(),
            channels.marker.clone(),
            "err",
        )));

        // The remote open of `in` blocks until a writer appears, so the
        // feeder runs even without local input and closes at once
        let stdin = io
            .stdin
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::empty()));
        mux.feeder = Some(tokio::spawn(fifo::feed(channels.input.clone(), stdin)));

        tracing::debug!("Multiplexer started in {:?}", mux.dir);
        Ok(mux)
    }
}

#[cfg(not(unix))]
impl Multiplexer {
    pub fn start(_root: &Path, _run_id: &str, _io: &mut LocalIo) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "named pipes are not supported on this platform",
        ))
    }
}

#[cfg(unix)]
mod fifo {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::sys::stat::Mode;
    use tokio::io::AsyncReadExt;
    use tokio::net::unix::pipe;

    use super::MarkerScanner;
    use crate::console::{InputStream, Sink};

    /// Retry interval while waiting for the remote side to open `in`
    const OPEN_RETRY: Duration = Duration::from_millis(20);

    pub(super) fn create(path: &Path) -> io::Result<()> {
        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
    }

    /// Open an output pipe for reading
    ///
    /// A sender is opened alongside and held for the life of the drain, so
    /// the reader never sees end-of-file between remote writers.
    pub(super) fn open_drain(path: &Path) -> io::Result<(pipe::Receiver, pipe::Sender)> {
        let receiver = pipe::OpenOptions::new().open_receiver(path)?;
        let keepalive = pipe::OpenOptions::new().open_sender(path)?;
        Ok((receiver, keepalive))
    }

    pub(super) async fn drain(
        (mut receiver, _keepalive): (pipe::Receiver, pipe::Sender),
        sink: Sink,
        marker: String,
        name: &'static str,
    ) {
        let mut scanner = MarkerScanner::new(&marker);
        let mut buf = [0u8; 4096];

        loop {
            match receiver.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("{} pipe closed before end marker", name);
                    let rest = scanner.finish();
                    if let Err(e) = sink.write_async(rest).await {
                        tracing::warn!("Failed to write {} output: {}", name, e);
                    }
                    break;
                }
                Ok(n) => {
                    let chunk = scanner.feed(&buf[..n]);
                    if !chunk.is_empty() {
                        if let Err(e) = sink.write_async(chunk).await {
                            tracing::warn!("Failed to write {} output: {}", name, e);
                            break;
                        }
                    }
                    if scanner.is_finished() {
                        tracing::debug!("{} pipe drained", name);
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Error reading {} pipe: {}", name, e);
                    break;
                }
            }
        }
    }

    pub(super) async fn feed(path: PathBuf, mut stdin: InputStream) {
        // Opening a FIFO for writing fails with ENXIO until a reader exists
        let mut sender = loop {
            match pipe::OpenOptions::new().open_sender(&path) {
                Ok(sender) => break sender,
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                    tokio::time::sleep(OPEN_RETRY).await;
                }
                Err(e) => {
                    tracing::warn!("Failed to open input pipe {:?}: {}", path, e);
                    return;
                }
            }
        };

        match tokio::io::copy(&mut stdin, &mut sender).await {
            Ok(n) => tracing::debug!("Forwarded {} bytes of input", n),
            // The remote side may stop reading early
            Err(e) => tracing::debug!("Input forwarding stopped: {}", e),
        }
        // Dropping the sender signals end-of-input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_passes_plain_output() {
        let mut scanner = MarkerScanner::new("__EOS__");
        assert_eq!(scanner.feed(b"hello\n"), b"hello\n");
        assert!(!scanner.is_finished());
    }

    #[test]
    fn test_scanner_stops_at_marker() {
        let mut scanner = MarkerScanner::new("__EOS__");
        assert_eq!(scanner.feed(b"last line\n__EOS__ignored"), b"last line\n");
        assert!(scanner.is_finished());
        assert!(scanner.feed(b"more").is_empty());
    }

    #[test]
    fn test_scanner_marker_split_across_chunks() {
        let mut scanner = MarkerScanner::new("__EOS__");

        assert_eq!(scanner.feed(b"abc__E"), b"abc");
        assert_eq!(scanner.feed(b"O"), b"");
        assert_eq!(scanner.feed(b"S__"), b"");
        assert!(scanner.is_finished());
    }

    #[test]
    fn test_scanner_releases_false_prefix() {
        let mut scanner = MarkerScanner::new("__EOS__");

        assert_eq!(scanner.feed(b"x__"), b"x");
        assert_eq!(scanner.feed(b"y"), b"__y");
        assert!(!scanner.is_finished());
    }

    #[test]
    fn test_scanner_finish_flushes_held_bytes() {
        let mut scanner = MarkerScanner::new("__EOS__");
        assert_eq!(scanner.feed(b"tail__EO"), b"tail");
        assert_eq!(scanner.finish(), b"__EO");
    }

    #[test]
    fn test_marker_contains_run_id() {
        assert_eq!(end_of_stream_marker("42-1000"), "__REVAL_EOS_42-1000__");
    }

    #[cfg(unix)]
    mod fifo_tests {
        use super::*;
        use crate::console::CaptureBuffer;
        use std::io::{Read, Write};

        #[tokio::test]
        async fn test_shuttles_all_three_streams() {
            let root = tempfile::tempdir().unwrap();
            let stdout = CaptureBuffer::new();
            let stderr = CaptureBuffer::new();
            let mut io = LocalIo::new(
                Some(Box::new(&b"input data"[..])),
                stdout.sink(),
                stderr.sink(),
            );

            let mux = Multiplexer::start(root.path(), "1-1", &mut io).unwrap();
            assert!(io.stdin.is_none());
            let channels = mux.channels().clone();
            let dir = mux.dir.clone();
            assert!(dir.exists());

            // Play the remote program
            let remote = tokio::task::spawn_blocking(move || {
                let mut input = String::new();
                std::fs::File::open(&channels.input)
                    .unwrap()
                    .read_to_string(&mut input)
                    .unwrap();

                let mut out = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&channels.output)
                    .unwrap();
                write!(out, "got {}\n{}", input, channels.marker).unwrap();

                let mut err = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&channels.error)
                    .unwrap();
                write!(err, "warning\n{}", channels.marker).unwrap();
            });
            remote.await.unwrap();

            mux.finish(Duration::from_secs(5)).await;

            assert_eq!(stdout.contents(), "got input data\n");
            assert_eq!(stderr.contents(), "warning\n");
            assert!(!dir.exists());
        }

        #[tokio::test]
        async fn test_input_without_stdin_is_empty() {
            let root = tempfile::tempdir().unwrap();
            let buffer = CaptureBuffer::new();
            let mut io = LocalIo::new(None, buffer.sink(), buffer.sink());

            let mux = Multiplexer::start(root.path(), "6-6", &mut io).unwrap();
            let input_path = mux.channels().input.clone();

            let input = tokio::task::spawn_blocking(move || {
                let mut input = Vec::new();
                std::fs::File::open(&input_path)
                    .unwrap()
                    .read_to_end(&mut input)
                    .unwrap();
                input
            })
            .await
            .unwrap();

            assert!(input.is_empty());
            mux.abort();
        }

        #[tokio::test]
        async fn test_abort_removes_directory() {
            let root = tempfile::tempdir().unwrap();
            let buffer = CaptureBuffer::new();
            let mut io = LocalIo::new(None, buffer.sink(), buffer.sink());

            let mux = Multiplexer::start(root.path(), "2-2", &mut io).unwrap();
            let dir = mux.dir.clone();
            assert!(dir.join("in").exists());
            assert!(dir.join("out").exists());
            assert!(dir.join("err").exists());

            mux.abort();
            assert!(!dir.exists());
        }

        #[tokio::test]
        async fn test_drop_removes_directory() {
            let root = tempfile::tempdir().unwrap();
            let buffer = CaptureBuffer::new();
            let mut io = LocalIo::new(None, buffer.sink(), buffer.sink());

            let dir = {
                let mux = Multiplexer::start(root.path(), "3-3", &mut io).unwrap();
                mux.dir.clone()
            };
            assert!(!dir.exists());
        }

        #[tokio::test]
        async fn test_finish_gives_up_after_grace() {
            let root = tempfile::tempdir().unwrap();
            let buffer = CaptureBuffer::new();
            let mut io = LocalIo::new(None, buffer.sink(), buffer.sink());

            let mux = Multiplexer::start(root.path(), "4-4", &mut io).unwrap();
            let dir = mux.dir.clone();

            // Nobody ever writes the marker
            mux.finish(Duration::from_millis(50)).await;
            assert!(!dir.exists());
        }

        #[tokio::test]
        async fn test_failed_start_keeps_stdin() {
            let root = tempfile::tempdir().unwrap();
            let missing = root.path().join("does-not-exist");
            let buffer = CaptureBuffer::new();
            let mut io = LocalIo::new(Some(Box::new(&b""[..])), buffer.sink(), buffer.sink());

            assert!(Multiplexer::start(&missing, "5-5", &mut io).is_err());
            assert!(io.stdin.is_some());
        }
    }
}
