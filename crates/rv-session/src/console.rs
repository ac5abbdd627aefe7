//! Local standard streams used by a run
//!
//! Output written by the remote program reaches the console two ways: as
//! `out`/`err` fields of response messages, and through the multiplexer's
//! pipes. Both paths write through a shared [`Sink`] so chunks from either
//! source never interleave mid-write.

use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncRead;

/// Boxed source of local input
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Shared, thread-safe output destination
#[derive(Clone)]
pub struct Sink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Write a whole chunk and flush it
    ///
    /// Blocks the calling thread; async tasks use [`Sink::write_async`].
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()
    }

    /// Write a whole chunk from async code
    ///
    /// The write runs on tokio's blocking pool, so a slow terminal or a full
    /// pipe downstream never stalls a runtime worker.
    pub async fn write_async(&self, data: Vec<u8>) -> io::Result<()> {
        let sink = self.clone();
        tokio::task::spawn_blocking(move || sink.write(&data))
            .await
            .map_err(io::Error::other)?
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

/// In-memory writer whose contents can be read back
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&data).into_owned()
    }

    /// A sink that appends to this buffer
    pub fn sink(&self) -> Sink {
        Sink::new(self.clone())
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The local side of a run's standard streams
pub struct LocalIo {
    /// Input for the remote program; taken by whichever path forwards it
    pub stdin: Option<InputStream>,
    /// Whether stdin carries data (it is not an interactive terminal)
    pub stdin_piped: bool,
    /// Whether any of the process's standard streams is redirected
    pub redirected: bool,
    pub stdout: Sink,
    pub stderr: Sink,
}

impl LocalIo {
    /// Streams of the current process
    pub fn process() -> Self {
        let stdin_piped = !io::stdin().is_terminal();
        let redirected = stdin_piped || !io::stdout().is_terminal() || !io::stderr().is_terminal();

        Self {
            stdin: Some(Box::new(tokio::io::stdin())),
            stdin_piped,
            redirected,
            stdout: Sink::stdout(),
            stderr: Sink::stderr(),
        }
    }

    /// Explicit streams, treated as redirected
    pub fn new(stdin: Option<InputStream>, stdout: Sink, stderr: Sink) -> Self {
        Self {
            stdin_piped: stdin.is_some(),
            stdin,
            redirected: true,
            stdout,
            stderr,
        }
    }

    /// Drop the input stream, e.g. when the program text itself came from stdin
    pub fn without_stdin(mut self) -> Self {
        self.stdin = None;
        self.stdin_piped = false;
        self
    }
}

impl std::fmt::Debug for LocalIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdin_piped", &self.stdin_piped)
            .field("redirected", &self.redirected)
            .finish()
    }
}
