//! Buffered line output of a launched service
//!
//! Lines are kept from process start, so a subscriber that attaches late
//! still sees every line. Each subscription is its own cursor and ends once
//! the log is closed and fully read.

use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Which output channel a log captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl std::fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputChannel::Stdout => write!(f, "stdout"),
            OutputChannel::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    len: usize,
    closed: bool,
}

/// Append-only line log for one output channel
#[derive(Debug)]
pub struct OutputLog {
    /// Display id of the owning service, used as log prefix
    prefix: String,
    /// Channel captured
    channel: OutputChannel,
    /// Every line received so far
    lines: RwLock<Vec<String>>,
    /// Line count and closed flag, published to subscribers
    progress: watch::Sender<Progress>,
}

impl OutputLog {
    /// Create an empty, open log
    pub fn new(prefix: &str, channel: OutputChannel) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            prefix: prefix.to_string(),
            channel,
            lines: RwLock::new(Vec::new()),
            progress,
        }
    }

    /// Channel captured by this log
    pub fn channel(&self) -> OutputChannel {
        self.channel
    }

    /// Append a line. Lines arriving after close are ignored.
    pub async fn push(&self, line: String) {
        let mut lines = self.lines.write().await;
        if self.progress.borrow().closed {
            return;
        }

        match self.channel {
            OutputChannel::Stdout => tracing::info!("[{}] {}", self.prefix, line),
            OutputChannel::Stderr => tracing::warn!("[{}] {}", self.prefix, line),
        }

        lines.push(line);
        let len = lines.len();
        self.progress.send_modify(|p| p.len = len);
    }

    /// Mark the log complete. Subscribers end after the last line.
    pub async fn close(&self) {
        let _lines = self.lines.write().await;
        self.progress.send_modify(|p| p.closed = true);
    }

    /// Whether the log has been closed
    pub fn is_closed(&self) -> bool {
        self.progress.borrow().closed
    }

    /// Number of lines captured
    pub fn len(&self) -> usize {
        self.progress.borrow().len
    }

    /// Whether no line has been captured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every line captured so far
    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.read().await.clone()
    }

    /// Wait until the log is closed
    pub async fn wait_closed(&self) {
        let mut progress = self.progress.subscribe();
        let _ = progress.wait_for(|p| p.closed).await;
    }

    /// Subscribe from the first line
    pub fn subscribe(self: &Arc<Self>) -> OutputStream {
        OutputStream {
            log: self.clone(),
            cursor: 0,
            progress: self.progress.subscribe(),
        }
    }
}

/// Independent cursor over an [`OutputLog`]
#[derive(Debug)]
pub struct OutputStream {
    log: Arc<OutputLog>,
    cursor: usize,
    progress: watch::Receiver<Progress>,
}

impl OutputStream {
    /// Next line, or `None` once the log is closed and every line was read
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            let progress = *self.progress.borrow_and_update();
            if self.cursor < progress.len {
                let line = self.log.lines.read().await.get(self.cursor).cloned();
                self.cursor += 1;
                return line;
            }
            if progress.closed {
                return None;
            }
            if self.progress.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Lines as an async stream
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        stream::unfold(self, |mut output| async move {
            let line = output.next_line().await?;
            Some((line, output))
        })
    }
}
