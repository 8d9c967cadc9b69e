use std::io::{self, Write};

use tracing::warn;

/// Append-only sink a chat turn writes into.
pub trait ResponseStream: Send {
    /// One-shot status line shown while work is in progress.
    fn progress(&mut self, message: &str);
    /// Append a markdown fragment, in order.
    fn markdown(&mut self, fragment: &str);
}

/// Writes model output to stdout and progress notices to stderr.
pub struct TerminalStream<W: Write + Send = io::Stdout> {
    out: W,
    wrote_output: bool,
}

impl TerminalStream {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> TerminalStream<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            wrote_output: false,
        }
    }

    /// Terminate the last line of output so the next prompt starts clean.
    pub fn finish(&mut self) {
        if self.wrote_output {
            if let Err(e) = writeln!(self.out).and_then(|_| self.out.flush()) {
                warn!("Failed to flush output: {}", e);
            }
            self.wrote_output = false;
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ResponseStream for TerminalStream<W> {
    fn progress(&mut self, message: &str) {
        eprintln!("{}", message);
    }

    fn markdown(&mut self, fragment: &str) {
        // Flush per fragment so text shows up as it arrives.
        if let Err(e) = self
            .out
            .write_all(fragment.as_bytes())
            .and_then(|_| self.out.flush())
        {
            warn!("Failed to write response fragment: {}", e);
            return;
        }
        self.wrote_output = true;
    }
}

/// Keeps everything written to it; handy for tests and embedding.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordingStream {
    pub progress: Vec<String>,
    pub markdown: Vec<String>,
}

impl RecordingStream {
    pub fn text(&self) -> String {
        self.markdown.concat()
    }
}

impl ResponseStream for RecordingStream {
    fn progress(&mut self, message: &str) {
        self.progress.push(message.to_string());
    }

    fn markdown(&mut self, fragment: &str) {
        self.markdown.push(fragment.to_string());
    }
}
