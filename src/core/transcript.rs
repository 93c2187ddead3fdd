use itertools::Itertools;

use crate::constants::TRUNCATION_MARKER;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

/// Line-oriented capture of a process's stdout and stderr.
///
/// Lines are kept in arrival order so the combined view interleaves both
/// streams the way the reader observed them. Each stream is capped at
/// `limit` bytes, counting an unterminated partial line. Once a stream
/// overflows, everything it sends afterwards is discarded and its view
/// ends with the truncation marker.
#[derive(Clone, Debug)]
pub struct Transcript {
    lines: Vec<(Stream, String)>,
    bytes: [usize; 2],
    pending: [Vec<u8>; 2],
    truncated: [bool; 2],
    limit: usize,
}

impl Transcript {
    pub fn with_limit(limit: usize) -> Self {
        Transcript {
            lines: Vec::new(),
            bytes: [0, 0],
            pending: [Vec::new(), Vec::new()],
            truncated: [false, false],
            limit,
        }
    }

    pub fn push_line(&mut self, stream: Stream, line: impl Into<String>) {
        let index = stream.index();
        if self.truncated[index] {
            return;
        }

        let mut line = line.into();
        if line.ends_with('\r') {
            line.pop();
        }
        if self.bytes[index] + line.len() > self.limit {
            self.truncate(stream);
            return;
        }
        self.bytes[index] += line.len();
        self.lines.push((stream, line));
    }

    /// Appends a raw chunk that may end in the middle of a line. The
    /// unterminated tail is buffered only while it fits the stream's budget.
    pub fn push_chunk(&mut self, stream: Stream, chunk: &[u8]) {
        let index = stream.index();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            if self.truncated[index] {
                return;
            }
            let mut line = std::mem::take(&mut self.pending[index]);
            line.extend_from_slice(&rest[..pos]);
            self.push_line(stream, String::from_utf8_lossy(&line).into_owned());
            rest = &rest[pos + 1..];
        }

        if self.truncated[index] {
            return;
        }
        let budget = self.limit - self.bytes[index];
        if self.pending[index].len() + rest.len() > budget {
            self.truncate(stream);
            return;
        }
        self.pending[index].extend_from_slice(rest);
    }

    /// Emits any unterminated trailing line of either stream.
    pub fn flush(&mut self) {
        for stream in [Stream::Stdout, Stream::Stderr] {
            let line = std::mem::take(&mut self.pending[stream.index()]);
            if !line.is_empty() {
                self.push_line(stream, String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    fn truncate(&mut self, stream: Stream) {
        let index = stream.index();
        self.truncated[index] = true;
        self.pending[index] = Vec::new();
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.iter().any(|truncated| *truncated)
    }

    /// Bytes held for a partial line that has not seen its newline yet.
    pub fn buffered(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    pub fn combined(&self) -> String {
        self.render(|_| true)
    }

    pub fn stdout(&self) -> String {
        self.render(|stream| stream == Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.render(|stream| stream == Stream::Stderr)
    }

    fn render(&self, include: impl Fn(Stream) -> bool) -> String {
        let mut text = self
            .lines
            .iter()
            .filter(|(stream, _)| include(*stream))
            .map(|(_, line)| line)
            .join("\n");

        let truncated = [Stream::Stdout, Stream::Stderr]
            .into_iter()
            .any(|stream| include(stream) && self.truncated[stream.index()]);
        if truncated {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}
