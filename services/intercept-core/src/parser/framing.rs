//! Newline framing over arbitrary read boundaries

/// Longest line kept; anything longer is discarded up to the next newline
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedLine {
    /// Complete line, `\r\n` / `\n` removed, invalid UTF-8 replaced
    Line(String),
    /// A line exceeded the limit and was dropped (bytes discarded so far)
    Overlong(usize),
}

/// Splits a byte stream into lines, holding a partial trailing line until its
/// terminator arrives in a later chunk
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line: usize,
    /// Discarding the remainder of an over-long line
    skipping: bool,
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            skipping: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<FramedLine> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (segment, after) = rest.split_at(pos);
            rest = &after[1..];

            if self.skipping {
                self.skipping = false;
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(segment);
            if self.buf.len() > self.max_line {
                out.push(FramedLine::Overlong(self.buf.len()));
                self.buf.clear();
                continue;
            }
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            out.push(FramedLine::Line(String::from_utf8_lossy(&self.buf).into_owned()));
            self.buf.clear();
        }

        if !self.skipping {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_line {
                out.push(FramedLine::Overlong(self.buf.len()));
                self.buf.clear();
                self.skipping = true;
            }
        }

        out
    }

    /// Stream closed. Returns the size of an unterminated trailing line, if any.
    pub fn finish(&mut self) -> Option<usize> {
        let pending = self.buf.len();
        self.buf.clear();
        self.skipping = false;
        (pending > 0).then_some(pending)
    }
}
