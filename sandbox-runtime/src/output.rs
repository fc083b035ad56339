//! Bounded capture of command output.

use crate::engine::ExecOutput;

/// Accumulates stdout/stderr up to a combined byte ceiling.
///
/// Once the ceiling is hit further output is dropped and [`Self::overflowed`]
/// reports true; the caller is expected to terminate the command.
#[derive(Debug)]
pub struct BoundedOutput {
    limit_bytes: usize,
    stdout: String,
    stderr: String,
    overflowed: bool,
}

impl BoundedOutput {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            stdout: String::new(),
            stderr: String::new(),
            overflowed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Append a chunk. Returns false when the ceiling has been reached.
    pub fn push(&mut self, chunk: &ExecOutput) -> bool {
        if self.overflowed {
            return false;
        }
        let room = self.limit_bytes.saturating_sub(self.len());
        let (target, text) = match chunk {
            ExecOutput::Stdout(text) => (&mut self.stdout, text),
            ExecOutput::Stderr(text) => (&mut self.stderr, text),
        };
        if text.len() <= room {
            target.push_str(text);
            return true;
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        target.push_str(&text[..cut]);
        self.overflowed = true;
        false
    }

    pub fn into_parts(self) -> (String, String) {
        (self.stdout, self.stderr)
    }
}
