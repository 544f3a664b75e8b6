//! Backward line scanning over a log file in bounded memory.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// Chunk size used when walking a file backward.
pub(crate) const CHUNK_SIZE: usize = 8 * 1024;

/// Pulls lines from the end of a file toward its start.
///
/// Holds one chunk plus the line currently being assembled, so memory stays
/// bounded by `CHUNK_SIZE` and the longest line regardless of file size.
/// Blank lines are skipped. Lines are yielded without their terminator.
pub(crate) struct ReverseLines {
    file: File,
    /// Offset of the first byte of `chunk` in the file.
    pos: u64,
    chunk: Vec<u8>,
    /// Bytes of `chunk` not yet scanned; scanning runs from `cursor - 1` down to 0.
    cursor: usize,
    /// The partial line, in reverse byte order.
    carry: Vec<u8>,
    done: bool,
}

impl ReverseLines {
    pub(crate) fn new(mut file: File) -> io::Result<Self> {
        let pos = file.seek(SeekFrom::End(0))?;
        Ok(ReverseLines {
            file,
            pos,
            chunk: vec![0u8; CHUNK_SIZE],
            cursor: 0,
            carry: Vec::new(),
            done: false,
        })
    }

    fn fill(&mut self) -> io::Result<bool> {
        if self.pos == 0 {
            return Ok(false);
        }
        let len = (self.pos as usize).min(CHUNK_SIZE);
        self.pos -= len as u64;
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut self.chunk[..len])?;
        self.cursor = len;
        Ok(true)
    }

    fn take_line(&mut self) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.carry);
        line.reverse();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line
    }
}

impl Iterator for ReverseLines {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            while self.cursor > 0 {
                self.cursor -= 1;
                let byte = self.chunk[self.cursor];
                if byte == b'\n' {
                    if !self.carry.is_empty() {
                        return Some(Ok(self.take_line()));
                    }
                } else {
                    self.carry.push(byte);
                }
            }

            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    if self.carry.is_empty() {
                        return None;
                    }
                    return Some(Ok(self.take_line()));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Read the trailing lines held in the last `window` bytes of a file.
///
/// The first line is kept only if the byte before the window is a line
/// terminator, otherwise it is a cut fragment and dropped. Lines are
/// returned in file order.
pub(crate) fn tail_lines(file: &mut File, window: u64) -> io::Result<Vec<Vec<u8>>> {
    let len = file.seek(SeekFrom::End(0))?;
    let start = len.saturating_sub(window);
    // One extra byte to see whether the window opens on a line boundary.
    let from = start.saturating_sub(1);
    file.seek(SeekFrom::Start(from))?;
    let mut buf = Vec::with_capacity((len - from) as usize);
    (&mut *file).take(len - from).read_to_end(&mut buf)?;

    let (cut, body) = match buf.split_first() {
        Some((&before, rest)) if start > 0 => (before != b'\n', rest),
        _ => (false, &buf[..]),
    };
    let mut lines: Vec<Vec<u8>> = body
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
        .collect();
    if cut && !lines.is_empty() {
        lines.remove(0);
    }
    lines.retain(|line| !line.is_empty());
    Ok(lines)
}
