//! Log file tailing and backward scanning.
//!
//! [`LogTailer`] is a polling reader: it remembers a byte offset into the
//! file and each `poll` returns the complete lines appended since the last
//! one. A shrinking file is treated as rotation and reading restarts from
//! the top; a missing file is an empty poll, not an error, because game
//! clients create the log lazily.
//!
//! [`scan_backward`] reads a file in fixed-size chunks from the end,
//! reassembling lines that straddle chunk boundaries, and visits complete
//! lines newest first. Startup loopback resolution uses it to find the most
//! recent occurrence of a phrase without reading the whole file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::info;

/// Incremental forward reader over an append-only log.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    /// Trailing partial line from the previous poll, kept as raw bytes so
    /// a multi-byte character split across polls survives intact.
    carry: Vec<u8>,
}

impl LogTailer {
    /// Tail from the current end of the file. Lines written before the
    /// tailer existed are never replayed.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let offset = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        Ok(LogTailer { path, offset, carry: Vec::new() })
    }

    /// Tail from the beginning of the file.
    pub fn from_start(path: impl Into<PathBuf>) -> Self {
        LogTailer { path: path.into(), offset: 0, carry: Vec::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the previous poll.
    pub fn poll(&mut self) -> io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            info!("{} shrank ({} -> {len} bytes); restarting from the top", self.path.display(), self.offset);
            self.offset = 0;
            self.carry.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = std::mem::take(&mut self.carry);
        let read = file.take(len - self.offset).read_to_end(&mut buf)?;
        self.offset += read as u64;

        let mut lines = Vec::new();
        let mut rest = buf.as_slice();
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            lines.push(decode_line(&rest[..pos]));
            rest = &rest[pos + 1..];
        }
        self.carry = rest.to_vec();
        Ok(lines)
    }
}

/// Decode one complete line, dropping the carriage return of a CRLF ending.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Visit complete lines of `path` newest first, reading backward in
/// `chunk_size`-byte chunks. The visitor returns `false` to stop early.
/// The final partial write (a line with no terminating newline yet) is
/// skipped.
pub fn scan_backward(
    path: &Path,
    chunk_size: u64,
    mut visit: impl FnMut(&str) -> bool,
) -> io::Result<()> {
    assert!(chunk_size > 0);
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut pos = file.metadata()?.len();
    // Leading partial line of the chunk we already visited (it continues
    // into the chunk we are about to read).
    let mut carry: Vec<u8> = Vec::new();
    // Everything after the last newline in the file is an unfinished write;
    // stays set until the first newline is found.
    let mut discard_tail = true;

    while pos > 0 {
        let start = pos.saturating_sub(chunk_size);
        let mut buf = vec![0u8; (pos - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        buf.extend_from_slice(&carry);

        let mut segments: Vec<&[u8]> = buf.split(|&b| b == b'\n').collect();

        if discard_tail {
            if segments.len() == 1 {
                // No newline yet; the whole chunk is part of the tail.
                carry.clear();
                pos = start;
                continue;
            }
            segments.pop();
            discard_tail = false;
        }
        let complete_from = if start > 0 {
            // Segment 0 continues into the previous (earlier) chunk.
            carry = segments.first().map(|s| s.to_vec()).unwrap_or_default();
            1
        } else {
            0
        };

        for segment in segments[complete_from.min(segments.len())..].iter().rev() {
            let line = decode_line(segment);
            if line.is_empty() {
                continue;
            }
            if !visit(&line) {
                return Ok(());
            }
        }
        pos = start;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_log(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn poll_returns_only_appended_complete_lines() {
        let file = temp_log("old line\n");
        let mut tailer = LogTailer::new(file.path()).unwrap();
        assert!(tailer.poll().unwrap().is_empty());

        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .write_all(b"first\r\nsecond\npart")
            .unwrap();

        assert_eq!(tailer.poll().unwrap(), ["first", "second"]);

        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .write_all(b"ial\n")
            .unwrap();

        // The straddling line arrives whole on the next poll.
        assert_eq!(tailer.poll().unwrap(), ["partial"]);
    }

    #[test]
    fn truncation_restarts_from_the_top() {
        let file = temp_log("a\nb\nc\n");
        let mut tailer = LogTailer::new(file.path()).unwrap();
        assert!(tailer.poll().unwrap().is_empty());

        // Rotation detection keys on the file shrinking, so the fresh
        // content must be shorter than the old offset.
        std::fs::write(file.path(), b"x\n").unwrap();
        assert_eq!(tailer.poll().unwrap(), ["x"]);
    }

    #[test]
    fn multibyte_character_split_across_polls_survives() {
        let file = temp_log("");
        let mut tailer = LogTailer::new(file.path()).unwrap();

        // "café line\n" written in two halves, cut inside the two-byte 'é'.
        let bytes = "caf\u{e9} line\n".as_bytes();
        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .write_all(&bytes[..4])
            .unwrap();
        assert!(tailer.poll().unwrap().is_empty());

        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .write_all(&bytes[4..])
            .unwrap();
        assert_eq!(tailer.poll().unwrap(), ["caf\u{e9} line"]);
    }

    #[test]
    fn missing_file_is_an_empty_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-yet.txt");
        let mut tailer = LogTailer::new(&path).unwrap();
        assert!(tailer.poll().unwrap().is_empty());

        std::fs::write(&path, b"now it exists\n").unwrap();
        assert_eq!(tailer.poll().unwrap(), ["now it exists"]);
    }

    #[test]
    fn backward_scan_visits_newest_first_across_chunks() {
        let file = temp_log("alpha line\nbeta line\ngamma line\n");
        let mut seen = Vec::new();
        // A tiny chunk size forces every line to straddle a boundary.
        scan_backward(file.path(), 4, |line| {
            seen.push(line.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, ["gamma line", "beta line", "alpha line"]);
    }

    #[test]
    fn backward_scan_keeps_multibyte_characters_across_chunks() {
        let file = temp_log("entr\u{e9}e served\ncaf\u{e9} opened\n");
        let mut seen = Vec::new();
        // The 1-byte chunks guarantee every multi-byte character is cut.
        scan_backward(file.path(), 1, |line| {
            seen.push(line.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, ["caf\u{e9} opened", "entr\u{e9}e served"]);
    }

    #[test]
    fn backward_scan_stops_when_the_visitor_says_so() {
        let file = temp_log("one\ntwo\nthree\n");
        let mut seen = Vec::new();
        scan_backward(file.path(), 1024, |line| {
            seen.push(line.to_string());
            false
        })
        .unwrap();
        assert_eq!(seen, ["three"]);
    }

    #[test]
    fn backward_scan_skips_the_unterminated_tail() {
        let file = temp_log("done\nin progress");
        let mut seen = Vec::new();
        scan_backward(file.path(), 1024, |line| {
            seen.push(line.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, ["done"]);
    }
}
