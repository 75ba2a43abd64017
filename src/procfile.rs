//! Reusable reader for small proc-style text files.
//!
//! A [`ProcFile`] keeps its descriptor open between refreshes so that files
//! read on every poll (like `/proc/stat`) are only rewound, never reopened.
//! Per-process files are read through a fresh `ProcFile` that is dropped (and
//! therefore closed) after use.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Default read capacity, large enough for `/proc/stat` and `/proc/<pid>/status`.
pub const DEFAULT_CAPACITY: usize = 4 * 1024;

/// Errors returned by [`ProcFile::refresh`].
///
/// `Open` is the expected outcome when a process exits between enumeration
/// and read; `Seek` and `Read` are genuine I/O problems worth reporting.
#[derive(Debug, thiserror::Error)]
pub enum ProcFileError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to rewind {path}: {source}")]
    Seek { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

impl ProcFileError {
    /// True when the file could not be opened (the entity is gone).
    pub fn is_open_failure(&self) -> bool {
        matches!(self, ProcFileError::Open { .. })
    }
}

/// A proc file read into a fixed-capacity buffer.
#[derive(Debug)]
pub struct ProcFile {
    path: PathBuf,
    capacity: usize,
    file: Option<File>,
    raw: Vec<u8>,
    text: String,
}

impl ProcFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity,
            file: None,
            raw: Vec::with_capacity(capacity),
            text: String::with_capacity(capacity),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Opens the file if needed (or rewinds it) and rereads up to `capacity` bytes.
    ///
    /// A failed read closes the file so the next refresh reopens it.
    pub fn refresh(&mut self) -> Result<(), ProcFileError> {
        match self.file.as_mut() {
            Some(file) => {
                if let Err(source) = file.seek(SeekFrom::Start(0)) {
                    return Err(ProcFileError::Seek {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
            None => {
                let file = File::open(&self.path).map_err(|source| ProcFileError::Open {
                    path: self.path.clone(),
                    source,
                })?;
                self.file = Some(file);
            }
        }

        let result = match self.file.as_mut() {
            Some(file) => read_up_to(file, &mut self.raw, self.capacity),
            None => Ok(0),
        };

        self.text.clear();
        match result {
            Ok(_) => {
                self.text.push_str(&String::from_utf8_lossy(&self.raw));
                Ok(())
            }
            Err(source) => {
                self.close();
                self.raw.clear();
                Err(ProcFileError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    /// Forces the next [`refresh`](Self::refresh) to reopen the file.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Contents read by the last successful refresh.
    pub fn data(&self) -> &str {
        &self.text
    }

    /// Returns the text immediately following the first occurrence of `token`.
    pub fn data_after(&self, token: &str) -> Option<&str> {
        let start = self.text.find(token)?;
        Some(&self.text[start + token.len()..])
    }

    /// Parses the first unsigned integer following `token`.
    ///
    /// Returns 0 when the token is missing or no digits follow it, so callers
    /// cannot tell an absent value from a real zero.
    pub fn value_after(&self, token: &str) -> u64 {
        self.data_after(token).map(leading_u64).unwrap_or(0)
    }
}

/// Reads until EOF or until `capacity` bytes are buffered.
fn read_up_to(file: &mut File, buf: &mut Vec<u8>, capacity: usize) -> io::Result<usize> {
    buf.clear();
    buf.resize(capacity, 0);
    let mut filled = 0;
    while filled < capacity {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(filled)
}

/// Parses the unsigned integer at the start of `s`, skipping leading whitespace.
pub fn leading_u64(s: &str) -> u64 {
    let s = s.trim_start();
    let end = s
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(s.len());
    s[..end].parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_refresh_missing_file_is_open_failure() {
        let dir = tempdir().expect("Failed to create temp dir");
        let mut file = ProcFile::new(dir.path().join("missing"));

        let err = file.refresh().expect_err("refresh should fail");
        assert!(err.is_open_failure());
        assert!(!file.is_open());
    }

    #[test]
    fn test_refresh_rewinds_open_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("stat");
        std::fs::write(&path, "cpu  1 2 3 4\n").expect("Failed to write file");

        let mut file = ProcFile::new(&path);
        file.refresh().expect("first refresh");
        assert_eq!(file.data(), "cpu  1 2 3 4\n");
        assert!(file.is_open());

        // Same inode, new contents: the rewound descriptor sees the update
        std::fs::write(&path, "cpu  5 6 7 8\n").expect("Failed to rewrite file");
        file.refresh().expect("second refresh");
        assert_eq!(file.data(), "cpu  5 6 7 8\n");
    }

    #[test]
    fn test_close_forces_reopen() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("status");
        std::fs::write(&path, "Name:\tbash\n").expect("Failed to write file");

        let mut file = ProcFile::new(&path);
        file.refresh().expect("refresh");
        file.close();
        assert!(!file.is_open());

        std::fs::remove_file(&path).expect("Failed to remove file");
        let err = file.refresh().expect_err("reopen should fail");
        assert!(err.is_open_failure());
    }

    #[test]
    fn test_capacity_limits_read() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("big");
        std::fs::write(&path, "0123456789").expect("Failed to write file");

        let mut file = ProcFile::with_capacity(&path, 4);
        file.refresh().expect("refresh");
        assert_eq!(file.data(), "0123");
    }

    #[test]
    fn test_data_after_and_value_after() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("status");
        std::fs::write(
            &path,
            "Name:\tpostgres\nVmPeak:\t  300000 kB\nVmRSS:\t   12345 kB\nThreads:\tx\n",
        )
        .expect("Failed to write file");

        let mut file = ProcFile::new(&path);
        file.refresh().expect("refresh");

        assert_eq!(file.data_after("Name:"), Some("\tpostgres\nVmPeak:\t  300000 kB\nVmRSS:\t   12345 kB\nThreads:\tx\n"));
        assert_eq!(file.value_after("VmRSS:"), 12345);
        // Absent token and unparsable value both read as zero
        assert_eq!(file.value_after("VmSwap:"), 0);
        assert_eq!(file.value_after("Threads:"), 0);
        assert!(file.data_after("VmSwap:").is_none());
    }

    #[test]
    fn test_leading_u64() {
        assert_eq!(leading_u64("  42 kB"), 42);
        assert_eq!(leading_u64("7"), 7);
        assert_eq!(leading_u64("abc"), 0);
        assert_eq!(leading_u64(""), 0);
        assert_eq!(leading_u64("18446744073709551615"), u64::MAX);
    }
}
