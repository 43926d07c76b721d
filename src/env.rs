// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filesystem access for the database directory.
//!
//! A single-node, single-process engine has no pluggable-backend
//! requirement, so this is a direct `std::fs`/`std::io` wrapper plus the
//! `fs4` crate for the one POSIX gap the standard library leaves open:
//! advisory exclusive file locking.

use crate::error::{Error, Result};
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Creates `path` as a directory if it does not already exist.
pub fn create_dir_if_missing(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Returns `true` if `path` exists.
#[must_use]
pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Lists the file names (not full paths) directly inside `dir`.
pub fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Removes the file at `path`.
pub fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(Error::Io)
}

/// Removes the directory at `path` and everything inside it.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Removes the directory at `path` if it is both present and empty.
/// Succeeds silently either way, since a non-empty directory is left for
/// its remaining (unrecognized) contents.
pub fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) | Err(_) => Ok(()),
    }
}

/// Atomically replaces `to` with `from`'s contents (same filesystem).
pub fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(Error::Io)
}

/// Returns the size in bytes of the file at `path`.
pub fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}

/// Reads `path` fully into memory.
pub fn read_file_to_vec(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Writes `contents` to `path`, creating or truncating it, and `fsync`s
/// before returning.
pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Creates `path` as a fresh, empty file for incremental writing (e.g. a
/// manifest log), truncating it if it already exists.
pub fn create_file(path: &Path) -> Result<File> {
    File::create(path).map_err(Error::Io)
}

/// Opens `path` for appending, creating it if it does not exist.
pub fn open_appendable(path: &Path) -> Result<File> {
    OpenOptions::new().create(true).append(true).open(path).map_err(Error::Io)
}

/// Opens `path` read-only.
pub fn open_readable(path: &Path) -> Result<File> {
    File::open(path).map_err(Error::Io)
}

/// Reads `len` bytes from `file` starting at `offset`, without disturbing
/// any other reader's position (safe to call from multiple threads against
/// clones of the same underlying file).
pub fn read_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt as _;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
    #[cfg(not(unix))]
    {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An advisory exclusive lock on the database directory, held for the
/// lifetime of this value. A second process attempting to open the same
/// directory observes a locked `LOCK` file and fails.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates (if needed) and locks `path`. Fails if another process
    /// already holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, "database directory is locked by another process")))?;
        Ok(Self { file, path: path.to_path_buf() })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = &self.path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_dir_if_missing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        create_dir_if_missing(&nested).unwrap();
        create_dir_if_missing(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        write_file(&path, b"hello").unwrap();
        assert_eq!(read_file_to_vec(&path).unwrap(), b"hello");
    }

    #[test]
    fn read_at_reads_from_an_arbitrary_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        write_file(&path, b"0123456789").unwrap();
        let file = open_readable(&path).unwrap();
        assert_eq!(read_at(&file, 3, 4).unwrap(), b"3456");
    }

    #[test]
    fn lock_is_exclusive_to_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOCK");
        let _first = FileLock::acquire(&path).unwrap();
        assert!(FileLock::acquire(&path).is_err());
    }
}
