// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Names and parses the files that live inside a database directory.

use std::path::{Path, PathBuf};

/// The kind of file a database-directory entry is, as recognized by
/// [`parse_filename`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Manifest,
    Table,
    Temp,
    Current,
    Lock,
}

fn number_name(dbname: &Path, number: u64, suffix: &str) -> PathBuf {
    dbname.join(format!("{number:06}.{suffix}"))
}

#[must_use]
pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    number_name(dbname, number, "log")
}

#[must_use]
pub fn manifest_file_name(dbname: &Path, number: u64) -> PathBuf {
    number_name(dbname, number, "meta")
}

#[must_use]
pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    number_name(dbname, number, "sst")
}

#[must_use]
pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    number_name(dbname, number, "tmp")
}

#[must_use]
pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

#[must_use]
pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// Recognizes one of this database's reserved file names, returning its
/// type and (for numbered files) its file number.
#[must_use]
pub fn parse_filename(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        "LOGGER" => return None,
        _ => {}
    }
    let (digits, suffix) = name.split_once('.')?;
    let number: u64 = digits.parse().ok()?;
    let file_type = match suffix {
        "log" => FileType::Log,
        "meta" => FileType::Manifest,
        "sst" => FileType::Table,
        "tmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_names_round_trip_through_parse() {
        let dir = Path::new("/db");
        for (path, expected_type) in [
            (log_file_name(dir, 7), FileType::Log),
            (manifest_file_name(dir, 7), FileType::Manifest),
            (table_file_name(dir, 7), FileType::Table),
            (temp_file_name(dir, 7), FileType::Temp),
        ] {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse_filename(name), Some((expected_type, 7)));
        }
    }

    #[test]
    fn current_and_lock_are_recognized_by_literal_name() {
        assert_eq!(parse_filename("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_filename("LOCK"), Some((FileType::Lock, 0)));
    }

    #[test]
    fn unrelated_names_are_ignored() {
        assert_eq!(parse_filename("LOGGER"), None);
        assert_eq!(parse_filename("readme.txt"), None);
    }
}
