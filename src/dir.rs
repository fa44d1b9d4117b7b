//! File directory discovery: enumerating segment and hint files by
//! `file_id`, locating the merge staging directory, the
//! `merge-finished` marker and the process lock file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MERGE_DIR_NAME: &str = "merge";
pub const MERGE_FINISHED_NAME: &str = "merge-finished";
pub const LOCK_FILE_NAME: &str = "db.lock";

/// The file layout discovered under a database directory at open time.
#[derive(Debug, Default)]
pub struct DirListing {
    /// `file_id`s with a `.data` file present, ascending.
    pub data_file_ids: Vec<u64>,
    /// `file_id`s that also have a matching `.hint` file.
    pub hint_file_ids: Vec<u64>,
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(Error::from_io)
}

/// Scans `dir` for `NNNNNNNNNNNNNNNNNNNN.data` / `.hint` files, parsing the
/// zero-padded decimal `file_id` from the stem. Unrecognized entries (the
/// lock file, the merge directory, the merge-finished marker) are ignored.
pub fn list(dir: &Path) -> Result<DirListing> {
    let mut data_file_ids = Vec::new();
    let mut hint_file_ids = Vec::new();

    for entry in fs::read_dir(dir).map_err(Error::from_io)? {
        let entry = entry.map_err(Error::from_io)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(stem) = file_name.strip_suffix(".data") {
            data_file_ids.push(parse_file_id(stem)?);
        } else if let Some(stem) = file_name.strip_suffix(".hint") {
            hint_file_ids.push(parse_file_id(stem)?);
        }
    }

    data_file_ids.sort_unstable();
    hint_file_ids.sort_unstable();
    Ok(DirListing {
        data_file_ids,
        hint_file_ids,
    })
}

fn parse_file_id(stem: &str) -> Result<u64> {
    stem.parse::<u64>()
        .map_err(|_| Error::MalformedFileName(stem.to_string()))
}

pub fn merge_dir_path(dir: &Path) -> PathBuf {
    dir.join(MERGE_DIR_NAME)
}

pub fn merge_finished_path(dir: &Path) -> PathBuf {
    dir.join(MERGE_FINISHED_NAME)
}

pub fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_data_and_hint_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for id in [2u64, 0, 1] {
            fs::write(dir.path().join(format!("{:020}.data", id)), b"x").unwrap();
        }
        fs::write(dir.path().join(format!("{:020}.hint", 0)), b"x").unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), b"").unwrap();

        let listing = list(dir.path()).unwrap();
        assert_eq!(listing.data_file_ids, vec![0, 1, 2]);
        assert_eq!(listing.hint_file_ids, vec![0]);
    }

    #[test]
    fn rejects_malformed_file_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("not-a-number.data"), b"x").unwrap();
        assert!(matches!(
            list(dir.path()),
            Err(Error::MalformedFileName(_))
        ));
    }
}
