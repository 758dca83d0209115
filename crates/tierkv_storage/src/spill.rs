//! Per-key spill files for the disk-backed lock store.
//!
//! Layout: `<root>/<thread id>/<encoded key>` holding `is_primary\nvalue\n`,
//! where the flag is `1` or `0`. A `.lock` file in the thread directory is
//! held exclusively for the lifetime of the [`SpillDirectory`].

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = ".lock";
const TEMP_PREFIX: &str = ".tmp-";

/// The persisted form of one unlocked key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilledKey {
    /// Whether this replica accepted writes for the key.
    pub is_primary: bool,
    /// The committed value.
    pub value: String,
}

/// A directory of spill files owned by one storage thread.
#[derive(Debug)]
pub struct SpillDirectory {
    dir: PathBuf,
    lock: File,
}

impl SpillDirectory {
    /// Opens (creating if needed) the spill directory of thread `tid` under
    /// `root` and takes its exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DirectoryLocked`] when another store holds the
    /// directory, or an I/O error.
    pub fn open(root: &Path, tid: u32) -> StorageResult<Self> {
        let dir = root.join(tid.to_string());
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::DirectoryLocked {
                path: dir.display().to_string(),
            })?;

        debug!(dir = %dir.display(), "opened spill directory");
        Ok(Self { dir, lock })
    }

    /// Returns the thread directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Writes (or replaces) the spill file for `key`.
    ///
    /// The file is written under a temporary name and renamed into place so a
    /// crash never leaves a half-written value behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, key: &str, entry: &SpilledKey) -> StorageResult<()> {
        let name = encode_file_name(key);
        let temp = self.dir.join(format!("{TEMP_PREFIX}{name}"));
        {
            let mut file = File::create(&temp)?;
            let flag = if entry.is_primary { '1' } else { '0' };
            write!(file, "{flag}\n{}\n", entry.value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.dir.join(name))?;
        Ok(())
    }

    /// Reads the spill file for `key`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MalformedSpillFile`] for a file that does not
    /// follow the layout, or an I/O error.
    pub fn read(&self, key: &str) -> StorageResult<Option<SpilledKey>> {
        let contents = match fs::read_to_string(self.dir.join(encode_file_name(key))) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let malformed = |reason: &str| StorageError::MalformedSpillFile {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let (flag, rest) = contents
            .split_once('\n')
            .ok_or_else(|| malformed("missing primary flag line"))?;
        let is_primary = match flag {
            "1" => true,
            "0" => false,
            _ => return Err(malformed("primary flag must be 0 or 1")),
        };
        let value = rest
            .strip_suffix('\n')
            .ok_or_else(|| malformed("missing trailing newline"))?;

        Ok(Some(SpilledKey {
            is_primary,
            value: value.to_string(),
        }))
    }

    /// Deletes the spill file for `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        match fs::remove_file(self.dir.join(encode_file_name(key))) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether `key` has a spill file.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.dir.join(encode_file_name(key)).is_file()
    }

    /// Lists every spilled key.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = decode_file_name(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl Drop for SpillDirectory {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

/// Maps a key to a file name. Path separators, `%` and a leading `.` are
/// written as `%XX`; the empty key becomes `%`.
fn encode_file_name(key: &str) -> String {
    if key.is_empty() {
        return "%".to_string();
    }
    let mut name = String::with_capacity(key.len());
    for (i, c) in key.chars().enumerate() {
        match c {
            '/' | '\\' | '%' => name.push_str(&format!("%{:02X}", c as u32)),
            '.' if i == 0 => name.push_str("%2E"),
            _ => name.push(c),
        }
    }
    name
}

fn decode_file_name(name: &str) -> Option<String> {
    if name == "%" {
        return Some(String::new());
    }
    let mut key = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            let byte = u8::from_str_radix(&hex, 16).ok()?;
            key.push(char::from(byte));
        } else {
            key.push(c);
        }
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn entry(is_primary: bool, value: &str) -> SpilledKey {
        SpilledKey {
            is_primary,
            value: value.to_string(),
        }
    }

    #[test]
    fn write_read_remove() {
        let root = tempdir().unwrap();
        let spill = SpillDirectory::open(root.path(), 3).unwrap();
        assert_eq!(spill.path(), root.path().join("3"));

        spill.write("user:1", &entry(true, "alice")).unwrap();
        assert!(spill.contains("user:1"));
        assert_eq!(spill.read("user:1").unwrap(), Some(entry(true, "alice")));

        let raw = fs::read_to_string(root.path().join("3").join("user:1")).unwrap();
        assert_eq!(raw, "1\nalice\n");

        assert!(spill.remove("user:1").unwrap());
        assert!(!spill.remove("user:1").unwrap());
        assert_eq!(spill.read("user:1").unwrap(), None);
    }

    #[test]
    fn multi_line_values_round_trip() {
        let root = tempdir().unwrap();
        let spill = SpillDirectory::open(root.path(), 0).unwrap();
        spill.write("doc", &entry(false, "line one\nline two")).unwrap();
        assert_eq!(
            spill.read("doc").unwrap(),
            Some(entry(false, "line one\nline two"))
        );
    }

    #[test]
    fn malformed_file_is_reported() {
        let root = tempdir().unwrap();
        let spill = SpillDirectory::open(root.path(), 0).unwrap();
        fs::write(spill.path().join("bad"), "yes\nvalue\n").unwrap();
        assert!(matches!(
            spill.read("bad"),
            Err(StorageError::MalformedSpillFile { .. })
        ));
    }

    #[test]
    fn second_open_of_same_thread_is_refused() {
        let root = tempdir().unwrap();
        let _first = SpillDirectory::open(root.path(), 1).unwrap();
        assert!(matches!(
            SpillDirectory::open(root.path(), 1),
            Err(StorageError::DirectoryLocked { .. })
        ));
        assert!(SpillDirectory::open(root.path(), 2).is_ok());
    }

    #[test]
    fn keys_lists_decoded_names() {
        let root = tempdir().unwrap();
        let spill = SpillDirectory::open(root.path(), 0).unwrap();
        for key in ["b/c", ".hidden", "a", ""] {
            spill.write(key, &entry(true, "v")).unwrap();
        }
        assert_eq!(spill.keys().unwrap(), vec!["", ".hidden", "a", "b/c"]);
    }

    proptest! {
        #[test]
        fn file_names_decode_to_their_key(key in "[a-z./%\\\\]{0,12}") {
            let name = encode_file_name(&key);
            prop_assert!(!name.contains('/'));
            prop_assert!(!name.starts_with('.'));
            prop_assert_eq!(decode_file_name(&name), Some(key));
        }
    }
}
