//! Tar entry helpers
//!
//! Archives are indexed once by entry name; individual entries are then read by
//! seeking straight to their data instead of walking the archive again.

use crate::error::{RegistryError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

/// Position of one entry's data inside an archive file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub offset: u64,
    pub size: u64,
}

/// Entry name → location, for every regular file in a tar archive
///
/// A damaged or truncated archive yields the entries read before the damage.
/// Entries whose data extends past the end of the file are left out.
pub fn index_entries(tar_path: &Path) -> Result<HashMap<String, EntryLocation>> {
    let file = File::open(tar_path)
        .map_err(|e| RegistryError::Io(format!("Failed to open tar file: {}", e)))?;
    let file_len = file.metadata()?.len();
    let mut archive = Archive::new(file);

    let mut entries = HashMap::new();
    let Ok(iter) = archive.entries() else {
        return Ok(entries);
    };
    for entry_result in iter {
        let Ok(entry) = entry_result else {
            break;
        };
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let Ok(path) = entry.path() else {
            continue;
        };
        let location = EntryLocation {
            offset: entry.raw_file_position(),
            size: entry.size(),
        };
        if location.offset.saturating_add(location.size) > file_len {
            break;
        }
        entries.insert(path.to_string_lossy().to_string(), location);
    }
    Ok(entries)
}

/// Read the data of the entry at `location`
pub fn read_entry(tar_path: &Path, location: EntryLocation) -> Result<Vec<u8>> {
    let mut file = File::open(tar_path)
        .map_err(|e| RegistryError::Io(format!("Failed to open tar file: {}", e)))?;
    file.seek(SeekFrom::Start(location.offset))?;

    let mut data = Vec::with_capacity(location.size as usize);
    file.take(location.size).read_to_end(&mut data)?;
    if data.len() as u64 != location.size {
        return Err(RegistryError::Io(format!(
            "Truncated tar entry: expected {} bytes, read {}",
            location.size,
            data.len()
        )));
    }
    Ok(data)
}

/// Append `data` as a regular file with fixed metadata so identical content
/// produces identical archives
pub fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| RegistryError::Io(format!("Failed to append {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_and_read_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.tar");

        let mut builder = Builder::new(File::create(&path).unwrap());
        append_entry(&mut builder, "first", b"alpha").unwrap();
        append_entry(&mut builder, "second", &vec![9u8; 1500]).unwrap();
        builder.into_inner().unwrap().sync_all().unwrap();

        let entries = index_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(read_entry(&path, entries["first"]).unwrap(), b"alpha");
        assert_eq!(read_entry(&path, entries["second"]).unwrap(), vec![9u8; 1500]);
    }

    #[test]
    fn test_truncated_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.tar");
        std::fs::write(&path, b"abc").unwrap();
        let location = EntryLocation { offset: 0, size: 10 };
        assert!(read_entry(&path, location).is_err());
    }

    #[test]
    fn test_index_keeps_entries_before_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.tar");

        let mut builder = Builder::new(File::create(&path).unwrap());
        append_entry(&mut builder, "first", b"alpha").unwrap();
        append_entry(&mut builder, "second", &vec![7u8; 4096]).unwrap();
        builder.into_inner().unwrap().sync_all().unwrap();

        let second = index_entries(&path).unwrap()["second"];
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(second.offset + 100).unwrap();
        drop(file);

        let entries = index_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(read_entry(&path, entries["first"]).unwrap(), b"alpha");
    }

    #[test]
    fn test_index_of_garbage_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.tar");
        std::fs::write(&path, b"definitely not a tar archive").unwrap();
        assert!(index_entries(&path).unwrap().is_empty());
    }
}
