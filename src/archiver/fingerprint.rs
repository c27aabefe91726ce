//! Content fingerprint of a crawl directory.
//!
//! The checksum depends only on relative paths and file contents. Entries are
//! visited sorted by name at every level, so the same tree hashes the same
//! on any filesystem and from any absolute location.

use crate::error::ArchiverError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::Path;
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub checksum: String,
    pub bytes: u64,
    pub files: u64,
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn stream_file(path: &Path, hasher: &mut Xxh3, buf: &mut [u8]) -> Result<u64> {
    let mut file = fs::File::open(path).map_err(|err| ArchiverError::io(path, err))?;
    let mut total = 0u64;
    loop {
        let n = match file.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(ArchiverError::io(path, err).into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

pub fn fingerprint(root: &Path) -> Result<Fingerprint> {
    let meta = fs::metadata(root).map_err(|err| ArchiverError::io(root, err))?;
    if !meta.is_dir() {
        return Err(ArchiverError::io(root, std::io::Error::other("not a directory")).into());
    }

    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;
    let mut files = 0u64;

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            ArchiverError::io(path, err.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        hasher.update(relative_key(root, entry.path()).as_bytes());
        hasher.update(&[0]);
        let size = stream_file(entry.path(), &mut hasher, &mut buf)?;
        hasher.update(&size.to_le_bytes());

        bytes += size;
        files += 1;
    }

    Ok(Fingerprint {
        checksum: format!("{:032x}", hasher.digest128()),
        bytes,
        files,
    })
}
