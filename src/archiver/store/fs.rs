use super::ObjectStore;
use crate::error::RemoteError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

const TEMP_PREFIX: &str = ".upload-";

/// A bucket laid out as plain files under `root`. Writes go through a temp
/// file in the destination directory and a rename, so readers never see a
/// partially written object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, RemoteError> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(RemoteError::request(key, "invalid object key"));
        }
        Ok(self.root.join(rel))
    }

    fn write_atomic(&self, key: &str, from: &Path) -> Result<(), RemoteError> {
        let dest = self.path_for(key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| RemoteError::request(key, "object key has no parent"))?;
        fs::create_dir_all(parent).map_err(|err| RemoteError::request(key, err))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)
            .map_err(|err| RemoteError::request(key, err))?;
        copy_into(from, &mut tmp).map_err(|err| match err.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(from.display().to_string()),
            _ => RemoteError::request(key, err),
        })?;
        tmp.as_file()
            .sync_all()
            .map_err(|err| RemoteError::request(key, err))?;
        tmp.persist(&dest)
            .map_err(|err| RemoteError::request(key, err.error))?;
        Ok(())
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut cursor = path.parent();
        while let Some(dir) = cursor {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            cursor = dir.parent();
        }
    }
}

fn copy_into(from: &Path, tmp: &mut NamedTempFile) -> std::io::Result<()> {
    let mut src = fs::File::open(from)?;
    std::io::copy(&mut src, tmp.as_file_mut())?;
    Ok(())
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, body: &Path) -> Result<(), RemoteError> {
        self.write_atomic(key, body)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<(), RemoteError> {
        let from = self.path_for(src)?;
        if !from.is_file() {
            return Err(RemoteError::NotFound(src.to_string()));
        }
        self.write_atomic(dst, &from)
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                self.prune_empty_parents(&path);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RemoteError::request(key, err)),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(RemoteError::request(key, err)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|err| RemoteError::request(prefix, err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_copy_get_delete_list() {
        let tmp = tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path().join("bucket"));
        let body = tmp.path().join("body.json");
        fs::write(&body, "{\"bytes\":1}").expect("write");

        store.put("staging/s/2020/09/metadata.json", &body).expect("put");
        store
            .copy("staging/s/2020/09/metadata.json", "s/2020/09/metadata.json")
            .expect("copy");
        assert_eq!(
            store.list("s/").expect("list"),
            vec!["s/2020/09/metadata.json".to_string()]
        );
        assert_eq!(
            store.get("s/2020/09/metadata.json").expect("get"),
            Some(b"{\"bytes\":1}".to_vec())
        );

        store.delete("staging/s/2020/09/metadata.json").expect("delete");
        store.delete("staging/s/2020/09/metadata.json").expect("delete twice");
        assert_eq!(store.get("staging/s/2020/09/metadata.json").expect("get"), None);
        assert!(!tmp.path().join("bucket/staging").exists());
    }

    #[test]
    fn copy_of_missing_object_is_not_found() {
        let tmp = tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path());
        let err = store.copy("nope", "dst").unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        let tmp = tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path());
        assert!(store.get("../etc/passwd").is_err());
        assert!(store.get("/abs").is_err());
    }
}
