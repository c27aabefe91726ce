use super::ObjectStore;
use crate::error::RemoteError;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Put,
    Copy,
    Delete,
    Get,
    List,
}

/// In-process bucket with an operation log and one-shot failure injection.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RefCell<BTreeMap<String, Vec<u8>>>,
    log: RefCell<Vec<(Op, String)>>,
    /// Operation to fail, and how many of its calls to let through first.
    fail_on: RefCell<Option<(Op, usize)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call of `op` fails with a request error.
    pub fn fail_next(&self, op: Op) {
        self.fail_after(op, 0);
    }

    /// Lets `skip` calls of `op` succeed, then fails the one after.
    pub fn fail_after(&self, op: Op, skip: usize) {
        *self.fail_on.borrow_mut() = Some((op, skip));
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        self.objects
            .borrow_mut()
            .insert(key.to_string(), body.to_vec());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.borrow().keys().cloned().collect()
    }

    pub fn writes(&self) -> Vec<(Op, String)> {
        self.log
            .borrow()
            .iter()
            .filter(|(op, _)| matches!(op, Op::Put | Op::Copy | Op::Delete))
            .cloned()
            .collect()
    }

    fn enter(&self, op: Op, key: &str) -> Result<(), RemoteError> {
        self.log.borrow_mut().push((op, key.to_string()));
        let mut fail_on = self.fail_on.borrow_mut();
        match *fail_on {
            Some((target, 0)) if target == op => {
                *fail_on = None;
                Err(RemoteError::request(key, "injected failure"))
            }
            Some((target, skip)) if target == op => {
                *fail_on = Some((target, skip - 1));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, body: &Path) -> Result<(), RemoteError> {
        self.enter(Op::Put, key)?;
        let bytes = fs::read(body).map_err(|err| RemoteError::request(key, err))?;
        self.objects.borrow_mut().insert(key.to_string(), bytes);
        Ok(())
    }

    fn copy(&self, src: &str, dst: &str) -> Result<(), RemoteError> {
        self.enter(Op::Copy, dst)?;
        let body = self
            .objects
            .borrow()
            .get(src)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(src.to_string()))?;
        self.objects.borrow_mut().insert(dst.to_string(), body);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.enter(Op::Delete, key)?;
        self.objects.borrow_mut().remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.enter(Op::Get, key)?;
        Ok(self.objects.borrow().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        self.enter(Op::List, prefix)?;
        Ok(self
            .objects
            .borrow()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
