use crate::archiver::paths::ArchiverPaths;
use crate::archiver::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// One decision or commit step, appended as a JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub crawl_id: String,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn audit_log_path(paths: &ArchiverPaths) -> PathBuf {
    paths.audit_dir.join("audit.jsonl")
}

pub fn append_event(
    paths: &ArchiverPaths,
    crawl_id: &str,
    phase: &str,
    status: &str,
    message: &str,
) -> Result<()> {
    fs::create_dir_all(&paths.audit_dir)
        .with_context(|| format!("failed to create {}", paths.audit_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        crawl_id: crawl_id.to_string(),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = audit_log_path(paths);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::paths::test_paths;
    use tempfile::tempdir;

    #[test]
    fn events_append_as_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let paths = test_paths(tmp.path());
        append_event(&paths, "s/20200902_052458", "decide", "archive", "new_period").expect("append");
        append_event(&paths, "s/20200903_000000", "decide", "skip", "same_period").expect("append");

        let raw = fs::read_to_string(audit_log_path(&paths)).expect("read");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["crawl_id"], "s/20200902_052458");
        assert_eq!(first["message"], "new_period");
    }
}
