use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ArchiverPaths {
    pub home: PathBuf,
    pub cache_db: PathBuf,
    pub audit_dir: PathBuf,
    pub lock_file: PathBuf,
    pub config_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<ArchiverPaths> {
    let home = match env::var("ARCHIVER_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".crawl-archiver"),
    };

    let cache_db = env_or_default_path("ARCHIVER_CACHE_DB", home.join("cache.sqlite3"));
    let audit_dir = env_or_default_path("ARCHIVER_AUDIT_DIR", home.join("logs"));
    let config_file = env_or_default_path("ARCHIVER_CONFIG_PATH", home.join("config.toml"));
    let lock_file = home.join("crawl-archiver.lock");

    Ok(ArchiverPaths {
        home,
        cache_db,
        audit_dir,
        lock_file,
        config_file,
    })
}

#[cfg(test)]
pub fn test_paths(root: &std::path::Path) -> ArchiverPaths {
    let home = root.join("archiver");
    ArchiverPaths {
        cache_db: home.join("cache.sqlite3"),
        audit_dir: home.join("logs"),
        lock_file: home.join("crawl-archiver.lock"),
        config_file: home.join("config.toml"),
        home,
    }
}
