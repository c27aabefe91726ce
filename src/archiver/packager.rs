use crate::archiver::crawl::Crawl;
use crate::archiver::fingerprint::Fingerprint;
use crate::archiver::log_facts::LogFacts;
use crate::archiver::metadata::ArchiveMetadata;
use crate::error::ArchiverError;
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// The two blobs a commit uploads. Both live in temp files that are removed
/// when the package is dropped.
#[derive(Debug)]
pub struct Package {
    pub data: NamedTempFile,
    pub metadata: NamedTempFile,
    pub meta: ArchiveMetadata,
}

impl Package {
    pub fn data_path(&self) -> &Path {
        self.data.path()
    }

    pub fn metadata_path(&self) -> &Path {
        self.metadata.path()
    }
}

pub trait Packager {
    fn package(&self, crawl: &Crawl, data: &Fingerprint, log: &LogFacts) -> Result<Package>;
}

/// gzip-compressed tar of the crawl directory, plus its log file.
#[derive(Debug, Clone, Default)]
pub struct TarGzPackager {
    /// Where temp files are created; the system temp dir when `None`.
    pub scratch_dir: Option<std::path::PathBuf>,
}

impl TarGzPackager {
    fn temp_file(&self, suffix: &str) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("crawl-archiver-").suffix(suffix);
        let file = match self.scratch_dir.as_deref() {
            Some(dir) => builder
                .tempfile_in(dir)
                .map_err(|err| ArchiverError::io(dir, err))?,
            None => builder
                .tempfile()
                .map_err(|err| ArchiverError::io(std::env::temp_dir(), err))?,
        };
        Ok(file)
    }

    fn write_tarball(&self, crawl: &Crawl, out: &NamedTempFile) -> Result<()> {
        let file = out
            .reopen()
            .map_err(|err| ArchiverError::io(out.path(), err))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.follow_symlinks(false);

        let root = format!("{}/{}", crawl.source_id, crawl.data_version_label());
        tar.append_dir_all(&root, &crawl.local_path)
            .map_err(|err| ArchiverError::io(&crawl.local_path, err))?;

        if let Some(log) = crawl.log_path.as_deref()
            && log.is_file()
        {
            let name = log
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}.log", crawl.data_version_label()));
            tar.append_path_with_name(log, format!("{}/{name}", crawl.source_id))
                .map_err(|err| ArchiverError::io(log, err))?;
        }

        let encoder = tar
            .into_inner()
            .map_err(|err| ArchiverError::io(out.path(), err))?;
        let mut file = encoder
            .finish()
            .map_err(|err| ArchiverError::io(out.path(), err))?;
        file.flush()
            .map_err(|err| ArchiverError::io(out.path(), err))?;
        Ok(())
    }
}

impl Packager for TarGzPackager {
    fn package(&self, crawl: &Crawl, data: &Fingerprint, log: &LogFacts) -> Result<Package> {
        let meta = ArchiveMetadata {
            source_id: crawl.source_id.clone(),
            period: crawl.period().compact(),
            checksum: data.checksum.clone(),
            bytes: data.bytes,
            file_count: log.file_count,
            error_count: log.error_count,
        };

        let tarball = self.temp_file(".tar.gz")?;
        self.write_tarball(crawl, &tarball)
            .with_context(|| format!("failed to package crawl {crawl}"))?;

        let mut metadata = self.temp_file(".json")?;
        metadata
            .write_all(&meta.to_json()?)
            .map_err(|err| ArchiverError::io(metadata.path(), err))?;
        metadata
            .flush()
            .map_err(|err| ArchiverError::io(metadata.path(), err))?;

        tracing::debug!(
            source = %crawl.source_id,
            data_version = %crawl.data_version_label(),
            bytes = data.bytes,
            "packaged crawl"
        );
        Ok(Package {
            data: tarball,
            metadata,
            meta,
        })
    }
}
