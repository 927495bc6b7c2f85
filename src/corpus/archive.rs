//! Incremental corpus archives.
//!
//! Each cycle packs the elements modified after the previous archive into a gzipped tarball.
//! The engine keeps writing while we walk, so every per-file failure is expected and skipped;
//! only failing to create or finish the archive itself is an error.

use super::layout::{resolve, QUEUE_DIR};
use anyhow::Context;
use flate2::{write::GzEncoder, Compression};
use std::{
    fs::{self, File},
    io::{BufWriter, ErrorKind},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// Subdirectories of an engine output directory that hold corpus elements.
pub const ELEMENT_DIRS: [&str; 3] = [QUEUE_DIR, "crashes", "hangs"];

/// Name of the archive of `cycle`.
pub fn corpus_archive_name(cycle: u64) -> String {
    format!("corpus-archive-{:04}.tar.gz", cycle)
}

/// Latest modification time already captured by an archive. The initial watermark lies
/// before every possible mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Watermark(Option<SystemTime>);

impl Watermark {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn at(t: SystemTime) -> Self {
        Self(Some(t))
    }

    pub fn time(&self) -> Option<SystemTime> {
        self.0
    }

    /// Whether an element modified at `mtime` has not been archived yet.
    pub fn admits(&self, mtime: SystemTime) -> bool {
        match self.0 {
            Some(w) => mtime > w,
            None => true,
        }
    }

    /// Never moves backwards.
    pub fn advance(&mut self, mtime: SystemTime) {
        if self.admits(mtime) {
            self.0 = Some(mtime);
        }
    }
}

/// Lazily yields every file under the element directories of `root`.
pub fn corpus_elements(root: &Path) -> impl Iterator<Item = PathBuf> {
    let dirs = ELEMENT_DIRS
        .iter()
        .map(|d| root.join(d))
        .filter(|d| d.is_dir())
        .collect::<Vec<_>>();
    dirs.into_iter().flat_map(|d| {
        WalkDir::new(d)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
    })
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub archive: PathBuf,
    /// Directory the archive paths are relative to.
    pub corpus_root: PathBuf,
    pub watermark: Watermark,
    pub added: u64,
    /// Elements that disappeared between listing and reading.
    pub vanished: u64,
    pub failed: u64,
}

/// Write the elements of `output_corpus` modified after `watermark` into a new archive at
/// `archive`. Returns the advanced watermark along with some counters.
pub fn archive_corpus(
    output_corpus: &Path,
    archive: &Path,
    watermark: Watermark,
) -> anyhow::Result<ArchiveSummary> {
    let corpus_root = resolve(output_corpus).into_dir();
    archive_resolved_corpus(&corpus_root, archive, watermark)
}

/// [`archive_corpus`] for a `corpus_root` that is already resolved.
pub fn archive_resolved_corpus(
    corpus_root: &Path,
    archive: &Path,
    watermark: Watermark,
) -> anyhow::Result<ArchiveSummary> {
    if !corpus_root.join(QUEUE_DIR).is_dir() {
        sync_warn!(
            "no {}/ found in {}, archive may only hold crashes and hangs",
            QUEUE_DIR,
            corpus_root.display()
        );
    }

    let f = File::create(archive)
        .with_context(|| format!("failed to create archive {}", archive.display()))?;
    let mut tar = Builder::new(GzEncoder::new(BufWriter::new(f), Compression::default()));
    let mut summary = ArchiveSummary {
        archive: archive.to_path_buf(),
        corpus_root: corpus_root.to_path_buf(),
        watermark,
        added: 0,
        vanished: 0,
        failed: 0,
    };

    for path in corpus_elements(corpus_root) {
        match append_element(&mut tar, corpus_root, &path, watermark) {
            Ok(Some(mtime)) => {
                summary.watermark.advance(mtime);
                summary.added += 1;
            }
            Ok(None) => (),
            Err(e) if e.kind() == ErrorKind::NotFound => summary.vanished += 1,
            Err(e) => {
                sync_debug!("failed to archive {}: {}", path.display(), e);
                summary.failed += 1;
            }
        }
    }

    let gz = tar
        .into_inner()
        .with_context(|| format!("failed to finish archive {}", archive.display()))?;
    let w = gz
        .finish()
        .with_context(|| format!("failed to finish archive {}", archive.display()))?;
    w.into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .with_context(|| format!("failed to flush archive {}", archive.display()))?;

    if summary.failed != 0 {
        sync_warn!("{} corpus elements could not be archived", summary.failed);
    }
    sync_debug!(
        "archived {} elements ({} vanished) into {}",
        summary.added,
        summary.vanished,
        archive.display()
    );
    Ok(summary)
}

/// Append `path` if it is newer than `watermark`, returning its mtime. The content is read
/// up front so an element truncated while being archived still yields a consistent entry.
fn append_element<W: std::io::Write>(
    tar: &mut Builder<W>,
    root: &Path,
    path: &Path,
    watermark: Watermark,
) -> std::io::Result<Option<SystemTime>> {
    let meta = fs::metadata(path)?;
    let mtime = meta.modified()?;
    if !watermark.admits(mtime) {
        return Ok(None);
    }
    let data = fs::read(path)?;
    let name = path
        .strip_prefix(root)
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    let secs = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    header.set_mtime(secs);
    header.set_cksum();
    tar.append_data(&mut header, name, &data[..])?;
    Ok(Some(mtime))
}
