//! Locating the directory a fuzz engine really writes its queue, crashes and hangs into.
//!
//! Engines of the AFL family do not write into the output directory they are given: parallel
//! instances get a subdirectory each (`default`, `main`, `master`), older releases write right
//! into it, and forks invent their own names. [`resolve`] tries those layouts in a fixed order
//! and never fails, the nominal directory is the answer of last resort.

use crate::util::absolute;
use std::{
    fs::read_dir,
    path::{Path, PathBuf},
};

/// Instance directories of parallel fuzzing setups, in priority order.
pub const INSTANCE_DIRS: [&str; 3] = ["default", "main", "master"];

/// Files and directories only a running engine instance creates.
pub const INSTANCE_MARKERS: [&str; 4] = ["fuzzer_stats", "plot_data", "cmdline", "target_hash"];

pub const QUEUE_DIR: &str = "queue";

/// Resolved location of the engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusLayout {
    /// A conventional instance subdirectory.
    Known { dir: PathBuf, instance: &'static str },
    /// Artifacts live directly under the nominal directory.
    Legacy(PathBuf),
    /// Some other child of the nominal directory looks like an instance.
    Unknown(PathBuf),
    /// Nothing looked like engine output, this is the nominal directory.
    Unresolved(PathBuf),
}

impl CorpusLayout {
    pub fn dir(&self) -> &Path {
        match self {
            CorpusLayout::Known { dir, .. } => dir,
            CorpusLayout::Legacy(dir) => dir,
            CorpusLayout::Unknown(dir) => dir,
            CorpusLayout::Unresolved(dir) => dir,
        }
    }

    pub fn into_dir(self) -> PathBuf {
        match self {
            CorpusLayout::Known { dir, .. } => dir,
            CorpusLayout::Legacy(dir) => dir,
            CorpusLayout::Unknown(dir) => dir,
            CorpusLayout::Unresolved(dir) => dir,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, CorpusLayout::Unresolved(_))
    }
}

/// Read-only view of the file system used by the resolver.
pub trait LayoutProbe {
    fn is_dir(&self, p: &Path) -> bool;
    fn exists(&self, p: &Path) -> bool;
    /// Whether `dir` holds at least one regular file whose name does not start with a dot.
    /// Unreadable directories hold nothing.
    fn has_visible_file(&self, dir: &Path) -> bool;
    /// Immediate children of `dir`, any order.
    fn children(&self, dir: &Path) -> Vec<PathBuf>;
}

/// The real file system.
pub struct FsProbe;

impl LayoutProbe for FsProbe {
    fn is_dir(&self, p: &Path) -> bool {
        p.is_dir()
    }

    fn exists(&self, p: &Path) -> bool {
        p.exists()
    }

    fn has_visible_file(&self, dir: &Path) -> bool {
        let entries = match read_dir(dir) {
            Ok(e) => e,
            Err(_) => return false,
        };
        entries.filter_map(|e| e.ok()).any(|e| {
            // file_type does not follow symlinks
            let regular = e.file_type().map(|t| t.is_file()).unwrap_or(false);
            regular && !e.file_name().to_string_lossy().starts_with('.')
        })
    }

    fn children(&self, dir: &Path) -> Vec<PathBuf> {
        match read_dir(dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Whether `d` looks like the output directory of an engine instance that is or was running:
/// it needs a `queue` directory and either an instance marker or a real queue entry. A fresh
/// instance directory with an empty queue does not qualify.
pub fn looks_like_output_dir<P: LayoutProbe + ?Sized>(probe: &P, d: &Path) -> bool {
    if !probe.is_dir(d) {
        return false;
    }
    let queue = d.join(QUEUE_DIR);
    if !probe.is_dir(&queue) {
        return false;
    }
    if INSTANCE_MARKERS.iter().any(|m| probe.exists(&d.join(m))) {
        return true;
    }
    probe.has_visible_file(&queue)
}

fn is_hidden(p: &Path) -> bool {
    p.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Resolve the real output directory under `nominal`, first match wins.
pub fn resolve_with<P: LayoutProbe + ?Sized>(probe: &P, nominal: &Path) -> CorpusLayout {
    let nominal = absolute(nominal);

    for &instance in INSTANCE_DIRS.iter() {
        let cand = nominal.join(instance);
        if looks_like_output_dir(probe, &cand) {
            return CorpusLayout::Known {
                dir: cand,
                instance,
            };
        }
    }

    if looks_like_output_dir(probe, &nominal) {
        return CorpusLayout::Legacy(nominal);
    }

    // hidden children never count as an instance
    let mut children = probe
        .children(&nominal)
        .into_iter()
        .filter(|c| !is_hidden(c))
        .collect::<Vec<_>>();
    children.sort();
    for cand in children {
        if looks_like_output_dir(probe, &cand) {
            return CorpusLayout::Unknown(cand);
        }
    }

    CorpusLayout::Unresolved(nominal)
}

/// [`resolve_with`] against the real file system. An unresolved layout is logged since
/// archiving it may capture nothing or the wrong files.
pub fn resolve(nominal: &Path) -> CorpusLayout {
    let layout = resolve_with(&FsProbe, nominal);
    if !layout.is_resolved() {
        log::warn!(
            "no engine output layout recognized under {}, using it as is",
            layout.dir().display()
        );
    } else {
        log::debug!("output corpus resolved: {:?}", layout);
    }
    layout
}
