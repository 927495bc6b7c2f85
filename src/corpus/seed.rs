//! Seed corpus acquisition and cleanup.

use super::CORPUS_ELEMENT_BYTES_LIMIT;
use crate::{
    config::Config,
    filestore::{path_str, FileStore},
    util::{file_hash, recreate_dir},
};
use anyhow::Context;
use std::{
    collections::HashSet,
    ffi::OsString,
    fs::{self, create_dir_all, File},
    io,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;
use zip::ZipArchive;

/// Suffix of the seed archive shipped next to a fuzz target.
pub const SEED_CORPUS_ARCHIVE_SUFFIX: &str = "_seed_corpus.zip";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    /// Distinct seeds left in the directory.
    pub kept: usize,
    pub removed_oversized: usize,
    /// Renames that failed, `(from, to)`.
    pub failed_moves: Vec<(PathBuf, PathBuf)>,
}

/// Flatten `seed_dir` into content addressed files: every file is renamed to the hex sha1 of
/// its content at the top level, so duplicates collapse into one. Files above
/// [`CORPUS_ELEMENT_BYTES_LIMIT`] are deleted. With `no_seeds` the directory is just emptied.
pub fn prepare_seed_corpus(seed_dir: &Path, no_seeds: bool) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();
    if !seed_dir.exists() {
        return Ok(report);
    }
    if no_seeds {
        log::info!("NO_SEEDS set, deleting seeds in {}", seed_dir.display());
        recreate_dir(seed_dir)?;
        return Ok(report);
    }

    let files = WalkDir::new(seed_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect::<Vec<_>>();

    let mut names = HashSet::new();
    for path in files {
        let size = match fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) => {
                log::warn!("failed to stat seed {}: {}", path.display(), e);
                continue;
            }
        };
        if size > CORPUS_ELEMENT_BYTES_LIMIT {
            log::warn!(
                "removing seed {} of {} bytes, limit is {}",
                path.display(),
                size,
                CORPUS_ELEMENT_BYTES_LIMIT
            );
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("failed to remove {}: {}", path.display(), e);
            }
            report.removed_oversized += 1;
            continue;
        }

        let hash = match file_hash(&path) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("failed to hash seed {}: {}", path.display(), e);
                continue;
            }
        };
        let dst = seed_dir.join(&hash);
        if path != dst {
            if let Err(e) = fs::rename(&path, &dst) {
                log::debug!("rename {} -> {}: {}", path.display(), dst.display(), e);
                report.failed_moves.push((path, dst));
                continue;
            }
        }
        names.insert(hash);
    }

    report.kept = names.len();
    if !report.failed_moves.is_empty() {
        log::error!(
            "failed to move {} seeds: {:?}",
            report.failed_moves.len(),
            report.failed_moves
        );
    }
    log::info!(
        "seed corpus ready: {} seeds, {} removed for size",
        report.kept,
        report.removed_oversized
    );
    Ok(report)
}

/// `<target without extension>_seed_corpus.zip` if it exists.
pub fn seed_corpus_archive_path(target_binary: &Path) -> Option<PathBuf> {
    let mut name = OsString::from(target_binary.with_extension(""));
    name.push(SEED_CORPUS_ARCHIVE_SUFFIX);
    let p = PathBuf::from(name);
    if p.is_file() {
        Some(p)
    } else {
        None
    }
}

/// Extract the regular entries of a zip `archive` flat into `seed_dir` under zero padded
/// index names. Returns the number of seeds written.
pub fn unpack_seed_archive(archive: &Path, seed_dir: &Path) -> anyhow::Result<usize> {
    let f = File::open(archive)
        .with_context(|| format!("failed to open seed archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(f)
        .with_context(|| format!("failed to read seed archive {}", archive.display()))?;
    create_dir_all(seed_dir)
        .with_context(|| format!("failed to create {}", seed_dir.display()))?;

    log::info!("unpacking seed corpus {}", archive.display());
    let mut idx = 0;
    for i in 0..zip.len() {
        let mut entry = match zip.by_index(i) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("failed to read seed entry {}: {}", i, e);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        if entry.size() > CORPUS_ELEMENT_BYTES_LIMIT {
            log::warn!(
                "skipping seed {} of {} bytes, limit is {}",
                entry.name(),
                entry.size(),
                CORPUS_ELEMENT_BYTES_LIMIT
            );
            continue;
        }
        let dst = seed_dir.join(format!("{:016}", idx));
        let ret = File::create(&dst).and_then(|mut out| io::copy(&mut entry, &mut out));
        match ret {
            Ok(_) => idx += 1,
            Err(e) => {
                log::warn!("failed to unpack seed {}: {}", entry.name(), e);
                let _ = fs::remove_file(&dst);
            }
        }
    }
    log::info!("unarchived {} files from {}", idx, archive.display());
    Ok(idx)
}

fn fetch_dir(store: Option<&dyn FileStore>, src: &str, seed_dir: &Path) -> anyhow::Result<()> {
    let store = store.context("no filestore to fetch seeds from")?;
    if seed_dir.exists() {
        fs::remove_dir_all(seed_dir)
            .with_context(|| format!("failed to remove {}", seed_dir.display()))?;
    }
    log::info!("copying seed corpus from {}", src);
    store
        .cp(src, &path_str(seed_dir), true)
        .with_context(|| format!("failed to copy seed corpus from {}", src))
}

/// Populate the seed directory from the source the configuration selects: random corpora of
/// micro experiments, a custom seed corpus, or the seed archive of the fuzz target.
pub fn acquire_seed_corpus(
    config: &Config,
    store: Option<&dyn FileStore>,
    target_binary: Option<&Path>,
) -> anyhow::Result<()> {
    let seed_dir = &config.seed_corpus_dir;
    create_dir_all(seed_dir).with_context(|| format!("failed to create {}", seed_dir.display()))?;

    if config.micro_experiment {
        let src = config
            .random_corpus_dir()
            .context("random corpora need an experiment filestore")?;
        return fetch_dir(store, &src, seed_dir);
    }
    if config.custom_seed_corpus_dir.is_some() {
        let src = config
            .custom_seed_corpus_dir()
            .context("custom seed corpora need an experiment filestore")?;
        return fetch_dir(store, &src, seed_dir);
    }

    let archive = if config.oss_fuzz_corpus {
        let src = config
            .oss_fuzz_corpus_archive()
            .context("oss-fuzz corpora need an experiment filestore")?;
        let store = store.context("no filestore to fetch the oss-fuzz corpus from")?;
        let dst = config
            .fuzz_target_dir
            .join(format!("{}.zip", config.benchmark));
        store
            .cp(&src, &path_str(&dst), false)
            .with_context(|| format!("failed to copy {}", src))?;
        Some(dst)
    } else {
        target_binary.and_then(seed_corpus_archive_path)
    };

    match archive {
        Some(a) => unpack_seed_archive(&a, seed_dir).map(|_| ()),
        None => {
            log::info!("no seed corpus archive found");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::LocalStore;
    use std::fs::{read_dir, read_to_string, write};
    use std::io::Write;
    use zip::{write::FileOptions, ZipWriter};

    fn listing(dir: &Path) -> Vec<String> {
        let mut names = read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn identical_seeds_collapse() {
        let tmp = tempfile::tempdir().unwrap();
        let seeds = tmp.path().join("seeds");
        create_dir_all(seeds.join("nested").join("deeper")).unwrap();
        write(seeds.join("a"), b"abc").unwrap();
        write(seeds.join("nested").join("b"), b"abc").unwrap();
        write(seeds.join("nested").join("deeper").join("c"), b"xyz").unwrap();

        let report = prepare_seed_corpus(&seeds, false).unwrap();
        assert_eq!(report.kept, 2);
        assert!(report.failed_moves.is_empty());
        let abc = "a9993e364706816aba3e25717850c26c9cd0d89d";
        assert_eq!(read_to_string(seeds.join(abc)).unwrap(), "abc");
        let files = listing(&seeds)
            .into_iter()
            .filter(|n| seeds.join(n).is_file())
            .collect::<Vec<_>>();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&abc.to_string()));
    }

    #[test]
    fn oversized_seeds_are_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let seeds = tmp.path().join("seeds");
        create_dir_all(&seeds).unwrap();
        let big = vec![b'x'; CORPUS_ELEMENT_BYTES_LIMIT as usize + 1];
        let max = vec![b'y'; CORPUS_ELEMENT_BYTES_LIMIT as usize];
        write(seeds.join("big"), &big).unwrap();
        write(seeds.join("max"), &max).unwrap();

        let report = prepare_seed_corpus(&seeds, false).unwrap();
        assert_eq!(report.removed_oversized, 1);
        assert_eq!(report.kept, 1);
        assert!(!seeds.join("big").exists());
        for name in listing(&seeds) {
            assert!(fs::metadata(seeds.join(name)).unwrap().len() <= CORPUS_ELEMENT_BYTES_LIMIT);
        }
    }

    #[test]
    fn already_prepared_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let seeds = tmp.path().join("seeds");
        create_dir_all(&seeds).unwrap();
        write(seeds.join("s"), b"seed").unwrap();
        prepare_seed_corpus(&seeds, false).unwrap();
        let first = listing(&seeds);
        let report = prepare_seed_corpus(&seeds, false).unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(listing(&seeds), first);
    }

    #[test]
    fn no_seeds_empties_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let seeds = tmp.path().join("seeds");
        create_dir_all(seeds.join("d")).unwrap();
        write(seeds.join("d").join("s"), b"seed").unwrap();
        let report = prepare_seed_corpus(&seeds, true).unwrap();
        assert_eq!(report, SeedReport::default());
        assert!(seeds.is_dir());
        assert!(listing(&seeds).is_empty());
    }

    #[test]
    fn missing_dir_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let seeds = tmp.path().join("missing");
        assert_eq!(
            prepare_seed_corpus(&seeds, false).unwrap(),
            SeedReport::default()
        );
        assert!(!seeds.exists());
    }

    fn write_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            match data {
                Some(d) => {
                    zip.start_file(*name, FileOptions::default()).unwrap();
                    zip.write_all(d).unwrap();
                }
                None => zip.add_directory(*name, FileOptions::default()).unwrap(),
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn seed_archive_next_to_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("fuzz_png");
        write(&target, b"bin").unwrap();
        assert!(seed_corpus_archive_path(&target).is_none());

        let archive = tmp.path().join("fuzz_png_seed_corpus.zip");
        write_zip(&archive, &[("a", Some(b"a"))]);
        assert_eq!(seed_corpus_archive_path(&target), Some(archive));
    }

    #[test]
    fn unpack_skips_dirs_and_oversized() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("s.zip");
        let big = vec![0_u8; CORPUS_ELEMENT_BYTES_LIMIT as usize + 1];
        write_zip(
            &archive,
            &[
                ("dir/", None),
                ("dir/one", Some(b"1")),
                ("big", Some(&big)),
                ("two", Some(b"2")),
            ],
        );
        let seeds = tmp.path().join("seeds");
        assert_eq!(unpack_seed_archive(&archive, &seeds).unwrap(), 2);
        assert_eq!(
            listing(&seeds),
            vec!["0000000000000000".to_string(), "0000000000000001".to_string()]
        );
        assert_eq!(read_to_string(seeds.join("0000000000000000")).unwrap(), "1");
    }

    #[test]
    fn custom_corpus_from_local_store() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("fs");
        let custom = remote
            .join("exp")
            .join("custom_seed_corpora")
            .join("bench");
        create_dir_all(&custom).unwrap();
        write(custom.join("s"), b"custom").unwrap();

        let config = Config {
            fuzzer: "afl".to_string(),
            benchmark: "bench".to_string(),
            experiment: Some("exp".to_string()),
            experiment_filestore: Some(path_str(&remote)),
            custom_seed_corpus_dir: Some("custom".to_string()),
            seed_corpus_dir: tmp.path().join("seeds"),
            ..Default::default()
        };
        write_stale(&config.seed_corpus_dir);
        acquire_seed_corpus(&config, Some(&LocalStore), None).unwrap();
        assert_eq!(listing(&config.seed_corpus_dir), vec!["s".to_string()]);
    }

    fn write_stale(dir: &Path) {
        create_dir_all(dir).unwrap();
        write(dir.join("stale"), b"old").unwrap();
    }

    #[test]
    fn no_archive_no_seeds() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            seed_corpus_dir: tmp.path().join("seeds"),
            ..Default::default()
        };
        acquire_seed_corpus(&config, None, None).unwrap();
        assert!(listing(&config.seed_corpus_dir).is_empty());
    }
}
