use anyhow::Context;
use sha1::{Digest, Sha1};
use std::{
    env::current_dir,
    fs::{self, create_dir_all, remove_dir_all, File},
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::{Duration, Instant},
};
use walkdir::WalkDir;

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

/// Sleep for `d`, returning early once a stop is requested.
pub fn sleep_unless_stopped(d: Duration) {
    const STEP: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + d;
    while !stop_soon() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(STEP.min(deadline - now));
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

/// Call `f` until it succeeds or the attempts of `policy` are used up, the last error is
/// returned in the latter case. Once a stop is requested no further attempt is made.
pub fn retry_exec<T, E, F>(policy: RetryPolicy, name: &str, mut f: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut tried = 1;
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) => {
                if tried < policy.attempts && !stop_soon() {
                    log::warn!(
                        "{} failed (attempt {}/{}): {:#}, retrying in {}s",
                        name,
                        tried,
                        policy.attempts,
                        e,
                        policy.delay.as_secs_f32()
                    );
                    sleep(policy.delay);
                    tried += 1;
                } else {
                    log::error!("{} failed after {} attempt(s): {:#}", name, tried, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Make `p` absolute against the current directory without touching the file system
/// otherwise. Symlinks are kept as they are.
pub fn absolute(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match current_dir() {
        Ok(cwd) => cwd.join(p),
        Err(_) => p.to_path_buf(),
    }
}

/// Delete `dir` if it exists and create it again, empty.
pub fn recreate_dir(dir: &Path) -> anyhow::Result<()> {
    if let Err(e) = remove_dir_all(dir) {
        if e.kind() != ErrorKind::NotFound {
            return Err(e).with_context(|| format!("failed to remove {}", dir.display()));
        }
    }
    create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

/// Copy everything under `from` into `to`, creating `to` and any missing parents. Existing
/// files are overwritten.
pub fn copy_dir(from: &Path, to: &Path) -> anyhow::Result<u64> {
    create_dir_all(to).with_context(|| format!("failed to create {}", to.display()))?;
    let mut copied = 0;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.with_context(|| format!("failed to walk {}", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("walked out of the source dir")?;
        let dst = to.join(rel);
        if entry.file_type().is_dir() {
            create_dir_all(&dst).with_context(|| format!("failed to create {}", dst.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dst).with_context(|| {
                format!(
                    "failed to copy {} -> {}",
                    entry.path().display(),
                    dst.display()
                )
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Make a sibling copy `<dir>-copy` of `dir` and return its path, the copy is a stable
/// snapshot of files that may still be written.
pub fn make_dir_copy(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut name = dir
        .file_name()
        .with_context(|| format!("no file name: {}", dir.display()))?
        .to_os_string();
    name.push("-copy");
    let copy = dir.with_file_name(name);
    recreate_dir(&copy)?;
    copy_dir(dir, &copy)?;
    Ok(copy)
}

/// Lowercase hex sha1 of the content of `path`.
pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
