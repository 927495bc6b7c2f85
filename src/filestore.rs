//! Experiment filestore access.
//!
//! The filestore is either a local directory or a `gs://` bucket reached through `gsutil`.
//! Locations are plain strings so remote URLs and local paths share one interface.

use crate::util::copy_dir;
use std::{
    fs::{self, create_dir_all},
    io::ErrorKind,
    path::Path,
    process::{Command, ExitStatus},
};
use thiserror::Error;

pub const GCS_PREFIX: &str = "gs://";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Copy(String),
    #[error("'{cmd}' exited with {status}: {stderr}")]
    Command {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Operations the trial needs from a filestore.
pub trait FileStore: Send + Sync {
    /// Copy `src` to `dst`, `recursive` copies a directory tree.
    fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), StoreError>;

    /// Delete `path` and everything below it. `force` ignores a missing `path` and failures.
    fn rm(&self, path: &str, force: bool) -> Result<(), StoreError>;

    /// Make `dst_dir` mirror the content of `src_dir`.
    fn rsync(&self, src_dir: &str, dst_dir: &str) -> Result<(), StoreError>;
}

/// Join with '/', the separator of local and remote locations alike.
pub fn join(base: &str, part: &str) -> String {
    let base = base.trim_end_matches('/');
    let part = part.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", part)
    } else {
        format!("{}/{}", base, part)
    }
}

pub fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Store serving `filestore`.
pub fn store_for(filestore: &str) -> Box<dyn FileStore> {
    if filestore.starts_with(GCS_PREFIX) {
        Box::new(GsutilStore::default())
    } else {
        Box::new(LocalStore)
    }
}

/// Filestore on a locally mounted directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStore;

impl FileStore for LocalStore {
    fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), StoreError> {
        let (src, dst) = (Path::new(src), Path::new(dst));
        if recursive {
            copy_dir(src, dst).map_err(|e| StoreError::Copy(format!("{:#}", e)))?;
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        Ok(())
    }

    fn rm(&self, path: &str, force: bool) -> Result<(), StoreError> {
        let p = Path::new(path);
        let ret = if p.is_dir() {
            fs::remove_dir_all(p)
        } else {
            fs::remove_file(p)
        };
        match ret {
            Ok(_) => Ok(()),
            Err(e) if force => {
                if e.kind() != ErrorKind::NotFound {
                    log::debug!("ignoring failed removal of {}: {}", path, e);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rsync(&self, src_dir: &str, dst_dir: &str) -> Result<(), StoreError> {
        self.rm(dst_dir, true)?;
        self.cp(src_dir, dst_dir, true)
    }
}

/// Filestore in Google Cloud Storage, driven by the `gsutil` command.
#[derive(Debug, Clone)]
pub struct GsutilStore {
    pub gsutil: String,
    /// Pass `-m` for parallel transfers.
    pub parallel: bool,
}

impl Default for GsutilStore {
    fn default() -> Self {
        Self {
            gsutil: "gsutil".to_string(),
            parallel: true,
        }
    }
}

impl GsutilStore {
    fn command(&self, sub: &str, flags: &[&str], args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.gsutil);
        if self.parallel {
            cmd.arg("-m");
        }
        cmd.arg(sub).args(flags).args(args);
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<(), StoreError> {
        log::debug!("running {:?}", cmd);
        let output = cmd.output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StoreError::Command {
                cmd: format!("{:?}", cmd),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl FileStore for GsutilStore {
    fn cp(&self, src: &str, dst: &str, recursive: bool) -> Result<(), StoreError> {
        let flags: &[&str] = if recursive { &["-r"] } else { &[] };
        self.run(self.command("cp", flags, &[src, dst]))
    }

    fn rm(&self, path: &str, force: bool) -> Result<(), StoreError> {
        let ret = self.run(self.command("rm", &["-r"], &[path]));
        match ret {
            Err(e) if force => {
                log::debug!("ignoring failed removal of {}: {}", path, e);
                Ok(())
            }
            r => r,
        }
    }

    fn rsync(&self, src_dir: &str, dst_dir: &str) -> Result<(), StoreError> {
        self.run(self.command("rsync", &["-d", "-r"], &[src_dir, dst_dir]))
    }
}
