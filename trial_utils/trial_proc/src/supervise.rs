use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::{
    ffi::OsString,
    fs::File,
    os::unix::prelude::CommandExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Where stdout and stderr of the child go.
#[derive(Debug, Clone)]
pub enum ChildOutput {
    /// Share the terminal of the supervisor.
    Inherit,
    /// Truncate and write both streams into this file.
    File(PathBuf),
}

/// Configuration of one supervised execution.
#[derive(Debug, Clone)]
pub struct ProcConfig {
    /// Wall-clock deadline, `None` means wait until the child exits or a stop is requested.
    pub timeout: Option<Duration>,
    pub output: ChildOutput,
    /// Extra environment variables of the child.
    pub env: Vec<(OsString, OsString)>,
    /// Kill the whole process group of the child once it is done.
    pub kill_children: bool,
    /// Interval between two exit checks.
    pub poll_interval: Duration,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            output: ChildOutput::Inherit,
            env: Vec::new(),
            kill_children: true,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcResult {
    pub status: ExitStatus,
    /// The deadline expired and the child was killed.
    pub timed_out: bool,
    /// A stop was requested and the child was killed.
    pub stopped: bool,
    pub elapsed: Duration,
}

impl ProcResult {
    /// The child exited on its own with a nonzero status.
    pub fn failed(&self) -> bool {
        !self.timed_out && !self.stopped && !self.status.success()
    }
}

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to open output file '{path}': {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
    #[error("wait: {0}")]
    Wait(std::io::Error),
}

/// A spawned child living in its own session. Dropping the handle kills the child and every
/// process of its group.
pub struct ProcHandle {
    child: Option<Child>,
    kill_children: bool,
}

impl ProcHandle {
    pub fn spawn(mut cmd: Command, config: &ProcConfig) -> Result<Self, ProcError> {
        match &config.output {
            ChildOutput::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            ChildOutput::File(path) => {
                let open_err = |source| ProcError::Output {
                    path: path.clone(),
                    source,
                };
                let stdout = File::create(path).map_err(open_err)?;
                let stderr = stdout.try_clone().map_err(open_err)?;
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
        }
        cmd.stdin(Stdio::null());
        cmd.envs(config.env.iter().map(|(k, v)| (k, v)));
        unsafe {
            cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        log::debug!("spawn: {:?}", cmd);

        let child = cmd.spawn().map_err(ProcError::Spawn)?;
        Ok(Self {
            child: Some(child),
            kill_children: config.kill_children,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Returns the exit status if the child is done. The process group is cleaned up right
    /// after the child has been reaped.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcError> {
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        let status = child.try_wait().map_err(ProcError::Wait)?;
        if status.is_some() {
            let pid = child.id();
            self.child = None;
            if self.kill_children {
                kill_group(pid);
            }
        }
        Ok(status)
    }

    /// Kill the child and its group, then reap it.
    pub fn kill(&mut self) -> Result<Option<ExitStatus>, ProcError> {
        let mut child = match self.child.take() {
            Some(c) => c,
            None => return Ok(None),
        };
        kill_group(child.id());
        let _ = child.kill();
        child.wait().map(Some).map_err(ProcError::Wait)
    }
}

impl Drop for ProcHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

fn kill_group(pid: u32) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::trace!("killpg({}): {}", pid, e);
    }
}

/// Run `cmd` until it exits, the deadline of `config` expires or `stop_soon` returns true,
/// whatever happens first. Only spawning and waiting can fail, the exit status of the child is
/// reported in the result.
pub fn execute<F>(cmd: Command, config: &ProcConfig, stop_soon: F) -> Result<ProcResult, ProcError>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let deadline = config.timeout.map(|t| start + t);
    let mut handle = ProcHandle::spawn(cmd, config)?;

    loop {
        if let Some(status) = handle.try_wait()? {
            return Ok(ProcResult {
                status,
                timed_out: false,
                stopped: false,
                elapsed: start.elapsed(),
            });
        }

        let now = Instant::now();
        let expired = deadline.map_or(false, |d| now >= d);
        if expired || stop_soon() {
            if expired {
                log::info!("deadline expired after {}s, killing", start.elapsed().as_secs());
            } else {
                log::info!("stop requested, killing");
            }
            let status = handle.kill()?.ok_or_else(|| {
                ProcError::Wait(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "child already reaped",
                ))
            })?;
            return Ok(ProcResult {
                status,
                timed_out: expired,
                stopped: !expired,
                elapsed: start.elapsed(),
            });
        }

        let mut wait = config.poll_interval;
        if let Some(d) = deadline {
            wait = wait.min(d - now);
        }
        sleep(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use std::fs::read_to_string;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn nonzero_exit_is_failure() {
        let r = execute(sh("exit 3"), &ProcConfig::default(), || false).unwrap();
        assert!(r.failed());
        assert_eq!(r.status.code(), Some(3));
        assert!(!r.timed_out);
    }

    #[test]
    fn clean_exit() {
        let r = execute(sh("true"), &ProcConfig::default(), || false).unwrap();
        assert!(!r.failed());
        assert!(r.status.success());
    }

    #[test]
    fn deadline_kills_child() {
        let config = ProcConfig {
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let r = execute(sh("sleep 30"), &config, || false).unwrap();
        assert!(r.timed_out);
        assert!(!r.failed());
        assert!(r.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn stop_request_kills_child() {
        let stop = AtomicBool::new(false);
        let config = ProcConfig::default();
        let start = Instant::now();
        let r = execute(sh("sleep 30"), &config, || {
            if start.elapsed() > Duration::from_millis(200) {
                stop.store(true, Ordering::Relaxed);
            }
            stop.load(Ordering::Relaxed)
        })
        .unwrap();
        assert!(r.stopped);
        assert!(!r.timed_out);
        assert!(!r.failed());
    }

    #[test]
    fn output_goes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let config = ProcConfig {
            output: ChildOutput::File(log.clone()),
            env: vec![("TRIAL_PROC_GREETING".into(), "hello".into())],
            ..Default::default()
        };
        let r = execute(
            sh("echo $TRIAL_PROC_GREETING; echo oops >&2"),
            &config,
            || false,
        )
        .unwrap();
        assert!(r.status.success());
        let content = read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[test]
    fn descendants_are_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let config = ProcConfig {
            timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let r = execute(sh(&script), &config, || false).unwrap();
        assert!(r.timed_out);
        let pid: i32 = read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        // the grandchild may need a moment to be reaped by init
        let mut gone = false;
        for _ in 0..50 {
            if kill(Pid::from_raw(pid), None).is_err() || is_zombie(pid) {
                gone = true;
                break;
            }
            sleep(Duration::from_millis(20));
        }
        assert!(gone, "grandchild {} survived", pid);
    }

    fn is_zombie(pid: i32) -> bool {
        // state is the first field after the parenthesized command name
        read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|s| s.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
            .unwrap_or(true)
    }

    #[test]
    fn spawn_failure_is_reported() {
        let cmd = Command::new("/nonexistent/trial-proc-binary");
        let r = execute(cmd, &ProcConfig::default(), || false);
        assert!(matches!(r, Err(ProcError::Spawn(_))));
    }
}
