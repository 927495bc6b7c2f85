//! Running the fuzz engine for the length of the trial.

use crate::{
    benchmark::{find_fuzz_target_binary, sanitizer_env},
    fuzzers::FuzzerAdapter,
    util::stop_soon,
};
use std::{
    ffi::OsString,
    path::PathBuf,
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};
use trial_proc::{execute, ChildOutput, ProcConfig};

/// How the fuzz process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzOutcome {
    /// No target binary to fuzz, nothing was started.
    MissingBinary,
    /// The engine exited cleanly on its own.
    Completed,
    /// Killed at the end of the fuzzing time.
    TimedOut,
    /// Killed because the runner was asked to stop.
    Stopped,
    Failed(ExitStatus),
    /// The engine could not be started or waited for.
    SpawnFailed,
}

impl FuzzOutcome {
    /// Outcomes that make the trial count as errored.
    pub fn is_error(&self) -> bool {
        matches!(self, FuzzOutcome::Failed(_) | FuzzOutcome::SpawnFailed)
    }
}

/// Everything the fuzz thread needs, owned so it can move there.
#[derive(Clone)]
pub struct FuzzRun {
    pub adapter: Arc<dyn FuzzerAdapter>,
    pub seed_corpus: PathBuf,
    pub output_corpus: PathBuf,
    pub fuzz_target_dir: PathBuf,
    pub fuzz_target: Option<String>,
    pub max_total_time: Option<Duration>,
    pub niceness: i32,
    pub bug_benchmark: bool,
    /// Let the engine write to our stdout instead of `log_file`.
    pub passthrough: bool,
    pub log_file: PathBuf,
}

pub fn run_fuzzer(run: &FuzzRun) -> FuzzOutcome {
    let target_binary =
        match find_fuzz_target_binary(&run.fuzz_target_dir, run.fuzz_target.as_deref()) {
            Some(t) => t,
            None => {
                log::error!(
                    "fuzz target binary not found in {}",
                    run.fuzz_target_dir.display()
                );
                return FuzzOutcome::MissingBinary;
            }
        };
    if run.max_total_time.is_none() {
        log::warn!("no max total time, fuzzing indefinitely");
    }

    if let Err(e) = run.adapter.prepare(&run.seed_corpus, &run.output_corpus) {
        log::error!("failed to prepare {}: {:#}", run.adapter.name(), e);
        return FuzzOutcome::SpawnFailed;
    }
    let inv = run
        .adapter
        .fuzz_invocation(&run.seed_corpus, &run.output_corpus, &target_binary);
    let mut env = inv.env.clone();
    if run.bug_benchmark {
        env.extend(
            sanitizer_env(true)
                .into_iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
    }
    let config = ProcConfig {
        timeout: run.max_total_time,
        output: if run.passthrough {
            ChildOutput::Inherit
        } else {
            ChildOutput::File(run.log_file.clone())
        },
        env,
        kill_children: true,
        ..Default::default()
    };

    let cmd = inv.niced_command(run.niceness);
    log::info!("fuzzing {} with {:?}", target_binary.display(), cmd);
    match execute(cmd, &config, stop_soon) {
        Ok(r) if r.failed() => {
            log::error!("fuzz process returned nonzero: {}", r.status);
            FuzzOutcome::Failed(r.status)
        }
        Ok(r) if r.timed_out => {
            log::info!("fuzzing time is up after {}s", r.elapsed.as_secs());
            FuzzOutcome::TimedOut
        }
        Ok(r) if r.stopped => {
            log::info!("fuzz process stopped on request");
            FuzzOutcome::Stopped
        }
        Ok(r) => {
            log::info!("fuzz process exited after {}s", r.elapsed.as_secs());
            FuzzOutcome::Completed
        }
        Err(e) => {
            log::error!("failed to run fuzz process: {}", e);
            FuzzOutcome::SpawnFailed
        }
    }
}
