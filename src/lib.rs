//! Runner of a single fuzzing trial.

#[macro_use]
pub mod trial_log;
pub mod benchmark;
pub mod config;
pub mod corpus;
pub mod filestore;
pub mod fuzz_process;
pub mod fuzzers;
pub mod schedule;
pub mod trial;
pub mod util;

use crate::{
    config::Config,
    filestore::store_for,
    fuzzers::adapter_for,
    trial::{TrialOutcome, TrialRunner},
    util::stop_req,
};
use anyhow::Context;
use std::{os::raw::c_int, sync::Arc};

/// Run the trial `config` describes and return the exit code of the runner.
pub fn boot(config: Config) -> anyhow::Result<i32> {
    config.check().context("config error")?;
    let adapter = adapter_for(&config.fuzzer)
        .with_context(|| format!("unknown fuzzer: {}", config.fuzzer))?;
    let store = config.experiment_filestore.as_deref().map(store_for);

    if config.fuzz_outside_experiment {
        log::info!("doing trial outside of an experiment");
    } else {
        log::info!("doing trial as part of experiment");
    }
    setup_signal_handler().context("failed to install signal handler")?;

    let outcome = run_trial(config, Arc::from(adapter), store).map_err(|e| {
        log::error!("error doing trial");
        e
    })?;
    log::info!(
        "trial done after {} cycles, fuzzer: {:?}",
        outcome.cycles,
        outcome.fuzz
    );
    Ok(outcome.exit_code())
}

fn run_trial(
    config: Config,
    adapter: Arc<dyn fuzzers::FuzzerAdapter>,
    store: Option<Box<dyn filestore::FileStore>>,
) -> anyhow::Result<TrialOutcome> {
    let mut runner = TrialRunner::new(config, adapter, store)?;
    runner.conduct_trial()
}

fn setup_signal_handler() -> anyhow::Result<()> {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    std::thread::spawn(move || {
        if let Some(info) = signals.forever().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            log::info!("stopping the fuzzer, final sync follows");
            stop_req();
        }
    });
    Ok(())
}
