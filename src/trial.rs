//! One fuzzing trial: seed the corpus, fuzz in the background, snapshot and ship the corpus
//! every period until the engine is done.

use crate::{
    benchmark::{find_fuzz_target_binary, load_benchmark_config},
    config::Config,
    corpus::{
        archive::{archive_resolved_corpus, corpus_archive_name, Watermark},
        layout::resolve,
        seed::{acquire_seed_corpus, prepare_seed_corpus},
    },
    filestore::{join, path_str, FileStore},
    fuzz_process::{run_fuzzer, FuzzOutcome, FuzzRun},
    fuzzers::{validate_stats, FuzzerAdapter},
    schedule::SyncClock,
    trial_log::set_cycle,
    util::{
        absolute, copy_dir, make_dir_copy, recreate_dir, retry_exec, sleep_unless_stopped,
        stop_soon,
    },
};
use anyhow::Context;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Instant,
};

/// Remote subdirectory of the trial holding corpus archives.
pub const CORPUS_DIRNAME: &str = "corpus";
pub const RESULTS_DIRNAME: &str = "results";
pub const FUZZER_LOG: &str = "fuzzer-log.txt";

pub fn stats_file_name(cycle: u64) -> String {
    format!("stats-{:04}.json", cycle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Initializing,
    SeedingCorpus,
    Fuzzing,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialOutcome {
    pub fuzz: FuzzOutcome,
    /// Index of the last sync cycle.
    pub cycles: u64,
    pub errored: bool,
}

impl TrialOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.errored {
            1
        } else {
            0
        }
    }
}

pub struct TrialRunner {
    config: Config,
    adapter: Arc<dyn FuzzerAdapter>,
    store: Option<Box<dyn FileStore>>,
    /// Remote directory of this trial, `None` outside experiments.
    trial_dir: Option<String>,
    fuzz_target: Option<String>,
    bug_benchmark: bool,

    corpus_archives_dir: PathBuf,
    results_dir: PathBuf,
    log_file: PathBuf,

    state: TrialState,
    cycle: u64,
    errored: bool,
    watermark: Watermark,
    clock: SyncClock,
}

impl TrialRunner {
    pub fn new(
        mut config: Config,
        adapter: Arc<dyn FuzzerAdapter>,
        store: Option<Box<dyn FileStore>>,
    ) -> anyhow::Result<Self> {
        let trial_dir = if config.fuzz_outside_experiment {
            None
        } else {
            let dir = config
                .trial_dir()
                .context("trials inside an experiment need an experiment and its filestore")?;
            if store.is_none() {
                anyhow::bail!("no filestore to sync {} to", dir);
            }
            Some(dir)
        };
        let bench = load_benchmark_config(&config.benchmarks_dir, &config.benchmark)
            .context("failed to load benchmark config")?;

        config.work_dir = absolute(&config.work_dir);
        config.output_corpus_dir = absolute(&config.output_corpus_dir);
        config.seed_corpus_dir = absolute(&config.seed_corpus_dir);
        let results_dir = config.results_dir();
        Ok(Self {
            fuzz_target: config.fuzz_target.clone().or(bench.fuzz_target.clone()),
            bug_benchmark: bench.is_bug_benchmark(),
            corpus_archives_dir: config.corpus_archives_dir(),
            log_file: results_dir.join(FUZZER_LOG),
            results_dir,
            clock: SyncClock::new(config.snapshot_period),
            config,
            adapter,
            store,
            trial_dir,
            state: TrialState::Initializing,
            cycle: 0,
            errored: false,
            watermark: Watermark::new(),
        })
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn trial_dir(&self) -> Option<&str> {
        self.trial_dir.as_deref()
    }

    fn enter(&mut self, state: TrialState) {
        log::info!("trial state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn mark_errored(&mut self) {
        if !self.errored {
            log::error!("trial errored");
            self.errored = true;
        }
    }

    pub fn conduct_trial(&mut self) -> anyhow::Result<TrialOutcome> {
        self.initialize_directories()
            .context("failed to initialize directories")?;
        log::info!("starting trial");

        self.enter(TrialState::SeedingCorpus);
        let target_binary =
            find_fuzz_target_binary(&self.config.fuzz_target_dir, self.fuzz_target.as_deref());
        self.set_up_corpus_directories(target_binary.as_deref())
            .context("failed to set up corpus directories")?;

        self.enter(TrialState::Fuzzing);
        // the seeds, before the engine touches anything
        self.do_sync();

        let run = self.fuzz_run();
        let fuzz_thread = thread::Builder::new()
            .name("fuzz".to_string())
            .spawn(move || run_fuzzer(&run))
            .context("failed to spawn fuzz thread")?;
        if self.config.fuzz_outside_experiment {
            sleep_unless_stopped(self.config.startup_grace);
        }

        while !fuzz_thread.is_finished() && !stop_soon() {
            self.sleep_until_next_sync();
            if stop_soon() {
                log::info!("stop requested, the final sync takes the rest");
                break;
            }
            self.cycle += 1;
            set_cycle(self.cycle);
            self.do_sync();
        }

        self.enter(TrialState::Finalizing);
        // on a stop request the engine is still being killed
        let fuzz = fuzz_thread
            .join()
            .map_err(|_| anyhow::anyhow!("fuzz thread panicked"))?;
        if fuzz.is_error() {
            self.mark_errored();
        }
        // own cycle, an archive name is never uploaded twice
        self.cycle += 1;
        set_cycle(self.cycle);
        sync_info!("doing final sync");
        self.do_sync();

        self.enter(TrialState::Done);
        Ok(TrialOutcome {
            fuzz,
            cycles: self.cycle,
            errored: self.errored,
        })
    }

    fn initialize_directories(&self) -> anyhow::Result<()> {
        for dir in [
            &self.config.output_corpus_dir,
            &self.corpus_archives_dir,
            &self.results_dir,
        ]
        .iter()
        {
            recreate_dir(dir)?;
        }
        if let (Some(dir), Some(store)) = (&self.trial_dir, &self.store) {
            log::info!("removing old trial dir {}", dir);
            store
                .rm(dir, true)
                .with_context(|| format!("failed to remove {}", dir))?;
        }
        Ok(())
    }

    fn set_up_corpus_directories(&self, target_binary: Option<&Path>) -> anyhow::Result<()> {
        let seeds = &self.config.seed_corpus_dir;
        acquire_seed_corpus(&self.config, self.store.as_deref(), target_binary)
            .context("failed to acquire seed corpus")?;
        prepare_seed_corpus(seeds, self.config.no_seeds)?;

        let output = &self.config.output_corpus_dir;
        recreate_dir(output)?;
        let n = copy_dir(seeds, output)?;
        log::info!("{} seeds copied into {}", n, output.display());
        Ok(())
    }

    fn fuzz_run(&self) -> FuzzRun {
        FuzzRun {
            adapter: Arc::clone(&self.adapter),
            seed_corpus: self.config.seed_corpus_dir.clone(),
            output_corpus: self.config.output_corpus_dir.clone(),
            fuzz_target_dir: self.config.fuzz_target_dir.clone(),
            fuzz_target: self.fuzz_target.clone(),
            max_total_time: self.config.max_total_time,
            niceness: self.config.runner_niceness,
            bug_benchmark: self.bug_benchmark,
            passthrough: self.config.fuzz_outside_experiment,
            log_file: self.log_file.clone(),
        }
    }

    fn sleep_until_next_sync(&mut self) {
        let plan = self.clock.plan(Instant::now());
        if let Some(overrun) = plan.overrun {
            sync_warn!("next sync is overdue by {}s", overrun.as_secs_f32());
        }
        sync_debug!("sleeping for {}s", plan.duration.as_secs_f32());
        sleep_unless_stopped(plan.duration);
        self.clock.mark(Instant::now());
    }

    /// Archive and upload the corpus, then the results. Failures are logged and the cycle is
    /// given up, returns whether the sync went through.
    pub fn do_sync(&mut self) -> bool {
        set_cycle(self.cycle);
        match self.sync_once() {
            Ok(_) => {
                sync_debug!("finished sync");
                true
            }
            Err(e) => {
                sync_error!("failed to sync: {:#}", e);
                false
            }
        }
    }

    fn sync_once(&mut self) -> anyhow::Result<()> {
        let policy = self.config.retry;
        let corpus_root = resolve(&self.config.output_corpus_dir).into_dir();
        retry_exec(policy, "archive_and_save_corpus", || {
            self.archive_and_save_corpus(&corpus_root)
        })?;
        self.record_stats(&corpus_root);
        retry_exec(policy, "save_results", || self.save_results())
    }

    /// The watermark only moves once the archive is stored, a failed upload is archived
    /// again on retry.
    fn archive_and_save_corpus(&mut self, corpus_root: &Path) -> anyhow::Result<()> {
        let archive = self
            .corpus_archives_dir
            .join(corpus_archive_name(self.cycle));
        let summary = archive_resolved_corpus(corpus_root, &archive, self.watermark)?;
        self.save_corpus_archive(&archive)?;
        self.watermark = summary.watermark;
        Ok(())
    }

    fn save_corpus_archive(&self, archive: &Path) -> anyhow::Result<()> {
        let (dir, store) = match (&self.trial_dir, &self.store) {
            (Some(d), Some(s)) => (d, s),
            _ => return Ok(()),
        };
        let name = archive
            .file_name()
            .with_context(|| format!("bad archive path: {}", archive.display()))?;
        let dst = join(&join(dir, CORPUS_DIRNAME), &name.to_string_lossy());
        store
            .cp(&path_str(archive), &dst, false)
            .with_context(|| format!("failed to upload {}", archive.display()))?;
        fs::remove_file(archive)
            .with_context(|| format!("failed to remove {}", archive.display()))?;
        Ok(())
    }

    fn save_results(&self) -> anyhow::Result<()> {
        let (dir, store) = match (&self.trial_dir, &self.store) {
            (Some(d), Some(s)) => (d, s),
            _ => return Ok(()),
        };
        let copy = make_dir_copy(&self.results_dir)?;
        let dst = join(dir, RESULTS_DIRNAME);
        store
            .rsync(&path_str(&copy), &dst)
            .with_context(|| format!("failed to sync results to {}", dst))
    }

    /// Best effort, failures are only logged.
    fn record_stats(&self, corpus_root: &Path) {
        let stats = match self.adapter.stats(corpus_root, &self.log_file) {
            None => return,
            Some(Ok(s)) => s,
            Some(Err(e)) => {
                sync_warn!("no stats from {}: {:#}", self.adapter.name(), e);
                return;
            }
        };
        if let Err(e) = validate_stats(&stats) {
            sync_error!("invalid stats {}: {:#}", stats, e);
            return;
        }
        let path = self.results_dir.join(stats_file_name(self.cycle));
        if let Err(e) = fs::write(&path, stats) {
            sync_error!("failed to write {}: {}", path.display(), e);
        }
    }
}
