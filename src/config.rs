use crate::{filestore::join, fuzzers, util::RetryPolicy};
use std::{env::current_dir, path::PathBuf, time::Duration};

/// Seconds between two syncs if nothing else is configured.
pub const DEFAULT_SNAPSHOT_PERIOD: u64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub fuzzer: String,
    pub benchmark: String,
    pub trial_id: u64,
    /// Directory holding `corpus-archives` and `results`.
    pub work_dir: PathBuf,
    pub seed_corpus_dir: PathBuf,
    pub output_corpus_dir: PathBuf,
    pub fuzz_target: Option<String>,
    /// Directory of the built fuzz targets.
    pub fuzz_target_dir: PathBuf,
    pub benchmarks_dir: PathBuf,
    /// Deadline of the fuzz process, `None` fuzzes until killed.
    pub max_total_time: Option<Duration>,
    pub snapshot_period: Duration,
    pub no_seeds: bool,
    /// Standalone run: no remote sync, fuzzer output goes to our stdout.
    pub fuzz_outside_experiment: bool,
    pub runner_niceness: i32,
    pub trial_group_num: u64,
    pub micro_experiment: bool,
    pub custom_seed_corpus_dir: Option<String>,
    pub oss_fuzz_corpus: bool,
    pub experiment: Option<String>,
    pub experiment_filestore: Option<String>,

    /// Applied to every remote sync operation.
    pub retry: RetryPolicy,
    /// Sleep after starting the fuzzer in standalone mode.
    pub startup_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let cwd = current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            fuzzer: String::new(),
            benchmark: String::new(),
            trial_id: 0,
            seed_corpus_dir: cwd.join("seeds"),
            output_corpus_dir: cwd.join("corpus"),
            work_dir: cwd,
            fuzz_target: None,
            fuzz_target_dir: PathBuf::from("/out"),
            benchmarks_dir: PathBuf::from("benchmarks"),
            max_total_time: None,
            snapshot_period: Duration::from_secs(DEFAULT_SNAPSHOT_PERIOD),
            no_seeds: false,
            fuzz_outside_experiment: false,
            runner_niceness: 0,
            trial_group_num: 0,
            micro_experiment: false,
            custom_seed_corpus_dir: None,
            oss_fuzz_corpus: false,
            experiment: None,
            experiment_filestore: None,

            retry: RetryPolicy::default(),
            startup_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.fuzzer.is_empty() {
            anyhow::bail!("no fuzzer given");
        }
        if fuzzers::adapter_for(&self.fuzzer).is_none() {
            anyhow::bail!(
                "unknown fuzzer '{}', supported: {}",
                self.fuzzer,
                fuzzers::FUZZERS.join(", ")
            );
        }
        if self.benchmark.is_empty() {
            anyhow::bail!("no benchmark given");
        }
        if self.snapshot_period.as_secs_f64() <= 0.0 {
            anyhow::bail!("snapshot period must be positive");
        }
        if self.retry.attempts == 0 {
            anyhow::bail!("at least one sync attempt is needed");
        }
        if !self.fuzz_outside_experiment {
            if self.experiment.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("experiment name is required inside an experiment");
            }
            if self.experiment_filestore.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("experiment filestore is required inside an experiment");
            }
        }
        let needs_store = self.micro_experiment
            || self.custom_seed_corpus_dir.is_some()
            || self.oss_fuzz_corpus;
        if needs_store && self.experiment_filestore_path().is_none() {
            anyhow::bail!("remote seed corpora need an experiment and its filestore");
        }
        Ok(())
    }

    /// `<filestore>/<experiment>`
    pub fn experiment_filestore_path(&self) -> Option<String> {
        match (
            self.experiment_filestore.as_deref(),
            self.experiment.as_deref(),
        ) {
            (Some(fs), Some(exp)) if !fs.is_empty() && !exp.is_empty() => Some(join(fs, exp)),
            _ => None,
        }
    }

    /// Remote directory all outputs of this trial are synced into.
    pub fn trial_dir(&self) -> Option<String> {
        let base = self.experiment_filestore_path()?;
        let folder = join(&base, "experiment-folders");
        let bench_fuzzer = join(&folder, &format!("{}-{}", self.benchmark, self.fuzzer));
        Some(join(&bench_fuzzer, &format!("trial-{}", self.trial_id)))
    }

    pub fn random_corpus_dir(&self) -> Option<String> {
        let base = join(&self.experiment_filestore_path()?, "random_corpora");
        let bench = join(&base, &self.benchmark);
        Some(join(&bench, &format!("trial-group-{}", self.trial_group_num)))
    }

    pub fn custom_seed_corpus_dir(&self) -> Option<String> {
        let base = join(&self.experiment_filestore_path()?, "custom_seed_corpora");
        Some(join(&base, &self.benchmark))
    }

    pub fn oss_fuzz_corpus_archive(&self) -> Option<String> {
        let base = join(&self.experiment_filestore_path()?, "oss_fuzz_corpora");
        Some(join(&base, &format!("{}.zip", self.benchmark)))
    }

    pub fn corpus_archives_dir(&self) -> PathBuf {
        self.work_dir.join("corpus-archives")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.work_dir.join("results")
    }
}
