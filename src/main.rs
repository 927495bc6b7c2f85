use env_logger::Env;
use std::{io::Write, path::PathBuf, time::Duration};
use structopt::StructOpt;
use trial_runner::{boot, config::Config, fuzzers::adapter_for};

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Run the trial (default).
    Run,
    /// Print the build environment of the fuzzer as KEY=VALUE lines.
    BuildEnv,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "trial-runner", about = "Run one fuzzing trial and sync its corpus.")]
struct Settings {
    #[structopt(subcommand)]
    cmd: Option<Cmd>,
    /// Fuzzer to run, e.g. afl, aflplusplus, libfuzzer.
    #[structopt(long, env = "FUZZER")]
    fuzzer: String,
    /// Benchmark to fuzz.
    #[structopt(long, env = "BENCHMARK", default_value = "")]
    benchmark: String,
    #[structopt(long, env = "TRIAL_ID", default_value = "0")]
    trial_id: u64,
    /// Directory of the seed corpus.
    #[structopt(long, env = "SEED_CORPUS_DIR", default_value = "seeds")]
    seed_corpus_dir: PathBuf,
    /// Directory the fuzzer writes its corpus into.
    #[structopt(long, env = "OUTPUT_CORPUS_DIR", default_value = "corpus")]
    output_corpus_dir: PathBuf,
    /// Name of the fuzz target binary.
    #[structopt(long, env = "FUZZ_TARGET")]
    fuzz_target: Option<String>,
    /// Directory of the built fuzz targets.
    #[structopt(long, env = "OUT", default_value = "/out")]
    fuzz_target_dir: PathBuf,
    /// Directory holding benchmark.yaml of each benchmark.
    #[structopt(long, env = "BENCHMARKS_DIR", default_value = "benchmarks")]
    benchmarks_dir: PathBuf,
    /// Fuzzing time in seconds, fuzz until killed if unset.
    #[structopt(long, env = "MAX_TOTAL_TIME")]
    max_total_time: Option<u64>,
    /// Seconds between two corpus snapshots.
    #[structopt(long, env = "SNAPSHOT_PERIOD", default_value = "900")]
    snapshot_period: u64,
    /// Start with an empty corpus.
    #[structopt(long, env = "NO_SEEDS", parse(try_from_str = parse_flag))]
    no_seeds: Option<bool>,
    /// Run standalone, without syncing to an experiment filestore.
    #[structopt(long, env = "FUZZ_OUTSIDE_EXPERIMENT", parse(try_from_str = parse_flag))]
    fuzz_outside_experiment: Option<bool>,
    #[structopt(long, env = "RUNNER_NICENESS", default_value = "0", allow_hyphen_values = true)]
    runner_niceness: i32,
    /// Group of the random corpus of micro experiments.
    #[structopt(long, env = "TRIAL_GROUP_NUM", default_value = "0")]
    trial_group_num: u64,
    /// Seed with a random corpus from the filestore.
    #[structopt(long, env = "MICRO_EXPERIMENT", parse(try_from_str = parse_flag))]
    micro_experiment: Option<bool>,
    /// Seed with the custom corpus of the benchmark from the filestore.
    #[structopt(long, env = "CUSTOM_SEED_CORPUS_DIR")]
    custom_seed_corpus_dir: Option<String>,
    /// Seed with the OSS-Fuzz corpus of the benchmark from the filestore.
    #[structopt(long, env = "OSS_FUZZ_CORPUS", parse(try_from_str = parse_flag))]
    oss_fuzz_corpus: Option<bool>,
    #[structopt(long, env = "EXPERIMENT")]
    experiment: Option<String>,
    /// gs:// bucket or local directory of the experiment.
    #[structopt(long, env = "EXPERIMENT_FILESTORE")]
    experiment_filestore: Option<String>,
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        _ => Err(format!("not a boolean: {}", s)),
    }
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("RUNNER_LOG", "info")
        .default_write_style_or("auto");
    let tag = format!(
        "{}/{}/trial-{}",
        settings.fuzzer, settings.benchmark, settings.trial_id
    );
    env_logger::Builder::from_env(log_env)
        .format(move |buf, record| {
            writeln!(
                buf,
                "[{} {:<5} runner {}] {}",
                buf.timestamp_seconds(),
                record.level(),
                tag,
                record.args()
            )
        })
        .init();

    match settings.cmd {
        Some(Cmd::BuildEnv) => {
            let adapter = match adapter_for(&settings.fuzzer) {
                Some(a) => a,
                None => anyhow::bail!("unknown fuzzer: {}", settings.fuzzer),
            };
            for (k, v) in adapter.build_env() {
                println!("{}={}", k, v);
            }
            Ok(())
        }
        Some(Cmd::Run) | None => {
            let config = Config {
                fuzzer: settings.fuzzer,
                benchmark: settings.benchmark,
                trial_id: settings.trial_id,
                seed_corpus_dir: settings.seed_corpus_dir,
                output_corpus_dir: settings.output_corpus_dir,
                fuzz_target: settings.fuzz_target.filter(|t| !t.is_empty()),
                fuzz_target_dir: settings.fuzz_target_dir,
                benchmarks_dir: settings.benchmarks_dir,
                max_total_time: settings.max_total_time.map(Duration::from_secs),
                snapshot_period: Duration::from_secs(settings.snapshot_period),
                no_seeds: settings.no_seeds.unwrap_or(false),
                fuzz_outside_experiment: settings.fuzz_outside_experiment.unwrap_or(false),
                runner_niceness: settings.runner_niceness,
                trial_group_num: settings.trial_group_num,
                micro_experiment: settings.micro_experiment.unwrap_or(false),
                custom_seed_corpus_dir: settings.custom_seed_corpus_dir.filter(|d| !d.is_empty()),
                oss_fuzz_corpus: settings.oss_fuzz_corpus.unwrap_or(false),
                experiment: settings.experiment,
                experiment_filestore: settings.experiment_filestore,
                ..Default::default()
            };
            let code = boot(config)?;
            std::process::exit(code)
        }
    }
}
