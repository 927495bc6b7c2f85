//! Runs with the process wide stop flag set, so every test here expects it.

use std::{
    cell::Cell,
    fs::{create_dir_all, read_dir, set_permissions, write, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use trial_runner::{
    config::Config,
    filestore::{path_str, LocalStore},
    fuzz_process::FuzzOutcome,
    fuzzers::{FuzzerAdapter, Invocation},
    trial::{TrialRunner, CORPUS_DIRNAME},
    util::{retry_exec, stop_req, RetryPolicy},
};

struct Sleeper;

impl FuzzerAdapter for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn build_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn fuzz_invocation(&self, _: &Path, _: &Path, _: &Path) -> Invocation {
        Invocation::new("sh").arg("-c").arg("sleep 30")
    }
}

#[test]
fn retry_gives_up_once_stopped() {
    stop_req();
    let calls = Cell::new(0);
    let policy = RetryPolicy {
        attempts: 3,
        delay: Duration::from_secs(10),
    };
    let start = Instant::now();
    let r: Result<(), String> = retry_exec(policy, "upload", || {
        calls.set(calls.get() + 1);
        Err("bucket unreachable".to_string())
    });
    assert!(r.is_err());
    assert_eq!(calls.get(), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn stopped_trial_ends_with_one_final_sync() {
    stop_req();
    let tmp = tempfile::tempdir().unwrap();
    let tmp = tmp.path();
    let out = tmp.join("out");
    create_dir_all(&out).unwrap();
    let target = out.join("png_fuzzer");
    write(&target, b"\x7fELF LLVMFuzzerTestOneInput").unwrap();
    set_permissions(&target, Permissions::from_mode(0o755)).unwrap();

    let config = Config {
        fuzzer: "sleeper".to_string(),
        benchmark: "libpng".to_string(),
        trial_id: 2,
        work_dir: tmp.join("work"),
        seed_corpus_dir: tmp.join("seeds"),
        output_corpus_dir: tmp.join("corpus"),
        fuzz_target_dir: out,
        benchmarks_dir: tmp.join("benchmarks"),
        max_total_time: Some(Duration::from_secs(60)),
        snapshot_period: Duration::from_millis(50),
        experiment: Some("exp".to_string()),
        experiment_filestore: Some(path_str(&tmp.join("filestore"))),
        ..Default::default()
    };

    let start = Instant::now();
    let mut runner =
        TrialRunner::new(config, Arc::new(Sleeper), Some(Box::new(LocalStore))).unwrap();
    let outcome = runner.conduct_trial().unwrap();
    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(outcome.fuzz, FuzzOutcome::Stopped);
    assert!(!outcome.errored);

    // the seed sync and the final sync, nothing in between
    assert_eq!(outcome.cycles, 1);
    let dir = PathBuf::from(runner.trial_dir().unwrap()).join(CORPUS_DIRNAME);
    let mut archives = read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    archives.sort();
    assert_eq!(
        archives,
        vec![
            "corpus-archive-0000.tar.gz".to_string(),
            "corpus-archive-0001.tar.gz".to_string()
        ]
    );
}
