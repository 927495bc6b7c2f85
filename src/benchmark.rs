//! Benchmark metadata and fuzz target lookup.

use anyhow::Context;
use serde::Deserialize;
use std::{
    fs::{self, read_dir, read_to_string},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Symbol every libFuzzer style target defines.
pub const FUZZ_TARGET_SEARCH_STRING: &[u8] = b"LLVMFuzzerTestOneInput";

/// Name of the target binary older builds use.
pub const LEGACY_FUZZ_TARGET: &str = "fuzzer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkType {
    /// Measured by coverage.
    Code,
    /// Measured by bugs found, targets run with sanitizers tuned for fuzzing.
    Bug,
}

impl Default for BenchmarkType {
    fn default() -> Self {
        BenchmarkType::Code
    }
}

/// The part of `benchmark.yaml` the runner cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub fuzz_target: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: BenchmarkType,
}

impl BenchmarkConfig {
    pub fn is_bug_benchmark(&self) -> bool {
        self.kind == BenchmarkType::Bug
    }
}

/// Load `<benchmarks_dir>/<benchmark>/benchmark.yaml`, a missing file means a code benchmark
/// with no extra metadata.
pub fn load_benchmark_config(
    benchmarks_dir: &Path,
    benchmark: &str,
) -> anyhow::Result<BenchmarkConfig> {
    let path = benchmarks_dir.join(benchmark).join("benchmark.yaml");
    if !path.is_file() {
        log::debug!("no {}, assuming a code benchmark", path.display());
        return Ok(BenchmarkConfig::default());
    }
    let content =
        read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Find the fuzz target in `dir`. A named target must exist as is; otherwise the legacy
/// `fuzzer` binary is used, and failing that the first executable that defines
/// [`FUZZ_TARGET_SEARCH_STRING`], in name order.
pub fn find_fuzz_target_binary(dir: &Path, name: Option<&str>) -> Option<PathBuf> {
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        let p = dir.join(name);
        return if p.is_file() { Some(p) } else { None };
    }
    let legacy = dir.join(LEGACY_FUZZ_TARGET);
    if legacy.is_file() {
        return Some(legacy);
    }

    let mut candidates = read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect::<Vec<_>>();
    candidates.sort();
    candidates.into_iter().find(|p| is_fuzz_target(p))
}

fn is_fuzz_target(p: &Path) -> bool {
    let executable = fs::metadata(p)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        return false;
    }
    match fs::read(p) {
        Ok(content) => content
            .windows(FUZZ_TARGET_SEARCH_STRING.len())
            .any(|w| w == FUZZ_TARGET_SEARCH_STRING),
        Err(_) => false,
    }
}

const ASAN_FUZZ_OPTIONS: &[(&str, &str)] = &[
    ("abort_on_error", "1"),
    ("allocator_may_return_null", "1"),
    ("allocator_release_to_os_interval_ms", "500"),
    ("detect_leaks", "1"),
    ("detect_odr_violation", "0"),
    ("detect_stack_use_after_return", "1"),
    ("handle_abort", "2"),
    ("handle_segv", "2"),
    ("handle_sigbus", "2"),
    ("handle_sigfpe", "2"),
    ("handle_sigill", "2"),
    ("malloc_fill_byte", "0"),
    ("max_uar_stack_size_log", "16"),
    ("quarantine_size_mb", "64"),
    ("strict_memcmp", "1"),
    ("symbolize", "1"),
    ("use_sigaltstack", "1"),
];

const UBSAN_FUZZ_OPTIONS: &[(&str, &str)] = &[
    ("allocator_release_to_os_interval_ms", "500"),
    ("handle_abort", "2"),
    ("handle_segv", "2"),
    ("handle_sigbus", "2"),
    ("handle_sigfpe", "2"),
    ("handle_sigill", "2"),
    ("print_stacktrace", "1"),
    ("print_summary", "1"),
    ("silence_unsigned_overflow", "1"),
    ("symbolize", "1"),
];

fn join_options(opts: &[(&str, &str)]) -> String {
    opts.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(":")
}

/// Sanitizer environment of bug benchmarks. Fuzz runs leave crash handling to the engine.
pub fn sanitizer_env(is_fuzz_run: bool) -> Vec<(String, String)> {
    let mut asan = join_options(ASAN_FUZZ_OPTIONS);
    let mut ubsan = join_options(UBSAN_FUZZ_OPTIONS);
    let extra = if is_fuzz_run {
        "dedup_token_length=3"
    } else {
        "exitcode=1"
    };
    for opts in [&mut asan, &mut ubsan].iter_mut() {
        opts.push(':');
        opts.push_str(extra);
    }
    vec![
        ("ASAN_OPTIONS".to_string(), asan),
        ("UBSAN_OPTIONS".to_string(), ubsan),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, set_permissions, write, Permissions};

    #[test]
    fn bug_benchmark_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("libxml2_bug");
        create_dir_all(&dir).unwrap();
        write(
            dir.join("benchmark.yaml"),
            "project: libxml2\nfuzz_target: xml\ntype: bug\nunsupported_fuzzers:\n  - x\n",
        )
        .unwrap();
        let c = load_benchmark_config(tmp.path(), "libxml2_bug").unwrap();
        assert!(c.is_bug_benchmark());
        assert_eq!(c.fuzz_target.as_deref(), Some("xml"));

        let missing = load_benchmark_config(tmp.path(), "nope").unwrap();
        assert!(!missing.is_bug_benchmark());
    }

    #[test]
    fn bad_yaml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("b");
        create_dir_all(&dir).unwrap();
        write(dir.join("benchmark.yaml"), "type: [").unwrap();
        assert!(load_benchmark_config(tmp.path(), "b").is_err());
    }

    fn exe(p: &Path, content: &[u8]) {
        write(p, content).unwrap();
        set_permissions(p, Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn target_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        exe(&out.join("afl-fuzz"), b"\x7fELF no symbol here");
        exe(&out.join("png_fuzzer"), b"\x7fELF..LLVMFuzzerTestOneInput..");
        write(out.join("data_LLVMFuzzerTestOneInput"), b"LLVMFuzzerTestOneInput").unwrap();

        assert_eq!(
            find_fuzz_target_binary(out, None),
            Some(out.join("png_fuzzer"))
        );
        assert_eq!(
            find_fuzz_target_binary(out, Some("afl-fuzz")),
            Some(out.join("afl-fuzz"))
        );
        assert_eq!(find_fuzz_target_binary(out, Some("missing")), None);

        exe(&out.join("fuzzer"), b"legacy");
        assert_eq!(find_fuzz_target_binary(out, None), Some(out.join("fuzzer")));
    }

    #[test]
    fn fuzz_run_sanitizer_options() {
        let env = sanitizer_env(true);
        let asan = &env.iter().find(|(k, _)| k == "ASAN_OPTIONS").unwrap().1;
        assert!(asan.contains("abort_on_error=1"));
        assert!(asan.ends_with("dedup_token_length=3"));
        assert!(!asan.contains("exitcode"));
        assert!(env.iter().any(|(k, _)| k == "UBSAN_OPTIONS"));
    }
}
