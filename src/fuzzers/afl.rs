//! AFL and the forks that share its command line and output layout.

use super::{execs_per_sec_json, FuzzerAdapter, Invocation};
use anyhow::Context;
use std::{
    fs::{read_dir, read_to_string, write},
    path::{Path, PathBuf},
};

/// Engine binary, copied next to the fuzz target at build time.
pub const AFL_FUZZ: &str = "afl-fuzz";

#[derive(Debug, Clone)]
pub struct Afl {
    name: &'static str,
    /// Build environment.
    build: Vec<(&'static str, String)>,
    /// Extra run environment.
    run_env: Vec<(&'static str, &'static str)>,
    extra_args: Vec<&'static str>,
}

const COMMON_RUN_ENV: [(&str, &str); 5] = [
    ("AFL_NO_UI", "1"),
    ("AFL_SKIP_CPUFREQ", "1"),
    ("AFL_NO_AFFINITY", "1"),
    ("AFL_I_DONT_CARE_ABOUT_MISSING_CRASHES", "1"),
    ("AFL_SKIP_CRASHES", "1"),
];

impl Afl {
    pub fn classic() -> Self {
        Self {
            name: "afl",
            build: vec![
                ("CC", "clang".to_string()),
                ("CXX", "clang++".to_string()),
                ("CFLAGS", "-fsanitize-coverage=trace-pc-guard".to_string()),
                ("CXXFLAGS", "-fsanitize-coverage=trace-pc-guard".to_string()),
                ("FUZZER_LIB", "/libAFL.a".to_string()),
            ],
            run_env: vec![("AFL_SHUFFLE_QUEUE", "1")],
            extra_args: vec!["-d"],
        }
    }

    pub fn plusplus() -> Self {
        Self {
            name: "aflplusplus",
            build: vec![
                ("CC", "/afl/afl-clang-fast".to_string()),
                ("CXX", "/afl/afl-clang-fast++".to_string()),
                ("FUZZER_LIB", "/libAFLDriver.a".to_string()),
                ("AFL_LLVM_MODE", "1".to_string()),
                ("AFL_QUIET", "1".to_string()),
            ],
            run_env: vec![("AFL_FAST_CAL", "1"), ("AFL_CMPLOG_ONLY_NEW", "1")],
            extra_args: Vec::new(),
        }
    }

    /// AFL++ fork built from its own tree.
    pub fn funfuzz() -> Self {
        let root = Path::new("/funfuzz_repo/aflpp-fun");
        let path = |bin: &str| root.join(bin).to_string_lossy().into_owned();
        Self {
            name: "funfuzz",
            build: vec![
                ("CC", path("afl-clang-fast")),
                ("CXX", path("afl-clang-fast++")),
                ("AFL_LLVM_MODE", "1".to_string()),
                ("AFL_QUIET", "1".to_string()),
                ("AFL_PATH", root.to_string_lossy().into_owned()),
            ],
            run_env: vec![("AFL_FAST_CAL", "1")],
            extra_args: Vec::new(),
        }
    }

    fn engine(target_binary: &Path) -> PathBuf {
        target_binary.with_file_name(AFL_FUZZ)
    }
}

impl FuzzerAdapter for Afl {
    fn name(&self) -> &str {
        self.name
    }

    fn build_env(&self) -> Vec<(String, String)> {
        self.build
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// afl-fuzz refuses an empty input directory, give it one dummy seed.
    fn prepare(&self, input_corpus: &Path, _output_corpus: &Path) -> anyhow::Result<()> {
        let empty = read_dir(input_corpus)
            .map(|mut d| d.next().is_none())
            .unwrap_or(true);
        if empty {
            log::info!("empty seed corpus, adding a dummy seed for {}", self.name);
            std::fs::create_dir_all(input_corpus)?;
            write(input_corpus.join("default_seed"), b"hi")
                .context("failed to write dummy seed")?;
        }
        Ok(())
    }

    fn fuzz_invocation(
        &self,
        input_corpus: &Path,
        output_corpus: &Path,
        target_binary: &Path,
    ) -> Invocation {
        let mut inv = Invocation::new(Self::engine(target_binary))
            .arg("-i")
            .arg(input_corpus)
            .arg("-o")
            .arg(output_corpus)
            .arg("-m")
            .arg("none")
            .arg("-t")
            .arg("1000+");
        for a in self.extra_args.iter() {
            inv = inv.arg(a);
        }
        inv = inv.arg("--").arg(target_binary).arg("2147483647");
        for (k, v) in COMMON_RUN_ENV.iter().chain(self.run_env.iter()) {
            inv = inv.env(k, v);
        }
        inv
    }

    fn stats(&self, output_corpus: &Path, _log_file: &Path) -> Option<anyhow::Result<String>> {
        Some(parse_fuzzer_stats(&output_corpus.join("fuzzer_stats")))
    }
}

/// Pull `execs_per_sec` out of an afl `fuzzer_stats` file.
fn parse_fuzzer_stats(path: &Path) -> anyhow::Result<String> {
    let content =
        read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    for l in content.lines() {
        let mut kv = l.splitn(2, ':');
        let (k, v) = match (kv.next(), kv.next()) {
            (Some(k), Some(v)) => (k.trim(), v.trim()),
            _ => continue,
        };
        if k == "execs_per_sec" {
            let v: f64 = v
                .parse()
                .with_context(|| format!("bad execs_per_sec: {}", v))?;
            return Ok(execs_per_sec_json(v));
        }
    }
    anyhow::bail!("no execs_per_sec in {}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::create_dir_all;

    #[test]
    fn invocation_layout() {
        let inv = Afl::plusplus().fuzz_invocation(
            Path::new("/seeds"),
            Path::new("/corpus"),
            Path::new("/out/png_fuzzer"),
        );
        assert_eq!(inv.program, "/out/afl-fuzz");
        let args = inv
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(&args[..4], ["-i", "/seeds", "-o", "/corpus"]);
        assert_eq!(&args[args.len() - 3..], ["--", "/out/png_fuzzer", "2147483647"]);
        assert!(inv.env.iter().any(|(k, _)| k == "AFL_NO_UI"));
    }

    #[test]
    fn funfuzz_build_env() {
        let env = Afl::funfuzz().build_env();
        assert!(env.contains(&(
            "CC".to_string(),
            "/funfuzz_repo/aflpp-fun/afl-clang-fast".to_string()
        )));
        assert!(env.contains(&(
            "AFL_PATH".to_string(),
            "/funfuzz_repo/aflpp-fun".to_string()
        )));
    }

    #[test]
    fn dummy_seed_for_empty_input() {
        let tmp = tempfile::tempdir().unwrap();
        let seeds = tmp.path().join("seeds");
        create_dir_all(&seeds).unwrap();
        let afl = Afl::classic();
        afl.prepare(&seeds, tmp.path()).unwrap();
        assert!(seeds.join("default_seed").is_file());

        // a populated corpus is left alone
        afl.prepare(&seeds, tmp.path()).unwrap();
        assert_eq!(read_dir(&seeds).unwrap().count(), 1);
    }

    #[test]
    fn stats_from_fuzzer_stats() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path().join("fuzzer_stats"),
            "start_time        : 1\nexecs_done        : 10\nexecs_per_sec     : 1234.50\n",
        )
        .unwrap();
        let stats = Afl::plusplus()
            .stats(tmp.path(), Path::new("/dev/null"))
            .unwrap()
            .unwrap();
        crate::fuzzers::validate_stats(&stats).unwrap();
        assert!(stats.contains("1234.5"));

        let missing = Afl::plusplus().stats(&tmp.path().join("nope"), Path::new("/dev/null"));
        assert!(missing.unwrap().is_err());
    }
}
