//! libFuzzer and its Entropic power schedule.
//!
//! The target binary is the engine. Its corpus goes to `<output>/queue` and artifacts to
//! `<output>/crashes/` so the output looks like any other engine's to the archiver.

use super::{execs_per_sec_json, FuzzerAdapter, Invocation};
use crate::corpus::layout::QUEUE_DIR;
use anyhow::Context;
use std::{
    ffi::OsString,
    fs::{create_dir_all, read_to_string},
    path::Path,
};

pub const CRASHES_DIR: &str = "crashes";

const DEFAULT_ENTROPIC_LIB: &str = "/libEntropic.a";

#[derive(Debug, Clone)]
pub struct LibFuzzer {
    name: &'static str,
    entropic: bool,
}

impl LibFuzzer {
    pub fn plain() -> Self {
        Self {
            name: "libfuzzer",
            entropic: false,
        }
    }

    pub fn entropic() -> Self {
        Self {
            name: "entropic",
            entropic: true,
        }
    }
}

impl FuzzerAdapter for LibFuzzer {
    fn name(&self) -> &str {
        self.name
    }

    fn build_env(&self) -> Vec<(String, String)> {
        let cflags = if self.entropic {
            "-fsanitize=fuzzer-no-link -fsanitize=address"
        } else {
            "-fsanitize=fuzzer-no-link"
        };
        let lib = if self.entropic {
            std::env::var("ENTROPIC_LIB").unwrap_or_else(|_| DEFAULT_ENTROPIC_LIB.to_string())
        } else {
            "-fsanitize=fuzzer".to_string()
        };
        let cxxflags = if self.entropic {
            format!("{} {} -lstdc++", cflags, lib)
        } else {
            cflags.to_string()
        };
        vec![
            ("CC".to_string(), "clang".to_string()),
            ("CXX".to_string(), "clang++".to_string()),
            ("CFLAGS".to_string(), cflags.to_string()),
            ("CXXFLAGS".to_string(), cxxflags),
            ("FUZZER_LIB".to_string(), lib),
        ]
    }

    fn prepare(&self, _input_corpus: &Path, output_corpus: &Path) -> anyhow::Result<()> {
        for d in [QUEUE_DIR, CRASHES_DIR].iter() {
            let p = output_corpus.join(d);
            create_dir_all(&p).with_context(|| format!("failed to create {}", p.display()))?;
        }
        Ok(())
    }

    fn fuzz_invocation(
        &self,
        input_corpus: &Path,
        output_corpus: &Path,
        target_binary: &Path,
    ) -> Invocation {
        // trailing separator: libFuzzer prepends the prefix to artifact names verbatim
        let mut prefix = OsString::from("-artifact_prefix=");
        prefix.push(output_corpus.join(CRASHES_DIR));
        prefix.push("/");

        let mut inv = Invocation::new(target_binary)
            .arg("-print_final_stats=1")
            .arg("-close_fd_mask=3")
            .arg("-fork=1")
            .arg("-ignore_ooms=1")
            .arg("-ignore_timeouts=1")
            .arg("-ignore_crashes=1")
            .arg("-detect_leaks=0")
            .arg("-keep_seed=1")
            .arg("-cross_over_uniform_dist=1");
        if self.entropic {
            inv = inv.arg("-entropic=1");
        }
        inv.arg(prefix)
            .arg(output_corpus.join(QUEUE_DIR))
            .arg(input_corpus)
    }

    fn stats(&self, _output_corpus: &Path, log_file: &Path) -> Option<anyhow::Result<String>> {
        Some(parse_log_stats(log_file))
    }
}

/// Last `exec/s:` figure libFuzzer printed to `log_file`.
fn parse_log_stats(log_file: &Path) -> anyhow::Result<String> {
    let log = read_to_string(log_file)
        .with_context(|| format!("failed to read {}", log_file.display()))?;
    let last = log
        .lines()
        .rev()
        .find_map(|l| {
            let rest = &l[l.find("exec/s:")? + "exec/s:".len()..];
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
        .with_context(|| format!("no exec/s in {}", log_file.display()))?;
    Ok(execs_per_sec_json(last))
}
