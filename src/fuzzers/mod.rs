//! Fuzz engines the runner knows how to drive.

pub mod afl;
pub mod libfuzzer;

use serde_json::Value;
use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::Command,
};

/// Names accepted by [`adapter_for`].
pub const FUZZERS: [&str; 5] = ["afl", "aflplusplus", "funfuzz", "libfuzzer", "entropic"];

/// Stat names accepted in a stats report.
pub const KNOWN_STATS: [&str; 1] = ["execs_per_sec"];

/// A program with its arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl Invocation {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, val: V) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        self
    }

    /// `nice -n <-niceness> program args...`, environment excluded.
    pub fn niced_command(&self, niceness: i32) -> Command {
        let mut cmd = Command::new("nice");
        cmd.arg("-n")
            .arg((-niceness).to_string())
            .arg(&self.program)
            .args(&self.args);
        cmd
    }
}

pub trait FuzzerAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Environment the benchmark build needs for this engine.
    fn build_env(&self) -> Vec<(String, String)>;

    /// Hook run right before fuzzing starts.
    fn prepare(&self, _input_corpus: &Path, _output_corpus: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn fuzz_invocation(
        &self,
        input_corpus: &Path,
        output_corpus: &Path,
        target_binary: &Path,
    ) -> Invocation;

    /// Stats as a JSON object, `None` if the engine reports none.
    fn stats(&self, _output_corpus: &Path, _log_file: &Path) -> Option<anyhow::Result<String>> {
        None
    }
}

pub fn adapter_for(name: &str) -> Option<Box<dyn FuzzerAdapter>> {
    let adapter: Box<dyn FuzzerAdapter> = match name {
        "afl" => Box::new(afl::Afl::classic()),
        "aflplusplus" => Box::new(afl::Afl::plusplus()),
        "funfuzz" => Box::new(afl::Afl::funfuzz()),
        "libfuzzer" => Box::new(libfuzzer::LibFuzzer::plain()),
        "entropic" => Box::new(libfuzzer::LibFuzzer::entropic()),
        _ => return None,
    };
    Some(adapter)
}

/// Check that `stats` is a JSON object of known stats with numeric values.
pub fn validate_stats(stats: &str) -> anyhow::Result<()> {
    let value: Value = serde_json::from_str(stats)?;
    let obj = match value.as_object() {
        Some(o) => o,
        None => anyhow::bail!("stats are not an object: {}", stats),
    };
    for (k, v) in obj {
        if !KNOWN_STATS.contains(&k.as_str()) {
            anyhow::bail!("unknown stat: {}", k);
        }
        if !v.is_number() {
            anyhow::bail!("stat {} is not a number: {}", k, v);
        }
    }
    Ok(())
}

/// `{"execs_per_sec": <v>}`
pub(crate) fn execs_per_sec_json(v: f64) -> String {
    serde_json::json!({ "execs_per_sec": v }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_name() {
        for name in FUZZERS.iter() {
            let a = adapter_for(name).unwrap();
            assert_eq!(a.name(), *name);
        }
        assert!(adapter_for("honggfuzz").is_none());
    }

    #[test]
    fn stats_validation() {
        assert!(validate_stats(r#"{"execs_per_sec": 12.5}"#).is_ok());
        assert!(validate_stats("{}").is_ok());
        assert!(validate_stats(r#"{"execs_per_sec": "fast"}"#).is_err());
        assert!(validate_stats(r#"{"edges": 1}"#).is_err());
        assert!(validate_stats("[1]").is_err());
        assert!(validate_stats("not json").is_err());
        assert!(validate_stats(&execs_per_sec_json(3.0)).is_ok());
    }

    #[test]
    fn nice_prefix() {
        let inv = Invocation::new("/out/afl-fuzz").arg("-i").arg("seeds");
        let cmd = inv.niced_command(5);
        let args = cmd.get_args().collect::<Vec<_>>();
        assert_eq!(cmd.get_program(), "nice");
        assert_eq!(args, ["-n", "-5", "/out/afl-fuzz", "-i", "seeds"]);
    }
}
