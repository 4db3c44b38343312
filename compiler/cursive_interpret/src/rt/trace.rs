//! Spec-tagged runtime tracing.
//!
//! When `CURSIVE_SPEC_TRACE_RUNTIME` names a file, each tagged runtime
//! operation appends one TSV line. Absent, tracing is disabled silently.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

pub const TRACE_ENV_VAR: &str = "CURSIVE_SPEC_TRACE_RUNTIME";

pub struct SpecTrace {
    path: Option<PathBuf>,
}

/// `%HH`-encodes the characters that would break the TSV framing.
fn encode_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'%' | b'\t' | b'\n' | b';' | b'=' => {
                out.push('%');
                out.push_str(&format!("{:02X}", byte));
            }
            _ => out.push(byte as char),
        }
    }
    out
}

impl SpecTrace {
    pub fn from_env() -> SpecTrace {
        SpecTrace { path: std::env::var_os(TRACE_ENV_VAR).map(PathBuf::from) }
    }

    pub fn with_path(path: Option<PathBuf>) -> SpecTrace {
        SpecTrace { path }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Appends one record. IO failures are swallowed; tracing must never
    /// change program behavior.
    pub fn record(&self, subsystem: &str, rule_id: &str, payload: &str) {
        let Some(path) = &self.path else { return };
        let line = format!(
            "{}\t{}\t{}\t-\t0\t0\t0\t0\t{}\n",
            encode_field(subsystem),
            encode_field(subsystem),
            encode_field(rule_id),
            encode_field(payload),
        );
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_escapes_framing_bytes() {
        assert_eq!(encode_field("a\tb"), "a%09b");
        assert_eq!(encode_field("k=v;x%"), "k%3Dv%3Bx%25");
        assert_eq!(encode_field("plain"), "plain");
    }

    #[test]
    fn disabled_trace_is_silent() {
        let trace = SpecTrace::with_path(None);
        assert!(!trace.enabled());
        trace.record("region", "alloc", "payload");
    }
}
