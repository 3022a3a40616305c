use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use alloy_primitives::TxHash;
use chrono::Local;
use tracing::*;

/// Append-only record of reverted and failed submissions.
pub struct FailureLog {
    path: PathBuf,
    // one writer at a time so lines from concurrent workers never interleave
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best effort: a failing journal write is logged, never propagated.
    pub fn record(&self, kind: &str, reason: &str, tx_hash: Option<TxHash>) {
        let tx = tx_hash.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string());
        let line = format!("{} {kind} {reason} {tx}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));

        if let Err(err) = res {
            error!("fail to write {} ({err})", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::new(dir.path().join("failures.log"));

        log.record("mine", "reverted", Some(TxHash::repeat_byte(0xab)));
        log.record("transfer", "timeout", None);

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("mine reverted 0xabab"));
        assert!(lines[1].ends_with("transfer timeout -"));
    }
}
