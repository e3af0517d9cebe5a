//! Pluggable event logging for connections and transfers.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::Result;

pub trait EventLog: Send + Sync {
    fn connected(&self, _peer: &str, _role: &str) {}
    fn closed(&self, _peer: &str) {}
    fn transfer_done(&self, _peer: &str, _bytes: u64, _aborted: bool) {}
    fn error(&self, _context: &str, _peer: &str, _msg: &str) {}
}

pub struct NoopLog;
impl EventLog for NoopLog {}

/// Appends timestamped lines to a file.
pub struct TextLog {
    file: Mutex<File>,
}

impl TextLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl EventLog for TextLog {
    fn connected(&self, peer: &str, role: &str) {
        self.line(&format!("CONNECT peer={peer} role={role}"));
    }
    fn closed(&self, peer: &str) {
        self.line(&format!("CLOSE peer={peer}"));
    }
    fn transfer_done(&self, peer: &str, bytes: u64, aborted: bool) {
        self.line(&format!("TRANSFER peer={peer} bytes={bytes} aborted={aborted}"));
    }
    fn error(&self, context: &str, peer: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} peer={peer} msg={msg}"));
    }
}
