//! Connection admission guard.
//!
//! Each peer address gets a sliding 5-second window of connection
//! attempts. Crossing the threshold appends the address to an append-only
//! block file and rejects it from then on. The blocked set is cached in
//! memory; the file exists so a restart keeps the decision.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Window over which attempts are counted.
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(5);

/// Attempts inside the window at which an address is blocked.
pub const ATTEMPT_LIMIT: usize = 4;

pub struct AdmissionGuard {
    block_file: PathBuf,
    attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    blocked: Mutex<HashSet<IpAddr>>,
}

impl AdmissionGuard {
    /// Opens the guard, loading any previously blocked addresses.
    pub fn open(block_file: impl Into<PathBuf>) -> Self {
        let block_file = block_file.into();
        let mut blocked = HashSet::new();
        if let Ok(text) = std::fs::read_to_string(&block_file) {
            for line in text.lines() {
                if let Ok(addr) = line.trim().parse() {
                    blocked.insert(addr);
                }
            }
        }
        AdmissionGuard {
            block_file,
            attempts: Mutex::new(HashMap::new()),
            blocked: Mutex::new(blocked),
        }
    }

    /// Records a connection attempt and decides whether to admit it.
    pub fn allow(&self, addr: IpAddr) -> bool {
        if self.blocked.lock().expect("blocked set poisoned").contains(&addr) {
            return false;
        }

        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("attempt map poisoned");
        let window = attempts.entry(addr).or_default();
        while window
            .front()
            .is_some_and(|&t| now.duration_since(t) > ATTEMPT_WINDOW)
        {
            window.pop_front();
        }
        window.push_back(now);

        if window.len() >= ATTEMPT_LIMIT {
            drop(attempts);
            error!(%addr, "address exceeded the connection threshold, blocking");
            self.block(addr);
            return false;
        }
        true
    }

    fn block(&self, addr: IpAddr) {
        self.blocked
            .lock()
            .expect("blocked set poisoned")
            .insert(addr);
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.block_file)
            .and_then(|mut f| writeln!(f, "{addr}"));
        if let Err(e) = appended {
            warn!(error = %e, file = %self.block_file.display(), "could not persist blocked address");
        }
    }

    /// Forgets a session's attempt history once it disconnects cleanly, so
    /// reconnects after long play sessions are not penalised.
    pub fn forget(&self, addr: IpAddr) {
        self.attempts
            .lock()
            .expect("attempt map poisoned")
            .remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_block_file(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("relay-blocked-{tag}-{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn rapid_attempts_get_blocked() {
        let file = temp_block_file("rapid");
        let guard = AdmissionGuard::open(&file);
        let addr: IpAddr = "203.0.113.7".parse().unwrap();

        assert!(guard.allow(addr));
        assert!(guard.allow(addr));
        assert!(guard.allow(addr));
        // Fourth attempt inside the window crosses the threshold.
        assert!(!guard.allow(addr));
        // And it stays rejected.
        assert!(!guard.allow(addr));

        let persisted = std::fs::read_to_string(&file).unwrap();
        assert!(persisted.contains("203.0.113.7"));
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn block_file_survives_reopen() {
        let file = temp_block_file("reopen");
        {
            let guard = AdmissionGuard::open(&file);
            let addr: IpAddr = "203.0.113.8".parse().unwrap();
            for _ in 0..4 {
                guard.allow(addr);
            }
        }
        let guard = AdmissionGuard::open(&file);
        assert!(!guard.allow("203.0.113.8".parse().unwrap()));
        assert!(guard.allow("203.0.113.9".parse().unwrap()));
        let _ = std::fs::remove_file(&file);
    }
}
