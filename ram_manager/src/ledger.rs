//! Per-process memory accounting.
//!
//! Kept apart from the map on purpose: the ledger has its own lock, and the
//! manager only ever touches it after the map lock has been dropped, so the
//! two can never deadlock against each other.

use log::warn;

use crate::chunk::Pid;

/// Maximum number of processes tracked at once.
const MAX_PROCESSES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    pid: Pid,
    bytes: u64,
}

/// Fixed-capacity table of how much physical memory each process holds.
pub(crate) struct ProcessLedger {
    entries: [Option<LedgerEntry>; MAX_PROCESSES],
}

impl ProcessLedger {
    pub(crate) const fn new() -> ProcessLedger {
        ProcessLedger {
            entries: [None; MAX_PROCESSES],
        }
    }

    /// Record `bytes` more held by `pid`.
    pub(crate) fn charge(&mut self, pid: Pid, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let mut free_slot = None;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            match entry {
                Some(e) if e.pid == pid => {
                    e.bytes += bytes;
                    return;
                }
                None if free_slot.is_none() => free_slot = Some(index),
                _ => {}
            }
        }

        match free_slot {
            Some(index) => self.entries[index] = Some(LedgerEntry { pid, bytes }),
            // The allocation itself succeeded; losing the statistic is the
            // lesser evil
            None => warn!("process ledger full, not tracking {}", pid),
        }
    }

    /// Record `bytes` given up by `pid`.
    pub(crate) fn credit(&mut self, pid: Pid, bytes: u64) {
        for entry in self.entries.iter_mut() {
            if let Some(e) = entry {
                if e.pid == pid {
                    e.bytes = e.bytes.saturating_sub(bytes);
                    return;
                }
            }
        }
    }

    /// Drop `pid` from the table entirely.
    pub(crate) fn forget(&mut self, pid: Pid) {
        for entry in self.entries.iter_mut() {
            if matches!(entry, Some(e) if e.pid == pid) {
                *entry = None;
                return;
            }
        }
    }

    /// Bytes currently held by `pid`, as far as the ledger knows.
    pub(crate) fn usage(&self, pid: Pid) -> u64 {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.pid == pid)
            .map(|e| e.bytes)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::ProcessLedger;
    use crate::chunk::Pid;

    #[test]
    fn test_charge_and_credit() {
        let mut ledger = ProcessLedger::new();
        let p = Pid::new(3);

        assert_eq!(ledger.usage(p), 0);
        ledger.charge(p, 8192);
        ledger.charge(p, 4096);
        assert_eq!(ledger.usage(p), 12288);

        ledger.credit(p, 8192);
        assert_eq!(ledger.usage(p), 4096);

        // Credits never underflow
        ledger.credit(p, 1 << 40);
        assert_eq!(ledger.usage(p), 0);
    }

    #[test]
    fn test_forget() {
        let mut ledger = ProcessLedger::new();
        ledger.charge(Pid::new(1), 4096);
        ledger.charge(Pid::new(2), 4096);

        ledger.forget(Pid::new(1));
        assert_eq!(ledger.usage(Pid::new(1)), 0);
        assert_eq!(ledger.usage(Pid::new(2)), 4096);
    }
}
