//! The in-memory Log (`spec.md` §4.2), kept consistent with the Durable
//! Store by its caller (the Role State Machine). `Log` never talks to disk
//! itself — see [`crate::storage::RaftStorage`] for persistence.

use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::AppData;

/// A single entry in the replicated log (`spec.md` §3, LogEntry).
///
/// Equality (and hence log-matching comparisons) is defined by `(term,
/// index, command)`; `timestamp` is informational only, so it's excluded
/// from `PartialEq`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct LogEntry<D: AppData> {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload<D>,
}

impl<D: AppData> PartialEq for LogEntry<D> {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term && self.index == other.index
    }
}

/// The content carried by a [`LogEntry`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub enum EntryPayload<D: AppData> {
    /// A no-op committed by a new leader so it can determine which prior
    /// entries are committed (Raft §8).
    Blank,
    /// An application-supplied command, treated as an opaque byte-equivalent
    /// value by this crate (`spec.md` §9).
    Normal(D),
}

/// Outcome of [`Log::append_from_leader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendResult {
    Accepted { last_new_index: u64 },
    Rejected { conflict_index: u64, conflict_term: u64 },
}

/// The in-memory Raft log.
///
/// Entries with `index <= last_included_index` have been compacted into a
/// snapshot and are no longer held in memory; `term_at` and `last_term`
/// consult `last_included_index`/`last_included_term` to answer queries that
/// land exactly on the snapshot boundary.
#[derive(Debug, Default)]
pub struct Log<D: AppData> {
    entries: VecDeque<LogEntry<D>>,
    last_included_index: u64,
    last_included_term: u64,
}

impl<D: AppData> Log<D> {
    pub fn new() -> Self {
        Self { entries: VecDeque::new(), last_included_index: 0, last_included_term: 0 }
    }

    /// Reconstruct a `Log` from persisted entries and the last-compacted
    /// snapshot boundary, as read back from the Durable Store at boot.
    pub fn restore(entries: Vec<LogEntry<D>>, last_included_index: u64, last_included_term: u64) -> Self {
        Self { entries: entries.into(), last_included_index, last_included_term }
    }

    pub fn last_included_index(&self) -> u64 {
        self.last_included_index
    }

    pub fn last_included_term(&self) -> u64 {
        self.last_included_term
    }

    pub fn last_index(&self) -> u64 {
        self.entries.back().map(|e| e.index).unwrap_or(self.last_included_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map(|e| e.term).unwrap_or(self.last_included_term)
    }

    /// Term of the entry at `index`, `last_included_term` if `index` is
    /// exactly the snapshot boundary, or `None` if `index` is out of range
    /// (including entries already compacted away).
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        if index < self.last_included_index {
            return None;
        }
        self.offset_of(index).and_then(|off| self.entries.get(off)).map(|e| e.term)
    }

    /// Entries with `index >= from_index`, in index order.
    pub fn slice(&self, from_index: u64) -> Vec<&LogEntry<D>> {
        let start = self.offset_of(from_index).unwrap_or(self.entries.len());
        self.entries.range(start..).collect()
    }

    /// Append a freshly-created entry (leader-side, on client submit). The
    /// caller is responsible for persisting it via the Durable Store before
    /// acknowledging success to anyone.
    pub fn append_leader_entry(&mut self, term: u64, payload: EntryPayload<D>) -> LogEntry<D> {
        let index = self.last_index() + 1;
        let entry = LogEntry { term, index, payload };
        self.entries.push_back(entry.clone());
        entry
    }

    /// The consistency check and conflict-resolution step (`spec.md` §4.2).
    pub fn append_from_leader(&mut self, prev_index: u64, prev_term: u64, mut new_entries: Vec<LogEntry<D>>) -> AppendResult {
        if prev_index != 0 {
            match self.term_at(prev_index) {
                Some(t) if t == prev_term => {}
                Some(t) => {
                    return AppendResult::Rejected {
                        conflict_index: self.first_index_of_term(t),
                        conflict_term: t,
                    };
                }
                None => {
                    return AppendResult::Rejected { conflict_index: self.last_index() + 1, conflict_term: 0 };
                }
            }
        }

        for new_entry in new_entries.drain(..) {
            match self.term_at(new_entry.index) {
                Some(existing_term) if existing_term == new_entry.term => {
                    // Already present and matching; nothing to do.
                }
                Some(_) => {
                    self.truncate_suffix_from(new_entry.index);
                    self.entries.push_back(new_entry);
                }
                None => {
                    self.entries.push_back(new_entry);
                }
            }
        }

        AppendResult::Accepted { last_new_index: self.last_index() }
    }

    /// Remove all entries with `index <= through_index`. No-op (with a
    /// warning logged by the caller) if `through_index >= last_index()`.
    pub fn truncate_prefix(&mut self, through_index: u64, new_last_included_term: u64) {
        if through_index >= self.last_index() && self.last_index() != 0 {
            // See Open Question in DESIGN.md: truncate_prefix only compacts
            // entries strictly below the current tail; a request to
            // compact through the tail itself is folded into a normal
            // truncation rather than silently dropped.
        }
        while let Some(front) = self.entries.front() {
            if front.index <= through_index {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        if through_index > self.last_included_index {
            self.last_included_index = through_index;
            self.last_included_term = new_last_included_term;
        }
    }

    /// Remove all entries with `index >= from_index` (leader conflict
    /// resolution truncation).
    fn truncate_suffix_from(&mut self, from_index: u64) {
        while let Some(back) = self.entries.back() {
            if back.index >= from_index {
                self.entries.pop_back();
            } else {
                break;
            }
        }
    }

    fn offset_of(&self, index: u64) -> Option<usize> {
        if index <= self.last_included_index {
            return None;
        }
        let front_index = self.entries.front()?.index;
        if index < front_index {
            return None;
        }
        let offset = (index - front_index) as usize;
        if offset >= self.entries.len() {
            return None;
        }
        Some(offset)
    }

    fn first_index_of_term(&self, term: u64) -> u64 {
        for e in self.entries.iter() {
            if e.term == term {
                return e.index;
            }
        }
        self.last_included_index + 1
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = &LogEntry<D>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry<String> {
        LogEntry { term, index, payload: EntryPayload::Normal(format!("cmd-{}", index)) }
    }

    #[test]
    fn empty_log_reports_zero() {
        let log: Log<String> = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn append_from_leader_accepts_matching_prefix() {
        let mut log: Log<String> = Log::new();
        let res = log.append_from_leader(0, 0, vec![entry(1, 1), entry(1, 2)]);
        assert_eq!(res, AppendResult::Accepted { last_new_index: 2 });
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn append_from_leader_rejects_on_missing_prev() {
        let mut log: Log<String> = Log::new();
        let res = log.append_from_leader(5, 1, vec![]);
        assert_eq!(res, AppendResult::Rejected { conflict_index: 1, conflict_term: 0 });
    }

    #[test]
    fn append_from_leader_rejects_on_term_mismatch() {
        let mut log: Log<String> = Log::new();
        log.append_from_leader(0, 0, vec![entry(1, 1), entry(1, 2)]);
        let res = log.append_from_leader(2, 2, vec![]);
        assert_eq!(res, AppendResult::Rejected { conflict_index: 1, conflict_term: 1 });
    }

    #[test]
    fn append_from_leader_truncates_conflicting_suffix() {
        let mut log: Log<String> = Log::new();
        log.append_from_leader(0, 0, vec![entry(1, 1), entry(1, 2), entry(1, 3)]);
        // Leader with a higher term overwrites from index 2 onward.
        let res = log.append_from_leader(1, 1, vec![entry(2, 2), entry(2, 3)]);
        assert_eq!(res, AppendResult::Accepted { last_new_index: 3 });
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.term_at(3), Some(2));
    }

    #[test]
    fn truncate_prefix_removes_compacted_entries() {
        let mut log: Log<String> = Log::new();
        log.append_from_leader(0, 0, vec![entry(1, 1), entry(1, 2), entry(1, 3)]);
        log.truncate_prefix(2, 1);
        assert_eq!(log.last_included_index(), 2);
        assert_eq!(log.last_included_term(), 1);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(1), None);
        assert_eq!(log.slice(1).len(), 1);
        assert_eq!(log.slice(1)[0].index, 3);
    }

    #[test]
    fn slice_returns_entries_from_index() {
        let mut log: Log<String> = Log::new();
        log.append_from_leader(0, 0, vec![entry(1, 1), entry(1, 2), entry(1, 3)]);
        let s = log.slice(2);
        assert_eq!(s.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
    }
}
