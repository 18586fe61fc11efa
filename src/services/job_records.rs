//! Job record store
//!
//! Keeps one record per queued job in memory. Terminal records are pruned by
//! age and by count so the store stays bounded while dead letters remain
//! listable for a while.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{JobRecord, JobState, QueueStats};

const DEFAULT_MAX_RECORDS: usize = 1000;

pub struct JobRecords {
    records: RwLock<HashMap<Uuid, JobRecord>>,
    max_age: ChronoDuration,
    max_records: usize,
}

impl Default for JobRecords {
    fn default() -> Self {
        Self::new(ChronoDuration::hours(24), DEFAULT_MAX_RECORDS)
    }
}

impl JobRecords {
    pub fn new(max_age: ChronoDuration, max_records: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_age,
            max_records,
        }
    }

    pub fn insert(&self, record: JobRecord) {
        self.records.write().insert(record.id, record);
        self.prune();
    }

    #[cfg(test)]
    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Apply `f` to the record; returns the updated copy
    pub fn update<F>(&self, id: Uuid, f: F) -> Option<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut records = self.records.write();
        let record = records.get_mut(&id)?;
        f(record);
        Some(record.clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<JobRecord> {
        self.records.write().remove(&id)
    }

    /// Dead-lettered records, most recent first
    pub fn dead_letters(&self) -> Vec<JobRecord> {
        let mut dead: Vec<JobRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.state == JobState::DeadLettered)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        dead
    }

    pub fn stats(&self) -> QueueStats {
        let records = self.records.read();
        let mut stats = QueueStats::default();
        for record in records.values() {
            match record.state {
                JobState::Queued => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Retrying => stats.retrying += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
                JobState::Completed => {}
            }
        }
        stats
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Drop terminal records older than `max_age`, then the oldest terminal
    /// records beyond `max_records`. Live records are never pruned.
    pub fn prune(&self) {
        let cutoff = Utc::now() - self.max_age;
        let mut records = self.records.write();

        records.retain(|_, r| {
            !(r.state.is_terminal() && r.finished_at.is_some_and(|at| at < cutoff))
        });

        if records.len() <= self.max_records {
            return;
        }

        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = records
            .values()
            .filter(|r| r.state.is_terminal())
            .map(|r| (r.id, r.finished_at.unwrap_or(r.enqueued_at)))
            .collect();
        terminal.sort_by_key(|(_, at)| *at);

        let excess = records.len() - self.max_records;
        for (id, _) in terminal.into_iter().take(excess) {
            records.remove(&id);
        }
    }
}
