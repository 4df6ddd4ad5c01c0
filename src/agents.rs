//! Inferred sub-agent roster.
//!
//! Records are created and updated from classified output lines and exist
//! purely for display. Nothing in the trigger or gathering path reads them.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Maximum description length, in characters.
pub const DESCRIPTION_LIMIT: usize = 80;

/// Most records one bulk-spawn line may create.
pub const BULK_SPAWN_LIMIT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Done,
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub status: AgentStatus,
    pub started_at: Instant,
    pub tool_uses: u32,
    pub tokens: u64,
    /// Set when the record is marked done.
    remove_at: Option<Instant>,
}

impl AgentRecord {
    pub fn set_description(&mut self, description: &str) {
        self.description = truncate_chars(description, DESCRIPTION_LIMIT);
    }
}

/// Serializable view of a record with its age.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub status: AgentStatus,
    pub elapsed_ms: u64,
    pub tool_uses: u32,
    pub tokens: u64,
}

/// Ordered collection of agent records keyed by a monotonic id.
#[derive(Debug)]
pub struct AgentTracker {
    records: BTreeMap<u64, AgentRecord>,
    next_id: u64,
    removal_delay: Duration,
}

impl AgentTracker {
    pub fn new(removal_delay: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
            removal_delay,
        }
    }

    /// Add a running record and return its id. Ids are never reused.
    pub fn spawn(
        &mut self,
        name: &str,
        description: &str,
        tool_uses: u32,
        tokens: u64,
        now: Instant,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(
            id,
            AgentRecord {
                id,
                name: name.to_string(),
                description: truncate_chars(description, DESCRIPTION_LIMIT),
                status: AgentStatus::Running,
                started_at: now,
                tool_uses,
                tokens,
                remove_at: None,
            },
        );
        id
    }

    /// The most recently created record, whatever its status.
    pub fn most_recent_mut(&mut self) -> Option<&mut AgentRecord> {
        self.records.values_mut().next_back()
    }

    #[cfg(test)]
    pub fn get(&self, id: u64) -> Option<&AgentRecord> {
        self.records.get(&id)
    }

    /// Mark the oldest running record done. Returns its id.
    pub fn complete_oldest(&mut self, now: Instant) -> Option<u64> {
        let delay = self.removal_delay;
        let record = self
            .records
            .values_mut()
            .find(|r| r.status == AgentStatus::Running)?;
        mark_done(record, now, delay);
        Some(record.id)
    }

    /// Mark every running record done. Returns how many changed.
    pub fn complete_all(&mut self, now: Instant) -> usize {
        let delay = self.removal_delay;
        let mut count = 0;
        for record in self
            .records
            .values_mut()
            .filter(|r| r.status == AgentStatus::Running)
        {
            mark_done(record, now, delay);
            count += 1;
        }
        count
    }

    /// Remove done records whose removal delay has passed. Returns how many
    /// were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| r.remove_at.is_none_or(|at| now < at));
        before - self.records.len()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<AgentSnapshot> {
        self.records
            .values()
            .map(|r| AgentSnapshot {
                id: r.id,
                name: r.name.clone(),
                description: r.description.clone(),
                status: r.status,
                elapsed_ms: now.saturating_duration_since(r.started_at).as_millis() as u64,
                tool_uses: r.tool_uses,
                tokens: r.tokens,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == AgentStatus::Running)
            .count()
    }
}

fn mark_done(record: &mut AgentRecord, now: Instant, delay: Duration) {
    record.status = AgentStatus::Done;
    record.remove_at = Some(now + delay);
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
