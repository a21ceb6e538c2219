use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};

use crate::registry::{FieldId, FieldRegistry, FieldValue};

/// Why a record was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// Every registered field received a value.
    Completed,
    /// The flush deadline expired with fields still unset.
    TimedOut,
    /// The aggregator was stopped with a partial record pending.
    Shutdown,
}

impl FlushReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Shutdown => "shutdown",
        }
    }

    pub const fn all() -> &'static [FlushReason] {
        &[Self::Completed, Self::TimedOut, Self::Shutdown]
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-progress aggregate for the current reporting cycle.
///
/// Holds one optional slot per registry field. Values are overwritten, never
/// accumulated, so the latest update since the last flush wins.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRecord {
    values: Vec<Option<FieldValue>>,
    received: usize,
}

impl PartialRecord {
    /// Creates an all-unset record sized for `registry`.
    pub fn new(registry: &FieldRegistry) -> Self {
        Self::with_len(registry.len())
    }

    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            values: vec![None; len],
            received: 0,
        }
    }

    /// Sets a field, replacing any earlier value.
    pub fn set(&mut self, id: FieldId, value: FieldValue) {
        let slot = &mut self.values[id.index()];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(value);
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.values.get(id.index()).and_then(Option::as_ref)
    }

    /// True once every field holds a value.
    pub fn is_complete(&self) -> bool {
        self.received == self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received == 0
    }

    /// Number of fields holding a value.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Number of fields still unset.
    pub fn missing(&self) -> usize {
        self.values.len() - self.received
    }

    /// Seals the record with a timestamp truncated to whole seconds.
    pub fn finalize(self, reason: FlushReason, at: DateTime<Utc>) -> FinalizedRecord {
        FinalizedRecord {
            timestamp_utc: at.trunc_subsecs(0),
            reason,
            values: self.values,
        }
    }
}

/// Immutable snapshot handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedRecord {
    pub timestamp_utc: DateTime<Utc>,
    pub reason: FlushReason,
    values: Vec<Option<FieldValue>>,
}

impl FinalizedRecord {
    /// Values in registry order; `None` is stored as NULL.
    pub fn values(&self) -> &[Option<FieldValue>] {
        &self.values
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.values.get(id.index()).and_then(Option::as_ref)
    }

    /// Looks a value up by column name.
    pub fn get_column(&self, registry: &FieldRegistry, column: &str) -> Option<&FieldValue> {
        registry
            .fields()
            .iter()
            .position(|f| f.column == column)
            .and_then(|idx| self.values.get(idx))
            .and_then(Option::as_ref)
    }

    pub fn received(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }
}
