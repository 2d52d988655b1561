//! In-memory buffer of records waiting to be flushed, plus the size/age policy
//! deciding when the buffer becomes a batch.
//!
//! The accumulator is owned by the ingestion loop and never shared: size and
//! timer triggers are both evaluated from the loop task, so a drain can never
//! race with an append.

use std::time::Duration;

use tokio::time::Instant;

use crate::kafka::types::Partition;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
}

/// Records drained from the accumulator, in arrival order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

pub struct BatchAccumulator {
    policy: BatchPolicy,
    records: Vec<Record>,
    /// When the oldest buffered record was added
    oldest: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            records: Vec::with_capacity(policy.max_batch_size),
            oldest: None,
        }
    }

    /// Appends a record and returns whether the buffer now meets the flush policy.
    ///
    /// The caller drains as soon as this returns true, so the buffer never grows
    /// past `max_batch_size`.
    pub fn add(&mut self, record: Record) -> bool {
        if self.records.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.records.push(record);
        self.is_ready()
    }

    /// Removes and returns every buffered record, leaving the accumulator empty.
    pub fn drain(&mut self) -> Batch {
        self.oldest = None;
        Batch::new(std::mem::replace(
            &mut self.records,
            Vec::with_capacity(self.policy.max_batch_size),
        ))
    }

    /// Puts an unflushed batch back in front of the buffer, keeping its age.
    pub fn restore(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let mut records = batch.into_records();
        records.append(&mut self.records);
        self.records = records;
        // the restored records are at least as old as anything buffered since
        let now = Instant::now();
        self.oldest = Some(now.checked_sub(self.policy.max_batch_age).unwrap_or(now));
    }

    /// Drops buffered records of partitions this consumer no longer owns and
    /// returns how many were dropped. Their offsets are not committed, so the
    /// new owner reads them again.
    pub fn discard_partitions(&mut self, partitions: &[Partition]) -> usize {
        let before = self.records.len();
        self.records
            .retain(|record| !partitions.contains(record.partition()));
        if self.records.is_empty() {
            self.oldest = None;
        }
        before - self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Time since the oldest buffered record was added
    pub fn age(&self) -> Option<Duration> {
        self.oldest.map(|oldest| oldest.elapsed())
    }

    /// True when the buffer is non-empty and has reached `max_batch_size` or
    /// `max_batch_age`.
    pub fn is_ready(&self) -> bool {
        self.is_full() || self.is_due()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.policy.max_batch_size
    }

    /// True when the buffer is non-empty and its oldest record reached `max_batch_age`.
    pub fn is_due(&self) -> bool {
        match self.age() {
            Some(age) => !self.records.is_empty() && age >= self.policy.max_batch_age,
            None => false,
        }
    }
}
