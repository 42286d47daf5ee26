//! Progressive batch planning.
//!
//! Batches grow along a fixed ascending size sequence, slow-start style. A
//! session that already proved a batch size skips the ramp: the first batch
//! uses the proven size and the sequence resumes above it.

use std::time::Duration;

use serde::Serialize;

use crate::{config::Config, domain::RecipientAddress, learning::SessionLearningRecord};

/// Ordered, disjoint, non-empty batches whose concatenation is the planned input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    batches: Vec<Vec<RecipientAddress>>,
}

impl BatchPlan {
    pub fn batches(&self) -> &[Vec<RecipientAddress>] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<Vec<RecipientAddress>> {
        self.batches
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.batches.iter().map(Vec::len).collect()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn total_recipients(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

#[derive(Clone, Debug)]
pub struct AdaptiveBatcher {
    sizes: Vec<usize>,
    ramp_factor: f64,
    fast_threshold: Duration,
}

impl AdaptiveBatcher {
    /// `sizes` must be non-empty and strictly ascending (see `Config::validate`).
    pub fn new(sizes: Vec<usize>, ramp_factor: f64, fast_threshold: Duration) -> Self {
        Self {
            sizes,
            ramp_factor,
            fast_threshold,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.batch_sizes.clone(),
            cfg.ramp_factor,
            cfg.fast_batch_threshold,
        )
    }

    /// Split `recipients` into batches. Deterministic for a given input and record.
    ///
    /// `learned` must already be TTL-checked; `LearningStore::get` only returns
    /// live records.
    pub fn plan(
        &self,
        recipients: &[RecipientAddress],
        learned: Option<&SessionLearningRecord>,
    ) -> BatchPlan {
        let proven = learned.map(|r| r.max_proven_batch_size);
        let mut offset = 0usize;
        let batches = self
            .plan_sizes(recipients.len(), proven)
            .into_iter()
            .map(|n| {
                let batch = recipients[offset..offset + n].to_vec();
                offset += n;
                batch
            })
            .collect();
        BatchPlan { batches }
    }

    /// Batch sizes for `total` recipients.
    ///
    /// A ramp step of size `s` is taken while `total >= ramp_factor * s`;
    /// the first step that fails the check takes everything left.
    pub fn plan_sizes(&self, total: usize, proven: Option<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        let mut remaining = total;
        if remaining == 0 {
            return out;
        }

        let mut start = 0usize;
        if let Some(p) = proven.filter(|p| *p > 0 && remaining >= *p) {
            out.push(p);
            remaining -= p;
            start = self.sizes.partition_point(|s| *s <= p);
            tracing::debug!(proven = p, "skipping ramp with proven batch size");
        }

        for &step in &self.sizes[start..] {
            if remaining == 0 {
                break;
            }
            if total as f64 >= self.ramp_factor * step as f64 {
                let n = step.min(remaining);
                out.push(n);
                remaining -= n;
            } else {
                out.push(remaining);
                remaining = 0;
            }
        }

        if remaining > 0 {
            out.push(remaining);
        }
        out
    }

    /// Larger size a batch this fast suggests the session could jump to.
    ///
    /// Advisory only: the engine logs it and keeps following the plan.
    pub fn skip_ahead_hint(&self, batch_size: usize, latency: Duration) -> Option<usize> {
        if latency >= self.fast_threshold {
            return None;
        }
        let next = self.sizes.partition_point(|s| *s <= batch_size);
        self.sizes.get(next + 1).copied()
    }
}
