//! Fault isolation by bisection.
//!
//! Given a batch that is known to fail, split it in halves and probe them
//! until every address is either proven deliverable or pinned down as
//! problematic. When the first half of a failing segment succeeds, the second
//! half is presumed failing and split without a probe of its own. A presumed
//! single address is still tried once: the parent may have failed on size
//! alone, so only an observed failure marks an address problematic.

use std::{ops::Range, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{config::Config, domain::RecipientAddress, errors::Error, Result};

/// One delivery attempt against a subset of recipients.
#[async_trait]
pub trait BatchAttempt: Send + Sync {
    async fn attempt(&self, batch: &[RecipientAddress]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct IsolationReport {
    /// Input order preserved.
    pub succeeded: Vec<RecipientAddress>,
    /// Input order preserved.
    pub problematic: Vec<RecipientAddress>,
    pub attempts: usize,
    /// One entry per segment cut off by the depth bound.
    pub depth_exceeded: Vec<Error>,
}

#[derive(Clone, Copy, Debug)]
pub struct FaultIsolator {
    max_depth: u32,
    attempt_delay: Duration,
}

struct Segment {
    range: Range<usize>,
    depth: u32,
    /// Seen failing as a whole, as opposed to inferred from a passing sibling.
    observed: bool,
}

impl FaultIsolator {
    pub fn new(max_depth: u32, attempt_delay: Duration) -> Self {
        Self {
            max_depth,
            attempt_delay,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.isolation_max_depth, cfg.isolation_delay)
    }

    /// Isolate the failing addresses of `batch`, which the caller already saw fail.
    pub async fn isolate<A>(&self, batch: &[RecipientAddress], attempt: &A) -> IsolationReport
    where
        A: BatchAttempt + ?Sized,
    {
        self.isolate_from(batch, attempt, 0).await
    }

    /// Like [`Self::isolate`] for a segment that already sits `depth` levels down.
    pub async fn isolate_from<A>(
        &self,
        batch: &[RecipientAddress],
        attempt: &A,
        depth: u32,
    ) -> IsolationReport
    where
        A: BatchAttempt + ?Sized,
    {
        let mut report = IsolationReport::default();
        let mut ok: Vec<Range<usize>> = Vec::new();
        let mut bad: Vec<Range<usize>> = Vec::new();

        // Every segment on the stack is known to fail as a whole.
        let mut stack = Vec::new();
        if !batch.is_empty() {
            stack.push(Segment {
                range: 0..batch.len(),
                depth,
                observed: true,
            });
        }

        while let Some(seg) = stack.pop() {
            let Range { start, end } = seg.range;
            if end - start == 1 {
                if !seg.observed
                    && self
                        .probe(batch, seg.range.clone(), attempt, &mut report)
                        .await
                {
                    ok.push(seg.range);
                    continue;
                }
                tracing::debug!(address = %batch[start], "isolated problematic address");
                bad.push(seg.range);
                continue;
            }
            if seg.depth > self.max_depth {
                let err = Error::IsolationDepthExceeded {
                    depth: seg.depth,
                    remaining: end - start,
                };
                tracing::warn!(error = %err, "giving up on segment");
                report.depth_exceeded.push(err);
                bad.push(seg.range);
                continue;
            }

            let mid = start + (end - start) / 2;
            let (left, right) = (start..mid, mid..end);
            let child = seg.depth + 1;

            if self.probe(batch, left.clone(), attempt, &mut report).await {
                ok.push(left);
                stack.push(Segment {
                    range: right,
                    depth: child,
                    observed: false,
                });
                continue;
            }

            if self.probe(batch, right.clone(), attempt, &mut report).await {
                ok.push(right);
            } else {
                stack.push(Segment {
                    range: right,
                    depth: child,
                    observed: true,
                });
            }
            stack.push(Segment {
                range: left,
                depth: child,
                observed: true,
            });
        }

        ok.sort_by_key(|r| r.start);
        bad.sort_by_key(|r| r.start);
        report.succeeded = ok.into_iter().flat_map(|r| batch[r].to_vec()).collect();
        report.problematic = bad.into_iter().flat_map(|r| batch[r].to_vec()).collect();
        tracing::info!(
            total = batch.len(),
            succeeded = report.succeeded.len(),
            problematic = report.problematic.len(),
            attempts = report.attempts,
            "isolation finished"
        );
        report
    }

    async fn probe<A>(
        &self,
        batch: &[RecipientAddress],
        range: Range<usize>,
        attempt: &A,
        report: &mut IsolationReport,
    ) -> bool
    where
        A: BatchAttempt + ?Sized,
    {
        if report.attempts > 0 && !self.attempt_delay.is_zero() {
            sleep(self.attempt_delay).await;
        }
        report.attempts += 1;
        match attempt.attempt(&batch[range.clone()]).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    from = range.start,
                    len = range.len(),
                    error = %e,
                    "probe failed"
                );
                false
            }
        }
    }
}
