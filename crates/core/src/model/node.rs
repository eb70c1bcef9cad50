use std::hash::Hasher;

use fxhash::FxHasher;

use crate::model::{NodeId, TimerError};

/// A single named, grouped, timed counter in the timer tree — one per
/// distinct label-path. Holds the start/stop state machine and the
/// accumulated measurements; all structural bookkeeping (ids, cursor
/// movement, child creation) belongs to the owning [`TimerTree`].
///
/// Timestamps are seconds as `f64` from the tree's injected clock; the
/// node only ever subtracts two readings of the same clock.
///
/// [`TimerTree`]: crate::model::TimerTree
#[derive(Debug, Clone)]
pub struct TimerNode {
    id: NodeId,
    /// `None` only for the root.
    parent_id: Option<NodeId>,
    label: String,
    /// Cross-cutting group tags in first-seen order, duplicates dropped.
    groups: Vec<String>,
    /// Unit name for throughput-style metrics (e.g. "cells/s"); recorded
    /// on first use.
    work_unit_label: Option<String>,
    /// Insertion order = first-start order.
    child_ids: Vec<NodeId>,
    running: bool,
    /// Valid only while `running`.
    start_time: f64,
    /// Cumulative elapsed seconds over all completed invocations.
    elapsed: f64,
    /// Completed and in-flight invocations.
    count: u64,
    /// Accumulated work-unit quantity, meaningful with `work_unit_label`.
    work_units: f64,
    /// Participating contexts for the average-time convention.
    contexts: u32,
}

impl TimerNode {
    pub(crate) fn new(
        id: NodeId,
        parent_id: Option<NodeId>,
        label: &str,
        groups: &[&str],
        work_unit_label: Option<&str>,
        contexts: u32,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(groups.len());
        for group in groups {
            if !unique.iter().any(|seen| seen == group) {
                unique.push((*group).to_string());
            }
        }
        Self {
            id,
            parent_id,
            label: label.to_string(),
            groups: unique,
            work_unit_label: work_unit_label.map(str::to_string),
            child_ids: Vec::new(),
            running: false,
            start_time: 0.0,
            elapsed: 0.0,
            count: 0,
            work_units: 0.0,
            contexts: contexts.max(1),
        }
    }

    /// Begin an invocation at `now`. Double-start is a usage error, not
    /// silently ignored.
    pub fn start(&mut self, now: f64) -> Result<(), TimerError> {
        if self.running {
            return Err(TimerError::AlreadyRunning {
                label: self.label.clone(),
            });
        }
        self.running = true;
        self.start_time = now;
        self.count += 1;
        Ok(())
    }

    /// End the active invocation at `now`, folding `now - start_time` into
    /// the cumulative elapsed time. Returns the parent id so the owning
    /// tree can move its cursor up.
    pub fn stop(&mut self, now: f64) -> Result<Option<NodeId>, TimerError> {
        self.stop_with_work(now, 0.0, None)
    }

    /// End the active invocation and accumulate a work-unit quantity. The
    /// unit label is recorded the first time one is supplied.
    pub fn stop_with_work(
        &mut self,
        now: f64,
        work_units: f64,
        work_unit_label: Option<&str>,
    ) -> Result<Option<NodeId>, TimerError> {
        if !self.running {
            return Err(TimerError::NotRunning {
                label: self.label.clone(),
            });
        }
        self.elapsed += now - self.start_time;
        self.work_units += work_units;
        if self.work_unit_label.is_none()
            && let Some(unit) = work_unit_label
        {
            self.work_unit_label = Some(unit.to_string());
        }
        self.running = false;
        Ok(self.parent_id)
    }

    /// Cumulative elapsed time divided by the number of participating
    /// contexts. The raw `elapsed` and `count` stay independently
    /// queryable so downstream reductions can apply their own convention.
    pub fn average_time(&self) -> f64 {
        self.elapsed / f64::from(self.contexts)
    }

    /// Discard measurements so far and measure from `baseline_wall_time`
    /// forward; identity and structure are untouched. An in-flight
    /// invocation restarts at the baseline and keeps counting. Used to
    /// exclude a warm-up phase.
    pub fn reset_time(&mut self, baseline_wall_time: f64) {
        self.elapsed = 0.0;
        self.work_units = 0.0;
        if self.running {
            self.start_time = baseline_wall_time;
            self.count = 1;
        } else {
            self.count = 0;
        }
    }

    /// Shift the active invocation's start forward by `delta`, excluding
    /// that much time from it without a stop/start pair. No-op while not
    /// running. Used to keep e.g. report emission out of the enclosing
    /// timer.
    pub fn shift_active_start_time(&mut self, delta: f64) {
        if self.running {
            self.start_time += delta;
        }
    }

    /// Deterministic hash of (label, groups, work-unit label), independent
    /// of timing values. Equal identities hash equally; any difference
    /// changes the value with overwhelming probability. Fed into the
    /// tree-level structural hash that guards cross-context merging.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(self.label.as_bytes());
        hasher.write_u8(0xff);
        for group in &self.groups {
            hasher.write(group.as_bytes());
            hasher.write_u8(0xff);
        }
        if let Some(unit) = &self.work_unit_label {
            hasher.write(unit.as_bytes());
        }
        hasher.finish()
    }

    pub(crate) fn add_child(&mut self, id: NodeId) {
        self.child_ids.push(id);
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn work_unit_label(&self) -> Option<&str> {
        self.work_unit_label.as_deref()
    }

    pub fn child_ids(&self) -> &[NodeId] {
        &self.child_ids
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn work_units(&self) -> f64 {
        self.work_units
    }
}
