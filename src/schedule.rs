//! Tasks deferred by a number of physics steps.
//!
//! Replaces "wait N frames" continuations: a task is queued for an absolute
//! step, handed back by [`StepScheduler::advance`] when that step begins, and
//! can be cancelled by key in the meantime. Due tasks must re-check that the
//! world still warrants them.

use std::collections::BTreeMap;

#[derive(Debug)]
pub struct StepScheduler<K, T> {
    step: u64,
    queue: BTreeMap<u64, Vec<(K, T)>>,
}

impl<K, T> Default for StepScheduler<K, T> {
    fn default() -> Self {
        Self {
            step: 0,
            queue: BTreeMap::new(),
        }
    }
}

impl<K: PartialEq, T> StepScheduler<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_step(&self) -> u64 {
        self.step
    }

    /// Queues `task` to run `steps` steps from now (at least one).
    pub fn schedule_in(&mut self, steps: u64, key: K, task: T) -> u64 {
        let due = self.step + steps.max(1);
        self.queue.entry(due).or_default().push((key, task));
        due
    }

    /// Drops every task queued under `key`. Returns how many were dropped.
    pub fn cancel(&mut self, key: &K) -> usize {
        let mut dropped = 0;
        for tasks in self.queue.values_mut() {
            let before = tasks.len();
            tasks.retain(|(k, _)| k != key);
            dropped += before - tasks.len();
        }
        self.queue.retain(|_, tasks| !tasks.is_empty());
        dropped
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.queue.values().flatten().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.queue.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Starts the next step and returns the tasks due by it, in queue order.
    pub fn advance(&mut self) -> Vec<(K, T)> {
        self.step += 1;
        let later = self.queue.split_off(&(self.step + 1));
        let due = std::mem::replace(&mut self.queue, later);
        due.into_values().flatten().collect()
    }
}
