/// Bounded priority admission buffer
///
/// Insertion scans from the front for the first request whose priority is
/// strictly lower than the new one and inserts immediately before it. That gives
/// strict priority ordering with FIFO stability inside a level. A sustained
/// stream of higher-priority admissions starves lower levels; there is no aging.

use crate::execution::{ExecutionRequest, Priority};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug)]
pub struct PriorityBuffer {
    items: VecDeque<ExecutionRequest>,
    max_size: usize,
}

impl PriorityBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Insert by priority; hands the request back untouched when full
    pub fn push(&mut self, request: ExecutionRequest) -> Result<(), ExecutionRequest> {
        if self.is_full() {
            return Err(request);
        }
        let position = self
            .items
            .iter()
            .position(|queued| queued.priority < request.priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, request);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<ExecutionRequest> {
        self.items.pop_front()
    }

    /// Remove and return the first request (in dequeue order) matching `predicate`
    pub fn take_first<F>(&mut self, predicate: F) -> Option<ExecutionRequest>
    where
        F: FnMut(&ExecutionRequest) -> bool,
    {
        let position = self.items.iter().position(predicate)?;
        self.items.remove(position)
    }

    pub fn remove(&mut self, id: &str) -> Option<ExecutionRequest> {
        self.take_first(|request| request.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|request| request.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|request| request.id.clone()).collect()
    }

    pub fn count_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for request in &self.items {
            *counts.entry(request.priority).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
