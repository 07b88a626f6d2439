//! Ordered list of job ids awaiting admission.

use std::collections::VecDeque;

use crate::job::JobId;

/// FIFO of job ids in canonical order.
///
/// Owned exclusively by the scheduler task, so replacing it is atomic with
/// respect to admission.
#[derive(Debug, Default, Clone)]
pub struct Backlog {
    queue: VecDeque<JobId>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the full canonical order.
    pub fn reset_full(&mut self, order: &[JobId]) {
        self.queue = order.iter().cloned().collect();
    }

    /// Replace the contents with the canonical suffix starting at `from`.
    ///
    /// Returns false (and leaves the backlog untouched) when `from` is not in
    /// the order.
    pub fn resume_from(&mut self, order: &[JobId], from: &JobId) -> bool {
        match order.iter().position(|id| id == from) {
            Some(start) => {
                self.queue = order[start..].iter().cloned().collect();
                true
            }
            None => false,
        }
    }

    pub fn pop_front(&mut self) -> Option<JobId> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.queue.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Vec<JobId> {
        ["01", "02", "03", "04", "05"].iter().map(|s| JobId::from(*s)).collect()
    }

    #[test]
    fn test_reset_full() {
        let mut backlog = Backlog::new();
        backlog.reset_full(&order());
        assert_eq!(backlog.ids(), order());
        assert_eq!(backlog.pop_front(), Some(JobId::from("01")));
    }

    #[test]
    fn test_resume_from_yields_suffix() {
        let mut backlog = Backlog::new();
        backlog.reset_full(&order());
        backlog.pop_front();

        assert!(backlog.resume_from(&order(), &JobId::from("03")));
        assert_eq!(
            backlog.ids(),
            vec![JobId::from("03"), JobId::from("04"), JobId::from("05")]
        );
    }

    #[test]
    fn test_resume_from_unknown_keeps_backlog() {
        let mut backlog = Backlog::new();
        backlog.reset_full(&order());
        assert!(!backlog.resume_from(&order(), &JobId::from("99")));
        assert_eq!(backlog.len(), 5);
    }
}
