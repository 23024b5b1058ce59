//! ---
//! mgd_section: "03-forecasting"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Demand history buffers and Fourier projection."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::collections::VecDeque;

/// Ring of the most recent demand samples for a single node, in arrival
/// order. Owned exclusively by the tick loop and mutated only between ticks.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Copy the samples into a contiguous vector, oldest first.
    pub fn to_vec(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let mut history = HistoryBuffer::new(3);
        for sample in [1.0, 2.0, 3.0, 4.0] {
            history.push(sample);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(history.latest(), Some(4.0));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut history = HistoryBuffer::new(0);
        history.push(1.0);
        history.push(2.0);
        assert_eq!(history.to_vec(), vec![2.0]);
    }
}
