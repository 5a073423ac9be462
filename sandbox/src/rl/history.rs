use std::collections::VecDeque;

pub const HISTORY_LEN: usize = 100;

/// Bounded record of recent episode lengths and the exploration rate each ran at.
#[derive(Debug, Clone)]
pub struct SurvivalHistory {
    survival: VecDeque<usize>,
    exploration: VecDeque<f64>,
    capacity: usize,
}

impl Default for SurvivalHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_LEN)
    }
}

impl SurvivalHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        SurvivalHistory {
            survival: VecDeque::with_capacity(capacity),
            exploration: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, steps: usize, exploration: f64) {
        if self.survival.len() == self.capacity {
            self.survival.pop_front();
            self.exploration.pop_front();
        }
        self.survival.push_back(steps);
        self.exploration.push_back(exploration);
    }

    /// Mean survival over the last `n` entries; 0 when empty.
    pub fn mean_recent(&self, n: usize) -> f64 {
        let take = n.min(self.survival.len());
        if take == 0 {
            return 0.0;
        }
        self.survival.iter().rev().take(take).sum::<usize>() as f64 / take as f64
    }

    pub fn survival(&self) -> impl Iterator<Item = usize> + '_ {
        self.survival.iter().copied()
    }

    pub fn exploration(&self) -> impl Iterator<Item = f64> + '_ {
        self.exploration.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.survival.len()
    }

    pub fn is_empty(&self) -> bool {
        self.survival.is_empty()
    }

    pub fn clear(&mut self) {
        self.survival.clear();
        self.exploration.clear();
    }
}
