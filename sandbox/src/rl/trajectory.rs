//! Per-episode transition log.

use cartpole_protocol::{Action, Observation};

/// One recorded step. The state is the normalized network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub state: Observation,
    pub action: Action,
    pub reward: f64,
}

/// Ordered transitions of the current episode. Entries are never edited.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    transitions: Vec<Transition>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: Observation, action: Action, reward: f64) {
        self.transitions.push(Transition { state, action, reward });
    }

    pub fn clear(&mut self) {
        self.transitions.clear();
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transition> {
        self.transitions.iter()
    }

    pub fn rewards(&self) -> Vec<f64> {
        self.transitions.iter().map(|t| t.reward).collect()
    }
}

impl FromIterator<Transition> for Trajectory {
    fn from_iter<I: IntoIterator<Item = Transition>>(iter: I) -> Self {
        Trajectory { transitions: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Transition;
    type IntoIter = std::slice::Iter<'a, Transition>;

    fn into_iter(self) -> Self::IntoIter {
        self.transitions.iter()
    }
}
