//! Constraint bookkeeping owned by the scheduler.

use std::collections::{HashMap, HashSet};

use courier_core::Constraint;

/// Which named conditions currently hold, and how many jobs of each
/// concurrency group are running.
#[derive(Debug, Clone, Default)]
pub struct ConstraintState {
    conditions: HashSet<String>,
    running_by_group: HashMap<String, usize>,
}

impl ConstraintState {
    pub fn new<I, S>(initial_conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            conditions: initial_conditions.into_iter().map(Into::into).collect(),
            running_by_group: HashMap::new(),
        }
    }

    /// Update a condition. Returns true if anything changed.
    pub fn set_condition(&mut self, name: &str, satisfied: bool) -> bool {
        if satisfied {
            self.conditions.insert(name.to_string())
        } else {
            self.conditions.remove(name)
        }
    }

    pub fn condition(&self, name: &str) -> bool {
        self.conditions.contains(name)
    }

    /// Whether a job with these constraints may start now.
    pub fn allows(&self, constraints: &[Constraint]) -> bool {
        constraints.iter().all(|c| match c {
            Constraint::Requires(name) => self.conditions.contains(name),
            Constraint::MaxConcurrent { group, limit } => self.running(group) < *limit,
        })
    }

    pub fn running(&self, group: &str) -> usize {
        self.running_by_group.get(group).copied().unwrap_or(0)
    }

    /// Account for a job starting.
    pub fn acquire(&mut self, constraints: &[Constraint]) {
        for group in groups(constraints) {
            *self.running_by_group.entry(group.to_string()).or_insert(0) += 1;
        }
    }

    /// Account for a job finishing.
    pub fn release(&mut self, constraints: &[Constraint]) {
        for group in groups(constraints) {
            if let Some(count) = self.running_by_group.get_mut(group) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.running_by_group.remove(group);
                }
            }
        }
    }
}

fn groups(constraints: &[Constraint]) -> impl Iterator<Item = &str> {
    let mut seen = HashSet::new();
    constraints.iter().filter_map(move |c| match c {
        Constraint::MaxConcurrent { group, .. } if seen.insert(group.as_str()) => Some(group.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreported_conditions_are_unsatisfied() {
        let state = ConstraintState::default();
        assert!(!state.allows(&[Constraint::network()]));
        assert!(state.allows(&[]));
    }

    #[test]
    fn condition_changes_are_reported() {
        let mut state = ConstraintState::new([Constraint::NETWORK]);
        assert!(state.allows(&[Constraint::network()]));

        assert!(!state.set_condition(Constraint::NETWORK, true));
        assert!(state.set_condition(Constraint::NETWORK, false));
        assert!(!state.allows(&[Constraint::network()]));
    }

    #[test]
    fn group_limit_blocks_until_release() {
        let mut state = ConstraintState::default();
        let uploads = vec![Constraint::max_concurrent("uploads", 2)];

        state.acquire(&uploads);
        assert!(state.allows(&uploads));
        state.acquire(&uploads);
        assert!(!state.allows(&uploads));

        state.release(&uploads);
        assert!(state.allows(&uploads));
        assert_eq!(state.running("uploads"), 1);
    }

    #[test]
    fn repeated_group_counts_once_per_job() {
        let mut state = ConstraintState::default();
        let twice = vec![
            Constraint::max_concurrent("uploads", 1),
            Constraint::max_concurrent("uploads", 3),
        ];

        state.acquire(&twice);
        assert_eq!(state.running("uploads"), 1);
        // The tighter limit wins.
        assert!(!state.allows(&twice));

        state.release(&twice);
        assert_eq!(state.running("uploads"), 0);
    }
}
