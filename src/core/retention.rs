//! Keep/delete decisions for duplicate groups.
//!
//! A category whose initial count is below its minimum is *protected*. In a
//! group that mixes protected and unprotected categories, the first protected
//! member is the one kept. Protection only chooses the survivor: every other
//! member is still deleted, including further members of protected
//! categories, and a group made only of protected members collapses to its
//! first member like any other group.

use crate::core::category::CategoryLabel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    pub label: CategoryLabel,
    pub minimum_desired_count: usize,
    pub observed_count: usize,
    pub is_protected: bool,
}

/// Per-category policies, fixed for the duration of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    policies: BTreeMap<CategoryLabel, CategoryPolicy>,
}

impl PolicyTable {
    /// Compute protection from the initial per-category counts.
    pub fn from_counts(counts: &BTreeMap<CategoryLabel, usize>, minimum_desired_count: usize) -> Self {
        let policies = counts
            .iter()
            .map(|(&label, &observed_count)| {
                let policy = CategoryPolicy {
                    label,
                    minimum_desired_count,
                    observed_count,
                    is_protected: observed_count < minimum_desired_count,
                };
                (label, policy)
            })
            .collect();
        Self { policies }
    }

    /// Categories absent from the scan are treated as unprotected.
    pub fn is_protected(&self, label: CategoryLabel) -> bool {
        self.policies
            .get(&label)
            .map(|policy| policy.is_protected)
            .unwrap_or(false)
    }

    pub fn get(&self, label: CategoryLabel) -> Option<&CategoryPolicy> {
        self.policies.get(&label)
    }

    pub fn protected_labels(&self) -> Vec<CategoryLabel> {
        self.policies
            .values()
            .filter(|p| p.is_protected)
            .map(|p| p.label)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryPolicy> {
        self.policies.values()
    }
}

/// Outcome for one group, as positions into the member slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionDecision {
    pub keep: usize,
    pub delete: Vec<usize>,
    /// The survivor was chosen over an earlier unprotected member.
    pub protection_applied: bool,
}

pub struct RetentionPolicy<'a> {
    table: &'a PolicyTable,
}

impl<'a> RetentionPolicy<'a> {
    pub fn new(table: &'a PolicyTable) -> Self {
        Self { table }
    }

    /// Decide which member survives. `members` must be in scan order; the
    /// result is `None` only for an empty group.
    pub fn decide(&self, members: &[CategoryLabel]) -> Option<RetentionDecision> {
        if members.is_empty() {
            return None;
        }

        let protected: Vec<bool> = members.iter().map(|&l| self.table.is_protected(l)).collect();
        let any_protected = protected.iter().any(|&p| p);
        let all_protected = protected.iter().all(|&p| p);

        let keep = if any_protected && !all_protected {
            protected.iter().position(|&p| p).unwrap_or(0)
        } else {
            0
        };

        let delete = (0..members.len()).filter(|&i| i != keep).collect();
        Some(RetentionDecision {
            keep,
            delete,
            protection_applied: keep != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::category::CategoryLabel::*;

    fn table(counts: &[(CategoryLabel, usize)], minimum: usize) -> PolicyTable {
        let counts: BTreeMap<CategoryLabel, usize> = counts.iter().copied().collect();
        PolicyTable::from_counts(&counts, minimum)
    }

    #[test]
    fn test_protection_computed_from_counts() {
        let t = table(&[(CommonRust, 120), (Blight, 900), (Healthy, 500)], 500);
        assert!(t.is_protected(CommonRust));
        assert!(!t.is_protected(Blight));
        // At the minimum is not below it.
        assert!(!t.is_protected(Healthy));
        assert!(!t.is_protected(GrayLeafSpot));
        assert_eq!(t.protected_labels(), vec![CommonRust]);
    }

    #[test]
    fn test_all_unprotected_keeps_first() {
        let t = table(&[(Blight, 900), (Healthy, 900)], 500);
        let decision = RetentionPolicy::new(&t).decide(&[Healthy, Blight, Blight]).unwrap();
        assert_eq!(decision.keep, 0);
        assert_eq!(decision.delete, vec![1, 2]);
        assert!(!decision.protection_applied);
    }

    #[test]
    fn test_mixed_group_keeps_first_protected() {
        let t = table(&[(CommonRust, 100), (Blight, 900)], 500);
        let decision = RetentionPolicy::new(&t)
            .decide(&[Blight, CommonRust, Blight, CommonRust])
            .unwrap();
        assert_eq!(decision.keep, 1);
        // The second protected member goes too.
        assert_eq!(decision.delete, vec![0, 2, 3]);
        assert!(decision.protection_applied);
    }

    #[test]
    fn test_all_protected_collapses_to_first() {
        let t = table(&[(CommonRust, 100), (BlightRust, 50)], 500);
        let decision = RetentionPolicy::new(&t)
            .decide(&[BlightRust, CommonRust, CommonRust])
            .unwrap();
        assert_eq!(decision.keep, 0);
        assert_eq!(decision.delete, vec![1, 2]);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let t = table(&[(CommonRust, 100), (Blight, 900), (Healthy, 700)], 500);
        let members = [Healthy, Blight, CommonRust, Healthy];
        let policy = RetentionPolicy::new(&t);
        assert_eq!(policy.decide(&members), policy.decide(&members));
    }

    #[test]
    fn test_exactly_one_keep() {
        let t = table(&[(CommonRust, 100), (Blight, 900)], 500);
        let members = [Blight, Blight, CommonRust, Blight, CommonRust];
        let decision = RetentionPolicy::new(&t).decide(&members).unwrap();
        assert_eq!(decision.delete.len(), members.len() - 1);
        assert!(!decision.delete.contains(&decision.keep));
    }

    #[test]
    fn test_empty_group() {
        let t = PolicyTable::default();
        assert!(RetentionPolicy::new(&t).decide(&[]).is_none());
    }
}
