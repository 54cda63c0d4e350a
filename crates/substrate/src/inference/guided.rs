//! Belief-guided consolidation of a crystal
//!
//! [`GuidedCrystal`] only proposes; [`apply_actions`] turns the proposals
//! into relevance changes so that compaction and demotion drop the demoted
//! concepts first.

use serde::Serialize;

use crate::crystal::Crystal;
use crate::inference::ActiveInferenceAgent;
use crate::types::ConceptId;

pub const DEFAULT_PROMOTE_RATIO: f64 = 1.5;
pub const DEFAULT_DEMOTE_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Promote,
    Demote,
    Keep,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuidedAction {
    pub concept: ConceptId,
    pub action: Action,
    /// `belief * concept_count / cost`; 1.0 means average value per unit cost
    pub value_ratio: f64,
}

/// A crystal read through an agent's beliefs
pub struct GuidedCrystal<'a> {
    crystal: &'a Crystal,
    agent: &'a ActiveInferenceAgent,
    promote_ratio: f64,
    demote_ratio: f64,
}

impl<'a> GuidedCrystal<'a> {
    pub fn new(crystal: &'a Crystal, agent: &'a ActiveInferenceAgent) -> Self {
        Self {
            crystal,
            agent,
            promote_ratio: DEFAULT_PROMOTE_RATIO,
            demote_ratio: DEFAULT_DEMOTE_RATIO,
        }
    }

    pub fn with_thresholds(mut self, promote_ratio: f64, demote_ratio: f64) -> Self {
        self.promote_ratio = promote_ratio;
        self.demote_ratio = demote_ratio;
        self
    }

    /// One action per concept, in concept id order
    pub fn consolidate(&self) -> Vec<GuidedAction> {
        let count = self.crystal.len() as f64;
        let belief = self.agent.belief();

        self.crystal
            .concept_ids()
            .into_iter()
            .map(|concept| {
                let value_ratio = belief.probability(&concept) * count / self.agent.cost(&concept);
                let action = if value_ratio >= self.promote_ratio {
                    Action::Promote
                } else if value_ratio <= self.demote_ratio {
                    Action::Demote
                } else {
                    Action::Keep
                };
                GuidedAction {
                    concept,
                    action,
                    value_ratio,
                }
            })
            .collect()
    }
}

/// Counts of what [`apply_actions`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppliedActions {
    pub promoted: usize,
    pub demoted: usize,
    pub kept: usize,
    /// Actions naming concepts no longer in the crystal
    pub missing: usize,
}

/// Raise promoted and lower demoted concepts' relevance by `step`
pub fn apply_actions(crystal: &mut Crystal, actions: &[GuidedAction], step: f32) -> AppliedActions {
    let mut applied = AppliedActions::default();

    for guided in actions {
        let Some(current) = crystal.get(&guided.concept).map(|c| c.relevance) else {
            applied.missing += 1;
            continue;
        };
        match guided.action {
            Action::Promote => {
                crystal.set_relevance(&guided.concept, current + step);
                applied.promoted += 1;
            }
            Action::Demote => {
                crystal.set_relevance(&guided.concept, current - step);
                applied.demoted += 1;
            }
            Action::Keep => applied.kept += 1,
        }
    }

    tracing::debug!(
        promoted = applied.promoted,
        demoted = applied.demoted,
        kept = applied.kept,
        missing = applied.missing,
        "Applied guided actions"
    );
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unit_vector;

    fn crystal(names: &[&str]) -> Crystal {
        let mut crystal = Crystal::new(8);
        for (axis, name) in names.iter().enumerate() {
            crystal.store(*name, Vec::new(), unit_vector(8, axis)).unwrap();
        }
        crystal
    }

    #[test]
    fn test_one_action_per_concept_in_id_order() {
        let crystal = crystal(&["c", "a", "b"]);
        let agent = ActiveInferenceAgent::new();

        let actions = GuidedCrystal::new(&crystal, &agent).consolidate();
        let ids: Vec<&str> = actions.iter().map(|a| a.concept.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        // No beliefs at all: everything is worth nothing
        assert!(actions.iter().all(|a| a.action == Action::Demote));
    }

    #[test]
    fn test_favoured_concept_is_promoted() {
        let crystal = crystal(&["hot", "warm", "cold"]);
        let mut agent = ActiveInferenceAgent::new();
        for _ in 0..10 {
            agent.observe("hot");
        }
        agent.observe("warm");
        agent.observe("cold");
        agent.observe("warm");

        let actions = GuidedCrystal::new(&crystal, &agent).consolidate();
        let hot = actions.iter().find(|a| a.concept.as_str() == "hot").unwrap();
        assert_eq!(hot.action, Action::Promote);
    }

    #[test]
    fn test_cost_lowers_value() {
        let crystal = crystal(&["a", "b"]);
        let mut agent = ActiveInferenceAgent::new();
        agent.observe("a");
        agent.observe("b");

        let cheap = GuidedCrystal::new(&crystal, &agent).consolidate();
        agent.record_cost("a", 10.0);
        let costly = GuidedCrystal::new(&crystal, &agent).consolidate();

        assert_eq!(cheap[0].action, Action::Promote);
        assert_eq!(costly[0].action, Action::Demote);
        assert!((costly[0].value_ratio - cheap[0].value_ratio / 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_consolidate_is_read_only() {
        let crystal = crystal(&["a", "b"]);
        let before: Vec<f32> = crystal.iter().map(|(_, c)| c.relevance).collect();
        let agent = ActiveInferenceAgent::new();

        GuidedCrystal::new(&crystal, &agent).consolidate();
        let after: Vec<f32> = crystal.iter().map(|(_, c)| c.relevance).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_apply_actions_adjusts_relevance() {
        let mut crystal = crystal(&["up", "down", "same"]);
        let actions = vec![
            GuidedAction {
                concept: ConceptId::from("up"),
                action: Action::Promote,
                value_ratio: 2.0,
            },
            GuidedAction {
                concept: ConceptId::from("down"),
                action: Action::Demote,
                value_ratio: 0.1,
            },
            GuidedAction {
                concept: ConceptId::from("same"),
                action: Action::Keep,
                value_ratio: 1.0,
            },
            GuidedAction {
                concept: ConceptId::from("gone"),
                action: Action::Demote,
                value_ratio: 0.0,
            },
        ];

        let applied = apply_actions(&mut crystal, &actions, 0.2);
        assert_eq!(
            applied,
            AppliedActions {
                promoted: 1,
                demoted: 1,
                kept: 1,
                missing: 1
            }
        );
        assert!((crystal.get(&ConceptId::from("up")).unwrap().relevance - 0.7).abs() < 1e-6);
        assert!((crystal.get(&ConceptId::from("down")).unwrap().relevance - 0.3).abs() < 1e-6);
        assert_eq!(crystal.least_relevant_first()[0].as_str(), "down");
    }
}
