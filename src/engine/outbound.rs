// Outbound planning
// Turns the active outbound rules of a key into ordered dispatch waves

//! # Outbound Planner
//!
//! Given the effective routing key and the canonical payload, the planner
//! decides which destinations receive the event and in what order.
//!
//! ## Planning Steps
//!
//! 1. Fetch the active outbound rules and keep the best `(rank, version)`
//!    row per target.
//! 2. Reject dependency cycles among those candidates. A cycle is a
//!    configuration error and nothing is dispatched.
//! 3. Evaluate each rule's `conditions`. `false` excludes the rule; an
//!    evaluation error skips it with [`SkipReason::ConditionError`].
//! 4. Skip, transitively, every rule that depends on a target which did not
//!    survive step 3 ([`SkipReason::DependencyUnmet`]).
//! 5. Layer the survivors into waves with Kahn's algorithm. A rule's wave is
//!    one past the latest wave of its dependencies.
//!
//! Units inside a wave are sorted by target so plans are deterministic.
//!
//! ## Rust Learning Notes:
//!
//! ### Ordered Collections for Determinism
//! `BTreeMap` and `BTreeSet` iterate in key order. Using them instead of
//! `HashMap` means two runs over the same catalog always produce the same
//! plan, which makes plans diffable and tests stable.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::engine::catalog::RuleCatalog;
use crate::models::{select_best, MatchRank, OutboundRule, RoutingKey};
use crate::{Result, RouterError};

/// One destination to dispatch to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchUnit {
    pub rule: OutboundRule,
    pub rank: MatchRank,
    /// Zero-based wave index
    pub wave: usize,
}

impl DispatchUnit {
    pub fn target(&self) -> &str {
        &self.rule.target
    }

    /// Targets that must succeed before this unit runs
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.rule.dependencies.keys().map(String::as_str)
    }
}

/// Why a rule that passed the catalog lookup is not dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The rule's conditions could not be evaluated
    ConditionError { message: String },
    /// A dependency was excluded, skipped, missing or failed
    DependencyUnmet { missing: Vec<String> },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ConditionError { message } => write!(f, "condition_error: {}", message),
            SkipReason::DependencyUnmet { missing } => {
                write!(f, "dependency_unmet: {}", missing.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedUnit {
    pub rule: OutboundRule,
    pub reason: SkipReason,
}

/// Ordered dispatch plan for one event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchPlan {
    pub key: RoutingKey,
    pub waves: Vec<Vec<DispatchUnit>>,
    pub skipped: Vec<SkippedUnit>,
    /// Rules whose conditions evaluated to false
    pub excluded: Vec<OutboundRule>,
}

impl DispatchPlan {
    pub fn unit_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Nothing to dispatch
    pub fn is_empty(&self) -> bool {
        self.unit_count() == 0
    }

    pub fn units(&self) -> impl Iterator<Item = &DispatchUnit> {
        self.waves.iter().flatten()
    }
}

pub struct OutboundPlanner {
    catalog: Arc<dyn RuleCatalog>,
}

impl OutboundPlanner {
    pub fn new(catalog: Arc<dyn RuleCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn plan(&self, key: &RoutingKey, payload: &Value) -> Result<DispatchPlan> {
        let rows = self
            .catalog
            .find_active_outbound(&key.agent, &key.entity, &key.action)
            .await?;
        let plan = build_plan(key, rows, payload)?;
        debug!(
            key = %key,
            waves = plan.waves.len(),
            units = plan.unit_count(),
            skipped = plan.skipped.len(),
            excluded = plan.excluded.len(),
            "Dispatch plan built"
        );
        Ok(plan)
    }
}

/// Pure planning over already-fetched rows
pub fn build_plan(key: &RoutingKey, rows: Vec<OutboundRule>, payload: &Value) -> Result<DispatchPlan> {
    let candidates = best_per_target(rows, &key.action);
    detect_cycles(&candidates)?;

    let mut surviving: BTreeMap<String, (OutboundRule, MatchRank)> = BTreeMap::new();
    let mut skipped = Vec::new();
    let mut excluded = Vec::new();

    for (target, (rule, rank)) in candidates {
        let Some(conditions) = &rule.conditions else {
            surviving.insert(target, (rule, rank));
            continue;
        };
        match conditions.try_evaluate(payload) {
            Ok(true) => {
                surviving.insert(target, (rule, rank));
            }
            Ok(false) => {
                debug!(destination = %target, "Outbound rule excluded by its conditions");
                excluded.push(rule);
            }
            Err(err) => {
                if err.is_configuration() {
                    error!(destination = %target, error = %err, "Outbound rule has a malformed condition");
                } else {
                    warn!(destination = %target, error = %err, "Outbound condition could not be evaluated");
                }
                skipped.push(SkippedUnit {
                    rule,
                    reason: SkipReason::ConditionError {
                        message: err.to_string(),
                    },
                });
            }
        }
    }

    // Dropping one rule can strand another, so repeat until nothing changes.
    loop {
        let stranded: Vec<(String, Vec<String>)> = surviving
            .iter()
            .filter_map(|(target, (rule, _))| {
                let missing: Vec<String> = rule
                    .dependencies
                    .keys()
                    .filter(|dep| !surviving.contains_key(*dep))
                    .cloned()
                    .collect();
                (!missing.is_empty()).then(|| (target.clone(), missing))
            })
            .collect();
        if stranded.is_empty() {
            break;
        }
        for (target, missing) in stranded {
            if let Some((rule, _)) = surviving.remove(&target) {
                debug!(destination = %target, missing = ?missing, "Outbound rule skipped, dependency unmet");
                skipped.push(SkippedUnit {
                    rule,
                    reason: SkipReason::DependencyUnmet { missing },
                });
            }
        }
    }

    let waves = layer_waves(surviving)?;
    Ok(DispatchPlan {
        key: key.clone(),
        waves,
        skipped,
        excluded,
    })
}

fn best_per_target(rows: Vec<OutboundRule>, action: &str) -> BTreeMap<String, (OutboundRule, MatchRank)> {
    let mut by_target: BTreeMap<String, Vec<OutboundRule>> = BTreeMap::new();
    for row in rows {
        by_target.entry(row.target.clone()).or_default().push(row);
    }
    by_target
        .into_iter()
        .filter_map(|(target, rows)| {
            select_best(&rows, action).map(|(rule, rank)| (target, (rule.clone(), rank)))
        })
        .collect()
}

/// Kahn's algorithm over the candidate graph; leftovers form a cycle
fn detect_cycles(candidates: &BTreeMap<String, (OutboundRule, MatchRank)>) -> Result<()> {
    let mut in_degree: BTreeMap<&str, usize> = candidates
        .iter()
        .map(|(target, (rule, _))| {
            let degree = rule
                .dependencies
                .keys()
                .filter(|dep| candidates.contains_key(*dep))
                .count();
            (target.as_str(), degree)
        })
        .collect();

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(target, _)| *target)
        .collect();
    let mut processed = 0usize;

    while let Some(done) = queue.pop() {
        processed += 1;
        for (target, (rule, _)) in candidates {
            if rule.dependencies.contains_key(done) {
                if let Some(degree) = in_degree.get_mut(target.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(target.as_str());
                    }
                }
            }
        }
    }

    if processed == candidates.len() {
        return Ok(());
    }

    let cycle: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(target, _)| *target)
        .collect();
    error!(targets = ?cycle, "Dependency cycle among outbound rules");
    Err(RouterError::Configuration(format!(
        "dependency cycle among outbound targets: {}",
        cycle.join(" -> ")
    )))
}

fn layer_waves(mut remaining: BTreeMap<String, (OutboundRule, MatchRank)>) -> Result<Vec<Vec<DispatchUnit>>> {
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, (rule, _))| rule.dependencies.keys().all(|dep| placed.contains(dep)))
            .map(|(target, _)| target.clone())
            .collect();
        if ready.is_empty() {
            return Err(RouterError::Internal(
                "outbound rules could not be layered into waves".to_string(),
            ));
        }

        let wave_index = waves.len();
        let mut wave = Vec::with_capacity(ready.len());
        for target in ready {
            if let Some((rule, rank)) = remaining.remove(&target) {
                wave.push(DispatchUnit {
                    rule,
                    rank,
                    wave: wave_index,
                });
            }
        }
        placed.extend(wave.iter().map(|unit| unit.rule.target.clone()));
        waves.push(wave);
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::catalog::InMemoryCatalog;
    use crate::models::{ConditionNode, Operator};
    use serde_json::json;

    fn key() -> RoutingKey {
        RoutingKey::new("erp", "driver", "create")
    }

    fn rule(target: &str) -> OutboundRule {
        OutboundRule::new("erp", "driver", "create", target)
    }

    fn targets(wave: &[DispatchUnit]) -> Vec<&str> {
        wave.iter().map(DispatchUnit::target).collect()
    }

    #[test]
    fn test_plain_rules_form_one_wave() {
        let plan = build_plan(&key(), vec![rule("wms"), rule("crm"), rule("tms")], &json!({})).unwrap();
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(targets(&plan.waves[0]), vec!["crm", "tms", "wms"]);
        assert!(plan.skipped.is_empty());
        assert!(plan.excluded.is_empty());
    }

    #[test]
    fn test_dependencies_layer_into_waves() {
        let rows = vec![
            rule("billing").depends_on("crm").depends_on("wms"),
            rule("wms"),
            rule("crm").depends_on("wms"),
            rule("audit"),
        ];
        let plan = build_plan(&key(), rows, &json!({})).unwrap();

        assert_eq!(plan.waves.len(), 3);
        assert_eq!(targets(&plan.waves[0]), vec!["audit", "wms"]);
        assert_eq!(targets(&plan.waves[1]), vec!["crm"]);
        assert_eq!(targets(&plan.waves[2]), vec!["billing"]);
        assert_eq!(plan.waves[2][0].wave, 2);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let rows = vec![rule("a").depends_on("b"), rule("b").depends_on("c"), rule("c").depends_on("a")];
        let err = build_plan(&key(), rows, &json!({})).unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = build_plan(&key(), vec![rule("a").depends_on("a")], &json!({})).unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
    }

    #[test]
    fn test_cycle_detected_even_if_conditions_would_exclude() {
        let never = ConditionNode::any(vec![]);
        let rows = vec![
            rule("a").depends_on("b").with_conditions(never),
            rule("b").depends_on("a"),
        ];
        assert!(build_plan(&key(), rows, &json!({})).is_err());
    }

    #[test]
    fn test_conditions_exclude_and_strand_dependents() {
        let rows = vec![
            rule("wms").with_conditions(ConditionNode::leaf("status", Operator::Eq, json!("active"))),
            rule("crm").depends_on("wms"),
            rule("billing").depends_on("crm"),
            rule("audit"),
        ];
        let plan = build_plan(&key(), rows, &json!({"status": "inactive"})).unwrap();

        assert_eq!(plan.excluded.len(), 1);
        assert_eq!(plan.excluded[0].target, "wms");
        assert_eq!(plan.skipped.len(), 2);
        assert!(plan
            .skipped
            .iter()
            .all(|unit| matches!(unit.reason, SkipReason::DependencyUnmet { .. })));
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(targets(&plan.waves[0]), vec!["audit"]);
    }

    #[test]
    fn test_condition_error_skips_only_that_unit() {
        let rows = vec![
            rule("wms").with_conditions(ConditionNode::leaf("age", Operator::Gt, json!(10))),
            rule("crm"),
        ];
        let plan = build_plan(&key(), rows, &json!({"age": "old"})).unwrap();

        assert_eq!(plan.skipped.len(), 1);
        assert!(matches!(plan.skipped[0].reason, SkipReason::ConditionError { .. }));
        assert_eq!(targets(&plan.waves[0]), vec!["crm"]);
    }

    #[test]
    fn test_missing_dependency_target_is_unmet() {
        let plan = build_plan(&key(), vec![rule("crm").depends_on("ghost")], &json!({})).unwrap();
        assert!(plan.is_empty());
        assert_eq!(
            plan.skipped[0].reason,
            SkipReason::DependencyUnmet {
                missing: vec!["ghost".to_string()]
            }
        );
    }

    #[test]
    fn test_best_row_per_target() {
        let rows = vec![
            OutboundRule::new("erp", "driver", "all", "wms").with_version(5),
            OutboundRule::new("erp", "driver", "create", "wms").with_version(1),
            OutboundRule::new("erp", "driver", "create,update", "crm").with_version(2),
        ];
        let plan = build_plan(&key(), rows, &json!({})).unwrap();
        let units: Vec<&DispatchUnit> = plan.units().collect();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].rank, MatchRank::Listed);
        assert_eq!(units[1].rule.version, 1);
        assert_eq!(units[1].rank, MatchRank::Exact);
    }

    #[tokio::test]
    async fn test_planner_reads_active_rules_from_catalog() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.publish_outbound(rule("wms")).await.unwrap();
        catalog.publish_outbound(rule("crm").inactive()).await.unwrap();

        let planner = OutboundPlanner::new(catalog);
        let plan = planner.plan(&key(), &json!({})).await.unwrap();
        assert_eq!(plan.unit_count(), 1);
        assert_eq!(plan.waves[0][0].target(), "wms");
    }
}
