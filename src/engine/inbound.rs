// Inbound resolution
// Picks the inbound rule for an event and applies conditional re-routing

//! # Inbound Resolver
//!
//! Resolution happens in two halves so that the inbound transformation can
//! run between them:
//!
//! 1. [`InboundResolver::select`] ranks the active inbound rules of
//!    `(agent, endpoint)` against the observed action and keeps the best one.
//! 2. [`InboundResolver::apply_routing`] evaluates the rule's `routingEntity`
//!    and `routingAction` tables on the canonical payload and settles the
//!    effective `(entity, action)` and routing mode.
//!
//! [`InboundResolver::resolve`] runs both halves back to back for callers that
//! have no transformation step.
//!
//! An event that no rule owns is [`InboundResolution::Unrouted`]. That is an
//! outcome, not an error.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::engine::catalog::RuleCatalog;
use crate::models::{
    select_best, InboundRoute, InboundRule, MatchRank, OnError, RoutingKey, RoutingMode,
};
use crate::{Result, RouterError};

/// Rule chosen for an observed event, before the payload is inspected
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSelection {
    pub rule: InboundRule,
    pub rank: MatchRank,
    /// Key as the source agent sent it
    pub observed: RoutingKey,
}

/// Fully resolved inbound route
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub rule: InboundRule,
    pub rank: MatchRank,
    /// Effective key used by the outbound stage
    pub key: RoutingKey,
    pub mode: RoutingMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundResolution {
    /// No active inbound rule owns the event
    Unrouted,
    Routed(ResolvedRoute),
}

pub struct InboundResolver {
    catalog: Arc<dyn RuleCatalog>,
}

impl InboundResolver {
    pub fn new(catalog: Arc<dyn RuleCatalog>) -> Self {
        Self { catalog }
    }

    /// Choose the inbound rule that owns `key`
    pub async fn select(&self, key: &RoutingKey) -> Result<Option<InboundSelection>> {
        let candidates = self
            .catalog
            .find_active_inbound(&key.agent, &key.entity, &key.action)
            .await?;

        let selection = select_best(&candidates, &key.action).map(|(rule, rank)| InboundSelection {
            rule: rule.clone(),
            rank,
            observed: key.clone(),
        });

        match &selection {
            Some(found) => debug!(
                key = %key,
                version = found.rule.version,
                rank = found.rank.value(),
                "Inbound rule selected"
            ),
            None => debug!(key = %key, candidates = candidates.len(), "No inbound rule owns event"),
        }
        Ok(selection)
    }

    /// Apply the selected rule's re-routing tables to the canonical payload
    pub async fn apply_routing(
        &self,
        selection: &InboundSelection,
        payload: &Value,
    ) -> Result<ResolvedRoute> {
        let rule = &selection.rule;
        let observed = &selection.observed;

        let base_entity = rule.entity.clone().unwrap_or_else(|| observed.entity.clone());
        let base_action = rule.action.clone().unwrap_or_else(|| observed.action.clone());

        let entity = pick_route(&rule.routing_entity, payload, "routingEntity")?
            .unwrap_or(base_entity);
        let action = pick_route(&rule.routing_action, payload, "routingAction")?
            .unwrap_or(base_action);

        let entity_default = self
            .catalog
            .find_entity(&entity)
            .await?
            .map(|row| row.routing_mode)
            .unwrap_or_default();
        let mode = rule.override_routing_mode.resolve(entity_default);

        let key = RoutingKey::new(&observed.agent, &entity, &action);
        debug!(observed = %observed, effective = %key, mode = %mode, "Inbound route resolved");

        Ok(ResolvedRoute {
            rule: rule.clone(),
            rank: selection.rank,
            key,
            mode,
        })
    }

    /// Select and apply in one step
    pub async fn resolve(&self, key: &RoutingKey, payload: &Value) -> Result<InboundResolution> {
        match self.select(key).await? {
            Some(selection) => Ok(InboundResolution::Routed(
                self.apply_routing(&selection, payload).await?,
            )),
            None => Ok(InboundResolution::Unrouted),
        }
    }
}

/// First matching entry wins; the fallback entry is only used when nothing matched
fn pick_route(routes: &[InboundRoute], payload: &Value, table: &str) -> Result<Option<String>> {
    let mut fallback: Option<&InboundRoute> = None;

    for route in routes {
        if route.is_fallback() {
            fallback.get_or_insert(route);
            continue;
        }
        let Some(conditions) = &route.conditions else {
            return Ok(Some(route.route.clone()));
        };
        match conditions.try_evaluate(payload) {
            Ok(true) => return Ok(Some(route.route.clone())),
            Ok(false) => {}
            Err(err) => match route.on_error {
                OnError::Fail => {
                    error!(table, route = %route.route, error = %err, "Routing condition failed, aborting");
                    return Err(RouterError::from_evaluation(err));
                }
                OnError::Ignore => {
                    warn!(table, route = %route.route, error = %err, "Routing condition failed, skipping entry");
                }
            },
        }
    }

    Ok(fallback.map(|route| route.route.clone()))
}
