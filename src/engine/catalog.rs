// Rule catalog abstraction
// Read-only, versioned lookup of routing definitions

//! # Rule Catalog
//!
//! The catalog is where the router reads its configuration from: inbound and
//! outbound rules, endpoints, entity defaults and webhook subscriptions.
//!
//! ## Catalog Architecture
//!
//! Follows the **Repository Pattern**:
//! - **RuleCatalog trait**: the read interface the engine depends on
//! - **InMemoryCatalog**: publishable store for tests, the CLI and single-process use
//! - **CachedCatalog**: TTL read cache in front of any other catalog
//!
//! Lookups are not required to return rows in any order. Callers rank the
//! candidates themselves with [`select_best`].
//!
//! ## Publishing Invariants
//!
//! [`InMemoryCatalog`] enforces what every catalog backend must guarantee:
//! - a published `(series, version)` row is never replaced
//! - publishing an active row deactivates the other versions of its series
//! - condition trees are validated before a row becomes visible
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! `#[async_trait]` lets trait methods be `async` and still be used as
//! `Arc<dyn RuleCatalog>` trait objects.
//!
//! ### Interior Mutability
//! `InMemoryCatalog` holds a `tokio::sync::RwLock`. Readers never block one
//! another and the lock cannot be poisoned, so no `.unwrap()` is needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::{
    select_best, ActionPattern, ConditionNode, Endpoint, InboundRule, IntegrationEntity, OutboundRule,
    WebhookSubscription,
};
use crate::{Result, RouterError};

/// Read interface over routing configuration
#[async_trait]
pub trait RuleCatalog: Send + Sync {
    /// Active inbound rules of `(agent, endpoint)` whose method pattern can own `action`
    async fn find_active_inbound(
        &self,
        agent: &str,
        endpoint: &str,
        action: &str,
    ) -> Result<Vec<InboundRule>>;

    /// Active outbound rules of `(agent, entity)` whose action pattern can own `action`
    async fn find_active_outbound(
        &self,
        agent: &str,
        entity: &str,
        action: &str,
    ) -> Result<Vec<OutboundRule>>;

    /// Best active endpoint for a destination agent
    async fn find_endpoint(
        &self,
        target: &str,
        entity: &str,
        action: &str,
    ) -> Result<Option<Endpoint>>;

    /// Active entity configuration
    async fn find_entity(&self, entity: &str) -> Result<Option<IntegrationEntity>>;

    /// Active webhook subscriptions of an agent
    async fn find_webhook_subscriptions(&self, agent: &str) -> Result<Vec<WebhookSubscription>>;
}

/// Full catalog contents, as exported to or loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSnapshot {
    pub inbound: Vec<InboundRule>,
    pub outbound: Vec<OutboundRule>,
    pub endpoints: Vec<Endpoint>,
    pub entities: Vec<IntegrationEntity>,
    pub webhooks: Vec<WebhookSubscription>,
}

/// Rows that belong to a version series
trait Series {
    type Key: PartialEq + std::fmt::Debug;

    fn series_key(&self) -> Self::Key;
    fn row_version(&self) -> u32;
    fn row_active(&self) -> bool;
    fn set_active(&mut self, active: bool);
}

impl Series for InboundRule {
    type Key = (String, String, String);

    fn series_key(&self) -> Self::Key {
        self.series()
    }
    fn row_version(&self) -> u32 {
        self.version
    }
    fn row_active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

impl Series for OutboundRule {
    type Key = (String, String, String, String);

    fn series_key(&self) -> Self::Key {
        self.series()
    }
    fn row_version(&self) -> u32 {
        self.version
    }
    fn row_active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

impl Series for Endpoint {
    type Key = (String, String, String);

    fn series_key(&self) -> Self::Key {
        self.series()
    }
    fn row_version(&self) -> u32 {
        self.version
    }
    fn row_active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

impl Series for IntegrationEntity {
    type Key = String;

    fn series_key(&self) -> Self::Key {
        self.entity.clone()
    }
    fn row_version(&self) -> u32 {
        self.version
    }
    fn row_active(&self) -> bool {
        self.active
    }
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

fn publish_row<T: Series>(rows: &mut Vec<T>, row: T) -> Result<()> {
    if row.row_version() == 0 {
        return Err(RouterError::InvalidInput(format!(
            "version of {:?} must be at least 1",
            row.series_key()
        )));
    }
    let key = row.series_key();
    if rows
        .iter()
        .any(|existing| existing.series_key() == key && existing.row_version() == row.row_version())
    {
        return Err(RouterError::InvalidInput(format!(
            "version {} of {:?} is already published",
            row.row_version(),
            key
        )));
    }
    if row.row_active() {
        for existing in rows.iter_mut().filter(|existing| existing.series_key() == key) {
            existing.set_active(false);
        }
    }
    rows.push(row);
    Ok(())
}

fn activate_row<T: Series>(rows: &mut [T], key: &T::Key, version: u32) -> Result<()> {
    if !rows
        .iter()
        .any(|row| &row.series_key() == key && row.row_version() == version)
    {
        return Err(RouterError::NotFound(format!("version {} of {:?}", version, key)));
    }
    for row in rows.iter_mut().filter(|row| &row.series_key() == key) {
        let active = row.row_version() == version;
        row.set_active(active);
    }
    Ok(())
}

fn validate_conditions<'a>(
    owner: &str,
    conditions: impl IntoIterator<Item = &'a ConditionNode>,
) -> Result<()> {
    for node in conditions {
        node.validate().map_err(|err| {
            RouterError::Configuration(format!("{} has an invalid condition: {}", owner, err))
        })?;
    }
    Ok(())
}

#[derive(Default)]
struct CatalogData {
    inbound: Vec<InboundRule>,
    outbound: Vec<OutboundRule>,
    endpoints: Vec<Endpoint>,
    entities: Vec<IntegrationEntity>,
    webhooks: Vec<WebhookSubscription>,
}

/// In-memory catalog
///
/// ## Limitations
///
/// - **Not persistent**: contents are lost when the process exits
/// - **Not distributed**: every process holds its own copy
#[derive(Default)]
pub struct InMemoryCatalog {
    data: RwLock<CatalogData>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog by publishing every row of a snapshot in order
    pub async fn from_snapshot(snapshot: CatalogSnapshot) -> Result<Self> {
        let catalog = Self::new();
        for entity in snapshot.entities {
            catalog.publish_entity(entity).await?;
        }
        for endpoint in snapshot.endpoints {
            catalog.publish_endpoint(endpoint).await?;
        }
        for rule in snapshot.inbound {
            catalog.publish_inbound(rule).await?;
        }
        for rule in snapshot.outbound {
            catalog.publish_outbound(rule).await?;
        }
        for subscription in snapshot.webhooks {
            catalog.add_webhook_subscription(subscription).await;
        }
        Ok(catalog)
    }

    pub async fn snapshot(&self) -> CatalogSnapshot {
        let data = self.data.read().await;
        CatalogSnapshot {
            inbound: data.inbound.clone(),
            outbound: data.outbound.clone(),
            endpoints: data.endpoints.clone(),
            entities: data.entities.clone(),
            webhooks: data.webhooks.clone(),
        }
    }

    pub async fn publish_inbound(&self, rule: InboundRule) -> Result<()> {
        validate_conditions(&format!("inbound rule {:?}", rule.series()), rule.conditions())?;
        info!(
            agent = %rule.agent,
            endpoint = %rule.endpoint,
            method = %rule.method,
            version = rule.version,
            active = rule.active,
            "Publishing inbound rule"
        );
        let mut data = self.data.write().await;
        publish_row(&mut data.inbound, rule)
    }

    pub async fn publish_outbound(&self, rule: OutboundRule) -> Result<()> {
        validate_conditions(&format!("outbound rule {:?}", rule.series()), rule.conditions.iter())?;
        info!(
            agent = %rule.agent,
            entity = %rule.entity,
            action = %rule.action,
            target = %rule.target,
            version = rule.version,
            active = rule.active,
            "Publishing outbound rule"
        );
        let mut data = self.data.write().await;
        publish_row(&mut data.outbound, rule)
    }

    pub async fn publish_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        if endpoint.endpoint.trim().is_empty() {
            return Err(RouterError::InvalidInput(format!(
                "endpoint {} has no address",
                endpoint.gate_key()
            )));
        }
        let mut data = self.data.write().await;
        publish_row(&mut data.endpoints, endpoint)
    }

    pub async fn publish_entity(&self, entity: IntegrationEntity) -> Result<()> {
        let mut data = self.data.write().await;
        publish_row(&mut data.entities, entity)
    }

    pub async fn add_webhook_subscription(&self, subscription: WebhookSubscription) {
        self.data.write().await.webhooks.push(subscription);
    }

    /// Make `version` the active row of an inbound series
    ///
    /// `method` is normalized like a stored rule, so `"POST, PUT"` finds the
    /// series published as `"POST,PUT"`.
    pub async fn activate_inbound(
        &self,
        agent: &str,
        endpoint: &str,
        method: &str,
        version: u32,
    ) -> Result<()> {
        let key = (
            agent.to_string(),
            endpoint.to_string(),
            ActionPattern::parse(method).to_string(),
        );
        let mut data = self.data.write().await;
        activate_row(&mut data.inbound, &key, version)
    }

    /// Make `version` the active row of an outbound series
    pub async fn activate_outbound(
        &self,
        agent: &str,
        entity: &str,
        action: &str,
        target: &str,
        version: u32,
    ) -> Result<()> {
        let key = (
            agent.to_string(),
            entity.to_string(),
            ActionPattern::parse(action).to_string(),
            target.to_string(),
        );
        let mut data = self.data.write().await;
        activate_row(&mut data.outbound, &key, version)
    }
}

#[async_trait]
impl RuleCatalog for InMemoryCatalog {
    async fn find_active_inbound(
        &self,
        agent: &str,
        endpoint: &str,
        action: &str,
    ) -> Result<Vec<InboundRule>> {
        let data = self.data.read().await;
        Ok(data
            .inbound
            .iter()
            .filter(|rule| rule.active && rule.agent == agent && rule.endpoint == endpoint)
            .filter(|rule| rule.method.matches(action).is_some())
            .cloned()
            .collect())
    }

    async fn find_active_outbound(
        &self,
        agent: &str,
        entity: &str,
        action: &str,
    ) -> Result<Vec<OutboundRule>> {
        let data = self.data.read().await;
        Ok(data
            .outbound
            .iter()
            .filter(|rule| rule.active && rule.agent == agent && rule.entity == entity)
            .filter(|rule| rule.action.matches(action).is_some())
            .cloned()
            .collect())
    }

    async fn find_endpoint(
        &self,
        target: &str,
        entity: &str,
        action: &str,
    ) -> Result<Option<Endpoint>> {
        let data = self.data.read().await;
        let candidates = data
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.agent == target && endpoint.entity == entity);
        Ok(select_best(candidates, action).map(|(endpoint, _)| endpoint.clone()))
    }

    async fn find_entity(&self, entity: &str) -> Result<Option<IntegrationEntity>> {
        let data = self.data.read().await;
        Ok(data
            .entities
            .iter()
            .filter(|row| row.active && row.entity == entity)
            .max_by_key(|row| row.version)
            .cloned())
    }

    async fn find_webhook_subscriptions(&self, agent: &str) -> Result<Vec<WebhookSubscription>> {
        let data = self.data.read().await;
        Ok(data
            .webhooks
            .iter()
            .filter(|sub| sub.is_active && sub.agent_name == agent)
            .cloned()
            .collect())
    }
}

struct CacheEntry<T> {
    stored_at: Instant,
    value: T,
}

/// Lookups kept per cache map before expired entries are swept
pub const DEFAULT_MAX_CACHED_LOOKUPS: usize = 4096;

/// TTL read cache in front of another catalog
///
/// Readers may see a rule change up to one TTL late. Call [`invalidate`]
/// after publishing to drop everything immediately.
///
/// Keys come from event fields, so each map is bounded: an expired entry is
/// removed when it is next read, and a full map is swept before inserting.
///
/// [`invalidate`]: CachedCatalog::invalidate
pub struct CachedCatalog {
    inner: Arc<dyn RuleCatalog>,
    ttl: Duration,
    max_entries: usize,
    inbound: DashMap<(String, String, String), CacheEntry<Vec<InboundRule>>>,
    outbound: DashMap<(String, String, String), CacheEntry<Vec<OutboundRule>>>,
    endpoints: DashMap<(String, String, String), CacheEntry<Option<Endpoint>>>,
    entities: DashMap<String, CacheEntry<Option<IntegrationEntity>>>,
    webhooks: DashMap<String, CacheEntry<Vec<WebhookSubscription>>>,
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn RuleCatalog>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            max_entries: DEFAULT_MAX_CACHED_LOOKUPS,
            inbound: DashMap::new(),
            outbound: DashMap::new(),
            endpoints: DashMap::new(),
            entities: DashMap::new(),
            webhooks: DashMap::new(),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Number of cached lookups across every map
    pub fn cached_entries(&self) -> usize {
        self.inbound.len()
            + self.outbound.len()
            + self.endpoints.len()
            + self.entities.len()
            + self.webhooks.len()
    }

    /// Drop every cached lookup
    pub fn invalidate(&self) {
        self.inbound.clear();
        self.outbound.clear();
        self.endpoints.clear();
        self.entities.clear();
        self.webhooks.clear();
        debug!("Catalog cache invalidated");
    }

    fn fresh<K, T>(&self, cache: &DashMap<K, CacheEntry<T>>, key: &K) -> Option<T>
    where
        K: std::hash::Hash + Eq,
        T: Clone,
    {
        let hit = cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone());
        // The read guard is gone here; removing under it would deadlock the shard.
        if hit.is_none() {
            cache.remove_if(key, |_, entry| entry.stored_at.elapsed() >= self.ttl);
        }
        hit
    }

    fn store<K, T>(&self, cache: &DashMap<K, CacheEntry<T>>, key: K, value: T)
    where
        K: std::hash::Hash + Eq,
    {
        if cache.len() >= self.max_entries {
            let ttl = self.ttl;
            cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
            if cache.len() >= self.max_entries {
                debug!(entries = cache.len(), "Catalog cache full, clearing");
                cache.clear();
            }
        }
        cache.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                value,
            },
        );
    }
}

fn triple(a: &str, b: &str, c: &str) -> (String, String, String) {
    (a.to_string(), b.to_string(), c.to_string())
}

#[async_trait]
impl RuleCatalog for CachedCatalog {
    async fn find_active_inbound(
        &self,
        agent: &str,
        endpoint: &str,
        action: &str,
    ) -> Result<Vec<InboundRule>> {
        let key = triple(agent, endpoint, action);
        if let Some(hit) = self.fresh(&self.inbound, &key) {
            return Ok(hit);
        }
        let rows = self.inner.find_active_inbound(agent, endpoint, action).await?;
        self.store(&self.inbound, key, rows.clone());
        Ok(rows)
    }

    async fn find_active_outbound(
        &self,
        agent: &str,
        entity: &str,
        action: &str,
    ) -> Result<Vec<OutboundRule>> {
        let key = triple(agent, entity, action);
        if let Some(hit) = self.fresh(&self.outbound, &key) {
            return Ok(hit);
        }
        let rows = self.inner.find_active_outbound(agent, entity, action).await?;
        self.store(&self.outbound, key, rows.clone());
        Ok(rows)
    }

    async fn find_endpoint(
        &self,
        target: &str,
        entity: &str,
        action: &str,
    ) -> Result<Option<Endpoint>> {
        let key = triple(target, entity, action);
        if let Some(hit) = self.fresh(&self.endpoints, &key) {
            return Ok(hit);
        }
        let endpoint = self.inner.find_endpoint(target, entity, action).await?;
        self.store(&self.endpoints, key, endpoint.clone());
        Ok(endpoint)
    }

    async fn find_entity(&self, entity: &str) -> Result<Option<IntegrationEntity>> {
        let key = entity.to_string();
        if let Some(hit) = self.fresh(&self.entities, &key) {
            return Ok(hit);
        }
        let row = self.inner.find_entity(entity).await?;
        self.store(&self.entities, key, row.clone());
        Ok(row)
    }

    async fn find_webhook_subscriptions(&self, agent: &str) -> Result<Vec<WebhookSubscription>> {
        let key = agent.to_string();
        if let Some(hit) = self.fresh(&self.webhooks, &key) {
            return Ok(hit);
        }
        let rows = self.inner.find_webhook_subscriptions(agent).await?;
        self.store(&self.webhooks, key, rows.clone());
        Ok(rows)
    }
}
