//! Integration Router CLI
//!
//! Operator tool for checking a routing catalog before it is published and
//! for previewing how an event would be routed. The catalog is read from a
//! JSON snapshot (`inbound`, `outbound`, `endpoints`, `entities`, `webhooks`).
//!
//! ```text
//! routectl validate --catalog catalog.json
//! routectl resolve  --catalog catalog.json --agent erp --endpoint driver --action create --payload @event.json
//! routectl plan     --catalog catalog.json --agent erp --entity driver --action create --payload '{"status":"active"}'
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::{json, Value};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use integration_router::engine::CatalogSnapshot;
use integration_router::models::{ActionPattern, WILDCARD_ACTION};
use integration_router::{
    InMemoryCatalog, InboundResolution, InboundResolver, OutboundPlanner, RoutingKey, RuleCatalog,
    Settings,
};

#[derive(Parser)]
#[command(name = "routectl")]
#[command(about = "Integration Router CLI - validate catalogs and preview routing")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML, YAML or JSON)
    #[arg(long, env = "ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a catalog snapshot and check every rule
    Validate {
        /// Catalog snapshot file
        #[arg(long)]
        catalog: PathBuf,
    },

    /// Show which inbound rule owns an event and where it is re-routed
    Resolve {
        #[arg(long)]
        catalog: PathBuf,

        /// Source agent
        #[arg(long)]
        agent: String,

        /// Endpoint the event was addressed to
        #[arg(long)]
        endpoint: String,

        /// Observed action or method
        #[arg(long)]
        action: String,

        /// Canonical payload as JSON, or @file
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Show the dispatch waves for an effective routing key
    Plan {
        #[arg(long)]
        catalog: PathBuf,

        #[arg(long)]
        agent: String,

        #[arg(long)]
        entity: String,

        #[arg(long)]
        action: String,

        /// Canonical payload as JSON, or @file
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.log_filter()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { catalog } => validate(&catalog).await,
        Commands::Resolve {
            catalog,
            agent,
            endpoint,
            action,
            payload,
        } => {
            let catalog = load_catalog(&catalog).await?;
            let payload = parse_payload(&payload)?;
            resolve(catalog, RoutingKey::new(&agent, &endpoint, &action), &payload).await
        }
        Commands::Plan {
            catalog,
            agent,
            entity,
            action,
            payload,
        } => {
            let catalog = load_catalog(&catalog).await?;
            let payload = parse_payload(&payload)?;
            let plan = OutboundPlanner::new(catalog)
                .plan(&RoutingKey::new(&agent, &entity, &action), &payload)
                .await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<CatalogSnapshot> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading catalog {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing catalog {}", path.display()))
}

async fn load_catalog(path: &Path) -> Result<Arc<dyn RuleCatalog>> {
    let snapshot = read_snapshot(path).await?;
    let catalog: Arc<dyn RuleCatalog> = Arc::new(InMemoryCatalog::from_snapshot(snapshot).await?);
    Ok(catalog)
}

fn parse_payload(raw: &str) -> Result<Value> {
    match raw.strip_prefix('@') {
        Some(file) => {
            let text = std::fs::read_to_string(file).with_context(|| format!("reading payload {}", file))?;
            serde_json::from_str(&text).with_context(|| format!("parsing payload {}", file))
        }
        None => serde_json::from_str(raw).context("parsing payload"),
    }
}

async fn validate(path: &Path) -> Result<()> {
    let snapshot = read_snapshot(path).await?;
    let counts = json!({
        "inbound": snapshot.inbound.len(),
        "outbound": snapshot.outbound.len(),
        "endpoints": snapshot.endpoints.len(),
        "entities": snapshot.entities.len(),
        "webhooks": snapshot.webhooks.len(),
    });
    let keys = outbound_keys(&snapshot);

    let catalog = match InMemoryCatalog::from_snapshot(snapshot).await {
        Ok(catalog) => Arc::new(catalog),
        Err(err) => {
            error!(error = %err, "Catalog rejected");
            bail!("catalog is invalid: {}", err);
        }
    };

    // Cycles are checked before conditions, so an empty payload is enough.
    let planner = OutboundPlanner::new(catalog);
    let mut problems = Vec::new();
    for key in &keys {
        debug!(key = %key, "Checking outbound dependencies");
        if let Err(err) = planner.plan(key, &json!({})).await {
            problems.push(format!("{}: {}", key, err));
        }
    }

    if !problems.is_empty() {
        for problem in &problems {
            error!("{}", problem);
        }
        bail!("{} outbound key(s) have invalid dependencies", problems.len());
    }

    info!(rows = %counts, keys = keys.len(), "Catalog is valid");
    println!("{}", serde_json::to_string_pretty(&json!({"valid": true, "rows": counts}))?);
    Ok(())
}

/// Every (agent, entity, action) an outbound rule can be planned under
///
/// A wildcard rule is expanded to the actions the other rules of its
/// (agent, entity) name, plus the wildcard token itself, so cycles between
/// `all` rules are checked too.
fn outbound_keys(snapshot: &CatalogSnapshot) -> BTreeSet<RoutingKey> {
    let mut named: BTreeMap<(&str, &str), BTreeSet<String>> = BTreeMap::new();
    let mut wildcard: BTreeSet<(&str, &str)> = BTreeSet::new();
    for rule in &snapshot.outbound {
        let pair = (rule.agent.as_str(), rule.entity.as_str());
        let actions = named.entry(pair).or_default();
        match &rule.action {
            ActionPattern::Exact(action) => {
                actions.insert(action.clone());
            }
            ActionPattern::Set(set) => actions.extend(set.iter().cloned()),
            ActionPattern::Wildcard => {
                wildcard.insert(pair);
            }
            ActionPattern::Empty => {}
        }
    }
    for pair in &wildcard {
        named.entry(*pair).or_default().insert(WILDCARD_ACTION.to_string());
    }

    named
        .into_iter()
        .flat_map(|((agent, entity), actions)| {
            actions
                .into_iter()
                .map(move |action| RoutingKey::new(agent, entity, &action))
        })
        .collect()
}

async fn resolve(catalog: Arc<dyn RuleCatalog>, key: RoutingKey, payload: &Value) -> Result<()> {
    let resolver = InboundResolver::new(catalog.clone());
    let route = match resolver.resolve(&key, payload).await? {
        InboundResolution::Unrouted => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"observed": key, "routed": false}))?
            );
            return Ok(());
        }
        InboundResolution::Routed(route) => route,
    };

    let plan = OutboundPlanner::new(catalog).plan(&route.key, payload).await?;
    let report = json!({
        "observed": key,
        "routed": true,
        "inboundVersion": route.rule.version,
        "rank": route.rank,
        "effective": route.key,
        "routingMode": route.mode,
        "plan": plan,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
