//! CLI entry point for keypoint administration.
//!
//! This binary provides the `keypoint` command with subcommands for
//! managing a file-backed keypoint store and dry-running authorization.

mod cli;
mod helpers;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::Parser;
use keypoint_policy::{AuthzConfig, AuthzError, RequestContext};
use keypoint_store::{Keypoint, KeypointFilter, KeypointStore, MemoryKeypointStore};
use tracing::{info, warn};

use crate::cli::{AddArgs, CheckArgs, Cli, Commands, ListArgs};
use crate::helpers::{
    generate_secret, init_tracing, keypoint_json, keypoint_row, load_config, open_store,
    parse_header, store_path,
};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let config = load_config(cli.config.as_deref())?;
    let store_flag = cli.store.as_deref();

    match cli.command {
        Commands::List(args) => cmd_list(&config, store_flag, args).await,
        Commands::Show {
            key_id,
            reveal_secret,
        } => cmd_show(&config, store_flag, &key_id, reveal_secret).await,
        Commands::Add(args) => cmd_add(&config, store_flag, args).await,
        Commands::Remove { key_id } => cmd_remove(&config, store_flag, &key_id).await,
        Commands::Cleanup => cmd_cleanup(&config, store_flag).await,
        Commands::Scopes { expand } => cmd_scopes(&config, &expand),
        Commands::Check(args) => {
            if !cmd_check(&config, store_flag, args).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Store subcommands
// ---------------------------------------------------------------------------

async fn cmd_list(config: &AuthzConfig, store_flag: Option<&Path>, args: ListArgs) -> Result<()> {
    let store = open_store(&store_path(config, store_flag)?).await?;

    let expired = match (args.expired, args.active) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    let filter = KeypointFilter {
        scope: args.scope,
        protocol: args.protocol,
        expired,
        name: args.name,
    };
    let keypoints = store.list(&filter).await?;

    if args.json {
        let rows = keypoints
            .iter()
            .map(|kp| keypoint_json(kp, false))
            .collect::<Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if keypoints.is_empty() {
        println!("No keypoints.");
        return Ok(());
    }
    println!(
        "{:<24} {:<20} {:<8} {:<26} SCOPES",
        "KEY ID", "NAME", "STATUS", "EXPIRES"
    );
    for kp in &keypoints {
        println!("{}", keypoint_row(kp));
    }
    Ok(())
}

async fn cmd_show(
    config: &AuthzConfig,
    store_flag: Option<&Path>,
    key_id: &str,
    reveal: bool,
) -> Result<()> {
    let store = open_store(&store_path(config, store_flag)?).await?;
    let Some(keypoint) = store.get(key_id).await? else {
        bail!("keypoint {key_id:?} not found");
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&keypoint_json(&keypoint, reveal)?)?
    );
    Ok(())
}

async fn cmd_add(config: &AuthzConfig, store_flag: Option<&Path>, args: AddArgs) -> Result<()> {
    let registry = config.build_registry()?;
    if !args.allow_unknown_scopes {
        registry
            .validate_scopes(&args.scopes)
            .context("pass --allow-unknown-scopes to store them anyway")?;
    }

    let path = store_path(config, store_flag)?;
    let store = open_store(&path).await?;

    let (secret, generated) = match args.secret {
        Some(secret) => (secret, false),
        None => (generate_secret()?, true),
    };

    let mut keypoint = Keypoint::new(args.key_id.clone(), secret.clone())
        .with_scopes(args.scopes)
        .with_protocols(args.protocols)
        .with_allowed_origins(args.origins)
        .with_allowed_ips(args.ips);
    if let Some(name) = args.name {
        keypoint = keypoint.with_name(name);
    }
    if let Some(requests) = args.rate_limit {
        keypoint = keypoint.with_rate_limit(requests, args.rate_window);
    }
    if let Some(days) = args.expires_in_days {
        let ttl = Duration::try_days(days).context("--expires-in-days is out of range")?;
        keypoint = keypoint.with_expires_at(Utc::now() + ttl);
    }
    if let Some(policy) = args.policy {
        if !config.policies.contains_key(&policy) {
            warn!(policy = %policy, "policy is not defined in the loaded config");
        }
        keypoint = keypoint.with_policy(policy);
    }

    let replaced = store.get(&args.key_id).await?.is_some();
    store.set(keypoint).await?;
    info!(key_id = %args.key_id, path = %path.display(), replaced, "keypoint saved");

    println!(
        "{} keypoint {}",
        if replaced { "Replaced" } else { "Added" },
        args.key_id
    );
    if generated {
        println!("Secret: {secret}");
        println!("Store it now; it is only shown once.");
    }
    Ok(())
}

async fn cmd_remove(config: &AuthzConfig, store_flag: Option<&Path>, key_id: &str) -> Result<()> {
    let store = open_store(&store_path(config, store_flag)?).await?;
    if !store.delete(key_id).await? {
        bail!("keypoint {key_id:?} not found");
    }
    println!("Removed keypoint {key_id}");
    Ok(())
}

async fn cmd_cleanup(config: &AuthzConfig, store_flag: Option<&Path>) -> Result<()> {
    let store = open_store(&store_path(config, store_flag)?).await?;
    let removed = store.cleanup_expired().await?;
    println!("Removed {removed} expired keypoint(s)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

fn cmd_scopes(config: &AuthzConfig, expand: &[String]) -> Result<()> {
    let registry = config.build_registry()?;

    if !expand.is_empty() {
        let expanded = registry.expand_scopes(expand);
        for scope in expanded {
            println!("{scope}");
        }
        return Ok(());
    }

    for scope in registry.list_scopes() {
        let children: Vec<String> = registry.children(&scope.name).into_iter().collect();
        if children.is_empty() {
            println!("{:<16} {}", scope.name, scope.description);
        } else {
            println!(
                "{:<16} {} (implies: {})",
                scope.name,
                scope.description,
                children.join(", ")
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

/// Run a synthetic request through the configured pipeline.
///
/// Prints the decision (or error) as JSON and returns whether it was allowed.
async fn cmd_check(
    config: &AuthzConfig,
    store_flag: Option<&Path>,
    args: CheckArgs,
) -> Result<bool> {
    let store: Arc<dyn KeypointStore> = match store_path(config, store_flag) {
        Ok(path) => Arc::new(open_store(&path).await?),
        Err(_) => {
            warn!("no keypoint store configured; every keypoint lookup will fail");
            Arc::new(MemoryKeypointStore::new())
        }
    };
    let pipeline = config.build_pipeline(store)?;

    let mut ctx = RequestContext::new(args.method, &args.url)
        .with_ip(args.ip)
        .with_protocol(args.protocol);
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        ctx = ctx.with_header(name, value);
    }
    if let Some(key_id) = args.key_id {
        ctx = ctx.with_header(&config.validator.id_header, key_id);
    }
    if let Some(secret) = args.secret {
        ctx = ctx.with_header(&config.validator.secret_header, secret);
    }

    let (allowed, output) = match pipeline.authorize(&mut ctx).await {
        Ok(decision) => (true, decision.to_json()),
        Err(AuthzError::Policy { decision, .. }) => (false, decision.to_json()),
        Err(e) => (
            false,
            serde_json::json!({
                "allowed": false,
                "error": e.error_code(),
                "status": e.status_code(),
                "reason": e.to_string(),
            }),
        ),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(allowed)
}
