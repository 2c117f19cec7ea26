use std::path::{Path, PathBuf};
use std::sync::Arc;

use wsgate_core::{EndpointContext, GatewayConfig, StageEndpoints};
use wsgate_deploy::{ConflictPolicy, Dependency, LifecycleEvent, ReconcileOutcome, Reconciler, settle};
use wsgate_state::StateStore;

use super::{load_config, open_store};
use crate::retry::RetryPolicy;

pub struct ApplyArgs {
    pub config: PathBuf,
    pub data_dir: PathBuf,
    pub event: LifecycleEvent,
    pub description: Option<String>,
    pub fail_fast: bool,
    pub retries: u32,
    pub verify: bool,
}

/// Context the reconciler derives endpoints in. A missing `[context]`
/// section surfaces as a `MissingContext` reconcile error.
fn context(cfg: &GatewayConfig) -> EndpointContext {
    cfg.context
        .clone()
        .unwrap_or_else(|| EndpointContext::new("", ""))
}

pub async fn plan(config: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let graph = cfg.graph()?;
    let stage = cfg.stage()?;
    let store = open_store(data_dir)?;

    let reconciler = Reconciler::new(Arc::new(store), context(&cfg));
    let plan = reconciler.plan_for(&graph, &stage.stage_name).await?;

    let target = format!("{}/{}", graph.api.id, stage.stage_name);
    match (&plan.bound, plan.needs_deployment()) {
        (None, _) => println!(
            "+ {target}: first deployment ({})",
            plan.fingerprint.short()
        ),
        (Some(id), true) => println!(
            "~ {target}: repoint from {id} ({}) to a new deployment ({})",
            plan.bound_fingerprint
                .as_ref()
                .map_or("unknown", |fp| fp.short()),
            plan.fingerprint.short()
        ),
        (Some(id), false) => println!("= {target}: no changes, stays on {id}"),
    }
    Ok(())
}

pub async fn apply(args: ApplyArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)?;
    let store = open_store(&args.data_dir)?;
    if args.event != LifecycleEvent::Delete {
        settle(&store, &cfg)?;
    }

    let api_id = cfg.api.id.clone();
    let stage_name = cfg.stage.stage_name.clone();
    let policy = if args.fail_fast {
        ConflictPolicy::FailFast
    } else {
        ConflictPolicy::Queue
    };
    let reconciler = Reconciler::new(Arc::new(store), context(&cfg)).with_policy(policy);
    let description = args
        .description
        .unwrap_or_else(|| format!("wsgate {} of {api_id}/{stage_name}", args.event));

    let retry = RetryPolicy {
        attempts: args.retries,
        ..Default::default()
    };
    let outcome = retry
        .run(|| reconciler.reconcile(args.event, &api_id, &stage_name, &description))
        .await?;

    match &outcome {
        ReconcileOutcome::Deployed(info) => println!(
            "✓ Deployed {} to {api_id}/{stage_name} ({})",
            info.deployment_id,
            info.fingerprint.short()
        ),
        ReconcileOutcome::Unchanged(info) => println!(
            "✓ No changes, {api_id}/{stage_name} still serves {}",
            info.deployment_id
        ),
        ReconcileOutcome::Released => println!("✓ Released {api_id}/{stage_name}"),
    }

    if let Some(info) = outcome.endpoint() {
        print_endpoints(&info.endpoints);
        if args.verify {
            let settings = cfg.verify.clone().unwrap_or_default();
            super::verify::run(&info.endpoints.stream_url, &settings).await?;
        }
    }
    Ok(())
}

pub async fn status(config: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let store = open_store(data_dir)?;
    let api_id = cfg.api.id.as_str();
    let stage_name = cfg.stage.stage_name.as_str();

    let reconciler = Reconciler::new(Arc::new(store.clone()), context(&cfg));
    let plan = reconciler.plan(api_id, stage_name).await?;
    println!(
        "stage        {api_id}/{stage_name} -> {}",
        plan.bound.as_deref().unwrap_or("(unbound)")
    );
    println!(
        "graph        {} ({})",
        plan.fingerprint.short(),
        if plan.needs_deployment() { "not deployed" } else { "deployed" }
    );

    let deps: Vec<String> = reconciler
        .dependencies(api_id, stage_name)
        .await?
        .into_iter()
        .map(|d| match d {
            Dependency::Route(key) => format!("route {key}"),
            Dependency::Stage(name) => format!("stage {name}"),
        })
        .collect();
    println!("depends on   {}", deps.join(", "));

    print_history(&store, api_id)?;
    Ok(())
}

pub fn teardown(config: &Path, data_dir: &Path, stage_only: bool) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let store = open_store(data_dir)?;
    let api_id = cfg.api.id.as_str();

    if stage_only {
        let stage_name = cfg.stage.stage_name.as_str();
        match store.delete_stage(api_id, stage_name)? {
            Some(t) => println!(
                "✓ Removed stage {api_id}/{stage_name} and {} deployment(s)",
                t.deployments
            ),
            None => println!("stage {api_id}/{stage_name} not found"),
        }
    } else {
        let t = store.delete_api(api_id)?;
        println!(
            "✓ Removed {api_id}: {} stage(s), {} deployment(s)",
            t.stages, t.deployments
        );
    }
    Ok(())
}

fn print_endpoints(endpoints: &StageEndpoints) {
    println!("  stream       {}", endpoints.stream_url);
    println!("  send         {}", endpoints.send_url);
    println!("  connections  {}", endpoints.connections_arn);
}

fn print_history(store: &StateStore, api_id: &str) -> anyhow::Result<()> {
    let history = store.list_deployments(api_id)?;
    if history.is_empty() {
        println!("deployments  (none)");
        return Ok(());
    }
    println!("deployments");
    for d in history {
        println!(
            "  #{:<4} {}  {:<12} {}  {}",
            d.sequence,
            d.id,
            d.stage_name,
            d.fingerprint.short(),
            d.description
        );
    }
    Ok(())
}
