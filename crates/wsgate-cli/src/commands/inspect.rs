use std::path::Path;

use anyhow::Context;

use wsgate_core::{derive_endpoints, fingerprint as digest};

use super::load_config;

pub fn fingerprint(
    config: &Path,
    identity: Option<&str>,
    secondary: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(identity) = identity {
        println!("{}", digest(identity, secondary.unwrap_or("")));
        return Ok(());
    }

    let cfg = load_config(config)?;
    let graph = cfg.graph()?;
    for function in &graph.functions {
        println!("function     {:<28} {}", function.id, function.fingerprint());
    }
    for integration in &graph.integrations {
        println!("integration  {:<28} {}", integration.id, integration.fingerprint());
    }
    println!("graph        {:<28} {}", graph.api.id, graph.fingerprint());
    Ok(())
}

pub fn endpoints(config: &Path, format: &str) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let stage = cfg.stage()?;
    let ctx = cfg
        .context
        .as_ref()
        .context("gateway config has no [context] section")?;
    let endpoints = derive_endpoints(&cfg.api.id, &stage.stage_name, ctx)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&endpoints)?);
        }
        _ => {
            println!("stream       {}", endpoints.stream_url);
            println!("send         {}", endpoints.send_url);
            println!("stage        {}", endpoints.resource_arn);
            println!("connections  {}", endpoints.connections_arn);
            for integration in &cfg.graph()?.integrations {
                let function = cfg
                    .functions
                    .iter()
                    .find(|f| f.id == integration.function)
                    .map_or(integration.function.as_str(), |f| f.name.as_str());
                println!(
                    "integration  {} -> {}",
                    integration.id,
                    ctx.integration_uri(function)?
                );
            }
        }
    }
    Ok(())
}
