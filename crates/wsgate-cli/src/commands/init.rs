use std::path::Path;

use wsgate_core::GatewayConfig;

pub fn init(path: &Path, api: &str, stage: &str, force: bool) -> anyhow::Result<()> {
    let output = path.join("gateway.toml");
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let config = GatewayConfig::scaffold(api, stage);
    // Reject names that would produce an invalid stage before writing.
    config.stage()?;
    std::fs::write(&output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
