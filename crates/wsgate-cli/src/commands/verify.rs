use std::path::Path;

use anyhow::Context;

use wsgate_core::{VerifySettings, derive_endpoints};
use wsgate_verify::{
    ConnectionVerifier, ExpectedMarker, Probe, TransportConfig, TungsteniteTransport,
    VerifyConfig,
};

use super::load_config;

pub async fn verify(config: &Path, url: Option<String>) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let url = match url {
        Some(url) => url,
        None => {
            let ctx = cfg
                .context
                .as_ref()
                .context("gateway config has no [context] section; pass --url")?;
            derive_endpoints(&cfg.api.id, &cfg.stage.stage_name, ctx)?.stream_url
        }
    };
    run(&url, &cfg.verify.clone().unwrap_or_default()).await
}

pub async fn run(url: &str, settings: &VerifySettings) -> anyhow::Result<()> {
    let config = verify_config(settings)?;
    let transport = TungsteniteTransport::new(TransportConfig::default())?;
    let verifier = ConnectionVerifier::new(transport, config);

    let report = verifier
        .verify(
            url,
            &Probe::action(&settings.action),
            &ExpectedMarker::new(&settings.expect_field, &settings.expect_value),
        )
        .await
        .with_context(|| format!("verifying {url}"))?;
    println!(
        "✓ {url} answered {}={:?} after {} attempt(s) in {:.1?}",
        settings.expect_field, settings.expect_value, report.attempts, report.elapsed
    );
    Ok(())
}

/// Fill unset `[verify]` fields from the verifier defaults.
pub fn verify_config(settings: &VerifySettings) -> anyhow::Result<VerifyConfig> {
    let defaults = VerifyConfig::default();
    let deadline = if settings.deadline_disabled() {
        None
    } else {
        settings.deadline()?.or(defaults.deadline)
    };
    let config = VerifyConfig {
        max_attempts: settings.max_attempts.unwrap_or(defaults.max_attempts),
        initial_sleep: settings.initial_sleep()?.unwrap_or(defaults.initial_sleep),
        backoff_factor: settings.backoff_factor.unwrap_or(defaults.backoff_factor),
        response_timeout: settings
            .response_timeout()?
            .unwrap_or(defaults.response_timeout),
        max_sleep: defaults.max_sleep,
        deadline,
    };
    config.validate()?;
    Ok(config)
}
