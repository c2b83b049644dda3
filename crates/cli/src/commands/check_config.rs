use std::path::Path;

use secmgr_core::codec::{default_group_violation, ValidityPolicy};
use secmgr_core::config::SecmgrConfig;
use secmgr_idp::soap::EnvelopeDecoder;
use tracing::info;

/// Run the `check-config` command: decode, validate and summarize.
pub fn run(config_path: &Path, permissive: bool) -> anyhow::Result<SecmgrConfig> {
    let codec = super::codec(permissive);
    let config = codec.read_file(config_path)?;
    config.validate()?;
    EnvelopeDecoder::from_names(&config.idp.understood_soap_headers)?;
    info!("Loaded configuration from {}", config_path.display());

    println!("Configuration OK: {}", config_path.display());
    println!("  Instance:          {}", config.secmgr.instance_name);
    println!("  Entity ID:         {}", config.entity_id());
    println!(
        "  Service providers: {} ({} enabled)",
        config.service_providers.len(),
        config.service_providers.iter().filter(|sp| sp.enabled).count()
    );
    for group in &config.credential_groups {
        let mechanisms: Vec<&str> = group.mechanisms.iter().map(|m| m.name()).collect();
        println!(
            "  Group {:<12} {}{}",
            group.name,
            mechanisms.join(", "),
            if group.optional { " (optional)" } else { "" }
        );
    }
    if codec.policy() == ValidityPolicy::Permissive {
        if let Some(problem) = default_group_violation(&config) {
            println!("  WARNING: accepted only because of --permissive-config: {problem}");
        }
    }

    Ok(config)
}
