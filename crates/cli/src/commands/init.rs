use std::path::Path;

use secmgr_core::config::SecmgrConfig;
use tracing::info;

/// Run the `init` command: write a default configuration file.
pub fn run(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            config_path.display()
        );
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let config = SecmgrConfig::generate_default();
    super::codec(false).write_file(config_path, &config)?;
    info!("Wrote configuration to {}", config_path.display());

    println!("secmgr initialized successfully!");
    println!("  Configuration: {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set [secmgr].public_url and register your service providers");
    println!("  2. Run `secmgr hash-password <password>` and add local accounts");
    println!("     to the \"local\" form mechanism of the default group");
    println!("  3. Run `secmgr check-config` to validate the result");
    println!("  4. Run `secmgr serve` to start the IdP");

    Ok(())
}
