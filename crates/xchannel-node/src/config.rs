//! Configuration file loading and saving.

use anyhow::Context;
use std::path::Path;

use xchannel_core::SetupConfig;

/// Load the setup config from a TOML file, or defaults if it does not exist.
pub fn load(path: &Path) -> anyhow::Result<SetupConfig> {
    let config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
    } else {
        SetupConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Save the config to a TOML file, creating parent directories.
pub fn save(config: &SetupConfig, path: &Path) -> anyhow::Result<()> {
    let contents = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
