//! `toolpilot init`: write a default config file.

use std::path::Path;

use toolpilot_config::AppConfig;

pub fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_path();
    match write_default_config(&config_path, force)? {
        true => {
            println!("Created {}", config_path.display());
            println!();
            println!("Next steps:");
            println!("  1. Pick a provider and model in {}", config_path.display());
            println!("  2. Add an API key for hosted providers (or set TOOLPILOT_API_KEY)");
            println!("  3. Run: toolpilot chat");
        }
        false => {
            println!("Config already exists at {}", config_path.display());
            println!("Edit it manually, or re-run with --force to overwrite it.");
        }
    }
    Ok(())
}

/// Returns `false` when a file exists and `force` is not set.
pub fn write_default_config(path: &Path, force: bool) -> std::io::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}
