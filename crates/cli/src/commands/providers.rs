//! `toolpilot providers`: list configured backends.

use toolpilot_config::AppConfig;
use toolpilot_core::provider::BackendProfile;
use toolpilot_providers::router::build_from_config;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let router = build_from_config(&config);

    println!("Providers (default: {})", config.default_provider);
    println!();
    println!("  {:<14} {:<12} {:<48} streaming+tools", "name", "kind", "base url");
    for name in router.list() {
        let Some(provider) = router.get(name) else {
            continue;
        };
        let profile = provider.profile();
        println!(
            "  {:<14} {:<12} {:<48} {}",
            name,
            profile.kind,
            profile.base_url,
            streaming_with_tools(&profile)
        );
    }
    println!();
    println!("  Models may be prefixed with a provider name: `ollama:qwen3:8b`.");
    Ok(())
}

fn streaming_with_tools(profile: &BackendProfile) -> &'static str {
    match profile.streaming_with_tools {
        Some(true) => "yes (configured)",
        Some(false) => "no (configured)",
        None if profile.is_hosted() => "no",
        None if profile.is_local() => "yes",
        None => "no",
    }
}
