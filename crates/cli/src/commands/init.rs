//! `threadloom init`: write the default config file.

use anyhow::Context;
use threadloom_config::AppConfig;

pub fn run(force: bool) -> anyhow::Result<()> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    if config_path.exists() && !force {
        println!("Config already exists at: {}", config_path.display());
        println!("   Edit it manually, or re-run with --force to overwrite.");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created config.toml at: {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Set THREADLOOM_API_KEY (or OPENAI_API_KEY), or add it to the config");
    println!("   2. Run: threadloom chat --message \"hello\"");
    println!("   3. Or serve the API: threadloom serve");

    Ok(())
}
