use crate::output::print_json;
use anyhow::Context;
use appflow_core::{config::Config, io, paths, Engine};
use std::path::Path;

/// Store and queue files are machine-local state.
const GITIGNORE_ENTRY: &str = ".appflow/*.redb";

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let dir = paths::appflow_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let created_config = !paths::config_path(root).exists();
    if created_config {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
    }

    // Opening creates the store and queue databases.
    let engine = Engine::open(root).context("failed to open store and queue")?;
    drop(engine);

    io::ensure_gitignore_entry(root, GITIGNORE_ENTRY).context("failed to update .gitignore")?;

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config_created": created_config,
        }))?;
        return Ok(());
    }

    println!("Initialized appflow in: {}", root.display());
    let verb = if created_config { "created" } else { "exists: " };
    println!("  {verb} {}", paths::CONFIG_FILE);
    println!("  ready:   {}", paths::STORE_FILE);
    println!("  ready:   {}", paths::QUEUE_FILE);
    Ok(())
}
