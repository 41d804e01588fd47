use crate::output::print_json;
use anyhow::Context;
use appflow_core::config::{Config, WarnLevel};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        print_json(&config)?;
    } else {
        print!("{}", summary(&config));
    }
    Ok(())
}

fn summary(config: &Config) -> String {
    let mut out = String::new();
    let w = &config.worker;
    out.push_str(&format!(
        "worker: {} lane(s), {} job(s) per {}ms, poll {}ms, lease {}s\n",
        w.concurrency, w.max_jobs_per_window, w.window_ms, w.poll_interval_ms, w.lease_secs
    ));
    let r = &config.retry;
    out.push_str(&format!(
        "retry:  {} attempt(s), backoff {}ms doubling up to {}ms\n",
        r.max_attempts, r.base_delay_ms, r.max_delay_ms
    ));
    out.push_str(&format!(
        "review: {}s interval, gated edges:\n",
        config.review.delay_secs
    ));
    for edge in &config.review.gated_edges {
        out.push_str(&format!("  {edge}\n"));
    }
    out
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
