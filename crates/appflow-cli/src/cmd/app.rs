use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use appflow_core::Engine;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum AppSubcommand {
    /// Create a draft application
    Create {
        name: String,
        /// Owning provider id
        #[arg(long)]
        owner: String,
    },
    /// Show one application
    Show { id: String },
    /// List applications
    List,
    /// Statuses an actor may request for an application right now
    Statuses {
        id: String,
        /// Actor id to evaluate for
        #[arg(long = "as", value_name = "ACTOR")]
        actor: String,
    },
}

pub fn run(root: &Path, subcmd: AppSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AppSubcommand::Create { name, owner } => create(root, &name, &owner, json),
        AppSubcommand::Show { id } => show(root, &id, json),
        AppSubcommand::List => list(root, json),
        AppSubcommand::Statuses { id, actor } => statuses(root, &id, &actor, json),
    }
}

fn create(root: &Path, name: &str, owner: &str, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let app = engine
        .create_application(name, owner)
        .with_context(|| format!("cannot create '{name}'"))?;

    if json {
        print_json(&app)?;
    } else {
        println!("Created '{}' ({}): {}", app.name, app.status, app.id);
    }
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let app = engine.store().get_application(id)?;

    if json {
        print_json(&app)?;
        return Ok(());
    }
    println!("Application: {}", app.name);
    println!("Id:          {}", app.id);
    println!("Status:      {}", app.status);
    println!("Owner:       {}", app.owner_id);
    println!("Created:     {}", fmt_time(&app.created_at));
    println!("Updated:     {}", fmt_time(&app.updated_at));
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let apps = engine.store().list_applications()?;

    if json {
        print_json(&apps)?;
        return Ok(());
    }
    if apps.is_empty() {
        println!("No applications.");
        return Ok(());
    }
    let rows = apps
        .iter()
        .map(|a| {
            vec![
                a.id.clone(),
                a.name.clone(),
                a.status.to_string(),
                a.owner_id.clone(),
                fmt_time(&a.updated_at),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "STATUS", "OWNER", "UPDATED"], rows);
    Ok(())
}

fn statuses(root: &Path, id: &str, actor: &str, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let available = engine.available_statuses(id, actor)?;

    if json {
        print_json(&serde_json::json!({
            "id": id,
            "actor": actor,
            "statuses": available,
        }))?;
    } else if available.is_empty() {
        println!("(none)");
    } else {
        for status in &available {
            println!("{status}");
        }
    }
    Ok(())
}
