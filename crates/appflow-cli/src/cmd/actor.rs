use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use appflow_core::types::{Actor, Role};
use appflow_core::Engine;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ActorSubcommand {
    /// Register an actor
    Add {
        name: String,
        /// provider, admin or user
        #[arg(long)]
        role: String,
    },
    /// List actors
    List,
}

pub fn run(root: &Path, subcmd: ActorSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ActorSubcommand::Add { name, role } => add(root, &name, &role, json),
        ActorSubcommand::List => list(root, json),
    }
}

fn add(root: &Path, name: &str, role: &str, json: bool) -> anyhow::Result<()> {
    let role: Role = role.parse()?;
    let engine = Engine::open(root).context("failed to open project")?;
    let actor = Actor::new(name, role);
    engine
        .store()
        .insert_actor(&actor)
        .context("failed to save actor")?;

    if json {
        print_json(&actor)?;
    } else {
        println!("Added {role} '{name}': {}", actor.id);
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let actors = engine.store().list_actors()?;

    if json {
        print_json(&actors)?;
        return Ok(());
    }
    if actors.is_empty() {
        println!("No actors.");
        return Ok(());
    }
    let rows = actors
        .iter()
        .map(|a| {
            vec![
                a.id.clone(),
                a.name.clone(),
                a.role.to_string(),
                fmt_time(&a.created_at),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "ROLE", "CREATED"], rows);
    Ok(())
}
