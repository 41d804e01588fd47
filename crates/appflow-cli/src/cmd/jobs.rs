use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use appflow_core::queue::{JobId, JobQueue, JobRecord, JobState};
use appflow_core::Engine;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum JobsSubcommand {
    /// List jobs, newest first
    List {
        /// Only jobs in this state (queued, active, awaiting_review, backoff, completed, dead)
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one job with its payload
    Show { id: String },
    /// List dead-lettered jobs
    Dead,
    /// Put a dead-lettered job back in the queue with a fresh retry budget
    Retry { id: String },
    /// Delete a dead-lettered job
    Purge { id: String },
}

pub fn run(root: &Path, subcmd: JobsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        JobsSubcommand::List { state } => list(root, state.as_deref(), json),
        JobsSubcommand::Show { id } => show(root, &id, json),
        JobsSubcommand::Dead => dead(root, json),
        JobsSubcommand::Retry { id } => retry(root, &id, json),
        JobsSubcommand::Purge { id } => purge(root, &id, json),
    }
}

fn parse_id(id: &str) -> anyhow::Result<JobId> {
    id.parse()
        .with_context(|| format!("'{id}' is not a job id"))
}

fn print_jobs(jobs: &[JobRecord], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    let rows = jobs
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.job.entity_id.clone(),
                r.job.requested_status.to_string(),
                r.state.label().to_string(),
                r.job.attempt.to_string(),
                fmt_time(&r.updated_at),
            ]
        })
        .collect();
    print_table(
        &["ID", "APP", "REQUESTED", "STATE", "ATTEMPT", "UPDATED"],
        rows,
    );
    Ok(())
}

fn list(root: &Path, state: Option<&str>, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let mut jobs = engine.queue().list()?;
    if let Some(label) = state {
        jobs.retain(|r| r.state.label() == label);
    }
    print_jobs(&jobs, json)
}

fn dead(root: &Path, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let jobs = engine.queue().dead_letters()?;
    print_jobs(&jobs, json)
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let job_id = parse_id(id)?;
    let engine = Engine::open(root).context("failed to open project")?;
    let record = engine.queue().get(job_id)?;

    if json {
        print_json(&record)?;
        return Ok(());
    }

    let job = &record.job;
    println!("Job:        {}", record.id);
    println!("App:        {}", job.entity_id);
    println!("Requested:  {}", job.requested_status);
    println!("By:         {}", job.requesting_user_id);
    println!(
        "Reviewer:   {}",
        job.reviewer_id.as_deref().unwrap_or("(none)")
    );
    println!("Attempt:    {}", job.attempt);
    match &record.state {
        JobState::Delayed { until, .. } => {
            println!("State:      {} until {}", record.state, fmt_time(until))
        }
        JobState::Completed { status } => println!("State:      completed ({status})"),
        JobState::DeadLettered { reason, permanent } => {
            let kind = if *permanent { "rejected" } else { "retries exhausted" };
            println!("State:      dead ({kind}): {reason}");
        }
        other => println!("State:      {other}"),
    }
    if let Some(note) = &job.note {
        println!("Note:       {note}");
    }
    if let Some(err) = &record.last_error {
        println!("Last error: {err}");
    }
    println!("Created:    {}", fmt_time(&record.created_at));
    println!("Updated:    {}", fmt_time(&record.updated_at));
    Ok(())
}

fn retry(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let job_id = parse_id(id)?;
    let engine = Engine::open(root).context("failed to open project")?;
    engine.queue().retry_dead(job_id)?;

    if json {
        print_json(&serde_json::json!({ "job_id": job_id, "state": "queued" }))?;
    } else {
        println!("Requeued job {job_id}");
    }
    Ok(())
}

fn purge(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let job_id = parse_id(id)?;
    let engine = Engine::open(root).context("failed to open project")?;
    engine.queue().purge(job_id)?;

    if json {
        print_json(&serde_json::json!({ "job_id": job_id, "purged": true }))?;
    } else {
        println!("Purged job {job_id}");
    }
    Ok(())
}
