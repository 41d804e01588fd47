use crate::output::print_json;
use anyhow::Context;
use appflow_core::queue::JobId;
use appflow_core::types::Role;
use appflow_core::Engine;
use std::path::Path;

pub fn run(root: &Path, job: &str, by: &str, now: bool, json: bool) -> anyhow::Result<()> {
    let job_id: JobId = job
        .parse()
        .with_context(|| format!("'{job}' is not a job id"))?;
    let engine = Engine::open(root).context("failed to open project")?;

    let reviewer = engine.store().get_actor(by)?;
    if reviewer.role != Role::Admin {
        anyhow::bail!("actor {by} is a {}; only admins can review", reviewer.role);
    }
    engine
        .attach_reviewer(job_id, by, now)
        .with_context(|| format!("cannot review job {job_id}"))?;

    if json {
        print_json(&serde_json::json!({
            "job_id": job_id,
            "reviewer_id": by,
            "resumed": now,
        }))?;
    } else if now {
        println!("Reviewed job {job_id}; it will run on the next worker poll");
    } else {
        println!("Reviewed job {job_id}; it will run when its review interval ends");
    }
    Ok(())
}
