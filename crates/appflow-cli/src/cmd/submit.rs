use crate::output::print_json;
use anyhow::Context;
use appflow_core::types::ApplicationStatus;
use appflow_core::Engine;
use std::path::Path;

pub fn run(
    root: &Path,
    app: &str,
    status: &str,
    by: &str,
    reviewer: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let requested: ApplicationStatus = status.parse()?;
    let engine = Engine::open(root).context("failed to open project")?;
    let job_id = engine
        .submit_transition(app, requested, by, reviewer)
        .context("failed to enqueue transition")?;

    if json {
        print_json(&serde_json::json!({
            "job_id": job_id,
            "entity_id": app,
            "requested_status": requested,
        }))?;
    } else {
        println!("Submitted job {job_id}: {app} -> {requested}");
    }
    Ok(())
}
