use crate::output::print_json;
use anyhow::Context;
use appflow_core::Engine;
use std::path::Path;
use tokio::sync::watch;
use tokio_stream::StreamExt as _;
use tracing::info;

pub fn run(root: &Path, drain: bool, json: bool) -> anyhow::Result<()> {
    let engine = Engine::open(root).context("failed to open project")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;

    let stats = runtime.block_on(async {
        let mut changes = Box::pin(engine.notifier().stream());
        let printer = tokio::spawn(async move {
            while let Some(event) = changes.next().await {
                if !json {
                    println!("changed: {}", event.entity_id);
                }
            }
        });

        let pool = engine.pool();
        let stats = if drain {
            pool.run_until_idle().await
        } else {
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing jobs in hand");
                }
                let _ = stop_tx.send(true);
            });
            pool.run(stop_rx).await
        };

        engine.shutdown();
        let _ = printer.await;
        stats
    });

    if json {
        print_json(&stats)?;
    } else {
        println!(
            "Processed {} job(s): {} committed, {} awaiting review, {} rejected, {} retrying, {} dead-lettered",
            stats.processed,
            stats.committed,
            stats.delayed,
            stats.rejected,
            stats.retrying,
            stats.dead_lettered
        );
        if stats.errors > 0 {
            println!("{} delivery error(s); see log output", stats.errors);
        }
    }
    Ok(())
}
