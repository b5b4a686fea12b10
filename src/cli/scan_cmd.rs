//! Immediate mode: run every scan tuple now, regardless of schedule.

use crate::cli::output;
use crate::cli::start::build_engine;
use anyhow::Result;

pub async fn run(brokers_dir: Option<&str>, db: Option<&str>) -> Result<()> {
    crate::cli::start::init_tracing();

    let engine = build_engine(brokers_dir, db).await?;
    if let Err(e) = engine.scheduler.updater().check_for_updates(&engine.bus) {
        tracing::error!("broker reconciliation failed: {e:#}");
    }

    let summary = engine.scheduler.tick(true).await;

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "scans_run": summary.scans_run,
            "opt_outs_run": summary.opt_outs_run,
        }));
    } else if !output::is_quiet() {
        println!(
            "Ran {} scan(s) and {} opt-out(s).",
            summary.scans_run, summary.opt_outs_run
        );
    }
    Ok(())
}
