//! Show vault progress counts and whether the daemon is running.

use crate::cli::output;
use crate::cli::start::{check_already_running, default_vault_path};
use crate::vault::Vault;
use anyhow::Result;
use std::path::PathBuf;

pub async fn run(db: Option<&str>) -> Result<()> {
    let vault_path = db.map(PathBuf::from).unwrap_or_else(default_vault_path);
    let vault = Vault::open(&vault_path)?;
    let stats = vault.stats()?;
    let running = check_already_running();

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "running": running.is_some(),
            "pid": running,
            "vault": vault_path.display().to_string(),
            "brokers": stats.brokers,
            "profile_queries": stats.profile_queries,
            "scan_jobs": stats.scan_jobs,
            "profiles_found": stats.profiles_found,
            "profiles_removed": stats.profiles_removed,
            "opt_outs_submitted": stats.opt_outs_submitted,
            "opt_outs_pending": stats.opt_outs_pending,
        }));
        return Ok(());
    }

    match running {
        Some(pid) => println!("unlist is running (PID {pid})"),
        None => println!("unlist is not running"),
    }
    println!("Vault: {}", vault_path.display());
    println!();
    println!("  Brokers tracked:     {}", stats.brokers);
    println!("  Profile queries:     {}", stats.profile_queries);
    println!("  Scan tuples:         {}", stats.scan_jobs);
    println!("  Profiles found:      {}", stats.profiles_found);
    println!("  Profiles removed:    {}", stats.profiles_removed);
    println!("  Opt-outs submitted:  {}", stats.opt_outs_submitted);
    println!("  Opt-outs pending:    {}", stats.opt_outs_pending);
    Ok(())
}
