//! List the brokers recorded in the vault.

use crate::cli::output;
use crate::cli::start::default_vault_path;
use crate::vault::Vault;
use anyhow::Result;
use std::path::PathBuf;

pub async fn run(db: Option<&str>) -> Result<()> {
    let vault_path = db.map(PathBuf::from).unwrap_or_else(default_vault_path);
    let vault = Vault::open(&vault_path)?;
    let brokers = vault.fetch_all_brokers()?;

    if output::is_json() {
        let items: Vec<_> = brokers
            .iter()
            .map(|b| {
                serde_json::json!({
                    "name": b.name,
                    "url": b.url,
                    "version": b.version,
                    "parent": b.parent,
                })
            })
            .collect();
        output::print_json(&serde_json::json!({ "brokers": items }));
        return Ok(());
    }

    if brokers.is_empty() {
        println!("No brokers in the vault yet. Run 'unlist scan' or 'unlist start' first.");
        return Ok(());
    }

    println!("{} broker(s):", brokers.len());
    for broker in &brokers {
        match &broker.parent {
            Some(parent) => println!(
                "  {:<30} v{:<8} {} (mirror of {})",
                broker.name, broker.version, broker.url, parent
            ),
            None => println!("  {:<30} v{:<8} {}", broker.name, broker.version, broker.url),
        }
    }
    Ok(())
}
