//! State inspection commands.

use anyhow::{Context as _, Result};
use stackrun_state::StateStore;

use super::Context;

pub async fn show(ctx: &Context) -> Result<()> {
    let stack = ctx.load()?;
    let store = ctx.store(&stack.name);
    let Some(record) = store
        .load(&stack.name)
        .await
        .with_context(|| format!("Failed to load state: {}", store.path().display()))?
    else {
        if ctx.json {
            println!("null");
        } else {
            println!("No state recorded for stack '{}'", stack.name);
        }
        return Ok(());
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("Stack: {}", record.stack);
    println!("Serial: {}", record.serial);
    if let Some(run_id) = record.last_run {
        println!("Last run: {}", run_id);
    }
    println!("Updated: {}", record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("{:<24} {:<28} {:<12} OUTPUTS", "UNIT", "TYPE", "STATE");
    println!("{}", "-".repeat(76));
    for (id, unit) in &record.units {
        let outputs: Vec<&str> = unit.outputs.keys().map(String::as_str).collect();
        println!(
            "{:<24} {:<28} {:<12} {}",
            id.as_str(),
            unit.resource_type,
            unit.state.to_string(),
            outputs.join(", ")
        );
    }
    Ok(())
}
