//! Dry-run command.

use anyhow::{Context as _, Result};
use serde_json::json;
use stackrun_provisioner::CommandProvisioner;
use stackrun_scheduler::{Orchestrator, PlanReport, PlannedAction};
use stackrun_state::StateStore;
use std::sync::Arc;
use tracing::warn;

use super::Context;

/// Show what an apply would do. No provisioner command is run.
pub async fn plan(ctx: &Context) -> Result<()> {
    let stack = ctx.load()?;
    let store = ctx.store(&stack.name);
    let record = store
        .load_or_new(&stack.name)
        .await
        .with_context(|| format!("Failed to load state: {}", store.path().display()))?;

    let mut units = stack.units.clone();
    record.hydrate(&mut units);
    let orphans: Vec<String> = record.orphans(&units).iter().map(|id| id.to_string()).collect();

    let provisioner = Arc::new(CommandProvisioner::new(stack.settings.provisioners.clone()));
    let report = Orchestrator::new(provisioner)
        .plan(units)
        .context("Invalid stack")?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&to_json(&report, &orphans))?);
        return Ok(());
    }

    println!("Plan for stack '{}':", stack.name);
    for wave in &report.plan.waves {
        println!("\n  wave {}:", wave.index);
        for id in &wave.units {
            let Some(unit) = report.units.get(id) else {
                continue;
            };
            let marker = match unit.action {
                PlannedAction::Create => "+",
                PlannedAction::Reuse => "=",
            };
            println!("  {} {} ({})", marker, id, unit.resource_type);
            for (name, value) in &unit.inputs {
                println!("      {} = {}", name, value);
            }
            for reference in &unit.mocked {
                println!("      (mocked) {}", reference);
            }
        }
    }

    for orphan in &orphans {
        warn!(unit = %orphan, "Unit is recorded in state but no longer in the stack file");
    }

    println!(
        "\n{} to create, {} unchanged.",
        report.count(PlannedAction::Create),
        report.count(PlannedAction::Reuse)
    );
    Ok(())
}

fn to_json(report: &PlanReport, orphans: &[String]) -> serde_json::Value {
    let units: serde_json::Map<String, serde_json::Value> = report
        .units
        .iter()
        .map(|(id, unit)| {
            let mocked: Vec<String> = unit.mocked.iter().map(|r| r.to_string()).collect();
            (
                id.to_string(),
                json!({
                    "resource_type": unit.resource_type,
                    "action": unit.action.to_string(),
                    "inputs": unit.inputs,
                    "mocked": mocked,
                }),
            )
        })
        .collect();

    json!({
        "waves": report.plan.waves,
        "units": units,
        "orphans": orphans,
    })
}
