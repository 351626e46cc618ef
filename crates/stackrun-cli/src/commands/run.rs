//! Apply and destroy commands.

use anyhow::{Context as _, Result};
use stackrun_core::{Direction, Results, UnitState};
use stackrun_provisioner::CommandProvisioner;
use stackrun_scheduler::{Orchestrator, RunError, RunEvent};
use stackrun_state::StateStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Context, run_options};
use crate::RunArgs;

pub async fn apply(ctx: &Context, args: &RunArgs) -> Result<()> {
    execute(ctx, args, Direction::Apply).await
}

pub async fn destroy(ctx: &Context, args: &RunArgs) -> Result<()> {
    execute(ctx, args, Direction::Destroy).await
}

async fn execute(ctx: &Context, args: &RunArgs, direction: Direction) -> Result<()> {
    let stack = ctx.load()?;
    let options = run_options(&stack, args)?;
    let store = ctx.store(&stack.name);
    let mut record = store
        .load_or_new(&stack.name)
        .await
        .with_context(|| format!("Failed to load state: {}", store.path().display()))?;

    let mut units = stack.units.clone();
    record.hydrate(&mut units);
    for orphan in record.orphans(&units) {
        warn!(unit = %orphan, "Unit is recorded in state but no longer in the stack file");
    }

    let provisioner = Arc::new(
        CommandProvisioner::new(stack.settings.provisioners.clone()).with_base_dir(ctx.base_dir()),
    );

    let (tx, rx) = mpsc::channel(100);
    let orchestrator = Orchestrator::new(provisioner.clone())
        .with_probe(provisioner)
        .with_readiness(stack.settings.readiness.clone())
        .with_events(tx);
    let printer = tokio::spawn(print_events(rx, !ctx.json));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, waiting for in-flight units to finish...");
                cancel.cancel();
            }
        })
    };

    if !ctx.json {
        println!("Stack: {} ({} units)", stack.name, units.len());
        println!("\n--- Starting {} ---\n", direction);
    }

    let outcome = match direction {
        Direction::Apply => orchestrator.apply(units, &options, &cancel).await,
        Direction::Destroy => orchestrator.destroy(units, &options, &cancel).await,
    };
    interrupt.abort();
    // Closes the event channel so the printer can finish.
    drop(orchestrator);
    printer.await.context("Event printer task failed")?;

    let results = match &outcome {
        Ok(results) => Some(results),
        Err(err) => err.results(),
    };
    if let Some(results) = results {
        record.merge(results);
        store
            .save(&mut record)
            .await
            .with_context(|| format!("Failed to save state: {}", store.path().display()))?;

        if ctx.json {
            println!("{}", serde_json::to_string_pretty(results)?);
        } else {
            print_summary(results);
        }
    }

    match outcome {
        Ok(_) => {
            if !ctx.json {
                println!("\n✓ {} succeeded!", capitalize(direction));
            }
            Ok(())
        }
        Err(RunError::Plan(e)) => Err(e).context("Invalid stack"),
        Err(e) => anyhow::bail!("{} failed: {}", capitalize(direction), e),
    }
}

async fn print_events(mut rx: mpsc::Receiver<RunEvent>, show: bool) {
    while let Some(event) = rx.recv().await {
        if !show {
            continue;
        }
        match event {
            RunEvent::RunStarted { run_id, waves, .. } => {
                println!("Run {} ({} waves)", run_id, waves);
            }
            RunEvent::WaveStarted { index, units } => {
                let names: Vec<&str> = units.iter().map(|u| u.as_str()).collect();
                println!("\n▶ Wave {}: {}", index, names.join(", "));
            }
            RunEvent::UnitStarted { unit, direction } => {
                println!("  ▶ {} {}", direction, unit);
            }
            RunEvent::UnitPolling { unit } => {
                println!("  … waiting for '{}' to become ready", unit);
            }
            RunEvent::UnitCompleted {
                unit,
                state,
                reused,
                error,
            } => match error {
                Some(error) => println!("  ✗ '{}' failed: {}", unit, error),
                None if reused => println!("  ✓ '{}' already {}", unit, state),
                None => println!("  ✓ '{}' {}", unit, state),
            },
            RunEvent::UnitSkipped { unit, reason } => {
                println!("  ⊘ '{}' skipped: {}", unit, reason);
            }
            RunEvent::WaveCompleted { index, failed } => {
                if failed > 0 {
                    println!("✗ Wave {} finished with {} failure(s)", index, failed);
                }
            }
            RunEvent::RunCompleted { success } => {
                if success {
                    println!("\n--- Run completed successfully ---");
                } else {
                    println!("\n--- Run failed ---");
                }
            }
        }
    }
}

fn print_summary(results: &Results) {
    println!("\n--- Unit Summary ---");
    for (id, unit) in &results.units {
        let status = match (&unit.error, &unit.skipped) {
            (Some(error), _) => format!("✗ {}: {}", unit.state, error),
            (None, Some(reason)) => format!("⊘ skipped: {}", reason),
            (None, None) => match unit.state {
                UnitState::Ready | UnitState::Destroyed if unit.reused => {
                    format!("✓ {} (unchanged)", unit.state)
                }
                UnitState::Ready | UnitState::Destroyed => format!("✓ {}", unit.state),
                state => format!("○ {}", state),
            },
        };
        println!("  {} [{}] - {}", id, unit.resource_type, status);
    }
}

fn capitalize(direction: Direction) -> &'static str {
    match direction {
        Direction::Apply => "Apply",
        Direction::Destroy => "Destroy",
    }
}
