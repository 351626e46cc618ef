//! CLI command implementations.

pub mod plan;
pub mod run;
pub mod state;

use anyhow::{Context as _, Result};
use stackrun_config::{StackConfig, load_stack, parse_duration};
use stackrun_core::{Direction, RunOptions};
use stackrun_provisioner::base_dir_for;
use stackrun_scheduler::{DependencyGraph, ExecutionPlan, schedule};
use stackrun_state::JsonFileStore;
use std::path::PathBuf;

use crate::RunArgs;

/// Global options shared by every command.
pub struct Context {
    pub file: PathBuf,
    pub state: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    pub fn load(&self) -> Result<StackConfig> {
        load_stack(&self.file)
            .with_context(|| format!("Failed to load stack file: {}", self.file.display()))
    }

    /// Directory that provisioner working directories are relative to.
    pub fn base_dir(&self) -> PathBuf {
        base_dir_for(&self.file)
    }

    pub fn store(&self, stack: &str) -> JsonFileStore {
        match &self.state {
            Some(path) => JsonFileStore::new(path),
            None => JsonFileStore::in_dir(self.base_dir().join(".stackrun"), stack),
        }
    }
}

/// Stack file settings with command-line overrides applied.
pub fn run_options(stack: &StackConfig, args: &RunArgs) -> Result<RunOptions> {
    let mut options = stack.settings.run.clone();
    if let Some(limit) = args.concurrency {
        options = options.with_concurrency_limit(limit);
    }
    if args.best_effort {
        options = options.best_effort();
    }
    if let Some(timeout) = &args.timeout {
        options = options.with_timeout(parse_duration(timeout).context("Invalid --timeout")?);
    }
    if args.abort_in_flight {
        options = options.with_abort_in_flight(true);
    }
    Ok(options)
}

pub fn validate(ctx: &Context) -> Result<()> {
    let checked = ctx
        .load()
        .and_then(|stack| {
            let graph = DependencyGraph::build(stack.units.clone())?;
            let plan = schedule(&graph, Direction::Apply)?;
            Ok((stack, plan))
        });

    match checked {
        Ok((stack, plan)) => {
            println!(
                "Stack '{}' is valid: {} units in {} waves",
                stack.name,
                plan.unit_count(),
                plan.waves.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

pub fn graph(ctx: &Context, destroy: bool) -> Result<()> {
    let stack = ctx.load()?;
    let direction = if destroy {
        Direction::Destroy
    } else {
        Direction::Apply
    };
    let graph = DependencyGraph::build(stack.units)?;
    let plan = schedule(&graph, direction)?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_waves(&plan, &graph);
    }
    Ok(())
}

fn print_waves(plan: &ExecutionPlan, graph: &DependencyGraph) {
    println!("{} order for {} units:", plan.direction, plan.unit_count());
    for wave in &plan.waves {
        println!("  wave {}:", wave.index);
        for id in &wave.units {
            let deps: Vec<&str> = graph.dependencies_of(id.as_str()).map(|d| d.as_str()).collect();
            let resource_type = graph
                .unit(id.as_str())
                .map(|u| u.resource_type.as_str())
                .unwrap_or_default();
            if deps.is_empty() {
                println!("    {} ({})", id, resource_type);
            } else {
                println!("    {} ({}) <- {}", id, resource_type, deps.join(", "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    const STACK: &str = r#"
        stack "lightwave"
        settings {
            concurrency 2
            timeout "10m"
        }
        provisioner "null" {
            apply "true"
            destroy "true"
        }
        unit "db" type="null"
    "#;

    fn context(dir: &std::path::Path) -> Context {
        let file = dir.join("stack.kdl");
        std::fs::write(&file, STACK).unwrap();
        Context {
            file,
            state: None,
            json: false,
        }
    }

    #[test]
    fn test_default_state_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let stack = ctx.load().unwrap();

        let store = ctx.store(&stack.name);
        assert!(store.path().ends_with(".stackrun/lightwave.state.json"));
        assert!(store.path().starts_with(dir.path()));
    }

    #[test]
    fn test_explicit_state_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.state = Some(dir.path().join("elsewhere.json"));

        let store = ctx.store("lightwave");
        assert_eq!(store.path(), dir.path().join("elsewhere.json"));
    }

    #[test]
    fn test_flags_override_settings() {
        let dir = tempfile::tempdir().unwrap();
        let stack = context(dir.path()).load().unwrap();

        let options = run_options(&stack, &RunArgs::default()).unwrap();
        assert_eq!(options.concurrency_limit, NonZeroUsize::new(2));
        assert_eq!(options.timeout, Some(Duration::from_secs(600)));
        assert!(options.fail_fast);

        let args = RunArgs {
            concurrency: NonZeroUsize::new(8),
            best_effort: true,
            timeout: Some("30s".to_string()),
            abort_in_flight: true,
        };
        let options = run_options(&stack, &args).unwrap();
        assert_eq!(options.concurrency_limit, NonZeroUsize::new(8));
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
        assert!(!options.fail_fast);
        assert!(options.abort_in_flight);
    }

    #[test]
    fn test_invalid_timeout_flag() {
        let dir = tempfile::tempdir().unwrap();
        let stack = context(dir.path()).load().unwrap();
        let args = RunArgs {
            timeout: Some("soon".to_string()),
            ..RunArgs::default()
        };
        assert!(run_options(&stack, &args).is_err());
    }

    #[test]
    fn test_missing_stack_file() {
        let ctx = Context {
            file: PathBuf::from("/nonexistent/stack.kdl"),
            state: None,
            json: false,
        };
        let err = ctx.load().unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to load stack file"));
    }
}
