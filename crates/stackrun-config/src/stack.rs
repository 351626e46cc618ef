//! Stack file parsing.

use crate::settings::{ProvisionerConfig, Settings, parse_duration, poll_preset};
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use stackrun_core::value::embedded_refs;
use stackrun_core::{PollSettings, Unit, UnitId, Value, ValueMap};
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;

/// A parsed stack file.
#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    pub name: String,
    pub units: Vec<Unit>,
    pub settings: Settings,
}

impl StackConfig {
    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id.as_str() == id)
    }
}

/// Read and parse a stack file, interpolating `${env.*}` from the process
/// environment.
pub fn load_stack(path: &Path) -> ConfigResult<StackConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_stack_with(&content, &VariableContext::from_env())
}

/// Parse a stack configuration from KDL text.
pub fn parse_stack(kdl: &str) -> ConfigResult<StackConfig> {
    parse_stack_with(kdl, &VariableContext::new())
}

/// Parse a stack configuration using the given variables for interpolation.
pub fn parse_stack_with(kdl: &str, vars: &VariableContext) -> ConfigResult<StackConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let name = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "stack")
        .and_then(get_first_string_arg)
        .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;

    let mut vars = vars.clone();
    vars.stack_name = name.clone();

    let mut units = Vec::new();
    let mut seen = HashSet::new();
    let mut settings = Settings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "unit" => {
                let unit = parse_unit(node, &vars)?;
                if !seen.insert(unit.id.clone()) {
                    return Err(ConfigError::Duplicate(format!("unit '{}'", unit.id)));
                }
                units.push(unit);
            }
            "settings" => parse_run_settings(node, &mut settings)?,
            "readiness" => {
                let target = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("readiness resource type".to_string()))?;
                let poll = parse_poll_settings(node, PollSettings::default())?;
                if target == "default" {
                    settings.readiness.default = poll;
                } else {
                    settings.readiness.by_type.insert(target, poll);
                }
            }
            "provisioner" => {
                let resource_type = get_first_string_arg(node).ok_or_else(|| {
                    ConfigError::MissingField("provisioner resource type".to_string())
                })?;
                if settings.provisioners.contains_key(&resource_type) {
                    return Err(ConfigError::Duplicate(format!(
                        "provisioner '{}'",
                        resource_type
                    )));
                }
                let config = parse_provisioner(node, &resource_type, &vars)?;
                settings.provisioners.insert(resource_type, config);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(StackConfig {
        name,
        units,
        settings,
    })
}

fn parse_unit(node: &KdlNode, vars: &VariableContext) -> ConfigResult<Unit> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("unit id".to_string()))?;
    let id = parse_unit_id(&name, "unit id")?;

    let resource_type = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for unit '{}'", name)))?;

    let mut unit = Unit::new(id, resource_type);

    for dep in get_string_list_prop(node, "depends-on") {
        unit.dependencies
            .insert(parse_unit_id(&dep, &format!("dependency of unit '{}'", name))?);
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "input" => {
                    let key = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("input name in unit '{}'", name))
                    })?;
                    let field = format!("input '{}' of unit '{}'", key, name);
                    let value = value_from_node(child, 1, vars, &field)?;
                    unit.inputs.insert(key, value);
                }
                "mock" => {
                    let dep = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("mock dependency in unit '{}'", name))
                    })?;
                    let dep_id = parse_unit_id(&dep, &format!("mock in unit '{}'", name))?;
                    let field = format!("mock '{}' of unit '{}'", dep, name);
                    let outputs = match value_from_children(child, vars, &field)? {
                        Some(map) => map,
                        None => ValueMap::new(),
                    };
                    unit.mock_outputs.entry(dep_id).or_default().extend(outputs);
                }
                "readiness" => {
                    unit.readiness = Some(parse_poll_settings(child, PollSettings::default())?);
                }
                _ => {}
            }
        }
    }

    Ok(unit)
}

fn parse_unit_id(raw: &str, field: &str) -> ConfigResult<UnitId> {
    UnitId::new(raw).map_err(|e| ConfigError::invalid(field, e.to_string()))
}

fn parse_run_settings(node: &KdlNode, settings: &mut Settings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let Some(value) = get_first_arg(child) else {
            return Err(ConfigError::MissingField(format!(
                "value for setting '{}'",
                child.name().value()
            )));
        };
        match child.name().value() {
            "concurrency" => {
                let limit = value
                    .as_integer()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(NonZeroUsize::new)
                    .ok_or_else(|| ConfigError::invalid("concurrency", "expected a positive integer"))?;
                settings.run.concurrency_limit = Some(limit);
            }
            "fail-fast" => {
                settings.run.fail_fast = value
                    .as_bool()
                    .ok_or_else(|| ConfigError::invalid("fail-fast", "expected a boolean"))?;
            }
            "abort-in-flight" => {
                settings.run.abort_in_flight = value
                    .as_bool()
                    .ok_or_else(|| ConfigError::invalid("abort-in-flight", "expected a boolean"))?;
            }
            "timeout" => {
                settings.run.timeout = Some(duration_from_value(value, "timeout")?);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Upper bound on a readiness budget.
const MAX_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

fn parse_poll_settings(node: &KdlNode, base: PollSettings) -> ConfigResult<PollSettings> {
    let mut poll = match get_string_prop(node, "preset") {
        Some(preset) => poll_preset(&preset)?,
        None => base,
    };
    if let Some(value) = node.get("interval") {
        poll.interval = duration_from_value(value, "readiness interval")?;
    }
    if let Some(value) = node.get("timeout") {
        poll.timeout = duration_from_value(value, "readiness timeout")?;
    }
    if poll.interval.is_zero() {
        return Err(ConfigError::invalid(
            "readiness interval",
            "must be greater than zero",
        ));
    }
    if poll.timeout > MAX_POLL_TIMEOUT || poll.interval > MAX_POLL_TIMEOUT {
        return Err(ConfigError::invalid(
            "readiness timeout",
            "must not exceed 7 days",
        ));
    }
    Ok(poll)
}

fn parse_provisioner(
    node: &KdlNode,
    resource_type: &str,
    vars: &VariableContext,
) -> ConfigResult<ProvisionerConfig> {
    let mut config = ProvisionerConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let args: Vec<String> = get_all_string_args(child)
                .iter()
                .map(|a| vars.interpolate(a))
                .collect();
            match child.name().value() {
                "apply" => config.apply = args,
                "destroy" => config.destroy = args,
                "status" => config.status = Some(args).filter(|a| !a.is_empty()),
                "working-dir" => config.working_dir = args.into_iter().next().map(Into::into),
                "env" => {
                    for entry in child.entries() {
                        if let (Some(key), Some(value)) = (entry.name(), entry.value().as_string()) {
                            config
                                .env
                                .insert(key.value().to_string(), vars.interpolate(value));
                        }
                    }
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            if let Some(value) = get_first_string_arg(gc) {
                                config
                                    .env
                                    .insert(gc.name().value().to_string(), vars.interpolate(&value));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if config.apply.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "apply command for provisioner '{}'",
            resource_type
        )));
    }
    if config.destroy.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "destroy command for provisioner '{}'",
            resource_type
        )));
    }

    Ok(config)
}

// Value conversion

/// Value of a node: one argument is a scalar, several a list, children a map.
fn value_from_node(
    node: &KdlNode,
    skip: usize,
    vars: &VariableContext,
    field: &str,
) -> ConfigResult<Value> {
    let args: Vec<&KdlValue> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .skip(skip)
        .map(|e| e.value())
        .collect();

    if let Some(map) = value_from_children(node, vars, field)? {
        if !args.is_empty() {
            return Err(ConfigError::invalid(
                field,
                "cannot combine arguments with a child block",
            ));
        }
        return Ok(Value::Map(map));
    }

    match args.as_slice() {
        [] => Err(ConfigError::MissingField(format!("value for {}", field))),
        [single] => convert_value(single, vars, field),
        many => Ok(Value::List(
            many.iter()
                .map(|v| convert_value(v, vars, field))
                .collect::<ConfigResult<Vec<_>>>()?,
        )),
    }
}

fn value_from_children(
    node: &KdlNode,
    vars: &VariableContext,
    field: &str,
) -> ConfigResult<Option<ValueMap>> {
    let Some(children) = node.children() else {
        return Ok(None);
    };

    let mut map = BTreeMap::new();
    for child in children.nodes() {
        let key = child.name().value().to_string();
        let value = value_from_node(child, 0, vars, &format!("{}.{}", field, key))?;
        map.insert(key, value);
    }
    Ok(Some(map))
}

fn convert_value(value: &KdlValue, vars: &VariableContext, field: &str) -> ConfigResult<Value> {
    if let Some(s) = value.as_string() {
        let s = vars.interpolate(s);
        let declared = s.matches("${unit.").count();
        if declared > embedded_refs(&s).len() {
            return Err(ConfigError::InvalidReference(format!(
                "{} in {}, expected ${{unit.<id>.outputs.<key>}}",
                s, field
            )));
        }
        return Ok(Value::from_template(s));
    }
    if let Some(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Some(i) = value.as_integer() {
        return i64::try_from(i)
            .map(Value::Integer)
            .map_err(|_| ConfigError::invalid(field, "integer out of range"));
    }
    if let Some(f) = value.as_float() {
        return Ok(Value::Float(f));
    }
    Ok(Value::Null)
}

fn duration_from_value(value: &KdlValue, field: &str) -> ConfigResult<std::time::Duration> {
    if let Some(s) = value.as_string() {
        return parse_duration(s);
    }
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .map(std::time::Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(field, "expected a duration"))
}

// Helper functions for extracting values from KDL nodes

fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes like depends-on="a" depends-on="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    // Block syntax, possibly repeated
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(get_all_string_args(child));
            }
        }
    }

    result
}
