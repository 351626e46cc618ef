//! Load-time variable interpolation for stack files.
//!
//! Supports variables like:
//! - `${stack.name}` - Stack name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${NAME}` - Custom variable
//!
//! Unit output references (`${unit.<id>.outputs.<key>}`) are not variables;
//! they are left untouched here and resolved by the orchestrator.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// Regex for matching ${...} variables with at most two segments
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Variables available while parsing a stack file.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub stack_name: String,
    pub env: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context populated from the current process environment.
    pub fn from_env() -> Self {
        let mut ctx = Self::new();
        ctx.env = std::env::vars().collect();
        ctx
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["stack", "name"] => Some(self.stack_name.clone()),
            ["env", name] => self.env.get(*name).cloned(),
            [name] => self.custom.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all known variables in a string; unknown ones are preserved.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }
}
