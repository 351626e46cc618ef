//! Provisioner backed by external commands.
//!
//! Each resource type maps to an `apply`, a `destroy` and an optional
//! `status` command. A command receives a JSON request on stdin:
//!
//! ```json
//! {"action": "apply", "resource_type": "aws_db_instance", "inputs": {...}}
//! ```
//!
//! (`state` instead of `inputs` for destroy, `outputs` for status) plus the
//! `STACKRUN_ACTION` and `STACKRUN_RESOURCE_TYPE` environment variables.
//! `apply` prints the resource outputs as a JSON object, either plain or in
//! `terraform output -json` form. `status` prints
//! `{"ready": bool, "terminal": bool, "status": "..."}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackrun_config::ProvisionerConfig;
use stackrun_core::{ReadinessProbe, ReadinessStatus, ResourceProvisioner, Value, ValueMap};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::CommandError;

/// Statuses after which a resource will never become ready.
const TERMINAL_STATUSES: &[&str] = &["failed", "deleted", "deleting", "create-failed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Apply,
    Destroy,
    Status,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Apply => write!(f, "apply"),
            Action::Destroy => write!(f, "destroy"),
            Action::Status => write!(f, "status"),
        }
    }
}

/// Provisioner that shells out to per-resource-type commands.
pub struct CommandProvisioner {
    commands: BTreeMap<String, ProvisionerConfig>,
    /// Directory that relative working directories are resolved against.
    base_dir: PathBuf,
}

impl CommandProvisioner {
    pub fn new(commands: BTreeMap<String, ProvisionerConfig>) -> Self {
        Self {
            commands,
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    fn config(&self, resource_type: &str) -> Result<&ProvisionerConfig, CommandError> {
        self.commands
            .get(resource_type)
            .ok_or_else(|| CommandError::UnknownResourceType(resource_type.to_string()))
    }

    fn working_dir(&self, config: &ProvisionerConfig) -> PathBuf {
        match &config.working_dir {
            Some(dir) => self.base_dir.join(dir),
            None => self.base_dir.clone(),
        }
    }

    /// Run one command, feeding it the request, and return its stdout.
    async fn run(
        &self,
        config: &ProvisionerConfig,
        argv: &[String],
        action: Action,
        resource_type: &str,
        payload_key: &str,
        payload: &ValueMap,
    ) -> Result<String, CommandError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::EmptyCommand(action));
        };

        let mut request = serde_json::json!({
            "action": action,
            "resource_type": resource_type,
        });
        request[payload_key] = Value::Map(payload.clone()).to_json();

        let body = serde_json::to_vec(&request).map_err(|e| CommandError::Parse {
            action,
            message: e.to_string(),
        })?;

        let dir = self.working_dir(config);
        debug!(%action, resource_type, program = %program, dir = %dir.display(), "Running command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&dir)
            .envs(&config.env)
            .env("STACKRUN_ACTION", action.to_string())
            .env("STACKRUN_RESOURCE_TYPE", resource_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout and stderr
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&body).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        // The command may exit without reading its input
        if let Err(e) = fed {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            error!(%action, resource_type, status = %output.status, stderr = %stderr.trim(), "Command failed");
            return Err(CommandError::Failed {
                action,
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout)
    }

    async fn apply(&self, resource_type: &str, inputs: &ValueMap) -> Result<ValueMap, CommandError> {
        let config = self.config(resource_type)?;
        let stdout = self
            .run(config, &config.apply, Action::Apply, resource_type, "inputs", inputs)
            .await?;
        let outputs = parse_outputs(&stdout)?;
        info!(resource_type, outputs = outputs.len(), "Apply command succeeded");
        Ok(outputs)
    }

    async fn remove(&self, resource_type: &str, state: &ValueMap) -> Result<(), CommandError> {
        let config = self.config(resource_type)?;
        self.run(config, &config.destroy, Action::Destroy, resource_type, "state", state)
            .await?;
        info!(resource_type, "Destroy command succeeded");
        Ok(())
    }

    async fn status(&self, resource_type: &str, outputs: &ValueMap) -> Result<ReadinessStatus, CommandError> {
        let config = self.config(resource_type)?;
        let Some(argv) = &config.status else {
            return Ok(ReadinessStatus::ready("no status command"));
        };
        let stdout = self
            .run(config, argv, Action::Status, resource_type, "outputs", outputs)
            .await?;
        parse_status(&stdout)
    }
}

#[async_trait]
impl ResourceProvisioner for CommandProvisioner {
    fn name(&self) -> &'static str {
        "command"
    }

    /// Dropping an in-flight call kills the child process.
    fn supports_cancellation(&self) -> bool {
        true
    }

    async fn provision(&self, resource_type: &str, inputs: &ValueMap) -> stackrun_core::Result<ValueMap> {
        self.apply(resource_type, inputs)
            .await
            .map_err(|e| e.into_core(Action::Apply))
    }

    async fn destroy(&self, resource_type: &str, state: &ValueMap) -> stackrun_core::Result<()> {
        self.remove(resource_type, state)
            .await
            .map_err(|e| e.into_core(Action::Destroy))
    }
}

#[async_trait]
impl ReadinessProbe for CommandProvisioner {
    async fn check(&self, resource_type: &str, outputs: &ValueMap) -> stackrun_core::Result<ReadinessStatus> {
        self.status(resource_type, outputs)
            .await
            .map_err(|e| e.into_core(Action::Status))
    }
}

/// Parse apply output: a JSON object of outputs, or `terraform output -json`.
fn parse_outputs(stdout: &str) -> Result<ValueMap, CommandError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(ValueMap::new());
    }

    let parse_error = |message: String| CommandError::Parse {
        action: Action::Apply,
        message,
    };
    let json: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| parse_error(e.to_string()))?;
    let serde_json::Value::Object(map) = json else {
        return Err(parse_error("expected a JSON object".to_string()));
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| (key, Value::from(unwrap_terraform_output(value))))
        .collect())
}

/// `{"value": v, "type": t, "sensitive": b}` becomes `v`.
fn unwrap_terraform_output(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut obj)
            if obj.contains_key("value")
                && obj.contains_key("type")
                && obj.keys().all(|k| matches!(k.as_str(), "value" | "type" | "sensitive")) =>
        {
            obj.remove("value").unwrap_or_default()
        }
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    ready: bool,
    #[serde(default)]
    terminal: bool,
    #[serde(default)]
    status: Option<String>,
}

fn parse_status(stdout: &str) -> Result<ReadinessStatus, CommandError> {
    let report: StatusReport =
        serde_json::from_str(stdout.trim()).map_err(|e| CommandError::Parse {
            action: Action::Status,
            message: e.to_string(),
        })?;

    let fallback = if report.ready { "ready" } else { "pending" };
    let description = report.status.unwrap_or_else(|| fallback.to_string());

    let terminal = TERMINAL_STATUSES.contains(&description.to_ascii_lowercase().as_str());
    if report.ready {
        Ok(ReadinessStatus::ready(description))
    } else if report.terminal || terminal {
        Ok(ReadinessStatus::failed(description))
    } else {
        Ok(ReadinessStatus::pending(description))
    }
}

/// Resolve a stack-relative directory for commands.
pub fn base_dir_for(stack_file: &Path) -> PathBuf {
    match stack_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_outputs() {
        let outputs = parse_outputs(r#"{"endpoint": "db.internal", "port": 5432}"#).unwrap();
        assert_eq!(outputs["endpoint"], Value::from("db.internal"));
        assert_eq!(outputs["port"], Value::Integer(5432));
    }

    #[test]
    fn test_parse_terraform_outputs() {
        let stdout = r#"{
            "endpoint": {"sensitive": false, "type": "string", "value": "db.internal"},
            "subnet_ids": {"sensitive": false, "type": ["list", "string"], "value": ["a", "b"]}
        }"#;
        let outputs = parse_outputs(stdout).unwrap();
        assert_eq!(outputs["endpoint"], Value::from("db.internal"));
        assert_eq!(
            outputs["subnet_ids"],
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_plain_object_output_kept() {
        let outputs = parse_outputs(r#"{"tags": {"value": "x", "owner": "ops"}}"#).unwrap();
        let Value::Map(tags) = &outputs["tags"] else {
            panic!("expected a map");
        };
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_outputs("  \n").unwrap().is_empty());
        assert!(parse_outputs("[1, 2]").is_err());
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status(r#"{"ready": false, "status": "creating"}"#).unwrap();
        assert!(!status.ready && !status.terminal_failure);
        assert_eq!(status.description, "creating");

        let status = parse_status(r#"{"ready": true, "status": "available"}"#).unwrap();
        assert!(status.ready);

        let status = parse_status(r#"{"ready": false, "terminal": true, "status": "incompatible-network"}"#).unwrap();
        assert!(status.terminal_failure);

        let status = parse_status(r#"{"ready": false, "status": "create-failed"}"#).unwrap();
        assert!(status.terminal_failure);

        let status = parse_status(r#"{"ready": false, "status": "DELETING"}"#).unwrap();
        assert!(status.terminal_failure);
        assert_eq!(status.description, "DELETING");

        assert!(parse_status("ok").is_err());
    }

    #[test]
    fn test_base_dir_for() {
        assert_eq!(base_dir_for(Path::new("stack.kdl")), PathBuf::from("."));
        assert_eq!(base_dir_for(Path::new("infra/stack.kdl")), PathBuf::from("infra"));
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use stackrun_core::Error;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn provisioner(resource_type: &str, config: ProvisionerConfig) -> CommandProvisioner {
        CommandProvisioner::new(BTreeMap::from([(resource_type.to_string(), config)]))
    }

    fn config(apply: &str, destroy: &str, status: Option<&str>) -> ProvisionerConfig {
        ProvisionerConfig {
            apply: sh(apply),
            destroy: sh(destroy),
            status: status.map(sh),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_receives_request() {
        let p = provisioner("aws_db_instance", config("cat", "true", None));
        let inputs = ValueMap::from([("identifier".to_string(), Value::from("lightwave-db"))]);

        let outputs = p.provision("aws_db_instance", &inputs).await.unwrap();
        assert_eq!(outputs["action"], Value::from("apply"));
        assert_eq!(outputs["resource_type"], Value::from("aws_db_instance"));
        let Value::Map(echoed) = &outputs["inputs"] else {
            panic!("expected inputs to be echoed");
        };
        assert_eq!(echoed["identifier"], Value::from("lightwave-db"));
    }

    #[tokio::test]
    async fn test_large_request_echoed() {
        let p = provisioner("aws_s3_object", config("cat", "true", None));
        let blob = "x".repeat(1024 * 1024);
        let inputs = ValueMap::from([("blob".to_string(), Value::from(blob.as_str()))]);

        let outputs = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            p.provision("aws_s3_object", &inputs),
        )
        .await
        .expect("command stalled on a full pipe")
        .unwrap();
        let Value::Map(echoed) = &outputs["inputs"] else {
            panic!("expected inputs to be echoed");
        };
        assert_eq!(echoed["blob"], Value::from(blob.as_str()));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let mut cfg = config(
            r#"cat >/dev/null; printf '{"action":"%s","region":"%s"}' "$STACKRUN_ACTION" "$AWS_REGION""#,
            "true",
            None,
        );
        cfg.env.insert("AWS_REGION".to_string(), "us-east-1".to_string());
        let p = provisioner("aws_vpc", cfg);

        let outputs = p.provision("aws_vpc", &ValueMap::new()).await.unwrap();
        assert_eq!(outputs["action"], Value::from("apply"));
        assert_eq!(outputs["region"], Value::from("us-east-1"));
    }

    #[tokio::test]
    async fn test_working_dir_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("units")).unwrap();
        std::fs::write(dir.path().join("units/outputs.json"), r#"{"vpc_id": "vpc-123"}"#).unwrap();

        let mut cfg = config("cat >/dev/null; cat outputs.json", "true", None);
        cfg.working_dir = Some(PathBuf::from("units"));
        let p = provisioner("aws_vpc", cfg).with_base_dir(dir.path());

        let outputs = p.provision("aws_vpc", &ValueMap::new()).await.unwrap();
        assert_eq!(outputs["vpc_id"], Value::from("vpc-123"));
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let p = provisioner(
            "aws_db_instance",
            config("echo 'quota exceeded' >&2; exit 3", "echo 'still in use' >&2; exit 1", None),
        );

        let err = p
            .provision("aws_db_instance", &ValueMap::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::ProvisionFailed(m) if m.contains("quota exceeded")));

        let err = p.destroy("aws_db_instance", &ValueMap::new()).await.unwrap_err();
        assert!(matches!(&err, Error::DestroyFailed(m) if m.contains("still in use")));
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let p = CommandProvisioner::new(BTreeMap::new());
        let err = p.provision("aws_s3_bucket", &ValueMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedResourceType(t) if t == "aws_s3_bucket"));
    }

    #[tokio::test]
    async fn test_status_command() {
        let p = provisioner(
            "aws_db_instance",
            config(
                "true",
                "true",
                Some(r#"cat >/dev/null; echo '{"ready": false, "status": "backing-up"}'"#),
            ),
        );

        let status = p.check("aws_db_instance", &ValueMap::new()).await.unwrap();
        assert!(!status.ready);
        assert_eq!(status.description, "backing-up");
    }

    #[tokio::test]
    async fn test_no_status_command_is_ready() {
        let p = provisioner("cloudflare_record", config("true", "true", None));
        let status = p.check("cloudflare_record", &ValueMap::new()).await.unwrap();
        assert!(status.ready);
    }
}
