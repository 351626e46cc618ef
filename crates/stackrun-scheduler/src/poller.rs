//! Readiness polling.
//!
//! Provisioning calls return before the resource is usable: a database is
//! still `creating`, a DNS record has not propagated. The poller checks the
//! resource until it reports ready, reports a terminal failure, or the
//! polling budget runs out.

use stackrun_core::{PollSettings, ReadinessProbe, ReadinessStatus, UnitId, ValueMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything needed to wait for one provisioned unit.
#[derive(Clone)]
pub struct ReadinessCheck {
    pub unit: UnitId,
    pub resource_type: String,
    /// Outputs returned by the provisioner, passed to the probe.
    pub outputs: ValueMap,
    pub settings: PollSettings,
    pub probe: Arc<dyn ReadinessProbe>,
}

/// Outcome of a successful wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub attempts: u32,
    pub status: ReadinessStatus,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("not ready after {elapsed:?} ({attempts} checks), last status: {last_status}")]
    Timeout {
        last_status: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("resource entered terminal state: {status}")]
    TerminalFailure { status: String, attempts: u32 },

    #[error("readiness polling cancelled")]
    Cancelled {
        last_status: Option<String>,
        attempts: u32,
    },
}

impl PollError {
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Timeout { attempts, .. }
            | PollError::TerminalFailure { attempts, .. }
            | PollError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last_status(&self) -> Option<&str> {
        match self {
            PollError::Timeout { last_status, .. } => Some(last_status),
            PollError::TerminalFailure { status, .. } => Some(status),
            PollError::Cancelled { last_status, .. } => last_status.as_deref(),
        }
    }
}

/// Poll until the resource is ready, failed, or the budget is spent.
pub async fn wait_ready(check: &ReadinessCheck) -> Result<PollReport, PollError> {
    wait_ready_with_cancel(check, &CancellationToken::new()).await
}

/// Like [`wait_ready`], but stops early when `cancel` fires.
///
/// The probe is called immediately, then once per interval. The last sleep
/// is clipped to the deadline so one final check runs exactly at it; no
/// check happens after the deadline.
pub async fn wait_ready_with_cancel(
    check: &ReadinessCheck,
    cancel: &CancellationToken,
) -> Result<PollReport, PollError> {
    let interval = check.settings.interval.max(Duration::from_millis(1));
    let start = Instant::now();
    let deadline = start
        .checked_add(check.settings.timeout)
        .unwrap_or_else(|| far_future(start));
    let mut attempts = 0u32;
    let mut last_status: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled {
                last_status,
                attempts,
            });
        }

        attempts += 1;
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PollError::Cancelled { last_status, attempts });
            }
            result = check.probe.check(&check.resource_type, &check.outputs) => result,
        };

        match observed {
            Ok(status) if status.ready => {
                let elapsed = start.elapsed();
                info!(
                    unit = %check.unit,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Unit is ready"
                );
                return Ok(PollReport {
                    attempts,
                    status,
                    elapsed,
                });
            }
            Ok(status) if status.terminal_failure => {
                warn!(unit = %check.unit, status = %status.description, "Unit entered terminal state");
                return Err(PollError::TerminalFailure {
                    status: status.description,
                    attempts,
                });
            }
            Ok(status) => {
                debug!(unit = %check.unit, attempt = attempts, status = %status.description, "Unit not ready yet");
                last_status = Some(status.description);
            }
            Err(e) => {
                // The resource may not be visible to the status API yet
                debug!(unit = %check.unit, attempt = attempts, error = %e, "Readiness check failed, retrying");
                last_status = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            let elapsed = now - start;
            let last_status = last_status.unwrap_or_default();
            warn!(
                unit = %check.unit,
                attempts,
                last_status = %last_status,
                "Unit did not become ready in time"
            );
            return Err(PollError::Timeout {
                last_status,
                attempts,
                elapsed,
            });
        }

        let wake = now.checked_add(interval).map_or(deadline, |w| w.min(deadline));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PollError::Cancelled { last_status, attempts });
            }
            _ = sleep_until(wake) => {}
        }
    }
}

/// Roughly 30 years; stands in for budgets too large to represent.
fn far_future(from: Instant) -> Instant {
    from + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stackrun_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Probe that replays a script of statuses, repeating the last one.
    struct ScriptedProbe {
        script: Vec<stackrun_core::Result<ReadinessStatus>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(script: Vec<stackrun_core::Result<ReadinessStatus>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadinessProbe for ScriptedProbe {
        async fn check(
            &self,
            _resource_type: &str,
            _outputs: &ValueMap,
        ) -> stackrun_core::Result<ReadinessStatus> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let step = &self.script[n.min(self.script.len() - 1)];
            match step {
                Ok(status) => Ok(status.clone()),
                Err(e) => Err(Error::StatusFailed(e.to_string())),
            }
        }
    }

    fn check(probe: Arc<ScriptedProbe>, interval: u64, timeout: u64) -> ReadinessCheck {
        ReadinessCheck {
            unit: UnitId::new("db").unwrap(),
            resource_type: "aws_db_instance".to_string(),
            outputs: ValueMap::new(),
            settings: PollSettings::new(Duration::from_secs(interval), Duration::from_secs(timeout)),
            probe,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_checks() {
        let probe = ScriptedProbe::new(vec![
            Ok(ReadinessStatus::pending("creating")),
            Ok(ReadinessStatus::pending("backing-up")),
            Ok(ReadinessStatus::ready("available")),
        ]);

        let report = wait_ready(&check(probe.clone(), 10, 300)).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.status.description, "available");
        assert_eq!(report.elapsed, Duration::from_secs(20));
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_calling_probe() {
        let probe = ScriptedProbe::new(vec![Ok(ReadinessStatus::pending("creating"))]);

        let err = wait_ready(&check(probe.clone(), 10, 30)).await.unwrap_err();
        // Checks at 0s, 10s, 20s and the deadline
        assert_eq!(
            err,
            PollError::Timeout {
                last_status: "creating".to_string(),
                attempts: 4,
                elapsed: Duration::from_secs(30),
            }
        );
        assert_eq!(probe.calls(), 4);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_sleep_clipped_to_deadline() {
        let probe = ScriptedProbe::new(vec![Ok(ReadinessStatus::pending("pending"))]);

        let err = wait_ready(&check(probe.clone(), 10, 25)).await.unwrap_err();
        // 0s, 10s, 20s, 25s
        assert_eq!(err.attempts(), 4);
        let PollError::Timeout { elapsed, .. } = err else {
            panic!("expected timeout");
        };
        assert_eq!(elapsed, Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_stops_early() {
        let probe = ScriptedProbe::new(vec![
            Ok(ReadinessStatus::pending("creating")),
            Ok(ReadinessStatus::failed("failed")),
        ]);

        let settings_attempts = PollSettings::slow().max_attempts() as u32;
        let err = wait_ready(&check(probe.clone(), 10, 600)).await.unwrap_err();
        assert_eq!(
            err,
            PollError::TerminalFailure {
                status: "failed".to_string(),
                attempts: 2,
            }
        );
        assert!(probe.calls() < settings_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_are_retried() {
        let probe = ScriptedProbe::new(vec![
            Err(Error::NotFound("db-instance".to_string())),
            Ok(ReadinessStatus::ready("available")),
        ]);

        let report = wait_ready(&check(probe, 2, 20)).await.unwrap();
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_text_becomes_last_status() {
        let probe = ScriptedProbe::new(vec![Err(Error::NotFound("db-instance".to_string()))]);

        let err = wait_ready(&check(probe, 2, 4)).await.unwrap_err();
        assert_eq!(
            err.last_status(),
            Some("status check failed: not found: db-instance")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget() {
        let probe = ScriptedProbe::new(vec![
            Ok(ReadinessStatus::pending("creating")),
            Ok(ReadinessStatus::ready("available")),
        ]);

        let report = wait_ready(&check(probe.clone(), 10, u64::MAX)).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.elapsed, Duration::from_secs(10));

        let probe = ScriptedProbe::new(vec![
            Ok(ReadinessStatus::pending("creating")),
            Ok(ReadinessStatus::ready("available")),
        ]);
        let report = wait_ready(&check(probe, u64::MAX, 30)).await.unwrap();
        // The oversized interval is clipped to the deadline
        assert_eq!(report.attempts, 2);
        assert_eq!(report.elapsed, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let probe = ScriptedProbe::new(vec![Ok(ReadinessStatus::pending("creating"))]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let err = wait_ready_with_cancel(&check(probe.clone(), 10, 300), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PollError::Cancelled {
                last_status: Some("creating".to_string()),
                attempts: 2,
            }
        );
        assert_eq!(probe.calls(), 2);
    }
}
