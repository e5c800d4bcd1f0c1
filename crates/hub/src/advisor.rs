//! Boundary to the advisory decision source.
//!
//! The hub never looks at how a decision was produced. [`ExecAdvisor`] runs
//! an external program: the context goes in as JSON on stdin, a decision
//! comes back as JSON on stdout, optionally with its own cost or the token
//! usage to estimate it from.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AdvisorConfig;
use crate::control::ControlFlags;
use crate::db::LoggedAction;
use crate::decision::Decision;
use crate::error::AdvisorError;
use crate::rate_limit::RateLimitSummary;
use crate::status::DeviceStatus;

/// Everything the advisor is shown for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisorContext {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
    pub status: DeviceStatus,
    pub soil_moisture_pct: f64,
    pub control: ControlFlags,
    pub limits: RateLimitSummary,
    pub recent_actions: Vec<LoggedAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advice {
    pub decision: Decision,
    pub cost_usd: f64,
}

pub trait Advisor: Send + Sync {
    fn advise(
        &self,
        ctx: &AdvisorContext,
    ) -> impl Future<Output = Result<Advice, AdvisorError>> + Send;
}

// ---------------------------------------------------------------------------
// External program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

impl Pricing {
    pub fn estimate(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_usd_per_mtok
            + usage.output_tokens as f64 * self.output_usd_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(flatten)]
    decision: Decision,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    usage: Option<Usage>,
}

pub struct ExecAdvisor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    pricing: Pricing,
}

impl ExecAdvisor {
    pub fn new(command: &[String], timeout: Duration, pricing: Pricing) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            pricing,
        })
    }

    async fn run(&self, input: Vec<u8>) -> Result<Vec<u8>, AdvisorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdvisorError::Unreachable(format!("spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(&input).await {
                debug!("advisor stdin closed early: {e}");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AdvisorError::Unreachable(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdvisorError::Unreachable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl Advisor for ExecAdvisor {
    async fn advise(&self, ctx: &AdvisorContext) -> Result<Advice, AdvisorError> {
        let input = serde_json::to_vec(ctx).map_err(|e| AdvisorError::BadResponse(e.to_string()))?;

        let stdout = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| AdvisorError::Timeout(self.timeout.as_secs()))??;

        let reply: Reply = serde_json::from_slice(&stdout)
            .map_err(|e| AdvisorError::BadResponse(e.to_string()))?;
        if reply.decision.actions.is_empty() {
            return Err(AdvisorError::BadResponse("decision has no actions".into()));
        }

        let cost_usd = match (reply.cost_usd, reply.usage) {
            (Some(c), _) if c.is_finite() && c >= 0.0 => c,
            (_, Some(usage)) => self.pricing.estimate(&usage),
            (Some(c), None) => {
                warn!(cost_usd = c, "advisor reported unusable cost, counting zero");
                0.0
            }
            (None, None) => 0.0,
        };
        Ok(Advice {
            decision: reply.decision,
            cost_usd,
        })
    }
}

// ---------------------------------------------------------------------------
// No advisor
// ---------------------------------------------------------------------------

/// Stand-in when no advisor is configured; every cycle runs on fallback.
pub struct UnreachableAdvisor;

impl Advisor for UnreachableAdvisor {
    async fn advise(&self, _ctx: &AdvisorContext) -> Result<Advice, AdvisorError> {
        Err(AdvisorError::Unreachable("no advisor configured".into()))
    }
}

pub enum AnyAdvisor {
    Exec(ExecAdvisor),
    Offline(UnreachableAdvisor),
}

impl AnyAdvisor {
    pub fn from_config(cfg: &AdvisorConfig) -> Self {
        let pricing = Pricing {
            input_usd_per_mtok: cfg.input_usd_per_mtok,
            output_usd_per_mtok: cfg.output_usd_per_mtok,
        };
        cfg.command
            .as_deref()
            .and_then(|cmd| ExecAdvisor::new(cmd, Duration::from_secs(cfg.timeout_sec), pricing))
            .map_or(Self::Offline(UnreachableAdvisor), Self::Exec)
    }
}

impl Advisor for AnyAdvisor {
    async fn advise(&self, ctx: &AdvisorContext) -> Result<Advice, AdvisorError> {
        match self {
            Self::Exec(a) => a.advise(ctx).await,
            Self::Offline(a) => a.advise(ctx).await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Urgency;
    use std::collections::HashMap;
    use time::macros::datetime;

    const PRICING: Pricing = Pricing {
        input_usd_per_mtok: 3.0,
        output_usd_per_mtok: 15.0,
    };

    fn ctx() -> AdvisorContext {
        AdvisorContext {
            device_id: "plant-01".into(),
            timestamp: datetime!(2024-06-01 12:00 UTC),
            status: DeviceStatus::parse("700,22.00,45.00,410,600,1,0,0,0,0,0,0,0,0").unwrap(),
            soil_moisture_pct: 31.0,
            control: ControlFlags::default(),
            limits: RateLimitSummary {
                hourly_count: 0,
                cost_today_usd: 0.0,
                daily_counts: HashMap::new(),
            },
            recent_actions: vec![],
        }
    }

    fn shell(script: &str, timeout: Duration) -> ExecAdvisor {
        let cmd = ["sh".to_string(), "-c".to_string(), script.to_string()];
        ExecAdvisor::new(&cmd, timeout, PRICING).unwrap()
    }

    #[test]
    fn pricing_estimate() {
        let usage = Usage {
            input_tokens: 2_000,
            output_tokens: 500,
        };
        assert!((PRICING.estimate(&usage) - 0.0135).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reads_decision_and_usage() {
        let a = shell(
            r#"cat >/dev/null; echo '{"actions":[{"action":"light_on","reason":"dawn"}],"urgency":"normal","usage":{"input_tokens":1000000,"output_tokens":0}}'"#,
            Duration::from_secs(5),
        );
        let advice = a.advise(&ctx()).await.unwrap();
        assert_eq!(advice.decision.actions[0].action, "light_on");
        assert_eq!(advice.decision.urgency, Urgency::Normal);
        assert!((advice.cost_usd - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn explicit_cost_wins() {
        let a = shell(
            r#"cat >/dev/null; echo '{"actions":[{"action":"do_nothing"}],"cost_usd":0.02,"usage":{"input_tokens":5}}'"#,
            Duration::from_secs(5),
        );
        assert!((a.advise(&ctx()).await.unwrap().cost_usd - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn receives_context_on_stdin() {
        // Echo back a decision only if the device id made it through.
        let a = shell(
            r#"grep -q '"device_id":"plant-01"' && echo '{"actions":[{"action":"do_nothing"}]}'"#,
            Duration::from_secs(5),
        );
        assert!(a.advise(&ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn garbage_is_bad_response() {
        let a = shell("cat >/dev/null; echo 'I think you should water'", Duration::from_secs(5));
        assert!(matches!(a.advise(&ctx()).await, Err(AdvisorError::BadResponse(_))));

        let a = shell(r#"cat >/dev/null; echo '{"actions":[]}'"#, Duration::from_secs(5));
        assert!(matches!(a.advise(&ctx()).await, Err(AdvisorError::BadResponse(_))));
    }

    #[tokio::test]
    async fn failing_program_is_unreachable() {
        let a = shell("echo 'api down' >&2; exit 3", Duration::from_secs(5));
        match a.advise(&ctx()).await {
            Err(AdvisorError::Unreachable(msg)) => assert!(msg.contains("api down"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }

        let missing = ExecAdvisor::new(&["/nonexistent/advisor".to_string()], Duration::from_secs(1), PRICING)
            .unwrap();
        assert!(matches!(missing.advise(&ctx()).await, Err(AdvisorError::Unreachable(_))));
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let a = shell("sleep 5", Duration::from_millis(200));
        assert!(matches!(a.advise(&ctx()).await, Err(AdvisorError::Timeout(_))));
    }

    #[tokio::test]
    async fn no_command_means_offline() {
        let a = AnyAdvisor::from_config(&AdvisorConfig::default());
        assert!(matches!(a, AnyAdvisor::Offline(_)));
        assert!(matches!(a.advise(&ctx()).await, Err(AdvisorError::Unreachable(_))));
    }
}
