//! Assistant invocation
//!
//! Wraps one out-of-process Claude CLI call per queued job. Per-chat
//! ordering and the backlog cap live in the session job queue; the
//! invoker enforces the global concurrency cap (semaphore), bounds
//! every call by a hard wall-clock timeout, and cancels cooperatively
//! on shutdown at every suspension point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::onebot::ConversationKey;
use crate::session::Session;

/// Result of one assistant invocation
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Reply text and the cost this call reported
    Success { text: String, cost_usd: f64 },
    /// The hard wall-clock timeout expired; the process was killed
    Timeout,
    /// Spawn failure, non-zero exit, or unusable output
    ProcessFailure(String),
    /// Shutdown interrupted the call; nothing is reported to the chat
    Cancelled,
}

/// Reply text plus usage metadata from one engine run
#[derive(Debug, Clone, PartialEq)]
pub struct EngineReply {
    pub text: String,
    pub cost_usd: f64,
}

/// The out-of-process completion engine.
///
/// Implementations run one prompt to completion and do not enforce a
/// timeout of their own; the invoker bounds every call. The spawned
/// process must die when the returned future is dropped.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(&self, prompt: &str, work_dir: &Path) -> Result<EngineReply>;
}

/// Structured output of `claude --output-format json`
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse CLI stdout. Valid JSON yields text plus cost; anything else
/// from a clean exit is accepted as plain text with zero cost.
fn parse_cli_output(stdout: &str) -> Result<EngineReply> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        bail!("engine produced no output");
    }

    match serde_json::from_str::<CliOutput>(stdout) {
        Ok(output) => {
            if output.is_error.unwrap_or(false) {
                bail!(
                    "engine reported an error: {}",
                    output.error.as_deref().unwrap_or("unspecified")
                );
            }
            let text = output
                .result
                .or(output.response)
                .ok_or_else(|| anyhow::anyhow!("engine output carries no result field"))?;
            let cost_usd = output.total_cost_usd.or(output.cost_usd).unwrap_or(0.0);
            Ok(EngineReply { text, cost_usd })
        }
        // Plain-text fallback for older CLI builds
        Err(_) => Ok(EngineReply {
            text: stdout.to_string(),
            cost_usd: 0.0,
        }),
    }
}

/// Claude Code CLI engine
pub struct ClaudeCli {
    cli_path: String,
}

impl ClaudeCli {
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }
}

#[async_trait]
impl Engine for ClaudeCli {
    async fn run(&self, prompt: &str, work_dir: &Path) -> Result<EngineReply> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("creating working directory {}", work_dir.display()))?;

        debug!(cli = %self.cli_path, dir = %work_dir.display(), "spawning engine");

        // kill_on_drop ties the child's lifetime to this future, which
        // is how timeout expiry and shutdown terminate the process
        let output = Command::new(&self.cli_path)
            .arg("-p")
            .arg(prompt)
            .args(["--output-format", "json"])
            .current_dir(work_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.cli_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().next().unwrap_or("no stderr");
            bail!("engine exited with {}: {}", output.status, detail);
        }

        parse_cli_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Working directory for one conversation, under the configured root
pub fn session_work_dir(root: &Path, key: ConversationKey) -> PathBuf {
    match key {
        ConversationKey::Private(id) => root.join(format!("private_{}", id)),
        ConversationKey::Group(id) => root.join(format!("group_{}", id)),
    }
}

/// Rate-limits and time-bounds engine calls across all sessions
pub struct AssistantInvoker {
    engine: Arc<dyn Engine>,
    config: Arc<Config>,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl AssistantInvoker {
    pub fn new(engine: Arc<dyn Engine>, config: Arc<Config>, shutdown: watch::Receiver<bool>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            engine,
            config,
            permits,
            shutdown,
        }
    }

    /// Run one invocation for `session`, bounded by the global
    /// concurrency cap and the hard wall-clock timeout.
    ///
    /// Callers must already hold the session's drainer role; this
    /// method does not serialize same-session calls itself.
    pub async fn invoke(&self, session: &Session, prompt: &str) -> InvocationOutcome {
        let outcome = self.invoke_inner(session, prompt).await;
        session.touch();
        outcome
    }

    async fn invoke_inner(&self, session: &Session, prompt: &str) -> InvocationOutcome {
        let mut shutdown = self.shutdown.clone();

        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return InvocationOutcome::Cancelled,
            },
            _ = wait_for_shutdown(&mut shutdown) => return InvocationOutcome::Cancelled,
        };

        let work_dir = session_work_dir(&self.config.work_dir, session.key);
        debug!(key = %session.key, "invoking engine");

        let run = self.engine.run(prompt, &work_dir);
        tokio::select! {
            result = tokio::time::timeout(self.config.invoke_timeout, run) => match result {
                Ok(Ok(reply)) => {
                    session.add_cost(reply.cost_usd);
                    info!(
                        key = %session.key,
                        cost = reply.cost_usd,
                        session_cost = session.accumulated_cost(),
                        "invocation succeeded"
                    );
                    InvocationOutcome::Success {
                        text: reply.text,
                        cost_usd: reply.cost_usd,
                    }
                }
                Ok(Err(e)) => {
                    warn!(key = %session.key, error = %e, "invocation failed");
                    InvocationOutcome::ProcessFailure(e.to_string())
                }
                Err(_) => {
                    warn!(key = %session.key, timeout = ?self.config.invoke_timeout, "invocation timed out");
                    InvocationOutcome::Timeout
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(key = %session.key, "invocation cancelled by shutdown");
                InvocationOutcome::Cancelled
            }
        }
    }
}

/// Completes once shutdown is signalled (or the sender is gone)
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use std::time::Duration;

    struct ScriptedEngine {
        delay: Duration,
        reply: EngineReply,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn run(&self, _prompt: &str, _work_dir: &Path) -> Result<EngineReply> {
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl Engine for FailingEngine {
        async fn run(&self, _prompt: &str, _work_dir: &Path) -> Result<EngineReply> {
            bail!("exit status 1: command not found")
        }
    }

    fn invoker_with(engine: Arc<dyn Engine>, config: Config) -> (AssistantInvoker, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (AssistantInvoker::new(engine, Arc::new(config), rx), tx)
    }

    #[test]
    fn parses_json_output_with_total_cost() {
        let reply =
            parse_cli_output(r#"{"result": "hi there", "total_cost_usd": 0.002}"#).unwrap();
        assert_eq!(reply.text, "hi there");
        assert!((reply.cost_usd - 0.002).abs() < 1e-9);
    }

    #[test]
    fn parses_legacy_cost_field() {
        let reply = parse_cli_output(r#"{"response": "ok", "cost_usd": 0.01}"#).unwrap();
        assert_eq!(reply.text, "ok");
        assert!((reply.cost_usd - 0.01).abs() < 1e-9);
    }

    #[test]
    fn plain_text_output_is_accepted_with_zero_cost() {
        let reply = parse_cli_output("just some text\n").unwrap();
        assert_eq!(reply.text, "just some text");
        assert_eq!(reply.cost_usd, 0.0);
    }

    #[test]
    fn error_output_is_rejected() {
        assert!(parse_cli_output(r#"{"is_error": true, "error": "overloaded"}"#).is_err());
        assert!(parse_cli_output("").is_err());
        assert!(parse_cli_output(r#"{"total_cost_usd": 1.0}"#).is_err());
    }

    #[test]
    fn work_dirs_are_scoped_per_conversation() {
        let root = Path::new("/tmp/bridge");
        assert_eq!(
            session_work_dir(root, ConversationKey::Private(42)),
            root.join("private_42")
        );
        assert_eq!(
            session_work_dir(root, ConversationKey::Group(900)),
            root.join("group_900")
        );
    }

    #[tokio::test]
    async fn cli_engine_creates_the_work_dir_and_accepts_plain_text() {
        // `echo` stands in for the CLI; its output is not JSON, so the
        // plain-text fallback applies
        let root = tempfile::tempdir().unwrap();
        let work_dir = session_work_dir(root.path(), ConversationKey::Private(42));

        let engine = ClaudeCli::new("echo");
        let reply = engine.run("hello", &work_dir).await.unwrap();

        assert!(reply.text.contains("hello"));
        assert_eq!(reply.cost_usd, 0.0);
        assert!(work_dir.is_dir());
    }

    #[tokio::test]
    async fn success_accumulates_cost() {
        let engine = Arc::new(ScriptedEngine {
            delay: Duration::ZERO,
            reply: EngineReply {
                text: "hi there".to_string(),
                cost_usd: 0.002,
            },
        });
        let (invoker, _tx) = invoker_with(engine, Config::default());
        let registry = SessionRegistry::new();
        let session = registry.resolve(ConversationKey::Private(42));

        let outcome = invoker.invoke(&session, "hello").await;
        assert_eq!(
            outcome,
            InvocationOutcome::Success {
                text: "hi there".to_string(),
                cost_usd: 0.002
            }
        );
        assert!((session.accumulated_cost() - 0.002).abs() < 1e-9);
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn timeout_kills_the_call_and_leaves_cost_untouched() {
        let engine = Arc::new(ScriptedEngine {
            delay: Duration::from_secs(60),
            reply: EngineReply {
                text: "too late".to_string(),
                cost_usd: 1.0,
            },
        });
        let config = Config {
            invoke_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let (invoker, _tx) = invoker_with(engine, config);
        let registry = SessionRegistry::new();
        let session = registry.resolve(ConversationKey::Private(42));

        let outcome = invoker.invoke(&session, "hello").await;
        assert_eq!(outcome, InvocationOutcome::Timeout);
        assert_eq!(session.accumulated_cost(), 0.0);
    }

    #[tokio::test]
    async fn engine_failure_surfaces_as_process_failure() {
        let (invoker, _tx) = invoker_with(Arc::new(FailingEngine), Config::default());
        let registry = SessionRegistry::new();
        let session = registry.resolve(ConversationKey::Group(900));

        match invoker.invoke(&session, "hello").await {
            InvocationOutcome::ProcessFailure(detail) => {
                assert!(detail.contains("command not found"))
            }
            other => panic!("expected ProcessFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_invocation() {
        let engine = Arc::new(ScriptedEngine {
            delay: Duration::from_secs(60),
            reply: EngineReply {
                text: String::new(),
                cost_usd: 0.0,
            },
        });
        let (invoker, tx) = invoker_with(engine, Config::default());
        let invoker = Arc::new(invoker);
        let registry = SessionRegistry::new();
        let session = registry.resolve(ConversationKey::Private(42));

        let call = {
            let invoker = Arc::clone(&invoker);
            let session = Arc::clone(&session);
            tokio::spawn(async move { invoker.invoke(&session, "hello").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        assert_eq!(call.await.unwrap(), InvocationOutcome::Cancelled);
        assert_eq!(session.accumulated_cost(), 0.0);
    }
}
