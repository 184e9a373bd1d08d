//! Top-level supervision loop
//!
//! Drives the gateway connection through its states (Disconnected →
//! Connecting → Connected, back to Disconnected on drop) and
//! classifies inbound events. Each admitted message is pushed onto its
//! session's job queue from the ingestion loop, which fixes arrival
//! order before any task runs; a single drainer task per session then
//! invokes and dispatches jobs FIFO, so one slow engine call never
//! delays ingestion or other conversations. Drainers funnel outbound
//! actions back through a channel that the same loop writes to the
//! gateway; while the link is down those actions are dropped with a
//! warning instead of queueing unboundedly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::classifier::{classify, Intent};
use crate::config::Config;
use crate::dispatcher::{busy_notice, dispatch, thinking_notice};
use crate::gateway::{Backoff, GatewayLink, KEEPALIVE_INTERVAL};
use crate::invoker::{wait_for_shutdown, AssistantInvoker, ClaudeCli, Engine};
use crate::onebot::{InboundEvent, OutboundAction};
use crate::session::{Enqueue, SessionRegistry};

/// Bounded wait for in-flight invocations at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Outbound channel depth; senders block briefly rather than growing
/// an unbounded queue
const OUTBOUND_BUFFER: usize = 64;

/// Owns the registry, the invoker, and the gateway lifecycle
pub struct Supervisor {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    invoker: Arc<AssistantInvoker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Supervisor driving the real Claude CLI engine
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(ClaudeCli::new(config.cli_path.clone()));
        Self::with_engine(config, engine)
    }

    /// Supervisor with a caller-supplied engine (tests use a scripted one)
    pub fn with_engine(config: Config, engine: Arc<dyn Engine>) -> Self {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let invoker = Arc::new(AssistantInvoker::new(
            engine,
            Arc::clone(&config),
            shutdown_rx.clone(),
        ));
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            invoker,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Session registry, shared for inspection
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Signal process-wide shutdown; `run` drains and returns
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until shutdown is signalled or the configured reconnect
    /// attempts are exhausted. Reconnects with backoff on every
    /// unexpected drop.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::from_config(&self.config);
        let mut shutdown = self.shutdown_rx.clone();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundAction>(OUTBOUND_BUFFER);
        let mut workers: JoinSet<()> = JoinSet::new();

        let mut evict = tokio::time::interval(self.config.evict_interval);
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);

        let run_result = 'outer: loop {
            // Disconnected → Connecting. The retry future stays pinned
            // across drained actions and timer ticks so its attempt
            // count and backoff survive them.
            debug!("link state: connecting");
            let connect = GatewayLink::connect_with_retry(&self.config, &mut backoff);
            tokio::pin!(connect);
            let link = loop {
                tokio::select! {
                    link = &mut connect => match link {
                        Ok(link) => break link,
                        Err(e) => break 'outer Err(e.into()),
                    },
                    // Outbound traffic produced during the outage is
                    // dropped, never buffered across reconnects
                    Some(action) = outbound_rx.recv() => {
                        warn!(text_len = action.text().len(), "gateway disconnected, dropping outbound action");
                    }
                    _ = evict.tick() => {
                        self.registry.evict_idle(self.config.session_ttl);
                    }
                    _ = wait_for_shutdown(&mut shutdown) => break 'outer Ok(()),
                }
            };

            // Connecting → Connected
            let (mut reader, mut writer) = link.split();
            debug!("link state: connected");

            loop {
                tokio::select! {
                    maybe_event = reader.next_event() => {
                        match maybe_event {
                            Some(event) => self.handle_event(event, &outbound_tx, &mut workers),
                            None => {
                                // Connected → Disconnected
                                warn!("gateway connection dropped, reconnecting");
                                break;
                            }
                        }
                    }
                    Some(action) = outbound_rx.recv() => {
                        if let Err(e) = writer.send(&action).await {
                            warn!(error = %e, "failed to send outbound action, dropping it");
                        }
                    }
                    _ = evict.tick() => {
                        self.registry.evict_idle(self.config.session_ttl);
                    }
                    _ = keepalive.tick() => {
                        if let Err(e) = writer.ping().await {
                            warn!(error = %e, "keepalive ping failed, reconnecting");
                            break;
                        }
                    }
                    // Reap finished workers so the set stays small
                    Some(_) = workers.join_next(), if !workers.is_empty() => {}
                    _ = wait_for_shutdown(&mut shutdown) => {
                        info!("shutting down, closing gateway");
                        writer.close().await;
                        break 'outer Ok(());
                    }
                }
            }
        };

        // Cancel in-flight invocations and wait, bounded, for them to
        // acknowledge before exiting
        self.shutdown();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace period expired, aborting remaining workers");
            workers.abort_all();
        }

        run_result
    }

    /// Classify one event and, for a non-empty reply intent, enqueue
    /// it on its session. Enqueueing happens here, on the ingestion
    /// loop, so same-session messages are ordered by arrival and never
    /// by task scheduling. The first message of a burst spawns the
    /// session's drainer; later ones just queue behind it.
    fn handle_event(
        &self,
        event: InboundEvent,
        outbound_tx: &mpsc::Sender<OutboundAction>,
        workers: &mut JoinSet<()>,
    ) {
        let prompt = match classify(&event, &self.config) {
            Intent::Ignore => {
                debug!(key = %event.key, message_id = event.message_id, "ignoring event");
                return;
            }
            Intent::Reply(text) if text.is_empty() => {
                debug!(key = %event.key, "empty reply content, nothing to invoke");
                return;
            }
            Intent::Reply(text) => text,
        };

        info!(key = %event.key, sender = event.sender, chars = prompt.chars().count(), "scheduling invocation");

        let session = self.registry.resolve(event.key);
        session.touch();

        match session.enqueue(prompt, self.config.session_backlog) {
            Enqueue::Rejected => {
                warn!(key = %session.key, cap = self.config.session_backlog, "session backlog full, rejecting message");
                if outbound_tx.try_send(busy_notice(session.key)).is_err() {
                    warn!(key = %session.key, "outbound channel full, dropping busy notice");
                }
            }
            Enqueue::Queued => {
                debug!(key = %session.key, pending = session.pending(), "queued behind in-flight work");
            }
            Enqueue::Start => {
                let invoker = Arc::clone(&self.invoker);
                let config = Arc::clone(&self.config);
                let outbound_tx = outbound_tx.clone();
                workers.spawn(async move {
                    // On shutdown each remaining job comes back
                    // `Cancelled` immediately, which empties the queue
                    // and releases the drainer role
                    while let Some(prompt) = session.next_job() {
                        if config.thinking_notice {
                            let _ = outbound_tx.send(thinking_notice(session.key)).await;
                        }

                        let outcome = invoker.invoke(&session, &prompt).await;

                        let actions = dispatch(session.key, &outcome, &config);
                        for (i, action) in actions.into_iter().enumerate() {
                            if i > 0 && !config.segment_delay.is_zero() {
                                tokio::time::sleep(config.segment_delay).await;
                            }
                            if outbound_tx.send(action).await.is_err() {
                                return;
                            }
                            session.touch();
                        }
                    }
                });
            }
        }
    }
}
