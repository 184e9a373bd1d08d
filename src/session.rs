//! Session registry
//!
//! One `Session` per conversation key, created lazily on first
//! classified message and evicted after a configurable idle TTL. The
//! registry is the only owner of the map; components reach sessions
//! exclusively through `resolve`.
//!
//! Invocation order is fixed at enqueue time: the ingestion loop
//! pushes each admitted message onto the session's job queue
//! synchronously, in arrival order, and a single drainer task per
//! session pops jobs FIFO. Task spawn order never decides invocation
//! order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::onebot::ConversationKey;

/// Result of pushing a message onto a session's job queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The session was idle; the caller must spawn a drainer for it
    Start,
    /// Queued behind work the session's current drainer will reach
    Queued,
    /// The backlog cap is hit; nothing was queued
    Rejected,
}

struct JobQueue {
    jobs: VecDeque<String>,
    /// True while one drainer task owns this session's jobs
    draining: bool,
}

/// Per-conversation state
pub struct Session {
    /// Conversation this session serves
    pub key: ConversationKey,
    /// Updated on every inbound or outbound traffic for this session
    last_activity: Mutex<Instant>,
    /// Running total of reported usage cost, monotonically non-decreasing
    accumulated_cost: Mutex<f64>,
    /// Messages waiting for (or held by) this session's drainer
    queue: Mutex<JobQueue>,
}

impl Session {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            last_activity: Mutex::new(Instant::now()),
            accumulated_cost: Mutex::new(0.0),
            queue: Mutex::new(JobQueue {
                jobs: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Record traffic for this session
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the session last saw traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Total cost reported across the session's lifetime
    pub fn accumulated_cost(&self) -> f64 {
        *self.accumulated_cost.lock()
    }

    /// Add a successful invocation's cost to the running total
    pub fn add_cost(&self, cost: f64) {
        if cost > 0.0 {
            *self.accumulated_cost.lock() += cost;
        }
    }

    /// Queued plus in-flight jobs for this session right now
    pub fn pending(&self) -> usize {
        let queue = self.queue.lock();
        queue.jobs.len() + queue.draining as usize
    }

    /// Push a message onto the job queue in arrival order. `cap`
    /// bounds queued plus in-flight jobs; at the cap the message is
    /// rejected without queueing.
    pub fn enqueue(&self, prompt: String, cap: usize) -> Enqueue {
        let mut queue = self.queue.lock();
        if queue.jobs.len() + queue.draining as usize >= cap {
            return Enqueue::Rejected;
        }
        queue.jobs.push_back(prompt);
        if queue.draining {
            Enqueue::Queued
        } else {
            queue.draining = true;
            Enqueue::Start
        }
    }

    /// Pop the next job for this session's drainer. `None` means the
    /// queue is empty and the drainer role has been released; the next
    /// `enqueue` starts a fresh drainer.
    pub fn next_job(&self) -> Option<String> {
        let mut queue = self.queue.lock();
        match queue.jobs.pop_front() {
            Some(job) => Some(job),
            None => {
                queue.draining = false;
                None
            }
        }
    }
}

/// Process-wide table of live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConversationKey, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the session for `key`, creating it atomically if absent.
    /// Concurrent resolution of the same key yields the same session.
    pub fn resolve(&self, key: ConversationKey) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(&key) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(key)
            .or_insert_with(|| {
                debug!(%key, "creating session");
                Arc::new(Session::new(key))
            });
        Arc::clone(session)
    }

    /// Remove sessions idle past `ttl`. A session with queued or
    /// in-flight jobs is never evicted. Returns the count removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|key, session| {
            let keep = session.idle_for() < ttl || session.pending() > 0;
            if !keep {
                debug!(%key, cost = session.accumulated_cost(), "evicting idle session");
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "idle session sweep");
        }
        evicted
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
