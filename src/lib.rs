//! Claude QQ Bridge
//!
//! Relays QQ chat messages to the Claude Code CLI and routes the
//! replies back, one serialized conversation session per chat scope.
//!
//! # Architecture
//!
//! ```text
//! NapCat (OneBot v11) ──► GatewayLink ──► Supervisor ──► classify
//!        ▲                                   │
//!        │                                   ├── SessionRegistry
//!        │                                   ├── AssistantInvoker ──► claude CLI
//!        └────────────── dispatch ◄──────────┘
//! ```
//!
//! The supervisor ingests events from the gateway WebSocket, resolves
//! a session per conversation, and enqueues each admitted reply in
//! arrival order; one drainer task per session works the queue off
//! FIFO. Invocations are capped globally and always bounded by a
//! timeout.

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod invoker;
pub mod onebot;
pub mod session;
pub mod supervisor;

pub use classifier::{classify, Intent};
pub use config::Config;
pub use dispatcher::dispatch;
pub use error::GatewayError;
pub use gateway::{Backoff, GatewayLink};
pub use invoker::{AssistantInvoker, ClaudeCli, Engine, EngineReply, InvocationOutcome};
pub use onebot::{ConversationKey, InboundEvent, OutboundAction};
pub use session::{Enqueue, Session, SessionRegistry};
pub use supervisor::Supervisor;
