//! relay-core: chat-driven agent relay.
//!
//! Provides the durable state store, per-conversation serialization queue,
//! live progress reporting, agent process invocation, upload/attachment
//! bridge, inline action extraction, background job management, the task
//! runner, the plan subsystem, and the research manager. The chat platform
//! itself is out of scope here; `chat::ChatAdapter` is the trait boundary
//! a concrete bot crate implements.

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod actions;
pub mod agent_invoker;
pub mod chat;
pub mod dispatcher;
pub mod error;
pub mod git_manager;
pub mod jobs;
pub mod model;
pub mod plans;
pub mod progress;
pub mod queue;
pub mod research;
pub mod state;
pub mod tasks;
pub mod types;
pub mod upload;

pub use actions::{extract_relay_actions, ActionError, RelayAction};
pub use agent_invoker::{ActiveChildRegistry, AgentInvoker, AgentProvider, InvokeOutcome, InvokeRequest};
pub use chat::{Attachment, ChannelRef, ChatAdapter, InboundMessage};
pub use dispatcher::{parse_command, Command};
pub use error::{RelayError, RelayResult};
pub use git_manager::GitManager;
pub use jobs::JobManager;
pub use model::{CircuitBreaker, CircuitState, ModelTier};
pub use plans::{parse_plan_task_breakdown_steps, PlanRecord};
pub use progress::{EditablePendingMessage, ProgressReporter, ProgressReporterConfig};
pub use queue::ConversationQueue;
pub use state::StateStore;
pub use tasks::{TaskExecutor, TaskOutcome, TaskRunner, TaskRunnerConfig};
pub use types::{ConversationKey, Job, JobStatus, Plan, Session, Task, TaskStatus};
pub use upload::{IncomingAttachment, IncomingUploadConfig, OutgoingUploadError, TruncateMode};
