//! Process entrypoint and the one piece the core crate deliberately leaves
//! out: a concrete `ChatAdapter`. `NullAdapter` logs through `tracing`
//! instead of speaking a real wire protocol, which keeps this crate usable
//! for local smoke-running and tests without a chat platform credential.

pub mod adapter;
pub mod app;
pub mod config;
pub mod executor;
pub mod research_applier;

pub use adapter::NullAdapter;
pub use app::run;
pub use config::Config;
