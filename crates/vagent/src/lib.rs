//! vagent: host/guest RPC agent.
//!
//! Two interleaved request/response flows share one byte stream. The
//! [`JobManager`] tracks both as explicit state machines, the [`Channel`]
//! schedules them onto the stream without doing I/O itself, and
//! [`driver::run`] pumps a channel over a real stream on one tokio task.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod driver;
pub mod manager;
pub mod methods;
pub mod server;
#[cfg(unix)]
pub mod transport;
mod version;

pub use channel::{Channel, ChannelConfig, Event, Output};
pub use client::{AgentHandle, CallError, CallResult, Callback, ClientCall};
pub use codec::{Fault, JsonRpcCodec, PayloadCodec, Reply, RpcCall};
pub use config::{AgentConfig, ChannelMethod, ConfigError, Role};
pub use driver::ChannelError;
pub use manager::{CancelReason, JobError, JobManager, ManagerLimits, QueueKind};
pub use methods::{DeferredMethod, Method, MethodTable};
pub use server::ServerRequest;
pub use version::{VAGENT_VERSION, VersionInfo};
