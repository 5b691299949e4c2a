//! Scatter module wiring.
//!
//! `sender` contains the dispatcher, `slot` holds the per-remote state
//! records, and `types`/`error` define the shared request/response shapes and
//! the trait contracts (executor, targeter) the dispatcher coordinates.

mod error;
mod executor;
mod registry;
mod retry;
mod sender;
mod slot;
mod types;

pub use error::{command_result_status, ErrorCode, Status};
pub use executor::{
    CallbackHandle, NetworkLink, RemoteCommandCallback, TaskExecutor, TokioExecutor,
};
pub use registry::{ReplicaSetTargeter, Shard, ShardRegistry, ShardTargeter};
pub use retry::RetryPolicy;
pub use sender::ScatterGather;
pub use types::{
    Document, HostAndPort, OperationContext, ReadMode, ReadPreference, RemoteCommandRequest,
    Request, Response, ShardId, MAX_HOST_RETRY_ATTEMPTS, TARGET_RESOLUTION_TIMEOUT,
};
