//! Scatter-gather dispatch crate.
//!
//! This crate provides the asynchronous fan-out dispatcher used by the
//! ScribeDB routing tier. The API surface is intentionally small: higher
//! layers supply a `TaskExecutor` and a `ShardRegistry`, then drive a
//! fan-out through `ScatterGather`.

pub mod scatter;
