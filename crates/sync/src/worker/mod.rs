//! Adaptive worker pool
//!
//! This module provides:
//! - [`WorkerPool`] - Bounded buffer drained in batches by a dynamic set of workers
//! - [`WorkerPoolConfig`] - Buffer, batch and boost configuration
//! - [`BoostState`] - Worker accounting and adaptive block timeout
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │                                                              │
//! │  push ──► try_send ──full──► race(send, block_timeout)       │
//! │                                    │                         │
//! │                              timer wins                      │
//! │                                    ▼                         │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                   BoostState                         │    │
//! │  │  (worker cap, doubling / halving block timeout)      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │ spawn boost workers (child token, boost_timeout)   │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │       async_channel buffer (queue_length)            │    │
//! │  │  [base worker] [boost 1] [boost 2] ... [boost N]     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │ batches of up to batch_length                      │
//! │         ▼                                                    │
//! │     handler(Vec<T>)                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod boost;
mod pool;

pub use boost::{BoostDecision, BoostPhase, BoostState};
pub use pool::{BatchHandler, PoolError, WorkerPool, WorkerPoolConfig};
