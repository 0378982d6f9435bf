//! Utilities for bridging to `hyper` traits from tokio.

/// Bridge [hyper] and [tokio] I/O traits
pub mod io;

/// Provide runtime interfaces from [tokio] to [hyper]
pub mod rt;
