//! Steadfast
//!
//! A pooling HTTP client engine for networks that misbehave. Proxies die
//! mid-stream and servers stall after accepting a connection; the engine
//! retries around both and keeps upgraded connections alive past the request
//! which created them.
//!
//! The engine is organised around three nested lifetimes, each with its own
//! [`CancelToken`]:
//!
//! - a [pool](client::pool) per destination, proxy chain and protocol class,
//! - a connection, owned by exactly one worker task inside the pool,
//! - a task (one attempt of one request) and the body it produces.
//!
//! Requests enter through [`Client`], which retries attempts according to
//! [`client::RequestOptions`] and the client-wide [`client::Config`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod body;
pub use body::Body;
pub mod bridge;
pub mod cancel;
pub use cancel::{CancelToken, Cause};
pub mod client;
pub use client::{Client, Error};
pub mod socks;

/// A boxed error, used at the boundaries where collaborators plug in.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
