use std::fmt;
use std::sync::Arc;

use crate::client::conn::Proxy;
use crate::client::request::Target;

/// How the protocol for a connection is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtocolClass {
    /// Let the dialer pick.
    #[default]
    Auto,

    /// Force HTTP/1.1.
    Http1,

    /// HTTP/2 with prior knowledge.
    Http2,

    /// HTTP/3.
    Http3,
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolClass::Auto => "auto",
            ProtocolClass::Http1 => "http1",
            ProtocolClass::Http2 => "http2",
            ProtocolClass::Http3 => "http3",
        };
        f.write_str(name)
    }
}

/// Pool key which identifies the connections a request may share: the
/// protocol class, the proxy chain, and the destination.
///
/// Two requests with the same key may share a connection; two with different
/// keys never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(Arc<str>);

impl PoolKey {
    /// Build the key for a destination reached through `proxies`.
    pub fn new(target: &Target, proxies: &[Proxy], protocol: ProtocolClass) -> Self {
        let mut key = protocol.to_string();
        for proxy in proxies {
            key.push('|');
            key.push_str(&proxy.key());
        }
        key.push('|');
        key.push_str(&target.to_string());
        Self(key.into())
    }

    /// The key of a connection which is not part of any pool.
    pub fn detached() -> Self {
        Self(Arc::from("detached"))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
