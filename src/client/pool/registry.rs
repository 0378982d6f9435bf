use std::sync::Arc;

use dashmap::DashMap;

use super::{Pool, PoolConfig, PoolKey};
use crate::cancel::CancelToken;
use crate::client::Error;

pub(super) type Map = DashMap<PoolKey, Arc<Pool>>;

/// Maps pool keys to live pools.
///
/// Each client owns its own registry, so independent clients never share
/// connections. Pools remove themselves when they close.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Map>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live pool for `key`, if there is one.
    pub fn get(&self, key: &PoolKey) -> Option<Arc<Pool>> {
        self.inner
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|pool| !pool.is_closed())
    }

    /// Find the pool for `key`, creating it if there is none or the existing
    /// one has closed.
    pub(crate) fn get_or_create(
        &self,
        key: &PoolKey,
        parent: &CancelToken,
        config: &PoolConfig,
    ) -> Arc<Pool> {
        let mut entry = self
            .inner
            .entry(key.clone())
            .or_insert_with(|| Pool::new(key.clone(), parent, config, Arc::downgrade(&self.inner)));

        if entry.is_closed() {
            tracing::trace!(pool.key = %key, "replacing closed pool");
            *entry = Pool::new(key.clone(), parent, config, Arc::downgrade(&self.inner));
        }

        entry.value().clone()
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether there are no registered pools.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Keys of every registered pool.
    pub fn keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<_> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Close every pool with `cause`.
    pub fn close_all(&self, cause: Error) {
        let pools: Vec<_> = self.inner.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            pool.close(cause.clone());
        }
    }
}

/// Remove `pool` from `map`, but only if it is still the registered pool for its key.
pub(super) fn deregister(map: &Map, pool: &Pool) {
    let removed = map.remove_if(pool.key(), |_, registered| {
        std::ptr::eq(Arc::as_ptr(registered), pool)
    });
    if removed.is_some() {
        tracing::trace!(pool.key = %pool.key(), "pool deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::pool::ProtocolClass;
    use crate::client::request::Target;

    fn key(url: &str) -> PoolKey {
        PoolKey::new(&Target::parse(url).unwrap(), &[], ProtocolClass::Auto)
    }

    #[tokio::test]
    async fn find_or_create() {
        let registry = Registry::new();
        let root = CancelToken::new();
        let config = PoolConfig::default();

        let a = registry.get_or_create(&key("http://a.test"), &root, &config);
        let again = registry.get_or_create(&key("http://a.test"), &root, &config);
        let b = registry.get_or_create(&key("http://b.test"), &root, &config);

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.keys(),
            vec![key("http://a.test"), key("http://b.test")]
        );
    }

    #[tokio::test]
    async fn closed_pools_leave() {
        let registry = Registry::new();
        let root = CancelToken::new();
        let config = PoolConfig::default();
        let k = key("http://a.test");

        let pool = registry.get_or_create(&k, &root, &config);
        pool.close(Error::ConnectionClosed);
        assert!(registry.get(&k).is_none());
        assert!(registry.is_empty());

        let fresh = registry.get_or_create(&k, &root, &config);
        assert!(!Arc::ptr_eq(&pool, &fresh));

        // A stale pool closing must not evict its replacement.
        pool.close(Error::ConnectionClosed);
        assert!(registry.get(&k).is_some());
    }

    #[tokio::test]
    async fn close_all() {
        let registry = Registry::new();
        let root = CancelToken::new();
        let config = PoolConfig::default();

        let a = registry.get_or_create(&key("http://a.test"), &root, &config);
        let b = registry.get_or_create(&key("http://b.test"), &root, &config);
        registry.close_all(Error::ClientClosed);

        assert!(a.is_closed() && b.is_closed());
        assert!(registry.is_empty());
    }
}
