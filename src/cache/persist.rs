use anyhow::Result;

/// Spill storage for evicted cache entries.
///
/// Errors never reach cache users: a failed `store` loses the entry and a
/// failed `load` is a miss.
pub trait Persistor<K, V>: Send + Sync {
    fn load(&self, key: &K) -> Result<Option<V>>;
    fn store(&self, key: &K, value: &V) -> Result<()>;
}

pub struct NoPersistence;

impl<K, V> Persistor<K, V> for NoPersistence {
    fn load(&self, _key: &K) -> Result<Option<V>> {
        Ok(None)
    }

    fn store(&self, _key: &K, _value: &V) -> Result<()> {
        Ok(())
    }
}

/// A `(load, store)` pair of closures
impl<K, V, L, S> Persistor<K, V> for (L, S)
where
    L: Fn(&K) -> Result<Option<V>> + Send + Sync,
    S: Fn(&K, &V) -> Result<()> + Send + Sync,
{
    fn load(&self, key: &K) -> Result<Option<V>> {
        (self.0)(key)
    }

    fn store(&self, key: &K, value: &V) -> Result<()> {
        (self.1)(key, value)
    }
}
