//! Keys that can address both the in-memory maps and the backing table.

use std::fmt;
use std::hash::Hash;

/// A key of a [`Store`](crate::Store).
///
/// In-memory lookups only rely on [`Eq`] and [`Hash`]. The backing table however is addressed by
/// the textual [`persist_key`](Self::persist_key), which therefore has to be stable across
/// processes and must not collide for keys that compare unequal.
pub trait StoreKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The key under which the value is persisted.
    fn persist_key(&self) -> String;
}

impl StoreKey for String {
    fn persist_key(&self) -> String {
        self.clone()
    }
}

impl StoreKey for &'static str {
    fn persist_key(&self) -> String {
        (*self).to_owned()
    }
}

macro_rules! impl_integer_key {
    ($($ty:ty),*) => {
        $(
            impl StoreKey for $ty {
                fn persist_key(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_integer_key!(u32, u64, i32, i64, usize);

/// Composite keys, such as a channel and a timestamp, are persisted as `a/b`.
impl<A: StoreKey, B: StoreKey> StoreKey for (A, B) {
    fn persist_key(&self) -> String {
        format!("{}/{}", self.0.persist_key(), self.1.persist_key())
    }
}
