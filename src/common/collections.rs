//! Hash collections used throughout the crate.
//!
//! Keys are small ids and tokens, so the non-cryptographic FxHash is a better
//! fit than SipHash.

pub type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type FxHashSet<T> = rustc_hash::FxHashSet<T>;
