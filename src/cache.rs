//! Shared coordination cache used for breaker and replay-nonce state.
//!
//! Everything that must be consistent across dispatcher processes goes through
//! this trait. Implementations must make `incr` and `set_nx_ex` atomic with
//! respect to other clients of the same backing store.

use std::time::Duration;

use anyhow::{Error, Result};
use futures_util::future::BoxFuture;

pub trait CoordinationCache: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, Error>>;

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), Error>>;

    /// Sets `key` only when it does not exist yet, expiring after `ttl`.
    /// Returns whether this caller won the write.
    fn set_nx_ex<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Atomically increments an integer counter, creating it at zero.
    fn incr<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<i64, Error>>;

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<(), Error>>;

    fn ping(&self) -> BoxFuture<'_, Result<(), Error>>;
}
