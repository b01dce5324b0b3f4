//! Token pools: bounded admission control for the learning queues.
//!
//! A [`TokenPool`] hands out at most `capacity` [`Token`]s. Each token is a
//! move-only lease; dropping it returns the unit to the pool. When the
//! returned unit brings the pool back up to its low-water mark the pool's
//! wakeup is broadcast so every paused partition re-checks its gate.
//!
//! Counters are plain atomics shared by all partitions.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Percentage of capacity at which a paused queue is woken again.
pub const LOW_WATER_PERCENT: usize = 10;

/// Which queue a pool admits work for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPoolKind {
    Add,
    Resync,
    Delete,
}

impl fmt::Display for TokenPoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenPoolKind::Add => write!(f, "add"),
            TokenPoolKind::Resync => write!(f, "resync"),
            TokenPoolKind::Delete => write!(f, "delete"),
        }
    }
}

/// A bounded counting pool.
pub struct TokenPool {
    kind: TokenPoolKind,
    capacity: usize,
    low_water: usize,
    available: AtomicUsize,
    failures: AtomicU64,
    wakeup: Arc<Notify>,
}

impl fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl TokenPool {
    pub fn new(kind: TokenPoolKind, capacity: usize, wakeup: Arc<Notify>) -> Arc<Self> {
        let low_water = (capacity * LOW_WATER_PERCENT / 100).max(1);
        Arc::new(Self {
            kind,
            capacity,
            low_water,
            available: AtomicUsize::new(capacity),
            failures: AtomicU64::new(0),
            wakeup,
        })
    }

    pub fn kind(&self) -> TokenPoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Number of tokens currently leased out.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.available()
    }

    /// Number of times a queue found this pool empty.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// The notifier broadcast when the pool climbs back to its low-water mark.
    pub fn wakeup(&self) -> &Arc<Notify> {
        &self.wakeup
    }

    /// Returns true if a token is available. An empty pool counts a failure.
    pub fn can_proceed(&self) -> bool {
        if self.available() > 0 {
            return true;
        }
        self.failures.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Leases one token, or returns `None` if the pool is empty. The counter
    /// never goes below zero even with several partitions racing.
    pub fn acquire(self: &Arc<Self>) -> Option<Token> {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|_| Token {
                pool: Arc::clone(self),
            })
    }

    fn release(&self) {
        let now = self.available.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(now <= self.capacity, "{} pool over-released", self.kind);
        if now == self.low_water {
            tracing::debug!(
                pool = %self.kind,
                available = now,
                "Token pool back at low-water mark"
            );
            self.wakeup.notify_waiters();
        }
    }

    pub fn stats(&self) -> TokenPoolStats {
        TokenPoolStats {
            kind: self.kind,
            capacity: self.capacity,
            available: self.available(),
            failures: self.failures(),
        }
    }
}

/// A leased unit of a [`TokenPool`]. Not `Clone`: it is released exactly
/// once, when dropped.
pub struct Token {
    pool: Arc<TokenPool>,
}

impl Token {
    pub fn kind(&self) -> TokenPoolKind {
        self.pool.kind
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.pool.kind)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenPoolStats {
    pub kind: TokenPoolKind,
    pub capacity: usize,
    pub available: usize,
    pub failures: u64,
}

/// The three pools shared by every partition.
#[derive(Debug, Clone)]
pub struct TokenPools {
    pub add: Arc<TokenPool>,
    pub resync: Arc<TokenPool>,
    pub delete: Arc<TokenPool>,
}

impl TokenPools {
    pub fn new(add: usize, resync: usize, delete: usize) -> Self {
        Self {
            add: TokenPool::new(TokenPoolKind::Add, add, Arc::new(Notify::new())),
            resync: TokenPool::new(TokenPoolKind::Resync, resync, Arc::new(Notify::new())),
            delete: TokenPool::new(TokenPoolKind::Delete, delete, Arc::new(Notify::new())),
        }
    }

    pub fn get(&self, kind: TokenPoolKind) -> &Arc<TokenPool> {
        match kind {
            TokenPoolKind::Add => &self.add,
            TokenPoolKind::Resync => &self.resync,
            TokenPoolKind::Delete => &self.delete,
        }
    }

    pub fn stats(&self) -> Vec<TokenPoolStats> {
        vec![self.add.stats(), self.resync.stats(), self.delete.stats()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(capacity: usize) -> Arc<TokenPool> {
        TokenPool::new(TokenPoolKind::Add, capacity, Arc::new(Notify::new()))
    }

    #[test]
    fn test_acquire_and_release() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 2);
        assert!(pool.acquire().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_can_proceed_counts_failures() {
        let pool = pool(1);
        assert!(pool.can_proceed());
        let token = pool.acquire().unwrap();
        assert!(!pool.can_proceed());
        assert!(!pool.can_proceed());
        assert_eq!(pool.failures(), 2);
        drop(token);
        assert!(pool.can_proceed());
        assert_eq!(pool.failures(), 2);
    }

    #[test]
    fn test_low_water_mark() {
        assert_eq!(pool(1000).low_water(), 100);
        assert_eq!(pool(5).low_water(), 1);
    }

    #[tokio::test]
    async fn test_release_at_low_water_wakes_waiters() {
        let pool = pool(10);
        let tokens: Vec<Token> = (0..10).map(|_| pool.acquire().unwrap()).collect();
        let notified = pool.wakeup().notified();
        tokio::pin!(notified);
        // Registers the waiter before the release.
        notified.as_mut().enable();

        let mut tokens = tokens;
        tokens.pop();
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("low-water release should wake waiters");
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_tokens_can_move_between_holders() {
        let pool = pool(3);
        let mut first: Vec<Token> = vec![pool.acquire().unwrap(), pool.acquire().unwrap()];
        let mut second: Vec<Token> = Vec::new();
        second.append(&mut first);
        assert_eq!(pool.outstanding(), 2);
        drop(first);
        assert_eq!(pool.outstanding(), 2);
        second.clear();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_capacity() {
        let pool = pool(64);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..32 {
                        if let Some(t) = pool.acquire() {
                            held.push(t);
                        }
                    }
                    held
                })
            })
            .collect();
        let held: Vec<Vec<Token>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(held.iter().map(Vec::len).sum::<usize>(), 64);
        assert_eq!(pool.available(), 0);
        drop(held);
        assert_eq!(pool.available(), 64);
    }
}
