//! Transaction boundary used around each chunk and tasklet increment.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Handle to one open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: u64,
    started_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Transaction error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {0} is not active")]
    NotActive(u64),
    #[error("transaction failed: {0}")]
    Failed(String),
}

/// Begin/commit/rollback around one unit of work.
///
/// A step execution holds at most one open transaction at a time; concurrent
/// runs sharing a manager each hold their own.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Transaction, TransactionError>;

    fn commit(&self, transaction: Transaction) -> Result<(), TransactionError>;

    fn rollback(&self, transaction: Transaction) -> Result<(), TransactionError>;
}

impl<T: TransactionManager + ?Sized> TransactionManager for std::sync::Arc<T> {
    fn begin(&self) -> Result<Transaction, TransactionError> {
        (**self).begin()
    }

    fn commit(&self, transaction: Transaction) -> Result<(), TransactionError> {
        (**self).commit(transaction)
    }

    fn rollback(&self, transaction: Transaction) -> Result<(), TransactionError> {
        (**self).rollback(transaction)
    }
}

/// Counters kept by [`ResourcelessTransactionManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

/// Transaction manager with no backing resource.
///
/// Tracks open transactions and counts outcomes; for collaborators that
/// manage durability on their own.
#[derive(Debug, Default)]
pub struct ResourcelessTransactionManager {
    next_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl ResourcelessTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.next_id.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            rolled_back: self.rolled_back.load(Ordering::SeqCst),
        }
    }

    fn finish(&self, transaction: &Transaction) -> Result<(), TransactionError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| TransactionError::Failed("transaction lock poisoned".to_string()))?;
        if active.remove(&transaction.id()) {
            Ok(())
        } else {
            Err(TransactionError::NotActive(transaction.id()))
        }
    }

    /// Number of transactions currently open.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or_default()
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> Result<Transaction, TransactionError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| TransactionError::Failed("transaction lock poisoned".to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        active.insert(id);
        Ok(Transaction::new(id))
    }

    fn commit(&self, transaction: Transaction) -> Result<(), TransactionError> {
        self.finish(&transaction)?;
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self, transaction: Transaction) -> Result<(), TransactionError> {
        self.finish(&transaction)?;
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
