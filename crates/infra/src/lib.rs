//! Infrastructure layer: metadata repository and transaction boundaries.

pub mod repository;
pub mod transaction;

pub use repository::{InMemoryJobRepository, JobRepository, LaunchRules, RepositoryError};
pub use transaction::{
    ResourcelessTransactionManager, Transaction, TransactionError, TransactionManager, TransactionStats,
};
