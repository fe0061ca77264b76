//! Ready-made collaborators: a restartable in-memory reader and a writer whose
//! output only becomes visible when the chunk transaction commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use batchline_core::ExecutionContext;
use batchline_infra::{ResourcelessTransactionManager, Transaction, TransactionError, TransactionManager};

use crate::item::{Chunk, ItemReader, ItemWriter};

/// Reads items from a `Vec`, saving its position in the step context so a
/// restarted step resumes after the last committed chunk.
#[derive(Debug, Clone)]
pub struct ListItemReader<T> {
    items: Vec<T>,
    position: usize,
    key: String,
}

impl<T> ListItemReader<T> {
    pub const DEFAULT_KEY: &'static str = "list.reader.position";

    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            position: 0,
            key: Self::DEFAULT_KEY.to_string(),
        }
    }

    /// Use a different context key, e.g. when two readers share a step.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl<T: Clone + Send> ItemReader<T> for ListItemReader<T> {
    fn read(&mut self) -> anyhow::Result<Option<T>> {
        let item = self.items.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        Ok(item)
    }

    fn open(&mut self, context: &ExecutionContext) -> anyhow::Result<()> {
        if let Some(position) = context.get_long(&self.key) {
            let position = usize::try_from(position)
                .map_err(|_| anyhow::anyhow!("invalid reader position {position} under '{}'", self.key))?;
            anyhow::ensure!(
                position <= self.items.len(),
                "saved position {position} is past the end of {} items",
                self.items.len()
            );
            self.position = position;
        }
        Ok(())
    }

    fn update(&mut self, context: &mut ExecutionContext) -> anyhow::Result<()> {
        context.put_long(self.key.clone(), i64::try_from(self.position)?);
        Ok(())
    }
}

#[derive(Debug)]
struct Buffers<T> {
    committed: Vec<Vec<T>>,
    staged: HashMap<u64, Vec<Vec<T>>>,
    current: Option<u64>,
}

/// Item sink bound to the transaction manager it also implements: chunks
/// written inside a transaction are published on commit and dropped on
/// rollback.
///
/// Pass a clone to [`crate::step::StepBuilder::transaction_manager`] and use
/// [`TransactionalList::writer`] as the step's writer.
pub struct TransactionalList<T> {
    inner: Arc<Mutex<Buffers<T>>>,
    transactions: Arc<ResourcelessTransactionManager>,
}

impl<T> Clone for TransactionalList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            transactions: Arc::clone(&self.transactions),
        }
    }
}

impl<T> Default for TransactionalList<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffers {
                committed: Vec::new(),
                staged: HashMap::new(),
                current: None,
            })),
            transactions: Arc::new(ResourcelessTransactionManager::new()),
        }
    }
}

impl<T: Clone> TransactionalList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> TransactionalListWriter<T> {
        TransactionalListWriter { list: self.clone() }
    }

    /// Committed items in write order.
    pub fn committed_items(&self) -> Vec<T> {
        self.lock().committed.iter().flatten().cloned().collect()
    }

    /// Committed chunks, one entry per successful write call.
    pub fn committed_chunks(&self) -> Vec<Vec<T>> {
        self.lock().committed.clone()
    }
}

impl<T> TransactionalList<T> {
    fn lock(&self) -> MutexGuard<'_, Buffers<T>> {
        // A panic while holding the lock leaves the buffers consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stage(&self, items: Vec<T>) -> anyhow::Result<()> {
        let mut buffers = self.lock();
        let id = buffers
            .current
            .ok_or_else(|| anyhow::anyhow!("write outside of a transaction"))?;
        buffers.staged.entry(id).or_default().push(items);
        Ok(())
    }
}

impl<T: Send> TransactionManager for TransactionalList<T> {
    fn begin(&self) -> Result<Transaction, TransactionError> {
        let transaction = self.transactions.begin()?;
        self.lock().current = Some(transaction.id());
        Ok(transaction)
    }

    fn commit(&self, transaction: Transaction) -> Result<(), TransactionError> {
        let id = transaction.id();
        self.transactions.commit(transaction)?;
        let mut buffers = self.lock();
        let staged = buffers.staged.remove(&id).unwrap_or_default();
        buffers.committed.extend(staged);
        if buffers.current == Some(id) {
            buffers.current = None;
        }
        Ok(())
    }

    fn rollback(&self, transaction: Transaction) -> Result<(), TransactionError> {
        let id = transaction.id();
        self.transactions.rollback(transaction)?;
        let mut buffers = self.lock();
        buffers.staged.remove(&id);
        if buffers.current == Some(id) {
            buffers.current = None;
        }
        Ok(())
    }
}

/// Writer half of a [`TransactionalList`].
pub struct TransactionalListWriter<T> {
    list: TransactionalList<T>,
}

impl<T: Clone + Send> ItemWriter<T> for TransactionalListWriter<T> {
    fn write(&mut self, chunk: &Chunk<T>) -> anyhow::Result<()> {
        self.list.stage(chunk.items().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_reader_resumes_from_saved_position() {
        let mut reader = ListItemReader::new(vec![1, 2, 3, 4]);
        reader.open(&ExecutionContext::new()).unwrap();
        assert_eq!(reader.read().unwrap(), Some(1));
        assert_eq!(reader.read().unwrap(), Some(2));

        let mut context = ExecutionContext::new();
        reader.update(&mut context).unwrap();
        assert_eq!(context.get_long(ListItemReader::<i32>::DEFAULT_KEY), Some(2));

        let mut restarted = ListItemReader::new(vec![1, 2, 3, 4]);
        restarted.open(&context).unwrap();
        assert_eq!(restarted.read().unwrap(), Some(3));
        assert_eq!(restarted.read().unwrap(), Some(4));
        assert_eq!(restarted.read().unwrap(), None);
    }

    #[test]
    fn list_reader_rejects_position_past_end() {
        let mut context = ExecutionContext::new();
        context.put_long("pos", 9);
        let mut reader = ListItemReader::new(vec!['a']).with_key("pos");
        assert!(reader.open(&context).is_err());
    }

    #[test]
    fn only_committed_chunks_are_visible() {
        let list = TransactionalList::new();
        let mut writer = list.writer();

        let tx = list.begin().unwrap();
        writer.write(&Chunk::from(vec![1, 2])).unwrap();
        assert!(list.committed_items().is_empty());
        list.commit(tx).unwrap();

        let tx = list.begin().unwrap();
        writer.write(&Chunk::from(vec![3])).unwrap();
        list.rollback(tx).unwrap();

        assert_eq!(list.committed_chunks(), vec![vec![1, 2]]);
    }

    #[test]
    fn write_without_transaction_fails() {
        let list = TransactionalList::<i32>::new();
        assert!(list.writer().write(&Chunk::from(vec![1])).is_err());
    }
}
