//! Item-oriented collaborator contracts: reader, processor, writer and the chunk
//! they exchange.
//!
//! Readers and writers are *streams*: besides their main operation they get
//! `open` (restore state from the step context), `update` (save state before
//! each commit) and `close`. All three default to no-ops, so a stateless
//! collaborator only implements `read`/`write`.

use batchline_core::ExecutionContext;

/// Ordered items handled in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    items: Vec<T>,
}

impl<T> Chunk<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for Chunk<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<T>> for Chunk<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<'a, T> IntoIterator for &'a Chunk<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Source of items. `Ok(None)` signals end of data.
pub trait ItemReader<T>: Send {
    fn read(&mut self) -> anyhow::Result<Option<T>>;

    /// Restore position from the step context (called once before the first read).
    fn open(&mut self, _context: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Save position into the step context; runs inside each chunk transaction.
    fn update(&mut self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T, F> ItemReader<T> for F
where
    F: FnMut() -> anyhow::Result<Option<T>> + Send,
{
    fn read(&mut self) -> anyhow::Result<Option<T>> {
        self()
    }
}

/// Transforms one item. `Ok(None)` filters the item out of the chunk.
pub trait ItemProcessor<I, O>: Send {
    fn process(&mut self, item: &I) -> anyhow::Result<Option<O>>;
}

impl<I, O, F> ItemProcessor<I, O> for F
where
    F: FnMut(&I) -> anyhow::Result<Option<O>> + Send,
{
    fn process(&mut self, item: &I) -> anyhow::Result<Option<O>> {
        self(item)
    }
}

/// Identity processor for steps without a transformation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughProcessor;

impl<T: Clone> ItemProcessor<T, T> for PassThroughProcessor {
    fn process(&mut self, item: &T) -> anyhow::Result<Option<T>> {
        Ok(Some(item.clone()))
    }
}

/// Sink receiving one whole chunk per call.
pub trait ItemWriter<O>: Send {
    fn write(&mut self, chunk: &Chunk<O>) -> anyhow::Result<()>;

    fn open(&mut self, _context: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<O, F> ItemWriter<O> for F
where
    F: FnMut(&Chunk<O>) -> anyhow::Result<()> + Send,
{
    fn write(&mut self, chunk: &Chunk<O>) -> anyhow::Result<()> {
        self(chunk)
    }
}
