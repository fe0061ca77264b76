//! Chunk-oriented processing: read up to N items, process them, write the
//! chunk, commit. Repeat until the reader runs dry.

use tracing::{debug, warn};

use batchline_core::BatchStatus;

use crate::error::StepError;
use crate::item::{Chunk, ItemProcessor, ItemReader, ItemWriter};
use crate::listener::{ChunkListeners, ItemListeners};
use crate::step::StepRun;
use crate::tasklet::StepContribution;

/// Read/process/write loop for one step execution.
pub struct ChunkProcessor<I, O> {
    reader: Box<dyn ItemReader<I>>,
    processor: Box<dyn ItemProcessor<I, O>>,
    writer: Box<dyn ItemWriter<O>>,
    chunk_size: usize,
}

impl<I, O> ChunkProcessor<I, O> {
    /// `chunk_size` is clamped to at least 1.
    pub fn new(
        reader: Box<dyn ItemReader<I>>,
        processor: Box<dyn ItemProcessor<I, O>>,
        writer: Box<dyn ItemWriter<O>>,
        chunk_size: usize,
    ) -> Self {
        Self {
            reader,
            processor,
            writer,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Open the streams, run chunks until end of data or stop, close the streams.
    pub fn run(
        &mut self,
        run: &mut StepRun<'_>,
        listeners: &ItemListeners<I, O>,
        chunk_listeners: &ChunkListeners,
    ) -> Result<BatchStatus, StepError> {
        self.reader
            .open(run.step_context())
            .map_err(|e| StepError::collaborator("open reader", e))?;
        if let Err(error) = self.writer.open(run.step_context()) {
            if let Err(close_error) = self.reader.close() {
                warn!(error = %format!("{close_error:#}"), "reader close failed");
            }
            return Err(StepError::collaborator("open writer", error));
        }

        let result = self.chunk_loop(run, listeners, chunk_listeners);
        let closed = self.close();

        match (result, closed) {
            (Ok(status), Ok(())) => Ok(status),
            (Ok(_), Err(close_error)) => Err(close_error),
            (Err(error), closed) => {
                if let Err(close_error) = closed {
                    warn!(error = %close_error, "stream close failed after step error");
                }
                Err(error)
            }
        }
    }

    fn close(&mut self) -> Result<(), StepError> {
        let reader = self.reader.close();
        let writer = self.writer.close();
        reader.map_err(|e| StepError::collaborator("close reader", e))?;
        writer.map_err(|e| StepError::collaborator("close writer", e))
    }

    fn chunk_loop(
        &mut self,
        run: &mut StepRun<'_>,
        listeners: &ItemListeners<I, O>,
        chunk_listeners: &ChunkListeners,
    ) -> Result<BatchStatus, StepError> {
        let mut chunk_number: u64 = 0;
        loop {
            if run.stop_requested()? {
                return Ok(BatchStatus::Stopped);
            }
            chunk_number += 1;

            let end_of_data = run.in_transaction(chunk_listeners, |run, contribution| {
                self.process_chunk(run, listeners, contribution)
            })?;

            debug!(
                step = %run.step_name(),
                chunk = chunk_number,
                read = run.step_execution().read_count,
                written = run.step_execution().write_count,
                filtered = run.step_execution().filter_count,
                "chunk committed"
            );

            if end_of_data {
                return Ok(BatchStatus::Completed);
            }
        }
    }

    /// Body of one transaction. Returns whether the reader reached end of data.
    fn process_chunk(
        &mut self,
        run: &mut StepRun<'_>,
        listeners: &ItemListeners<I, O>,
        contribution: &mut StepContribution,
    ) -> Result<bool, StepError> {
        let mut items = Vec::with_capacity(self.chunk_size);
        let mut end_of_data = false;

        while items.len() < self.chunk_size {
            listeners
                .before_read()
                .map_err(|e| StepError::listener("before_read", e))?;
            match self.reader.read() {
                Ok(Some(item)) => {
                    listeners
                        .after_read(&item)
                        .map_err(|e| StepError::listener("after_read", e))?;
                    items.push(item);
                }
                Ok(None) => {
                    end_of_data = true;
                    break;
                }
                Err(error) => {
                    listeners.on_read_error(&error);
                    return Err(StepError::Read(error));
                }
            }
        }
        contribution.increment_read_count(items.len() as u64);

        let mut outputs = Chunk::with_capacity(items.len());
        for item in &items {
            listeners
                .before_process(item)
                .map_err(|e| StepError::listener("before_process", e))?;
            match self.processor.process(item) {
                Ok(result) => {
                    listeners
                        .after_process(item, result.as_ref())
                        .map_err(|e| StepError::listener("after_process", e))?;
                    match result {
                        Some(output) => outputs.push(output),
                        None => contribution.increment_filter_count(1),
                    }
                }
                Err(error) => {
                    listeners.on_process_error(item, &error);
                    return Err(StepError::Process(error));
                }
            }
        }

        if !outputs.is_empty() {
            listeners
                .before_write(&outputs)
                .map_err(|e| StepError::listener("before_write", e))?;
            if let Err(error) = self.writer.write(&outputs) {
                listeners.on_write_error(&outputs, &error);
                return Err(StepError::Write(error));
            }
            listeners
                .after_write(&outputs)
                .map_err(|e| StepError::listener("after_write", e))?;
            contribution.increment_write_count(outputs.len() as u64);
        }

        self.reader
            .update(run.step_context_mut())
            .map_err(|e| StepError::collaborator("update reader", e))?;
        self.writer
            .update(run.step_context_mut())
            .map_err(|e| StepError::collaborator("update writer", e))?;

        Ok(end_of_data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use batchline_core::{ExecutionContext, JobParameters, StepExecution};
    use batchline_infra::{InMemoryJobRepository, JobRepository, LaunchRules, ResourcelessTransactionManager};

    use super::*;
    use crate::item::PassThroughProcessor;

    struct RecordingReader {
        items: Vec<i32>,
        position: usize,
        events: Arc<Mutex<Vec<String>>>,
        fail_open: bool,
    }

    impl RecordingReader {
        fn new(items: Vec<i32>, events: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                items,
                position: 0,
                events: Arc::clone(events),
                fail_open: false,
            }
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl ItemReader<i32> for RecordingReader {
        fn read(&mut self) -> anyhow::Result<Option<i32>> {
            let item = self.items.get(self.position).copied();
            self.position += usize::from(item.is_some());
            Ok(item)
        }

        fn open(&mut self, _context: &ExecutionContext) -> anyhow::Result<()> {
            self.push("open".into());
            anyhow::ensure!(!self.fail_open, "no such file");
            Ok(())
        }

        fn update(&mut self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
            self.push(format!("update:{}", self.position));
            Ok(())
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.push("close".into());
            Ok(())
        }
    }

    fn run_recorded(
        reader: RecordingReader,
        chunk_size: usize,
        stop_first: bool,
    ) -> (Result<BatchStatus, StepError>, StepExecution) {
        let repository = InMemoryJobRepository::new();
        let job = repository
            .create_job_execution("job", &JobParameters::new(), LaunchRules::new())
            .unwrap();
        if stop_first {
            repository.request_stop(job.id).unwrap();
        }
        let mut step = StepExecution::new("step", job.id);
        repository.add_step_execution(&step).unwrap();

        let transactions = ResourcelessTransactionManager::new();
        let parameters = JobParameters::new();
        let mut job_context = ExecutionContext::new();
        let mut processor = ChunkProcessor::new(
            Box::new(reader),
            Box::new(PassThroughProcessor),
            Box::new(|_: &Chunk<i32>| -> anyhow::Result<()> { Ok(()) }),
            chunk_size,
        );

        let result = {
            let mut run = StepRun::new(&mut step, &mut job_context, &parameters, &repository, &transactions);
            processor.run(&mut run, &ItemListeners::default(), &ChunkListeners::default())
        };
        assert_eq!(transactions.active_count(), 0);
        (result, step)
    }

    #[test]
    fn streams_are_updated_once_per_chunk_and_closed() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (result, step) = run_recorded(RecordingReader::new(vec![1, 2, 3, 4, 5], &events), 2, false);

        assert_eq!(result.unwrap(), BatchStatus::Completed);
        assert_eq!(step.commit_count, 3);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["open", "update:2", "update:4", "update:5", "close"]
        );
    }

    #[test]
    fn open_failure_ends_before_any_chunk() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut reader = RecordingReader::new(vec![1], &events);
        reader.fail_open = true;

        let (result, step) = run_recorded(reader, 2, false);

        assert!(matches!(result, Err(StepError::Collaborator { operation: "open reader", .. })));
        assert_eq!(step.commit_count, 0);
        assert_eq!(*events.lock().unwrap(), vec!["open"]);
    }

    #[test]
    fn pending_stop_request_skips_every_chunk() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (result, step) = run_recorded(RecordingReader::new(vec![1, 2, 3], &events), 2, true);

        assert_eq!(result.unwrap(), BatchStatus::Stopped);
        assert_eq!((step.read_count, step.commit_count), (0, 0));
        assert_eq!(*events.lock().unwrap(), vec!["open", "close"]);
    }

    #[test]
    fn zero_chunk_size_is_clamped() {
        let processor: ChunkProcessor<i32, i32> = ChunkProcessor::new(
            Box::new(|| -> anyhow::Result<Option<i32>> { Ok(None) }),
            Box::new(PassThroughProcessor),
            Box::new(|_: &Chunk<i32>| -> anyhow::Result<()> { Ok(()) }),
            0,
        );
        assert_eq!(processor.chunk_size(), 1);
    }
}
