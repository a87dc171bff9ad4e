//! The staged batch pipeline: read, transform in parallel, reassemble.
//!
//! [`TransformPipeline`] wires a [`ShardedBatchSource`] to a pool of
//! transform workers through bounded queues:
//!
//! ```text
//! source thread -> input queue -> N workers -> output queue -> batcher
//! ```
//!
//! Every event carries a sequence number; the consumer holds a reorder
//! buffer so batches come out exactly as if the stream had been
//! transformed sequentially, regardless of worker count. Pass markers
//! flow through the same path, so remainder batches land on the same
//! boundaries as the single-threaded source. The first error ends the
//! stream; dropping the pipeline closes the queues and joins every
//! thread.

use crate::queue::{BoundedQueue, QueueClosed};
use crate::record::{FeatureBatch, TransformedRecord};
use crate::source::{Result, ShardedBatchSource, SourceError, SourceEvent};
use crate::transform::RecordTransformer;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Tuning knobs for the staged pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Number of transform worker threads.
    pub workers: usize,
    /// Capacity of each handoff queue, in events.
    pub queue_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            queue_capacity: 1024,
        }
    }
}

enum StageIn {
    Record(crate::record::Record),
    Marker,
    Fail(SourceError),
}

enum StageOut {
    Record(TransformedRecord),
    Marker,
    Fail(SourceError),
}

/// A running pipeline. Iterate it to drain ordered [`FeatureBatch`]es.
pub struct TransformPipeline {
    input: BoundedQueue<(u64, StageIn)>,
    output: BoundedQueue<(u64, StageOut)>,
    threads: Vec<JoinHandle<()>>,
    reorder: BTreeMap<u64, StageOut>,
    next_seq: u64,
    pending: Vec<TransformedRecord>,
    batch_size: usize,
    drop_remainder: bool,
    finished: bool,
}

impl TransformPipeline {
    /// Starts a pipeline with default options.
    pub fn new(source: &ShardedBatchSource, transformer: Arc<RecordTransformer>) -> Self {
        Self::with_options(source, transformer, PipelineOptions::default())
    }

    /// Starts the source thread and worker pool.
    pub fn with_options(
        source: &ShardedBatchSource,
        transformer: Arc<RecordTransformer>,
        options: PipelineOptions,
    ) -> Self {
        let workers = options.workers.max(1);
        let input: BoundedQueue<(u64, StageIn)> = BoundedQueue::new(options.queue_capacity);
        let output: BoundedQueue<(u64, StageOut)> = BoundedQueue::new(options.queue_capacity);
        let mut threads = Vec::with_capacity(workers + 1);

        let events = source.events();
        {
            let input = input.clone();
            threads.push(thread::spawn(move || {
                let mut seq = 0u64;
                for event in events {
                    let item = match event {
                        Ok(SourceEvent::Record(record)) => StageIn::Record(record),
                        Ok(SourceEvent::EpochEnd) => StageIn::Marker,
                        Err(error) => StageIn::Fail(error),
                    };
                    let stop = matches!(item, StageIn::Fail(_));
                    if input.push((seq, item)).is_err() {
                        // consumer went away
                        break;
                    }
                    seq += 1;
                    if stop {
                        break;
                    }
                }
                input.close();
            }));
        }

        let live = Arc::new(AtomicUsize::new(workers));
        for _ in 0..workers {
            let input = input.clone();
            let output = output.clone();
            let transformer = Arc::clone(&transformer);
            let live = Arc::clone(&live);
            threads.push(thread::spawn(move || {
                while let Ok((seq, item)) = input.pop() {
                    let out = match item {
                        StageIn::Record(record) => match transformer.transform(&record) {
                            Ok(transformed) => StageOut::Record(transformed),
                            Err(error) => StageOut::Fail(SourceError::Transform(error)),
                        },
                        StageIn::Marker => StageOut::Marker,
                        StageIn::Fail(error) => StageOut::Fail(error),
                    };
                    if output.push((seq, out)).is_err() {
                        break;
                    }
                }
                // the last worker out closes the downstream queue
                if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                    output.close();
                }
            }));
        }

        tracing::debug!(
            workers,
            batch_size = source.batch_size(),
            "transform pipeline started"
        );

        Self {
            input,
            output,
            threads,
            reorder: BTreeMap::new(),
            next_seq: 0,
            pending: Vec::new(),
            batch_size: source.batch_size(),
            drop_remainder: source.drop_remainder(),
            finished: false,
        }
    }

    fn emit(&mut self) -> Result<FeatureBatch> {
        let records = std::mem::take(&mut self.pending);
        FeatureBatch::from_records(records).map_err(SourceError::Transform)
    }
}

impl Iterator for TransformPipeline {
    type Item = Result<FeatureBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(item) = self.reorder.remove(&self.next_seq) {
                self.next_seq += 1;
                match item {
                    StageOut::Record(record) => {
                        self.pending.push(record);
                        if self.pending.len() == self.batch_size {
                            return Some(self.emit());
                        }
                    }
                    StageOut::Marker => {
                        if !self.pending.is_empty() {
                            if self.drop_remainder {
                                self.pending.clear();
                            } else {
                                return Some(self.emit());
                            }
                        }
                    }
                    StageOut::Fail(error) => {
                        self.finished = true;
                        return Some(Err(error));
                    }
                }
                continue;
            }
            match self.output.pop() {
                Ok((seq, item)) => {
                    self.reorder.insert(seq, item);
                }
                Err(QueueClosed) => {
                    self.finished = true;
                    // a gap in the sequence means a worker died mid-item
                    if !self.reorder.is_empty() {
                        return Some(Err(SourceError::WorkerPanicked));
                    }
                    return None;
                }
            }
        }
    }
}

impl Drop for TransformPipeline {
    fn drop(&mut self) {
        self.input.close();
        self.output.close();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
