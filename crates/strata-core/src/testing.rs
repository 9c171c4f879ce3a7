//! Test utilities.
//!
//! [`CollectingEmitter`] records everything a handler emits, for tests and
//! benches.

use arrow_array::RecordBatch;
use parking_lot::Mutex;

use crate::buffer::TupleBuffer;
use crate::operator::Emitter;

/// Emitter that stores every emitted buffer and side output in memory.
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    buffers: Mutex<Vec<TupleBuffer>>,
    side_outputs: Mutex<Vec<(String, RecordBatch)>>,
}

impl CollectingEmitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers emitted so far, in emission order.
    #[must_use]
    pub fn buffers(&self) -> Vec<TupleBuffer> {
        self.buffers.lock().clone()
    }

    /// Side-output batches emitted so far, with their output names.
    #[must_use]
    pub fn side_outputs(&self) -> Vec<(String, RecordBatch)> {
        self.side_outputs.lock().clone()
    }

    /// Total records across emitted buffers.
    #[must_use]
    pub fn num_records(&self) -> usize {
        self.buffers.lock().iter().map(TupleBuffer::num_records).sum()
    }

    /// Removes and returns the emitted buffers.
    pub fn take_buffers(&self) -> Vec<TupleBuffer> {
        std::mem::take(&mut *self.buffers.lock())
    }
}

impl Emitter for CollectingEmitter {
    fn emit(&self, buffer: TupleBuffer) {
        self.buffers.lock().push(buffer);
    }

    fn emit_side_output(&self, name: &str, batch: RecordBatch) {
        self.side_outputs.lock().push((name.to_string(), batch));
    }
}
