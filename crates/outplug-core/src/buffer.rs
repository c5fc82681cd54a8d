//! Telemetry buffer between the harness and the flusher.

use std::sync::{Mutex, PoisonError};

use crate::harness::SampleContainer;

/// Append-only list of sample batches, drained whole at each flush.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    batches: Mutex<Vec<SampleContainer>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, batches: Vec<SampleContainer>) {
        if batches.is_empty() {
            return;
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batches);
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<SampleContainer> {
        std::mem::take(&mut *self.batches.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_empty(&self) -> bool {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
