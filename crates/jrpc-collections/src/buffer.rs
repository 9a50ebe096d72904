//! Growable byte buffer.
//!
//! Capacity is tracked in whole blocks of [`BLOCK_SIZE`] bytes and never
//! shrinks. Growth happens inside the type, so holders never need to swap in
//! a new handle after an append. Consuming bytes from the front only moves a
//! read cursor; the live bytes are compacted back to the front the next time
//! the buffer would otherwise have to grow.

use std::collections::TryReserveError;

use thiserror::Error;

/// Growth granularity, in bytes.
pub const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("out of memory growing buffer to {requested} bytes")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("buffer capacity overflow")]
    CapacityOverflow,
}

#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    capacity: usize,
}

fn round_up(n: usize) -> Option<usize> {
    n.checked_add(BLOCK_SIZE - 1).map(|n| n / BLOCK_SIZE * BLOCK_SIZE)
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a buffer whose capacity is `size` rounded up to a block multiple.
    pub fn with_capacity(size: usize) -> Result<Self, BufferError> {
        let mut buffer = Self::new();
        buffer.grow(size)?;
        Ok(buffer)
    }

    /// Number of live bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Grow capacity by `additional` bytes rounded up to the block size.
    pub fn grow(&mut self, additional: usize) -> Result<(), BufferError> {
        let step = round_up(additional).ok_or(BufferError::CapacityOverflow)?;
        if step == 0 {
            return Ok(());
        }
        let target = self
            .capacity
            .checked_add(step)
            .ok_or(BufferError::CapacityOverflow)?;
        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|source| BufferError::OutOfMemory { requested: target, source })?;
        self.capacity = target;
        Ok(())
    }

    /// Make sure `additional` more bytes can be appended without another
    /// allocation.
    pub fn reserve(&mut self, additional: usize) -> Result<(), BufferError> {
        if self.data.len().saturating_add(additional) >= self.capacity && self.head > 0 {
            self.compact();
        }
        if self.data.len().saturating_add(additional) >= self.capacity {
            self.grow(additional)?;
        }
        Ok(())
    }

    /// Append all of `bytes`, growing first if the write would reach or
    /// exceed capacity. On error nothing is copied.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Discard up to `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.head += n.min(self.len());
        if self.head == self.data.len() {
            self.clear();
        }
    }

    /// Keep only the first `len` live bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(self.head + len);
    }

    /// Drop every live byte. Capacity is kept.
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    fn compact(&mut self) {
        self.data.drain(..self.head);
        self.head = 0;
    }
}
