//! Length-prefixed byte ring living in the log shared-memory region.
//!
//! Layout: a [`RingBufferHeader`] padded to [`HEADER_SIZE`], then `capacity`
//! data bytes. Each record is a little-endian `u32` length followed by the
//! payload; both may wrap around the end of the data area. Positions are
//! kept modulo `capacity`, and one byte always stays free so a full ring is
//! never mistaken for an empty one.

use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::{RingBufferHeader, HEADER_SIZE, MAX_EVENT_SIZE};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to open {name}: {reason}")]
    Open { name: &'static str, reason: String },
    #[error("event of {0} bytes exceeds the {MAX_EVENT_SIZE}-byte limit")]
    TooLarge(usize),
    #[error("ring buffer full")]
    Full,
    #[error("corrupt record length {0}")]
    Corrupt(usize),
    #[error("failed to serialize event: {0}")]
    Serialize(String),
    #[error("log writer lock not acquired")]
    Busy,
}

impl IpcError {
    pub fn open(name: &'static str, reason: impl ToString) -> Self {
        IpcError::Open {
            name,
            reason: reason.to_string(),
        }
    }
}

/// View of a ring in memory owned elsewhere (usually a mapped file view).
pub struct LogRing {
    base: *mut u8,
}

// SAFETY: all shared state is reached through the atomic header fields and
// the byte area they guard; the creator of the ring owns the mapping.
unsafe impl Send for LogRing {}

impl LogRing {
    /// Adopt a ring another process initialized.
    ///
    /// # Safety
    /// `base` must be 4-byte aligned, valid for `HEADER_SIZE + capacity`
    /// bytes as recorded in its header, and outlive the returned value.
    pub unsafe fn from_raw(base: *mut u8) -> Self {
        Self { base }
    }

    /// Reset the header of a fresh region and adopt it.
    ///
    /// # Safety
    /// As for [`LogRing::from_raw`], with `capacity` data bytes after the
    /// header. No other party may be using the region yet.
    pub unsafe fn initialize(base: *mut u8, capacity: u32) -> Self {
        std::ptr::write_bytes(base, 0, HEADER_SIZE);
        let header = base as *mut RingBufferHeader;
        (*header).write_pos.store(0, Ordering::SeqCst);
        (*header).read_pos.store(0, Ordering::SeqCst);
        (*header).capacity = capacity;
        Self { base }
    }

    fn header(&self) -> &RingBufferHeader {
        unsafe { &*(self.base as *const RingBufferHeader) }
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_SIZE) }
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Bytes a writer may still use.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        let write = header.write_pos.load(Ordering::SeqCst) as usize;
        let read = header.read_pos.load(Ordering::SeqCst) as usize;
        let used = (write + self.capacity() - read) % self.capacity().max(1);
        self.capacity().saturating_sub(used + 1)
    }

    pub fn is_empty(&self) -> bool {
        let header = self.header();
        header.write_pos.load(Ordering::SeqCst) == header.read_pos.load(Ordering::SeqCst)
    }

    fn copy_in(&self, offset: usize, bytes: &[u8]) {
        let capacity = self.capacity();
        let first = bytes.len().min(capacity - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data().add(offset), first);
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.data(), bytes.len() - first);
        }
    }

    fn copy_out(&self, offset: usize, buffer: &mut [u8]) {
        let capacity = self.capacity();
        let first = buffer.len().min(capacity - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data().add(offset), buffer.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(self.data(), buffer.as_mut_ptr().add(first), buffer.len() - first);
        }
    }

    /// Append one record. Writers must be serialized by the caller.
    pub fn push(&self, payload: &[u8]) -> Result<(), IpcError> {
        if payload.is_empty() || payload.len() > MAX_EVENT_SIZE {
            return Err(IpcError::TooLarge(payload.len()));
        }
        let total = LENGTH_PREFIX + payload.len();
        if total > self.free_space() {
            return Err(IpcError::Full);
        }

        let capacity = self.capacity();
        let write = self.header().write_pos.load(Ordering::SeqCst) as usize;
        self.copy_in(write, &(payload.len() as u32).to_le_bytes());
        self.copy_in((write + LENGTH_PREFIX) % capacity, payload);

        self.header()
            .write_pos
            .store(((write + total) % capacity) as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Take the oldest record, if any. A corrupt length discards everything
    /// currently buffered, since record boundaries can no longer be trusted.
    pub fn pop(&self) -> Option<Result<Vec<u8>, IpcError>> {
        let header = self.header();
        let read = header.read_pos.load(Ordering::SeqCst) as usize;
        let write = header.write_pos.load(Ordering::SeqCst);
        if read as u32 == write {
            return None;
        }

        let capacity = self.capacity();
        let mut prefix = [0u8; LENGTH_PREFIX];
        self.copy_out(read, &mut prefix);
        let len = u32::from_le_bytes(prefix) as usize;

        let buffered = (write as usize + capacity - read) % capacity;
        if len == 0 || len > MAX_EVENT_SIZE || LENGTH_PREFIX + len > buffered {
            header.read_pos.store(write, Ordering::SeqCst);
            return Some(Err(IpcError::Corrupt(len)));
        }

        let mut payload = vec![0u8; len];
        self.copy_out((read + LENGTH_PREFIX) % capacity, &mut payload);
        header
            .read_pos
            .store(((read + LENGTH_PREFIX + len) % capacity) as u32, Ordering::SeqCst);
        Some(Ok(payload))
    }
}
