use crate::error::{Result, SmuxError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates local stream IDs and classifies peer ones.
///
/// Clients own the odd IDs starting at 1, servers the even IDs starting at 2.
/// IDs never wrap: once the next ID would leave the `u32` range every further
/// allocation fails with [`SmuxError::StreamsExhausted`].
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU64,
    is_client: bool,
}

impl StreamIdGenerator {
    pub fn new(is_client: bool) -> Self {
        Self {
            next_id: AtomicU64::new(Self::first_id(is_client)),
            is_client,
        }
    }

    fn first_id(is_client: bool) -> u64 {
        if is_client {
            1
        } else {
            2
        }
    }

    pub fn next(&self) -> Result<u32> {
        self.next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                (id <= u32::MAX as u64).then_some(id + 2)
            })
            .map(|id| id as u32)
            .map_err(|_| SmuxError::StreamsExhausted)
    }

    /// Whether `stream_id` has the parity of locally opened streams.
    pub fn is_local(&self, stream_id: u32) -> bool {
        stream_id != 0 && (stream_id % 2 == 1) == self.is_client
    }

    /// Whether `stream_id` is a local ID that has already been handed out.
    pub fn is_allocated(&self, stream_id: u32) -> bool {
        self.is_local(stream_id) && (stream_id as u64) < self.next_id.load(Ordering::Acquire)
    }

    pub fn validate_peer_stream_id(&self, stream_id: u32) -> Result<()> {
        if stream_id == 0 || self.is_local(stream_id) {
            return Err(SmuxError::InvalidStreamId(stream_id));
        }
        Ok(())
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    #[cfg(test)]
    fn set_next(&self, next: u64) {
        self.next_id.store(next, Ordering::Release);
    }
}
