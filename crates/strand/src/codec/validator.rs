use super::{ALIGNMENT, DeserializationError, align_up};

/// Per-message decode bookkeeping.
///
/// Tracks the lowest offset the next memory claim may start at and the
/// lowest handle index that may be claimed next. Claims must be 8-aligned,
/// strictly increasing, and inside the message, which prevents a crafted
/// payload from aliasing already-decoded memory or reusing handles.
#[derive(Debug)]
pub struct Validator {
    data_len: usize,
    handle_count: usize,
    min_next_memory: usize,
    min_next_claimed_handle: u32,
}

impl Validator {
    pub fn new(data_len: usize, handle_count: usize) -> Self {
        Self {
            data_len,
            handle_count,
            min_next_memory: 0,
            min_next_claimed_handle: 0,
        }
    }

    /// Claim `[start, end)`. Advances the claim floor to the aligned end.
    pub fn claim_memory(&mut self, start: usize, end: usize) -> Result<(), DeserializationError> {
        if start % ALIGNMENT != 0 {
            return Err(DeserializationError::MisalignedClaim { offset: start });
        }
        if start < self.min_next_memory {
            return Err(DeserializationError::OutOfOrderClaim { offset: start });
        }
        if end < start || end > self.data_len {
            return Err(DeserializationError::OutOfBounds {
                offset: start,
                len: end.saturating_sub(start),
                message_len: self.data_len,
            });
        }
        self.min_next_memory = align_up(end);
        Ok(())
    }

    /// Claim one handle index. Indices must be claimed in non-decreasing
    /// order and stay below the attached handle count.
    pub fn claim_handle(&mut self, index: u32) -> Result<(), DeserializationError> {
        if index as usize >= self.handle_count {
            return Err(DeserializationError::HandleOutOfRange {
                index,
                count: self.handle_count,
            });
        }
        if index < self.min_next_claimed_handle {
            return Err(DeserializationError::HandleOutOfOrder { index });
        }
        self.min_next_claimed_handle = index + 1;
        Ok(())
    }
}
