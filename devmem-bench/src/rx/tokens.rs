use crate::error::{Error, Result};
use crate::rx::RxChannel;
use crate::wire::TokenRange;
use tracing::trace;

/// Fragment tokens waiting to be handed back to the kernel.
///
/// Consecutive tokens share one range; a token that does not continue the
/// last range starts a new one.
#[derive(Debug)]
pub struct TokenBatch {
    ranges: Vec<TokenRange>,
    count: usize,
    threshold: usize,
    max_ranges: usize,
}

impl TokenBatch {
    pub fn new(threshold: usize, max_ranges: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(max_ranges),
            count: 0,
            threshold,
            max_ranges,
        }
    }

    pub fn record(&mut self, token: u32) {
        match self.ranges.last_mut() {
            Some(range) if range.end() == token => range.token_count += 1,
            _ => self.ranges.push(TokenRange {
                token_start: token,
                token_count: 1,
            }),
        }
        self.count += 1;
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.threshold || self.ranges.len() >= self.max_ranges
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn ranges(&self) -> &[TokenRange] {
        &self.ranges
    }

    /// Return every pending token in one call.
    ///
    /// The kernel must confirm each token; a short count means a token was
    /// unknown or already released, and the batch is left untouched.
    pub fn release<C: RxChannel>(&mut self, channel: &mut C) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let released = channel.release_tokens(&self.ranges)?;
        if released != self.count {
            return Err(Error::TokenRelease {
                requested: self.count,
                released,
            });
        }
        trace!(tokens = released, ranges = self.ranges.len(), "Released tokens");
        self.ranges.clear();
        self.count = 0;
        Ok(released)
    }
}
