use tracing::trace;

/// Write cursor into the fixed-capacity destination region.
///
/// A write that would reach the end starts over at offset zero; whatever was
/// left in the tail is discarded. `cursor < capacity` holds between writes.
///
/// A wrap is counted only once earlier bytes are about to be overwritten, so
/// a session that exactly fills the region reports none.
#[derive(Debug)]
pub struct Ring {
    capacity: usize,
    cursor: usize,
    wraps: u64,
    // The last commit ended exactly at capacity.
    filled: bool,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cursor: 0,
            wraps: 0,
            filled: false,
        }
    }

    /// Destination offset for the next `len` bytes.
    pub fn reserve(&mut self, len: usize) -> usize {
        let filled = std::mem::take(&mut self.filled);
        if self.cursor + len >= self.capacity && self.cursor != 0 {
            trace!(cursor = self.cursor, len, "Ring wraparound");
            self.cursor = 0;
            self.wraps += 1;
        } else if filled {
            trace!(len, "Ring full, overwriting from the start");
            self.wraps += 1;
        }
        self.cursor
    }

    /// Advance past `len` bytes written at the reserved offset.
    pub fn commit(&mut self, len: usize) {
        self.cursor += len;
        if self.cursor >= self.capacity {
            self.cursor = 0;
            self.filled = true;
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wraps(&self) -> u64 {
        self.wraps
    }
}
