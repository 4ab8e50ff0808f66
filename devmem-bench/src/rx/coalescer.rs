/// Contiguous byte range of the source dmabuf awaiting a copy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Run {
    pub start: u64,
    pub end: u64,
}

impl Run {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Merges fragments that continue exactly where the previous one ended.
///
/// At most one run is open. A gap closes it and hands it back to the caller,
/// which must copy it out before the fragment that caused the gap is
/// released.
#[derive(Debug, Default)]
pub struct Coalescer {
    run: Option<Run>,
    last_end: Option<u64>,
    aligned: u64,
    non_aligned: u64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment; returns the run it displaced, if any.
    pub fn ingest(&mut self, offset: u64, len: u32) -> Option<Run> {
        let fresh = Run {
            start: offset,
            end: offset + len as u64,
        };
        match self.run.as_mut() {
            Some(run) if run.end == offset => {
                run.end = fresh.end;
                self.aligned += 1;
                None
            }
            Some(_) => {
                self.non_aligned += 1;
                let closed = self.run.replace(fresh);
                if let Some(closed) = closed {
                    self.last_end = Some(closed.end);
                }
                closed
            }
            None => {
                if self.last_end == Some(offset) {
                    self.aligned += 1;
                } else {
                    self.non_aligned += 1;
                }
                self.run = Some(fresh);
                None
            }
        }
    }

    /// Close the open run, if any.
    pub fn take(&mut self) -> Option<Run> {
        let run = self.run.take();
        if let Some(run) = run {
            self.last_end = Some(run.end);
        }
        run
    }

    pub fn open_run(&self) -> Option<Run> {
        self.run
    }

    pub fn aligned(&self) -> u64 {
        self.aligned
    }

    pub fn non_aligned(&self) -> u64 {
        self.non_aligned
    }
}
