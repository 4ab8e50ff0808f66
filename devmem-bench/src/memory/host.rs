use crate::error::{Error, Result};
use crate::memory::{MemoryProvider, Region, copy_mapped};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Plain heap memory. Backs the ordinary TCP path and tests.
#[derive(Debug, Default)]
pub struct HostMemory {
    next_id: AtomicU64,
}

#[derive(Debug)]
pub struct HostRegion {
    id: u64,
    data: Vec<u8>,
}

impl HostRegion {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Region for HostRegion {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryProvider for HostMemory {
    type Region = HostRegion;

    fn allocate(&self, size: usize) -> Result<HostRegion> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, size, "Allocating host region");
        Ok(HostRegion {
            id,
            data: vec![0u8; size],
        })
    }

    fn copy(
        &self,
        dst: &mut HostRegion,
        dst_offset: usize,
        src: &HostRegion,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        copy_mapped(&mut dst.data, dst_offset, &src.data, src_offset, len)
    }

    fn upload(&self, dst: &mut HostRegion, dst_offset: usize, src: &[u8]) -> Result<()> {
        copy_mapped(&mut dst.data, dst_offset, src, 0, src.len())
    }

    fn download(&self, dst: &mut [u8], src: &HostRegion, src_offset: usize) -> Result<()> {
        let len = dst.len();
        copy_mapped(dst, 0, &src.data, src_offset, len)
    }

    fn export<'r>(&self, region: &'r HostRegion) -> Result<BorrowedFd<'r>> {
        Err(Error::Memory(format!(
            "host region {} has no dma-buf to export",
            region.id
        )))
    }
}
