pub mod host;
pub mod pattern;
pub mod udmabuf;

use crate::error::{Error, Result};
use std::ops::Range;
use std::os::fd::BorrowedFd;

pub use host::{HostMemory, HostRegion};
pub use udmabuf::{UdmabufMemory, UdmabufRegion};

/// A fixed-capacity allocation the network stack can address by byte offset.
///
/// Regions are freed when dropped.
pub trait Region {
    fn id(&self) -> u64;
    fn len(&self) -> usize;
}

/// Allocates regions and moves bytes between them.
///
/// Every copy is bounds-checked against both regions before any byte moves;
/// a range that does not fit is reported as [`Error::RegionOverrun`].
pub trait MemoryProvider {
    type Region: Region;

    fn allocate(&self, size: usize) -> Result<Self::Region>;

    /// Device-to-device copy of `len` bytes.
    fn copy(
        &self,
        dst: &mut Self::Region,
        dst_offset: usize,
        src: &Self::Region,
        src_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Host-to-device copy of all of `src`.
    fn upload(&self, dst: &mut Self::Region, dst_offset: usize, src: &[u8]) -> Result<()>;

    /// Device-to-host copy filling all of `dst`.
    fn download(&self, dst: &mut [u8], src: &Self::Region, src_offset: usize) -> Result<()>;

    /// The dma-buf file descriptor backing `region`, for queue binding.
    fn export<'r>(&self, region: &'r Self::Region) -> Result<BorrowedFd<'r>>;
}

/// `offset..offset + len`, if it lies within `capacity`.
pub fn check_range(offset: usize, len: usize, capacity: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(offset..end),
        _ => Err(Error::RegionOverrun {
            offset,
            len,
            capacity,
        }),
    }
}

/// Shared copy routine for providers whose regions are mapped into the host.
fn copy_mapped(
    dst: &mut [u8],
    dst_offset: usize,
    src: &[u8],
    src_offset: usize,
    len: usize,
) -> Result<()> {
    let src = check_range(src_offset, len, src.len()).map(|r| &src[r])?;
    let dst_len = dst.len();
    let dst = check_range(dst_offset, len, dst_len).map(|r| &mut dst[r])?;
    dst.copy_from_slice(src);
    Ok(())
}
