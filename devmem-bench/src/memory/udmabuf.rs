use crate::error::{Error, Result};
use crate::memory::{MemoryProvider, Region, copy_mapped};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{ptr, slice};
use tracing::{debug, instrument};

const UDMABUF_DEVICE: &str = "/dev/udmabuf";
const UDMABUF_FLAGS_CLOEXEC: u32 = 0x01;
/// `_IOW('u', 0x42, struct udmabuf_create)`
const UDMABUF_CREATE: u64 = 0x4018_7542;

#[repr(C)]
struct UdmabufCreate {
    memfd: u32,
    flags: u32,
    offset: u64,
    size: u64,
}

/// memfd-backed regions exported as dma-bufs through `/dev/udmabuf`.
///
/// Lets the devmem path run against host memory on machines without an
/// accelerator; the NIC still DMAs straight into the region.
pub struct UdmabufMemory {
    device: OwnedFd,
    next_id: AtomicU64,
}

pub struct UdmabufRegion {
    id: u64,
    len: usize,
    mapped: usize,
    ptr: NonNull<u8>,
    dmabuf: OwnedFd,
    _memfd: OwnedFd,
}

// SAFETY: the mapping is owned exclusively by the region.
unsafe impl Send for UdmabufRegion {}

impl UdmabufRegion {
    fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` maps `mapped >= len` bytes for the lifetime of `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Region for UdmabufRegion {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for UdmabufRegion {
    fn drop(&mut self) {
        debug!(id = self.id, "Unmapping udmabuf region");
        // SAFETY: unmaps exactly the mapping created in `allocate`.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.mapped) };
    }
}

impl UdmabufMemory {
    pub fn open() -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(UDMABUF_DEVICE)
            .map_err(|e| Error::Memory(format!("failed to open {UDMABUF_DEVICE}: {e}")))?;
        Ok(Self {
            device: OwnedFd::from(device),
            next_id: AtomicU64::new(0),
        })
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

impl MemoryProvider for UdmabufMemory {
    type Region = UdmabufRegion;

    #[instrument(skip(self), err)]
    fn allocate(&self, size: usize) -> Result<UdmabufRegion> {
        if size == 0 {
            return Err(Error::Memory("cannot allocate an empty udmabuf".into()));
        }
        let mapped = size.next_multiple_of(page_size());

        // SAFETY: the name is a valid NUL-terminated string.
        let fd = unsafe { libc::memfd_create(c"devmem-bench".as_ptr(), libc::MFD_ALLOW_SEALING) };
        if fd < 0 {
            return Err(Error::last_os("memfd_create"));
        }
        // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
        let memfd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(memfd.as_raw_fd(), mapped as libc::off_t) } < 0 {
            return Err(Error::last_os("ftruncate"));
        }
        if unsafe { libc::fcntl(memfd.as_raw_fd(), libc::F_ADD_SEALS, libc::F_SEAL_SHRINK) } < 0 {
            return Err(Error::last_os("fcntl"));
        }

        let create = UdmabufCreate {
            memfd: memfd.as_raw_fd() as u32,
            flags: UDMABUF_FLAGS_CLOEXEC,
            offset: 0,
            size: mapped as u64,
        };
        // SAFETY: `create` matches `struct udmabuf_create` and outlives the call.
        let fd = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                UDMABUF_CREATE as _,
                &create as *const UdmabufCreate,
            )
        };
        if fd < 0 {
            return Err(Error::last_os("ioctl(UDMABUF_CREATE)"));
        }
        // SAFETY: the ioctl returns a fresh dma-buf descriptor.
        let dmabuf = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: maps the whole memfd, which is at least `mapped` bytes long.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                memfd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os("mmap"));
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| Error::Memory("mmap returned null".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, size, mapped, dmabuf = dmabuf.as_raw_fd(), "Allocated udmabuf region");
        Ok(UdmabufRegion {
            id,
            len: size,
            mapped,
            ptr,
            dmabuf,
            _memfd: memfd,
        })
    }

    fn copy(
        &self,
        dst: &mut UdmabufRegion,
        dst_offset: usize,
        src: &UdmabufRegion,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        copy_mapped(dst.bytes_mut(), dst_offset, src.bytes(), src_offset, len)
    }

    fn upload(&self, dst: &mut UdmabufRegion, dst_offset: usize, src: &[u8]) -> Result<()> {
        copy_mapped(dst.bytes_mut(), dst_offset, src, 0, src.len())
    }

    fn download(&self, dst: &mut [u8], src: &UdmabufRegion, src_offset: usize) -> Result<()> {
        let len = dst.len();
        copy_mapped(dst, 0, src.bytes(), src_offset, len)
    }

    fn export<'r>(&self, region: &'r UdmabufRegion) -> Result<BorrowedFd<'r>> {
        Ok(region.dmabuf.as_fd())
    }
}
