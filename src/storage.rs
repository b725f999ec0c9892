use std::fs::OpenOptions;
use std::io::{self, IoSlice};
use std::path::Path;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use memmap2::MmapMut;

use crate::config::fd_backend_enabled;

#[derive(Debug)]
pub(crate) struct FdBackend {
    file: std::fs::File,
    len: u64,
}

impl FdBackend {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn write_vectored(&self, offset: u64, bufs: &[IoSlice]) -> io::Result<()> {
        #[cfg(unix)]
        {
            let total: usize = bufs.iter().map(|b| b.len()).sum();
            let fd = self.file.as_raw_fd();
            // IoSlice is layout compatible with libc::iovec.
            let iovecs = bufs.as_ptr() as *const libc::iovec;
            let iovcnt = bufs.len() as std::ffi::c_int;
            // SAFETY: `bufs` outlives the call and iovcnt matches its length.
            let written = unsafe { libc::pwritev(fd, iovecs, iovcnt, offset as libc::off_t) };
            if written < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut written = written as usize;
            if written == total {
                return Ok(());
            }
            // Short write: land the remainder buffer by buffer.
            let mut cur = offset + written as u64;
            for buf in bufs {
                if written >= buf.len() {
                    written -= buf.len();
                    continue;
                }
                self.file.write_all_at(&buf[written..], cur)?;
                cur += (buf.len() - written) as u64;
                written = 0;
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let mut cur = offset;
            for buf in bufs {
                self.write(cur, buf)?;
                cur += buf.len() as u64;
            }
            Ok(())
        }
    }

    fn read(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(dest, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[derive(Debug)]
struct MmapBackend {
    mmap: MmapMut,
    len: u64,
}

// SAFETY: all access goes through bounds-checked offsets; concurrent
// writers never overlap because group offsets come from the append
// allocator, which hands out disjoint ranges.
unsafe impl Sync for MmapBackend {}
unsafe impl Send for MmapBackend {}

impl MmapBackend {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        // SAFETY: the journal file is preallocated at format time and never
        // resized while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap, len })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> io::Result<()> {
        if offset + len as u64 > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("access [{}..+{}] beyond device size {}", offset, len, self.len),
            ));
        }
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check_bounds(offset, data.len())?;
        // SAFETY: bounds checked above; ranges from the allocator never
        // overlap between concurrent writers.
        unsafe {
            let ptr = self.mmap.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        self.check_bounds(offset, dest.len())?;
        dest.copy_from_slice(&self.mmap[offset as usize..offset as usize + dest.len()]);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

/// Heap buffer aligned to the DMA address boundary. Record payloads and
/// device read buffers live in these so group offsets and payload bases
/// stay alignable.
pub(crate) struct AlignedBuf {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
}

// SAFETY: `AlignedBuf` owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub(crate) fn zeroed(len: usize) -> Self {
        use crate::config::DMA_ADDRESS_BOUNDARY;
        if len == 0 {
            return Self { ptr: std::ptr::NonNull::dangling(), len: 0 };
        }
        let layout =
            std::alloc::Layout::from_size_align(len, DMA_ADDRESS_BOUNDARY as usize).unwrap();
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = std::ptr::NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, len }
    }

    pub(crate) fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: `ptr` points at `len` initialized bytes owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: `ptr` points at `len` initialized bytes owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        use crate::config::DMA_ADDRESS_BOUNDARY;
        if self.len != 0 {
            let layout =
                std::alloc::Layout::from_size_align(self.len, DMA_ADDRESS_BOUNDARY as usize)
                    .unwrap();
            // SAFETY: allocated with the same layout in `zeroed`.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::ops::Deref for AlignedBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

/// Device storage for one journal. Reads and writes are positioned, never
/// cursor based, so concurrent access needs no seek coordination.
#[derive(Debug)]
pub(crate) struct Storage {
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    Fd(FdBackend),
    Mmap(MmapBackend),
}

impl Storage {
    /// Open the journal file with whichever backend is currently selected
    /// (fd by default, mmap via `disable_fd_backend`).
    pub(crate) fn open(path: &Path) -> io::Result<Arc<Self>> {
        let backend = if fd_backend_enabled() {
            Backend::Fd(FdBackend::open(path)?)
        } else {
            Backend::Mmap(MmapBackend::open(path)?)
        };
        Ok(Arc::new(Self { backend }))
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        match &self.backend {
            Backend::Fd(fd) => fd.write(offset, data),
            Backend::Mmap(mm) => mm.write(offset, data),
        }
    }

    pub(crate) fn write_vectored(&self, offset: u64, bufs: &[IoSlice]) -> io::Result<()> {
        match &self.backend {
            Backend::Fd(fd) => fd.write_vectored(offset, bufs),
            Backend::Mmap(mm) => {
                let mut cur = offset;
                for buf in bufs {
                    mm.write(cur, buf)?;
                    cur += buf.len() as u64;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn read(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        match &self.backend {
            Backend::Fd(fd) => fd.read(offset, dest),
            Backend::Mmap(mm) => mm.read(offset, dest),
        }
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        match &self.backend {
            Backend::Fd(fd) => fd.sync(),
            Backend::Mmap(mm) => mm.sync(),
        }
    }

    pub(crate) fn len(&self) -> u64 {
        match &self.backend {
            Backend::Fd(fd) => fd.len(),
            Backend::Mmap(mm) => mm.len,
        }
    }
}
