//! Buffer sizing policy and the pooled buffers protocol codecs read through.
//!
//! The sizing policy is a pure function of the memory budget. It bounds the
//! worst-case buffer footprint (`worker_threads * buffers_per_region *
//! buffer_size`) and keeps the smallest tier on individually allocated heap
//! buffers.

use std::{
    cmp, io,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{ready, Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const MIB: u64 = 1024 * 1024;

/// Buffer size, buffers per region and memory kind chosen for a memory budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufferProfile {
    pub buffer_size: usize,
    pub buffers_per_region: usize,
    pub direct: bool,
}

/// Selects the buffer profile for `max_memory` bytes.
///
/// | memory          | size | per region | direct |
/// |-----------------|------|------------|--------|
/// | `< 64 MiB`      | 512  | 10         | no     |
/// | `< 128 MiB`     | 1024 | 10         | yes    |
/// | otherwise       | 4096 | 20         | yes    |
pub const fn select_buffer_profile(max_memory: u64) -> BufferProfile {
    if max_memory < 64 * MIB {
        BufferProfile { buffer_size: 512, buffers_per_region: 10, direct: false }
    } else if max_memory < 128 * MIB {
        BufferProfile { buffer_size: 1024, buffers_per_region: 10, direct: true }
    } else {
        BufferProfile { buffer_size: 4096, buffers_per_region: 20, direct: true }
    }
}

/// Memory budget of the current process.
///
/// On Linux this is the cgroup v2 limit when one is set, otherwise the
/// physical memory size. Elsewhere the budget is unbounded.
pub fn detect_max_memory() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            cgroup_memory_limit()
                .or_else(physical_memory)
                .unwrap_or(u64::MAX)
        } else {
            u64::MAX
        }
    }
}

#[cfg(target_os = "linux")]
fn cgroup_memory_limit() -> Option<u64> {
    // "max" means unlimited and fails to parse, which is what we want
    std::fs::read_to_string("/sys/fs/cgroup/memory.max")
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn physical_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find_map(|line| {
            let kib: u64 = line
                .strip_prefix("MemTotal:")?
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            kib.checked_mul(1024)
        })
}

struct PoolInner {
    buffer_size: usize,
    buffers_per_region: usize,
    direct: bool,
    regions: AtomicUsize,
    free: Mutex<Vec<BytesMut>>,
}

impl PoolInner {
    fn grow(&self, free: &mut Vec<BytesMut>) {
        if self.direct {
            let mut region = BytesMut::zeroed(self.buffer_size * self.buffers_per_region);
            for _ in 0..self.buffers_per_region {
                free.push(region.split_to(self.buffer_size));
            }
        } else {
            for _ in 0..self.buffers_per_region {
                free.push(BytesMut::zeroed(self.buffer_size));
            }
        }
        self.regions
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool of fixed-size byte buffers allocated one region at a time.
///
/// Direct pools carve every buffer of a region out of a single allocation;
/// heap pools allocate each buffer on its own. Buffers go back to the pool
/// when the [`PooledBuffer`] is dropped.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, buffers_per_region: usize, direct: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size: buffer_size.max(1),
                buffers_per_region: buffers_per_region.max(1),
                direct,
                regions: AtomicUsize::new(0),
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn from_profile(profile: BufferProfile) -> Self {
        Self::new(profile.buffer_size, profile.buffers_per_region, profile.direct)
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn buffers_per_region(&self) -> usize {
        self.inner.buffers_per_region
    }

    pub fn is_direct(&self) -> bool {
        self.inner.direct
    }

    /// Number of regions allocated so far.
    pub fn regions(&self) -> usize {
        self.inner
            .regions
            .load(Ordering::Relaxed)
    }

    /// Number of buffers sitting in the free list.
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Takes a buffer from the pool, allocating a new region when it is empty.
    pub fn allocate(&self) -> PooledBuffer {
        let buffer = {
            let mut free = self
                .inner
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if free.is_empty() {
                self.inner
                    .grow(&mut free);
            }
            free.pop()
        };

        let buffer = buffer.unwrap_or_else(|| BytesMut::zeroed(self.inner.buffer_size));
        PooledBuffer { buffer: Some(buffer), pool: self.inner.clone() }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buffer: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer
            .as_deref()
            .unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer
            .as_deref_mut()
            .unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(buffer);
        }
    }
}

/// Connection wrapper that reads through one pooled buffer.
///
/// Reads at least as large as the buffer bypass it; writes pass straight
/// through to the inner stream.
pub struct PooledIo<T> {
    inner: T,
    buffer: PooledBuffer,
    pos: usize,
    filled: usize,
}

impl<T> PooledIo<T> {
    pub fn new(inner: T, buffer: PooledBuffer) -> Self {
        Self { inner, buffer, pos: 0, filled: 0 }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PooledIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos >= this.filled {
            if buf.remaining() >= this.buffer.len() {
                return Pin::new(&mut this.inner).poll_read(cx, buf);
            }

            let mut read_buf = ReadBuf::new(&mut this.buffer[..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            this.filled = read_buf
                .filled()
                .len();
            this.pos = 0;
        }

        let available = &this.buffer[this.pos..this.filled];
        let n = cmp::min(available.len(), buf.remaining());
        buf.put_slice(&available[..n]);
        this.pos += n;

        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PooledIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner
            .is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
