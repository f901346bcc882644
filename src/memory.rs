//! Size-classed byte buffer pool.
//!
//! Each size class owns a fixed number of buffers. Buffers are handed out as
//! [`PooledBuffer`] handles; dropping the handle puts the buffer back on its
//! class free list, so a buffer goes home exactly once whatever path the
//! caller takes out of a request.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One bucket of equally sized buffers.
struct SizeClass {
    size: usize,
    count: usize,
    free: Mutex<Vec<Vec<u8>>>,
    permits: Arc<Semaphore>,
    /// Buffers created so far; never exceeds `count`.
    created: AtomicUsize,
}

impl SizeClass {
    fn new(size: usize, count: usize) -> Self {
        SizeClass {
            size,
            count,
            free: Mutex::new(Vec::with_capacity(count)),
            permits: Arc::new(Semaphore::new(count)),
            created: AtomicUsize::new(0),
        }
    }

    /// Hand out a buffer for a permit already acquired from this class.
    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> PooledBuffer {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.size]
            }
        };
        PooledBuffer {
            buf,
            home: Some((Arc::clone(self), permit)),
        }
    }

    fn checkin(&self, buf: Vec<u8>) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }
}

/// Pool of byte buffers bucketed by size.
pub struct ByteBufferPool {
    classes: Vec<Arc<SizeClass>>,
}

impl ByteBufferPool {
    /// Create a pool from `(buffer size, buffer count)` pairs. Classes are
    /// sorted by size; buffers are created lazily up to each class count.
    pub fn new(classes: &[(usize, usize)]) -> Self {
        let mut sorted = classes.to_vec();
        sorted.sort_by_key(|&(size, _)| size);
        ByteBufferPool {
            classes: sorted
                .into_iter()
                .map(|(size, count)| Arc::new(SizeClass::new(size, count)))
                .collect(),
        }
    }

    pub fn smallest_size(&self) -> usize {
        self.classes.first().map_or(0, |c| c.size)
    }

    pub fn largest_size(&self) -> usize {
        self.classes.last().map_or(0, |c| c.size)
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// Any class that fits and has a free buffer is used straight away,
    /// smallest first. Otherwise waits up to `wait` for the best fitting class.
    /// Returns `None` when the request is larger than every class or the wait
    /// expires.
    pub async fn allocate_buffer(&self, size: usize, wait: Duration) -> Option<PooledBuffer> {
        let first = self.classes.iter().position(|c| c.size >= size)?;

        for class in &self.classes[first..] {
            if let Ok(permit) = Arc::clone(&class.permits).try_acquire_owned() {
                return Some(class.checkout(permit));
            }
        }

        let class = &self.classes[first];
        match tokio::time::timeout(wait, Arc::clone(&class.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Some(class.checkout(permit)),
            _ => None,
        }
    }

    /// Number of buffers of the class serving `size` that are free right now.
    pub fn available_buffers(&self, size: usize) -> usize {
        self.class_for(size)
            .map_or(0, |c| c.permits.available_permits())
    }

    /// Number of buffers the class serving `size` has actually created.
    pub fn created_buffers(&self, size: usize) -> usize {
        self.class_for(size)
            .map_or(0, |c| c.created.load(Ordering::Relaxed))
    }

    fn class_for(&self, size: usize) -> Option<&Arc<SizeClass>> {
        self.classes.iter().find(|c| c.size >= size)
    }
}

impl fmt::Display for ByteBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, class) in self.classes.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(
                f,
                "{}:{}/{}",
                class.size,
                class.permits.available_permits(),
                class.count
            )?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ByteBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteBufferPool{}", self)
    }
}

/// A checked-out buffer. Pooled buffers return to their size class on drop;
/// unpooled (oversized) buffers are simply freed.
pub struct PooledBuffer {
    buf: Vec<u8>,
    home: Option<(Arc<SizeClass>, OwnedSemaphorePermit)>,
}

impl PooledBuffer {
    /// A buffer that does not belong to any pool.
    pub fn unpooled(size: usize) -> Self {
        PooledBuffer {
            buf: vec![0u8; size],
            home: None,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some((class, permit)) = self.home.take() {
            // Buffer goes back before the permit so the next holder finds it.
            class.checkin(std::mem::take(&mut self.buf));
            drop(permit);
        }
    }
}
