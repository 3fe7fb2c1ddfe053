use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;

/// Used to send a previously allocated [`BytesMut`] back to its [`BufPool`]
/// when the owning [`PacketBuf`] is dropped.
type ReturnToPool = crossbeam_channel::Sender<BytesMut>;
type GetFromPool = crossbeam_channel::Receiver<BytesMut>;

/// A free-list of fixed-size packet buffers.
///
/// Buffers are pre-allocated up front and recycled through a bounded channel.
/// [`BufPool::get`] falls back to a fresh allocation when the list is empty,
/// so the pool never blocks the pipeline.
#[derive(Clone)]
pub struct BufPool {
    rx: GetFromPool,
    tx: ReturnToPool,
    buf_size: usize,
}

impl BufPool {
    /// Create a pool holding `capacity` buffers of `buf_size` bytes each.
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);

        let mut contiguous = BytesMut::zeroed(buf_size * capacity);
        for _ in 0..capacity {
            tx.send(contiguous.split_to(buf_size))
                .expect("chan has space for 'capacity' bufs");
        }
        debug_assert!(contiguous.is_empty());

        BufPool { rx, tx, buf_size }
    }

    /// The number of buffers the pool was created with.
    pub fn capacity(&self) -> usize {
        self.rx.capacity().expect("channel is bounded")
    }

    /// The number of buffers currently resting in the pool.
    ///
    /// After the pipeline has drained, this equals [`Self::capacity`].
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// The size of each buffer, which bounds the largest packet.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Get an empty [`PacketBuf`], recycling a resting buffer if one exists.
    pub fn get(&self) -> PacketBuf {
        let buf = match self.rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => BytesMut::with_capacity(self.buf_size),
        };

        PacketBuf {
            buf,
            pool: Some(self.tx.clone()),
        }
    }
}

/// An owned packet buffer, returned to its [`BufPool`] on drop.
pub struct PacketBuf {
    buf: BytesMut,
    pool: Option<ReturnToPool>,
}

impl PacketBuf {
    /// Create an unpooled buffer holding a copy of `data`.
    pub fn copy_from(data: &[u8]) -> Self {
        PacketBuf {
            buf: BytesMut::from(data),
            pool: None,
        }
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Deref for PacketBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PacketBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.buf.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(tx) = self.pool.take() {
            // A full pool means a fallback allocation is being retired.
            let _ = tx.try_send(std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BufPool;

    #[test]
    fn prealloc_and_recycle() {
        let pool = BufPool::new(4, 128);
        assert_eq!(pool.available(), 4);

        let bufs: Vec<_> = (0..4).map(|_| pool.get()).collect();
        assert_eq!(pool.available(), 0);

        drop(bufs);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn overflow_allocates() {
        let pool = BufPool::new(1, 64);
        let a = pool.get();
        let mut b = pool.get();
        b.extend_from_slice(&[1, 2, 3]);
        assert_eq!(&*b, &[1, 2, 3]);

        // Both return; the pool only keeps its configured capacity.
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn recycled_buffers_are_empty() {
        let pool = BufPool::new(1, 64);
        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        drop(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
    }
}
