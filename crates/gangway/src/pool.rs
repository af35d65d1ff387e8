use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Buffers kept around for reuse once released. Anything beyond this is
/// dropped on release, so a burst of connections does not pin its high-water
/// memory forever.
const MAX_IDLE_BUFFERS: usize = 64;

/// A pool of fixed-size scratch buffers for stream copying.
///
/// `acquire` never blocks: it reuses a released buffer when one is available
/// and allocates otherwise. Buffer contents are not zeroed between uses; the
/// buffers are only ever scratch space between the two sockets of a single
/// connection.
pub struct BufferPool {
	size: usize,
	free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
	pub fn new(size: usize) -> Arc<BufferPool> {
		Arc::new(BufferPool {
			size,
			free: Mutex::new(Vec::new()),
		})
	}

	pub fn buffer_size(&self) -> usize {
		self.size
	}

	pub fn acquire(self: &Arc<Self>) -> PooledBuf {
		let buf = self
			.free
			.lock()
			.unwrap()
			.pop()
			.unwrap_or_else(|| vec![0u8; self.size].into_boxed_slice());
		PooledBuf {
			buf: Some(buf),
			pool: Arc::clone(self),
		}
	}

	fn release(&self, buf: Box<[u8]>) {
		let mut free = self.free.lock().unwrap();
		if free.len() < MAX_IDLE_BUFFERS {
			free.push(buf);
		}
	}

	#[cfg(test)]
	pub(crate) fn idle(&self) -> usize {
		self.free.lock().unwrap().len()
	}
}

/// A buffer checked out of a [`BufferPool`]. Returned to the pool on drop, so
/// every exit path of the holder releases exactly once.
pub struct PooledBuf {
	buf: Option<Box<[u8]>>,
	pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		self.buf.as_ref().expect("buffer present until drop")
	}
}

impl DerefMut for PooledBuf {
	fn deref_mut(&mut self) -> &mut [u8] {
		self.buf.as_mut().expect("buffer present until drop")
	}
}

impl Drop for PooledBuf {
	fn drop(&mut self) {
		if let Some(buf) = self.buf.take() {
			self.pool.release(buf);
		}
	}
}
