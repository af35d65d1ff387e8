use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of concurrently accepted connections.
///
/// The accept loop tries to admit each connection before doing anything else
/// with it; on failure the socket is closed immediately. The permit is tied to
/// the connection task and released exactly once, when the task finishes.
#[derive(Clone)]
pub struct Admission {
	permits: Arc<Semaphore>,
	max: usize,
}

pub type AdmissionPermit = OwnedSemaphorePermit;

impl Admission {
	pub fn new(max_connections: usize) -> Admission {
		Admission {
			permits: Arc::new(Semaphore::new(max_connections)),
			max: max_connections,
		}
	}

	/// Non-blocking. None means the cap is reached and the caller must turn
	/// the connection away.
	pub fn try_admit(&self) -> Option<AdmissionPermit> {
		self.permits.clone().try_acquire_owned().ok()
	}

	pub fn available(&self) -> usize {
		self.permits.available_permits()
	}

	pub fn max(&self) -> usize {
		self.max
	}
}
