//! Hosted OAL implementation on top of `std`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

pub use std::sync::MutexGuard;

use crate::error::{Error, Result};

/// The stack mutex.
///
/// Poisoning is absorbed: a panic in a user callback must not wedge the
/// interface tasks.
#[derive(Debug, Default)]
pub struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
	pub const fn new(value: T) -> Self {
		Self(StdMutex::new(value))
	}

	pub fn lock(&self) -> MutexGuard<'_, T> {
		self.0.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// A waitable set of event flags.
///
/// Clones share the same underlying flags, so one end can be parked in
/// [`FlagSet::wait`] while interface tasks and driver callbacks signal it.
#[derive(Debug, Clone, Default)]
pub struct FlagSet(Arc<FlagSetInner>);

#[derive(Debug, Default)]
struct FlagSetInner {
	flags: StdMutex<u32>,
	cond: Condvar,
}

impl FlagSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the flags in `mask` and wakes all waiters.
	///
	/// Callable from interrupt context on targets where that exists; the
	/// hosted implementation has no such distinction.
	pub fn set(&self, mask: u32) {
		let mut flags = self.0.flags.lock().unwrap_or_else(PoisonError::into_inner);
		*flags |= mask;
		self.0.cond.notify_all();
	}

	/// Clears the flags in `mask`.
	pub fn reset(&self, mask: u32) {
		let mut flags = self.0.flags.lock().unwrap_or_else(PoisonError::into_inner);
		*flags &= !mask;
	}

	/// Waits until any flag in `mask` is set and returns the set subset.
	///
	/// With `consume`, the returned flags are cleared atomically with the
	/// wakeup. `timeout` of `None` waits forever; `Some(0)` polls.
	pub fn wait(&self, mask: u32, consume: bool, timeout: Option<u32>) -> Result<u32> {
		let deadline = timeout.map(|ms| std::time::Instant::now() + Duration::from_millis(ms.into()));
		let mut flags = self.0.flags.lock().unwrap_or_else(PoisonError::into_inner);

		loop {
			let active = *flags & mask;
			if active != 0 {
				if consume {
					*flags &= !active;
				}
				return Ok(active);
			}

			flags = match deadline {
				None => self.0.cond.wait(flags).unwrap_or_else(PoisonError::into_inner),
				Some(deadline) => {
					let now = std::time::Instant::now();
					if now >= deadline {
						return Err(Error::Timeout);
					}
					let (guard, _) = self
						.0
						.cond
						.wait_timeout(flags, deadline - now)
						.unwrap_or_else(PoisonError::into_inner);
					guard
				}
			};
		}
	}
}

/// Monotonic millisecond counter.
pub mod time {
	use super::*;

	static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
	static OFFSET_MS: AtomicU32 = AtomicU32::new(0);

	/// Milliseconds elapsed since the first call, plus any manual advance.
	pub fn ms_counter() -> u32 {
		let epoch = *EPOCH.get_or_init(std::time::Instant::now);
		let elapsed = epoch.elapsed().as_millis() as u32;
		elapsed.wrapping_add(OFFSET_MS.load(Ordering::Relaxed))
	}

	/// Advances the counter artificially. Meant for the cooperative port;
	/// on hosted builds it is mainly useful to tests exercising timeouts.
	pub fn advance_ms(delta: u32) {
		OFFSET_MS.fetch_add(delta, Ordering::Relaxed);
	}
}

/// Spawns a detached task running `body`.
pub fn spawn_task(name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
	std::thread::Builder::new()
		.name(name.into())
		.spawn(body)
		.map(drop)
		.map_err(|_| Error::Resource)
}
