//! Cooperative OAL implementation for OS-less targets.
//!
//! There is no scheduler: the application calls
//! [`Stack::poll_once`](crate::Stack::poll_once) from its main loop and
//! advances [`time`] from its tick source. The mutex is a spinlock (no
//! preemption means it never actually spins) and waits cannot block, so a
//! wait whose flags are not already set fails with `Timeout` right away.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use hermit_sync::SpinMutex;
pub use hermit_sync::SpinMutexGuard as MutexGuard;

use crate::error::{Error, Result};

/// The stack mutex.
#[derive(Debug, Default)]
pub struct Mutex<T>(SpinMutex<T>);

impl<T> Mutex<T> {
	pub const fn new(value: T) -> Self {
		Self(SpinMutex::new(value))
	}

	pub fn lock(&self) -> MutexGuard<'_, T> {
		self.0.lock()
	}
}

/// A set of event flags.
///
/// Clones share the same flags. Setting may happen from interrupt context;
/// waiting only ever polls.
#[derive(Debug, Clone, Default)]
pub struct FlagSet(Arc<AtomicU32>);

impl FlagSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, mask: u32) {
		self.0.fetch_or(mask, Ordering::AcqRel);
	}

	pub fn reset(&self, mask: u32) {
		self.0.fetch_and(!mask, Ordering::AcqRel);
	}

	/// Returns the set subset of `mask`, or `Timeout` when none is set.
	///
	/// Without a scheduler nothing can set a flag while we would block, so
	/// every timeout — infinite included — degenerates to a poll.
	pub fn wait(&self, mask: u32, consume: bool, _timeout: Option<u32>) -> Result<u32> {
		let active = self.0.load(Ordering::Acquire) & mask;
		if active == 0 {
			return Err(Error::Timeout);
		}
		if consume {
			self.0.fetch_and(!active, Ordering::AcqRel);
		}
		Ok(active)
	}
}

/// Monotonic millisecond counter, advanced by the application.
pub mod time {
	use super::*;

	static MS_COUNTER: AtomicU32 = AtomicU32::new(0);

	pub fn ms_counter() -> u32 {
		MS_COUNTER.load(Ordering::Relaxed)
	}

	/// Advances the counter; typically called from the systick handler.
	pub fn advance_ms(delta: u32) {
		MS_COUNTER.fetch_add(delta, Ordering::Relaxed);
	}
}
