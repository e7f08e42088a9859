//! Operating-system abstraction layer.
//!
//! The stack needs four things from its host: a mutex, waitable event-flag
//! sets, a monotonic millisecond counter and (optionally) task spawning.
//! The hosted implementation maps these onto `std`; the cooperative
//! implementation is for OS-less targets where the application pumps the
//! stack itself. Both expose the same API; in cooperative mode waiting is
//! degenerate — a wait whose flags are not already set returns
//! [`Error::Timeout`](crate::Error::Timeout) immediately and the callers
//! tolerate the spurious early return.

#[cfg(not(feature = "std"))]
mod coop;
#[cfg(feature = "std")]
mod hosted;

#[cfg(not(feature = "std"))]
pub use coop::*;
#[cfg(feature = "std")]
pub use hosted::*;

bitflags::bitflags! {
	/// Events signalled by a driver to its interface task.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct IfaceEvent: u32 {
		/// At least one received packet is waiting in the driver queue.
		const RX_DONE = 1;
		/// At least one transmitted packet is waiting in the driver queue.
		const TX_DONE = 2;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_wait_returns_set_subset_and_consumes() {
		let flags = FlagSet::new();
		flags.set(0b101);
		assert_eq!(flags.wait(0b001, true, Some(0)).unwrap(), 0b001);
		// The waited-for bit was consumed, the other one is still pending.
		assert_eq!(flags.wait(0b001, true, Some(0)).unwrap_err(), crate::Error::Timeout);
		assert_eq!(flags.wait(0b100, false, Some(0)).unwrap(), 0b100);
		assert_eq!(flags.wait(0b100, true, Some(0)).unwrap(), 0b100);
	}

	#[test]
	fn flags_reset_clears_pending_bits() {
		let flags = FlagSet::new();
		flags.set(0b11);
		flags.reset(0b01);
		assert_eq!(flags.wait(0b11, true, Some(0)).unwrap(), 0b10);
	}

	#[test]
	fn ms_counter_is_monotonic() {
		let before = time::ms_counter();
		time::advance_ms(5);
		let after = time::ms_counter();
		assert!(after >= before + 5);
	}
}
