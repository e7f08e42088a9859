//! The network driver contract.
//!
//! Concrete MAC/DMA drivers live outside the core; the stack only sees this
//! trait. All operations are non-blocking and are called with the stack
//! mutex held, except the [`DriverCallbacks`] which an ISR may invoke to
//! signal completions. Drivers for MACs with an external PHY compose with
//! the [`phy`] module to implement [`NetDriver::link_state`].

#[cfg(feature = "localhost")]
pub mod loopback;
pub mod phy;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Result;
use crate::oal::{FlagSet, IfaceEvent};
use crate::packet::Packet;
use crate::wire::{Ipv4Address, MacAddr};

bitflags::bitflags! {
	/// Validations and framing steps the hardware performs itself.
	///
	/// A set bit means the stack skips the corresponding software path.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DriverCaps: u32 {
		/// Short frames are rejected by the hardware.
		const ETH_MIN_FRAME_SIZE = 1 << 0;
		/// The FCS is appended by the hardware on transmit.
		const ETH_CS_COMPUTATION = 1 << 1;
		/// The FCS is verified by the hardware on receive.
		const ETH_CS_CHECK = 1 << 2;
		/// Frames are padded to the minimum size by the hardware.
		const ETH_FRAME_PADDING = 1 << 3;
		/// Destination MAC filtering is done by the hardware.
		const DEST_MAC_ADDR_CHECK = 1 << 4;
		/// The IPv4 header checksum is verified by the hardware.
		const IPV4_CS_CHECK = 1 << 5;
		/// Destination address filtering is done by the hardware.
		const IPV4_ADDRESS_CHECK = 1 << 6;
		/// The UDP checksum is verified by the hardware.
		const UDP_IPV4_CS_CHECK = 1 << 7;
		/// The TCP checksum is verified by the hardware.
		const TCP_IPV4_CS_CHECK = 1 << 8;
	}
}

/// Link state reported by a driver or PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LinkState {
	Down = 0,
	AutoNego,
	Up,
	Up10Hd,
	Up10Fd,
	Up100Hd,
	Up100Fd,
	Up1000Fd,
}

impl LinkState {
	pub fn is_up(self) -> bool {
		!matches!(self, LinkState::Down | LinkState::AutoNego)
	}
}

/// Completion callbacks handed to a driver at [`NetDriver::init`] time.
///
/// The ISR side of a driver moves buffers between its rings and its
/// completion queues under its own short critical section, then signals the
/// interface task through these callbacks. No stack state is touched here.
#[derive(Debug, Clone)]
pub struct DriverCallbacks {
	events: FlagSet,
}

impl DriverCallbacks {
	pub(crate) fn new(events: FlagSet) -> Self {
		Self { events }
	}

	/// A received packet has been placed on the driver's Rx-done queue.
	pub fn packet_received(&self, _from_isr: bool) {
		self.events.set(IfaceEvent::RX_DONE.bits());
	}

	/// A transmitted packet has been placed on the driver's Tx-done queue.
	pub fn packet_sent(&self, _from_isr: bool) {
		self.events.set(IfaceEvent::TX_DONE.bits());
	}
}

/// A network interface driver.
pub trait NetDriver: Send {
	/// Stores the completion callbacks and prepares the hardware.
	fn init(&mut self, callbacks: DriverCallbacks) -> Result<()>;

	fn start(&mut self) -> Result<()>;

	fn stop(&mut self) -> Result<()>;

	/// Programs the hardware unicast filter. Optional.
	fn set_mac_address(&mut self, _mac: MacAddr) -> Result<()> {
		Ok(())
	}

	/// Informs hardware with IPv4 offloads of the local address. Optional.
	fn set_ipv4_address(
		&mut self,
		_address: Ipv4Address,
		_netmask: Ipv4Address,
		_gateway: Ipv4Address,
	) -> Result<()> {
		Ok(())
	}

	/// Queues a frame for transmission. The driver owns the packet until it
	/// reappears on the Tx-done queue.
	fn send_packet(&mut self, packet: Packet) -> Result<()>;

	/// Gives a buffer to the receive ring.
	fn add_rx_packet(&mut self, packet: Packet) -> Result<()>;

	/// Dequeues the next completed received packet.
	fn next_rx_packet(&mut self) -> Option<Packet>;

	/// Dequeues the next completed transmitted packet.
	fn next_tx_packet(&mut self) -> Option<Packet>;

	/// Current link state. MAC drivers with an external PHY typically
	/// answer through a [`phy::PhyDriver`] over their MDIO bus.
	fn link_state(&self) -> LinkState;

	/// Validations the hardware performs; see [`DriverCaps`].
	fn capabilities(&self) -> DriverCaps;
}
