//! Packet buffers, the cursor codec and the allocator contract.
//!
//! A [`Packet`] is a raw byte region with a cursor. Encoders reserve header
//! space by skipping forward, write their payload, then rewind and patch the
//! header in place; decoders consume fields front to back. All multi-byte
//! accessors use network byte order.

use alloc::boxed::Box;
use alloc::collections::vec_deque::VecDeque;
use alloc::vec::Vec;

use hermit_sync::SpinMutex;

use crate::error::{Error, Result};
use crate::net::iface::IfaceId;

bitflags::bitflags! {
	/// Lifecycle flags of a packet buffer.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PacketFlags: u32 {
		/// The buffer is used for reception.
		const RX = 1;
		/// The buffer is used for transmission.
		const TX = 2;
		/// A receiver took ownership of the buffer; do not release it.
		const KEEP = 4;
		/// The transfer of the buffer failed.
		const ERROR = 128;
	}
}

/// A network packet buffer.
///
/// Invariant: `current <= capacity`. On a buffer freshly produced by an
/// allocator the cursor is at the start and `count` is zero; on an Rx buffer
/// delivered to the stack `count` is the number of valid bytes reported by
/// the driver.
#[derive(Debug)]
pub struct Packet {
	data: Box<[u8]>,
	current: usize,
	count: usize,
	pub flags: PacketFlags,
	/// Interface which received the packet (Rx) or will transmit it (Tx).
	pub(crate) net_if: Option<IfaceId>,
	/// Pool index of the TCP connection retaining this buffer across
	/// transmit completion, when [`PacketFlags::KEEP`] is set on a Tx buffer.
	#[cfg(feature = "tcp")]
	pub(crate) keeper: Option<usize>,
}

impl Packet {
	/// Wraps a raw buffer into a packet with the cursor at the start.
	pub fn new(data: Box<[u8]>) -> Self {
		Self {
			data,
			current: 0,
			count: 0,
			flags: PacketFlags::empty(),
			net_if: None,
			#[cfg(feature = "tcp")]
			keeper: None,
		}
	}

	/// Total capacity of the underlying buffer in bytes.
	pub fn capacity(&self) -> usize {
		self.data.len()
	}

	/// Number of logically valid bytes.
	pub fn count(&self) -> usize {
		self.count
	}

	/// Byte offset of the cursor from the start of the buffer.
	pub fn position(&self) -> usize {
		self.current
	}

	/// The bytes between the cursor and the end of the valid region.
	pub fn contents(&self) -> &[u8] {
		&self.data[self.current..self.current + self.count]
	}

	/// The whole underlying buffer.
	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}

	/// Mutable access to the whole underlying buffer, for drivers filling
	/// receive buffers.
	pub fn as_bytes_mut(&mut self) -> &mut [u8] {
		&mut self.data
	}

	/// Moves the cursor to an absolute offset.
	pub fn seek(&mut self, position: usize) {
		debug_assert!(position <= self.data.len());
		self.current = position;
	}

	/// Rewinds the cursor to the start of the buffer.
	pub fn rewind(&mut self) {
		self.current = 0;
	}

	/// Sets the number of logically valid bytes.
	pub fn set_count(&mut self, count: usize) {
		self.count = count;
	}

	/// Interface the packet is associated with.
	pub fn net_if(&self) -> Option<IfaceId> {
		self.net_if
	}

	/// Associates the packet with an interface, bypassing route selection
	/// on the send path.
	pub fn set_net_if(&mut self, iface: IfaceId) {
		self.net_if = Some(iface);
	}

	pub fn read_u8(&mut self) -> u8 {
		let value = self.data[self.current];
		self.current += 1;
		self.count -= 1;
		value
	}

	pub fn read_u16(&mut self) -> u16 {
		let value = u16::from_be_bytes([self.data[self.current], self.data[self.current + 1]]);
		self.current += 2;
		self.count -= 2;
		value
	}

	pub fn read_u32(&mut self) -> u32 {
		let value = u32::from_be_bytes(
			self.data[self.current..self.current + 4].try_into().unwrap(),
		);
		self.current += 4;
		self.count -= 4;
		value
	}

	pub fn read_into(&mut self, buffer: &mut [u8]) {
		buffer.copy_from_slice(&self.data[self.current..self.current + buffer.len()]);
		self.current += buffer.len();
		self.count -= buffer.len();
	}

	/// Advances the cursor over `size` bytes without reading them.
	pub fn read_skip(&mut self, size: usize) {
		self.current += size;
		self.count -= size;
	}

	pub fn write_u8(&mut self, value: u8) {
		self.write_u8_no_count(value);
		self.count += 1;
	}

	pub fn write_u8_no_count(&mut self, value: u8) {
		self.data[self.current] = value;
		self.current += 1;
	}

	pub fn write_u16(&mut self, value: u16) {
		self.write_u16_no_count(value);
		self.count += 2;
	}

	pub fn write_u16_no_count(&mut self, value: u16) {
		self.data[self.current..self.current + 2].copy_from_slice(&value.to_be_bytes());
		self.current += 2;
	}

	pub fn write_u32(&mut self, value: u32) {
		self.write_u32_no_count(value);
		self.count += 4;
	}

	pub fn write_u32_no_count(&mut self, value: u32) {
		self.data[self.current..self.current + 4].copy_from_slice(&value.to_be_bytes());
		self.current += 4;
	}

	pub fn write_slice(&mut self, buffer: &[u8]) {
		self.write_slice_no_count(buffer);
		self.count += buffer.len();
	}

	pub fn write_slice_no_count(&mut self, buffer: &[u8]) {
		self.data[self.current..self.current + buffer.len()].copy_from_slice(buffer);
		self.current += buffer.len();
	}

	/// Advances the cursor over `size` bytes, growing the valid region.
	/// Used to reserve header space before the payload is written.
	pub fn write_skip(&mut self, size: usize) {
		self.current += size;
		self.count += size;
	}

	pub fn write_zeros(&mut self, size: usize) {
		self.data[self.current..self.current + size].fill(0);
		self.write_skip(size);
	}
}

/// A FIFO queue of packets.
#[derive(Debug, Default)]
pub struct PacketQueue(VecDeque<Packet>);

impl PacketQueue {
	pub const fn new() -> Self {
		Self(VecDeque::new())
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn push(&mut self, packet: Packet) {
		self.0.push_back(packet);
	}

	pub fn pop(&mut self) -> Option<Packet> {
		self.0.pop_front()
	}

	pub fn head(&self) -> Option<&Packet> {
		self.0.front()
	}

	pub fn head_mut(&mut self) -> Option<&mut Packet> {
		self.0.front_mut()
	}

	pub fn drain(&mut self) -> impl Iterator<Item = Packet> + '_ {
		self.0.drain(..)
	}
}

/// The allocator contract seen by the stack.
///
/// The core calls exactly these two operations: buffers are handed out on
/// the Tx path or primed into driver Rx rings, and given back exactly once
/// when the stack is done with them.
pub trait PacketAllocator: Send + Sync {
	fn allocate(&self, size: usize) -> Result<Packet>;
	fn release(&self, packet: Packet);
}

/// The reference two-pool allocator.
///
/// Small requests are served from the small pool and fall back to the big
/// pool when it is empty; requests larger than a big buffer fail with
/// [`Error::PacketTooBig`]. All buffers are carved up front so allocation
/// never touches the heap after construction.
pub struct BigSmallAllocator {
	big_size: usize,
	small_size: usize,
	pools: SpinMutex<Pools>,
}

struct Pools {
	big: Vec<Box<[u8]>>,
	small: Vec<Box<[u8]>>,
}

impl BigSmallAllocator {
	pub fn new(big_size: usize, big_count: usize, small_size: usize, small_count: usize) -> Self {
		assert!(small_size < big_size);
		let big = (0..big_count)
			.map(|_| alloc::vec![0u8; big_size].into_boxed_slice())
			.collect();
		let small = (0..small_count)
			.map(|_| alloc::vec![0u8; small_size].into_boxed_slice())
			.collect();
		Self {
			big_size,
			small_size,
			pools: SpinMutex::new(Pools { big, small }),
		}
	}

	/// Number of currently free `(big, small)` buffers.
	pub fn free_buffers(&self) -> (usize, usize) {
		let pools = self.pools.lock();
		(pools.big.len(), pools.small.len())
	}
}

impl PacketAllocator for BigSmallAllocator {
	fn allocate(&self, size: usize) -> Result<Packet> {
		if size > self.big_size {
			return Err(Error::PacketTooBig);
		}

		let mut pools = self.pools.lock();
		let buffer = if size <= self.small_size {
			pools.small.pop().or_else(|| pools.big.pop())
		} else {
			pools.big.pop()
		};

		buffer.map(Packet::new).ok_or(Error::Resource)
	}

	fn release(&self, packet: Packet) {
		let Packet { data, .. } = packet;
		let mut pools = self.pools.lock();
		if data.len() == self.small_size {
			pools.small.push(data);
		} else {
			debug_assert_eq!(data.len(), self.big_size);
			pools.big.push(data);
		}
	}
}
