//! UDP: bind table, checksum handling and receive dispatch.

use alloc::boxed::Box;

use crate::error::{Error, Result};
use crate::net::ethernet::{self, ETHERNET_HEADER_SIZE};
use crate::net::iface::IfaceId;
use crate::net::ipv4::{self, IPV4_SOURCE_ADDRESS_OFFSET, Ipv4Header};
use crate::net::{RxDisposition, StackCore, route};
use crate::packet::Packet;
use crate::util::Pool;
use crate::wire::{self, Endpoint, Ipv4Address};

/// UDP header size in bytes.
pub const UDP_HEADER_SIZE: usize = 8;

/// Identifier of a UDP handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHandleId(pub(crate) usize);

/// Decoded UDP endpoints of a received datagram.
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
	pub src: Endpoint,
	pub dest: Endpoint,
}

/// Receiver of UDP handle events.
///
/// Handlers run with the stack mutex held and may call back into the core
/// through the `&mut StackCore` they are given.
pub trait UdpEventHandler: Send {
	/// A datagram arrived for the bound port. The cursor of `packet` sits
	/// at the payload start and `count` is the payload length.
	fn on_rx(
		&mut self,
		core: &mut StackCore,
		handle: UdpHandleId,
		header: &UdpHeader,
		packet: Packet,
	) -> RxDisposition;

	/// A deferred send completed.
	fn on_tx(&mut self, _core: &mut StackCore, _handle: UdpHandleId) {}

	/// A deferred send failed; `error` is typically
	/// [`Error::ArpFailure`](crate::Error::ArpFailure).
	fn on_tx_failed(&mut self, _core: &mut StackCore, _handle: UdpHandleId, _error: Error) {}
}

pub(crate) struct UdpHandle {
	pub(crate) ipv4_handle: ipv4::Ipv4HandleId,
	pub(crate) address: Ipv4Address,
	pub(crate) port: u16,
	pub(crate) is_bound: bool,
	handler: Option<Box<dyn UdpEventHandler>>,
}

pub(crate) struct UdpModule {
	pub(crate) handles: Pool<UdpHandle>,
}

impl UdpModule {
	pub(crate) fn new() -> Self {
		Self { handles: Pool::new() }
	}
}

pub(crate) fn init(core: &mut StackCore) {
	ipv4::add_protocol(core, wire::IP_PROTO_UDP, ipv4::Ipv4Proto::Udp);
}

/// Creates a handle delivering events to `handler`.
pub fn open(core: &mut StackCore, handler: Box<dyn UdpEventHandler>) -> Result<UdpHandleId> {
	let id = core.udp.handles.insert(UdpHandle {
		ipv4_handle: ipv4::Ipv4HandleId(0),
		address: Ipv4Address::ANY,
		port: 0,
		is_bound: false,
		handler: Some(handler),
	});
	let ipv4_handle = ipv4::create_handle(core, ipv4::Ipv4Owner::Udp(id));
	core.udp.handles.get_mut(id).unwrap().ipv4_handle = ipv4_handle;
	Ok(UdpHandleId(id))
}

/// Releases a handle, unbinding it first if needed.
pub fn release(core: &mut StackCore, handle: UdpHandleId) -> Result<()> {
	let Some(entry) = core.udp.handles.get(handle.0) else {
		return Err(Error::InvalidArg);
	};
	let ipv4_handle = entry.ipv4_handle;
	ipv4::release_handle(core, ipv4_handle);
	core.udp.handles.remove(handle.0);
	Ok(())
}

/// Binds the handle; the pair `(address, port)` must be unique.
pub fn bind(
	core: &mut StackCore,
	handle: UdpHandleId,
	address: Ipv4Address,
	port: u16,
) -> Result<()> {
	let in_use = core.udp.handles.iter().any(|(id, other)| {
		id != handle.0 && other.is_bound && other.port == port && other.address == address
	});
	if in_use {
		return Err(Error::AddressInUse);
	}

	let Some(entry) = core.udp.handles.get_mut(handle.0) else {
		return Err(Error::InvalidArg);
	};
	entry.address = address;
	entry.port = port;
	entry.is_bound = true;
	Ok(())
}

/// Removes the handle from the bind table.
pub fn unbind(core: &mut StackCore, handle: UdpHandleId) -> Result<()> {
	match core.udp.handles.get_mut(handle.0) {
		Some(entry) => {
			entry.is_bound = false;
			Ok(())
		}
		None => Err(Error::InvalidArg),
	}
}

/// Is the handle free to start another send?
pub fn handle_is_ready(core: &StackCore, handle: UdpHandleId) -> Result<()> {
	let entry = core.udp.handles.get(handle.0).ok_or(Error::InvalidArg)?;
	ipv4::handle_is_ready(core, entry.ipv4_handle)
}

/// Allocates a Tx buffer with all header space reserved and `count` zeroed
/// so that it tracks the payload alone.
pub fn allocate_packet(core: &mut StackCore, payload_size: usize) -> Result<Packet> {
	let mut packet = ipv4::allocate_packet(core, payload_size + UDP_HEADER_SIZE)?;
	packet.write_skip(UDP_HEADER_SIZE);
	packet.set_count(0);
	Ok(packet)
}

/// Sends a datagram to `(address, port)`.
///
/// The packet must come from [`allocate_packet`] with the payload written
/// behind the reserved headers. On any error the packet has been released;
/// [`ipv4::SendStatus::Pending`] means the datagram is parked behind ARP
/// and the handler's `on_tx`/`on_tx_failed` reports the outcome.
pub fn send_packet(
	core: &mut StackCore,
	handle: UdpHandleId,
	address: Ipv4Address,
	port: u16,
	mut packet: Packet,
) -> Result<ipv4::SendStatus> {
	let Some(entry) = core.udp.handles.get(handle.0) else {
		ethernet::release_packet(core, packet);
		return Err(Error::InvalidArg);
	};
	let local_port = entry.port;
	let bound_address = entry.address;
	let ipv4_handle = entry.ipv4_handle;

	let udp_length = packet.count() + UDP_HEADER_SIZE;
	let frame_length = packet.position();
	let header_start = frame_length - udp_length;

	packet.seek(header_start);
	packet.write_u16_no_count(local_port);
	packet.write_u16_no_count(port);
	packet.write_u16_no_count(udp_length as u16);
	let checksum_position = packet.position();
	packet.write_u16_no_count(0x0000);

	// Source address: the bound address, or the routed interface's when
	// bound to ANY.
	let src_address = if bound_address.is_unspecified() {
		let iface = match packet.net_if() {
			Some(iface) => Some(iface),
			None => route::search(core, address).ok().map(|(_, iface)| iface),
		};
		iface
			.and_then(|iface| core.ifaces.get(iface))
			.map(|netif| netif.ipv4)
			.unwrap_or_default()
	} else {
		bound_address
	};

	let header = Ipv4Header {
		src_address,
		dest_address: address,
		data_length: 0,
		protocol: wire::IP_PROTO_UDP,
	};

	#[cfg(feature = "udp-checksum")]
	{
		let pseudo =
			wire::pseudo_header(src_address, address, wire::IP_PROTO_UDP, udp_length as u16);
		let region = &packet.as_bytes()[header_start..header_start + udp_length];
		let checksum = wire::internet_checksum(&pseudo, region);
		packet.seek(checksum_position);
		packet.write_u16_no_count(checksum);
	}
	#[cfg(not(feature = "udp-checksum"))]
	let _ = checksum_position;

	packet.seek(frame_length);
	packet.set_count(frame_length);

	ipv4::send_packet(core, ipv4_handle, &header, packet)
}

/// Recovers the source endpoint of a received datagram whose cursor sits
/// at the payload start.
pub fn read_header(packet: &Packet) -> Endpoint {
	let udp_header_start = packet.position() - UDP_HEADER_SIZE;
	let ipv4_src = ETHERNET_HEADER_SIZE + IPV4_SOURCE_ADDRESS_OFFSET;
	let bytes = packet.as_bytes();
	let address = Ipv4Address(u32::from_be_bytes(
		bytes[ipv4_src..ipv4_src + 4].try_into().unwrap(),
	));
	let port = u16::from_be_bytes([bytes[udp_header_start], bytes[udp_header_start + 1]]);
	Endpoint::new(address, port)
}

/// Handles a received UDP frame.
pub(crate) fn rx_frame(
	core: &mut StackCore,
	iface: IfaceId,
	ipv4_header: &Ipv4Header,
	mut packet: Packet,
) -> (Result<()>, Option<Packet>) {
	if packet.count() < UDP_HEADER_SIZE {
		return (Err(Error::PacketTooShort), Some(packet));
	}

	#[cfg(feature = "udp-checksum")]
	let header_start = packet.position();

	let src_port = packet.read_u16();
	let dest_port = packet.read_u16();
	let total = usize::from(packet.read_u16());
	let Some(length) = total.checked_sub(UDP_HEADER_SIZE) else {
		return (Err(Error::PacketTooShort), Some(packet));
	};
	let checksum = packet.read_u16();

	#[cfg(feature = "udp-checksum")]
	{
		use crate::drivers::net::DriverCaps;

		let caps = core
			.ifaces
			.get(iface)
			.map(|netif| netif.caps)
			.unwrap_or(DriverCaps::empty());
		// A zero checksum means the sender did not compute one.
		if checksum != 0 && !caps.contains(DriverCaps::UDP_IPV4_CS_CHECK) {
			let segment = length + UDP_HEADER_SIZE;
			if packet.as_bytes().len() < header_start + segment {
				return (Err(Error::PacketTooShort), Some(packet));
			}
			let pseudo = wire::pseudo_header(
				ipv4_header.src_address,
				ipv4_header.dest_address,
				wire::IP_PROTO_UDP,
				segment as u16,
			);
			let region = &packet.as_bytes()[header_start..header_start + segment];
			if wire::internet_checksum(&pseudo, region) != 0 {
				return (Err(Error::InvalidChecksum), Some(packet));
			}
		}
	}
	#[cfg(not(feature = "udp-checksum"))]
	{
		let _ = (checksum, iface);
	}

	if length > packet.count() {
		return (Err(Error::PacketTooShort), Some(packet));
	}
	// Trim Ethernet padding.
	packet.set_count(length);

	let handle = core.udp.handles.iter().find_map(|(id, entry)| {
		let matches = entry.is_bound
			&& entry.port == dest_port
			&& entry.address.0 & ipv4_header.dest_address.0 == entry.address.0;
		matches.then_some(id)
	});
	let Some(handle) = handle else {
		return (Err(Error::IgnorePacket), Some(packet));
	};

	let header = UdpHeader {
		src: Endpoint::new(ipv4_header.src_address, src_port),
		dest: Endpoint::new(ipv4_header.dest_address, dest_port),
	};

	let Some(mut handler) = core
		.udp
		.handles
		.get_mut(handle)
		.and_then(|entry| entry.handler.take())
	else {
		return (Err(Error::IgnorePacket), Some(packet));
	};
	let disposition = handler.on_rx(core, UdpHandleId(handle), &header, packet);
	if let Some(entry) = core.udp.handles.get_mut(handle) {
		if entry.handler.is_none() {
			entry.handler = Some(handler);
		}
	}

	match disposition {
		RxDisposition::Release(packet) => (Ok(()), Some(packet)),
		RxDisposition::Kept => (Ok(()), None),
	}
}

/// Send-path completion from the IPv4 layer.
pub(crate) fn ipv4_send_complete(core: &mut StackCore, handle: usize, result: Result<()>) {
	let Some(mut handler) = core
		.udp
		.handles
		.get_mut(handle)
		.and_then(|entry| entry.handler.take())
	else {
		return;
	};

	match result {
		Ok(()) => handler.on_tx(core, UdpHandleId(handle)),
		Err(error) => handler.on_tx_failed(core, UdpHandleId(handle), error),
	}

	if let Some(entry) = core.udp.handles.get_mut(handle) {
		if entry.handler.is_none() {
			entry.handler = Some(handler);
		}
	}
}
