//! IPv4: header validation, protocol dispatch and the outgoing send
//! sequencer.
//!
//! Sending is mediated by pooled *send handles*. A handle is busy while the
//! next-hop MAC resolution is outstanding; completion or failure is
//! reported asynchronously to the protocol owning the handle.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::net::ethernet::{self, ETHERNET_HEADER_SIZE, EthHeader};
use crate::net::iface::IfaceId;
use crate::net::{StackCore, arp, route};
use crate::packet::Packet;
use crate::util::Pool;
use crate::wire::{self, Ipv4Address, MacAddr};

/// IPv4 header size in bytes, without options.
pub const IPV4_MIN_HEADER_SIZE: usize = 20;

/// Minimum size of a frame carrying an IPv4 packet.
const IPV4_MIN_PACKET_SIZE: usize = ETHERNET_HEADER_SIZE + IPV4_MIN_HEADER_SIZE;

/// Version 4, IHL 5.
const IPV4_VERSION_IHL_FIELD: u8 = 0x45;

/// Default time-to-live.
const IPV4_DEFAULT_TTL_FIELD: u8 = 0x80;

/// Offset of the source address field within the IPv4 header.
pub(crate) const IPV4_SOURCE_ADDRESS_OFFSET: usize = 12;

/// A decoded (Rx) or prepared (Tx) IPv4 header.
///
/// On the send path a zero `src_address` means "use the address of the
/// transmitting interface" and `data_length` is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4Header {
	pub src_address: Ipv4Address,
	pub dest_address: Ipv4Address,
	pub data_length: usize,
	pub protocol: u8,
}

/// Registered IPv4 payload protocols.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Ipv4Proto {
	#[cfg(feature = "icmp")]
	Icmp,
	#[cfg(feature = "udp")]
	Udp,
	#[cfg(feature = "tcp")]
	Tcp,
}

/// Modules driven from the IPv4 share of the periodic tick.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Ipv4Periodic {
	#[cfg(feature = "icmp-ping")]
	Icmp,
	#[cfg(feature = "tcp")]
	Tcp,
}

/// Protocol owning an IPv4 send handle; send completions are routed here.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Ipv4Owner {
	#[cfg(feature = "icmp")]
	Icmp,
	#[cfg(feature = "icmp-ping")]
	Ping(usize),
	#[cfg(feature = "udp")]
	Udp(usize),
	#[cfg(feature = "tcp")]
	Tcp(usize),
}

/// Identifier of a pooled IPv4 send handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4HandleId(pub(crate) usize);

pub(crate) struct Ipv4Handle {
	owner: Ipv4Owner,
	busy: bool,
	header: Ipv4Header,
	iface: Option<IfaceId>,
	/// In-flight packet parked while ARP resolves the next hop.
	packet: Option<Packet>,
	dest_mac: MacAddr,
}

/// Outcome of a successful [`send_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
	/// The frame went to the driver.
	Sent,
	/// Parked behind ARP; the owner is notified on completion.
	Pending,
}

pub(crate) struct Ipv4Module {
	protocols: SmallVec<[(u8, Ipv4Proto); 3]>,
	periodic: SmallVec<[Ipv4Periodic; 2]>,
	handles: Pool<Ipv4Handle>,
}

impl Ipv4Module {
	pub(crate) fn new() -> Self {
		Self {
			protocols: SmallVec::new(),
			periodic: SmallVec::new(),
			handles: Pool::new(),
		}
	}
}

pub(crate) fn init(core: &mut StackCore) {
	ethernet::add_protocol(core, wire::ETHERTYPE_IPV4, ethernet::EtherProtocol::Ipv4);
	ethernet::register_periodic(core, ethernet::EthPeriodic::Ipv4);

	// The limited broadcast address always short-circuits ARP lookup.
	let _ = arp::add_entry(
		core,
		arp::ArpEntryKind::Static,
		MacAddr::BROADCAST,
		Ipv4Address::BROADCAST,
	);
}

pub(crate) fn add_protocol(core: &mut StackCore, protocol: u8, handler: Ipv4Proto) {
	core.ipv4.protocols.push((protocol, handler));
}

pub(crate) fn register_periodic(core: &mut StackCore, periodic: Ipv4Periodic) {
	core.ipv4.periodic.push(periodic);
}

/// Creates a send handle owned by `owner`.
pub(crate) fn create_handle(core: &mut StackCore, owner: Ipv4Owner) -> Ipv4HandleId {
	Ipv4HandleId(core.ipv4.handles.insert(Ipv4Handle {
		owner,
		busy: false,
		header: Ipv4Header::default(),
		iface: None,
		packet: None,
		dest_mac: MacAddr::default(),
	}))
}

/// Releases a send handle, cancelling any outstanding ARP resolution.
pub(crate) fn release_handle(core: &mut StackCore, handle: Ipv4HandleId) {
	let busy = core
		.ipv4
		.handles
		.get(handle.0)
		.is_some_and(|entry| entry.busy);
	if busy {
		arp::cancel_for_ipv4_handle(core, handle);
	}
	core.ipv4.handles.remove(handle.0);
}

/// Allocates a Tx buffer with Ethernet and IPv4 header space reserved.
pub fn allocate_packet(core: &mut StackCore, payload_size: usize) -> Result<Packet> {
	let mut packet = ethernet::allocate_packet(core, payload_size + IPV4_MIN_HEADER_SIZE)?;
	packet.write_skip(IPV4_MIN_HEADER_SIZE);
	Ok(packet)
}

/// Is the handle free to start another send?
pub(crate) fn handle_is_ready(core: &StackCore, handle: Ipv4HandleId) -> Result<()> {
	match core.ipv4.handles.get(handle.0) {
		Some(entry) if entry.busy => Err(Error::Busy),
		Some(_) => Ok(()),
		None => Err(Error::InvalidArg),
	}
}

/// Sends an IPv4 frame through `handle`.
///
/// The route is taken from the packet's interface binding when present,
/// otherwise from the route table. On any error the packet has been
/// released. [`SendStatus::Pending`] means the next hop is being resolved;
/// the owning protocol hears about the outcome through its completion
/// callback.
pub(crate) fn send_packet(
	core: &mut StackCore,
	handle: Ipv4HandleId,
	header: &Ipv4Header,
	packet: Packet,
) -> Result<SendStatus> {
	match handle_is_ready(core, handle) {
		Ok(()) => {}
		Err(error) => {
			ethernet::release_packet(core, packet);
			return Err(error);
		}
	}

	let routed = match packet.net_if() {
		Some(iface) => Ok((Ipv4Address::ANY, iface)),
		None => route::search(core, header.dest_address),
	};
	let (gateway, iface) = match routed {
		Ok(route) => route,
		Err(error) => {
			log::debug!("no route to {}", header.dest_address);
			ethernet::release_packet(core, packet);
			return Err(error);
		}
	};

	let src_address = if header.src_address.is_unspecified() {
		core.ifaces
			.get(iface)
			.map(|netif| netif.ipv4)
			.unwrap_or_default()
	} else {
		header.src_address
	};

	let entry = core.ipv4.handles.get_mut(handle.0).unwrap();
	entry.header = Ipv4Header {
		src_address,
		dest_address: header.dest_address,
		data_length: 0,
		protocol: header.protocol,
	};
	entry.iface = Some(iface);
	entry.packet = Some(packet);

	let next_hop = if gateway.is_unspecified() {
		header.dest_address
	} else {
		gateway
	};

	match arp::request(core, iface, next_hop, arp::ArpClient::Ipv4(handle)) {
		Ok(arp::ArpResolution::Resolved(mac)) => {
			core.ipv4.handles.get_mut(handle.0).unwrap().dest_mac = mac;
			finalize_send(core, handle).map(|_| SendStatus::Sent)
		}
		Ok(arp::ArpResolution::Pending(_)) => {
			core.ipv4.handles.get_mut(handle.0).unwrap().busy = true;
			Ok(SendStatus::Pending)
		}
		Err(error) => {
			let parked = core.ipv4.handles.get_mut(handle.0).unwrap().packet.take();
			if let Some(parked) = parked {
				ethernet::release_packet(core, parked);
			}
			Err(error)
		}
	}
}

/// ARP completion for a parked handle.
pub(crate) fn arp_resolved(core: &mut StackCore, handle: Ipv4HandleId, mac: Option<MacAddr>) {
	let Some(entry) = core.ipv4.handles.get_mut(handle.0) else {
		return;
	};
	let owner = entry.owner;

	let result = match mac {
		Some(mac) => {
			entry.dest_mac = mac;
			finalize_send(core, handle)
		}
		None => {
			let parked = entry.packet.take();
			if let Some(parked) = parked {
				ethernet::release_packet(core, parked);
			}
			Err(Error::ArpFailure)
		}
	};

	if let Some(entry) = core.ipv4.handles.get_mut(handle.0) {
		entry.busy = false;
	}
	notify_owner(core, owner, result);
}

/// Fills the IPv4 header and the Ethernet header, then transmits.
fn finalize_send(core: &mut StackCore, handle: Ipv4HandleId) -> Result<()> {
	let entry = core.ipv4.handles.get_mut(handle.0).ok_or(Error::InvalidArg)?;
	let header = entry.header;
	let iface = entry.iface.ok_or(Error::InvalidArg)?;
	let dest_mac = entry.dest_mac;
	let mut packet = entry.packet.take().ok_or(Error::InvalidArg)?;

	if let Err(error) = fill_header(&header, &mut packet) {
		ethernet::release_packet(core, packet);
		return Err(error);
	}

	let src_mac = core
		.ifaces
		.get(iface)
		.map(|netif| netif.mac)
		.unwrap_or_default();
	let eth_header = EthHeader {
		dest_address: dest_mac,
		src_address: src_mac,
		ether_type: wire::ETHERTYPE_IPV4,
	};
	ethernet::send_packet(core, iface, &eth_header, packet)
}

/// Writes the IPv4 header into its reserved space and patches the
/// checksum, leaving cursor and count untouched.
fn fill_header(header: &Ipv4Header, packet: &mut Packet) -> Result<()> {
	if packet.count() < IPV4_MIN_PACKET_SIZE {
		return Err(Error::PacketTooShort);
	}

	let total_length = (packet.count() - ETHERNET_HEADER_SIZE) as u16;
	let position = packet.position();

	packet.seek(ETHERNET_HEADER_SIZE);
	packet.write_u8_no_count(IPV4_VERSION_IHL_FIELD);
	packet.write_u8_no_count(0x00);
	packet.write_u16_no_count(total_length);
	packet.write_u32_no_count(0x0000_0000);
	packet.write_u8_no_count(IPV4_DEFAULT_TTL_FIELD);
	packet.write_u8_no_count(header.protocol);
	let checksum_position = packet.position();
	packet.write_u16_no_count(0x0000);
	packet.write_u32_no_count(header.src_address.0);
	packet.write_u32_no_count(header.dest_address.0);

	let header_region =
		&packet.as_bytes()[ETHERNET_HEADER_SIZE..ETHERNET_HEADER_SIZE + IPV4_MIN_HEADER_SIZE];
	let checksum = wire::internet_checksum(&[], header_region);
	packet.seek(checksum_position);
	packet.write_u16_no_count(checksum);

	packet.seek(position);
	Ok(())
}

/// Handles a received IPv4 frame.
pub(crate) fn rx_frame(
	core: &mut StackCore,
	iface: IfaceId,
	_eth_header: &EthHeader,
	mut packet: Packet,
) -> (Result<()>, Option<Packet>) {
	use crate::drivers::net::DriverCaps;

	if packet.count() < IPV4_MIN_HEADER_SIZE {
		return (Err(Error::PacketTooShort), Some(packet));
	}

	let Some(netif) = core.ifaces.get(iface) else {
		return (Err(Error::InvalidArg), Some(packet));
	};
	let caps = netif.caps;
	let our_address = netif.ipv4;

	let header_start = packet.position();
	let version_ihl = packet.read_u8();
	let header_length = usize::from(version_ihl & 0x0F) * 4;
	if header_length < IPV4_MIN_HEADER_SIZE || header_length > packet.count() + 1 {
		return (Err(Error::PacketTooShort), Some(packet));
	}
	packet.read_skip(1); // tos
	let total_length = usize::from(packet.read_u16());
	packet.read_skip(2); // identification: fragmented packets are dropped
	let fragment = packet.read_u16();

	// More-fragments flag or a non-zero offset: drop silently.
	if fragment & 0x3FFF != 0 {
		return (Err(Error::IgnorePacket), Some(packet));
	}

	packet.read_skip(1); // ttl
	let protocol = packet.read_u8();
	packet.read_skip(2); // checksum
	let src_address = Ipv4Address(packet.read_u32());
	let dest_address = Ipv4Address(packet.read_u32());

	if !caps.contains(DriverCaps::IPV4_CS_CHECK) {
		let header_region = &packet.as_bytes()[header_start..header_start + header_length];
		if wire::internet_checksum(&[], header_region) != 0 {
			return (Err(Error::InvalidChecksum), Some(packet));
		}
	}

	if !caps.contains(DriverCaps::IPV4_ADDRESS_CHECK)
		&& our_address.0 & dest_address.0 != our_address.0
	{
		return (Err(Error::IgnorePacket), Some(packet));
	}

	let handler = core
		.ipv4
		.protocols
		.iter()
		.find(|(registered, _)| *registered == protocol)
		.map(|(_, handler)| *handler);
	let Some(handler) = handler else {
		return (Err(Error::ProtocolNotFound), Some(packet));
	};

	// Skip header options.
	packet.read_skip(header_length - IPV4_MIN_HEADER_SIZE);

	let header = Ipv4Header {
		src_address,
		dest_address,
		data_length: total_length.saturating_sub(header_length),
		protocol,
	};

	match handler {
		#[cfg(feature = "icmp")]
		Ipv4Proto::Icmp => crate::net::icmp::rx_frame(core, iface, &header, packet),
		#[cfg(feature = "udp")]
		Ipv4Proto::Udp => crate::net::udp::rx_frame(core, iface, &header, packet),
		#[cfg(feature = "tcp")]
		Ipv4Proto::Tcp => crate::net::tcp::rx_frame(core, iface, &header, packet),
	}
}

/// Routes a send completion to the protocol owning the handle.
fn notify_owner(core: &mut StackCore, owner: Ipv4Owner, result: Result<()>) {
	match owner {
		#[cfg(feature = "icmp")]
		Ipv4Owner::Icmp => {}
		#[cfg(feature = "icmp-ping")]
		Ipv4Owner::Ping(ping) => crate::net::icmp::ping_send_complete(core, ping, result),
		#[cfg(feature = "udp")]
		Ipv4Owner::Udp(handle) => crate::net::udp::ipv4_send_complete(core, handle, result),
		#[cfg(feature = "tcp")]
		Ipv4Owner::Tcp(handle) => crate::net::tcp::ipv4_send_complete(core, handle, result),
	}
}

/// Runs the registered periodic callbacks.
pub(crate) fn periodic_task(core: &mut StackCore, timestamp: u32) {
	for index in 0..core.ipv4.periodic.len() {
		match core.ipv4.periodic[index] {
			#[cfg(feature = "icmp-ping")]
			Ipv4Periodic::Icmp => crate::net::icmp::periodic_task(core, timestamp),
			#[cfg(feature = "tcp")]
			Ipv4Periodic::Tcp => crate::net::tcp::periodic_task(core, timestamp),
		}
	}
}
