//! Ethernet framing, demultiplexing and the frame release path.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::net::iface::IfaceId;
use crate::net::{StackCore, arp, ipv4};
use crate::oal::time;
use crate::packet::{Packet, PacketFlags};
use crate::wire::{self, MacAddr};

/// Ethernet header size in bytes.
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Minimum Ethernet frame size in bytes, without the FCS.
pub const MIN_ETHERNET_FRAME_SIZE: usize = 60;

/// FCS size in bytes.
const ETHERNET_CS_SIZE: usize = 4;

/// A decoded Ethernet header.
#[derive(Debug, Clone, Copy)]
pub struct EthHeader {
	pub dest_address: MacAddr,
	pub src_address: MacAddr,
	pub ether_type: u16,
}

/// Registered Ethernet protocols. The registry is scanned linearly on
/// every received frame; disabled features leave their entry out.
#[derive(Debug, Clone, Copy)]
pub(crate) enum EtherProtocol {
	Arp,
	Ipv4,
}

/// Modules driven by the interface tick.
#[derive(Debug, Clone, Copy)]
pub(crate) enum EthPeriodic {
	Arp,
	Ipv4,
}

pub(crate) struct EthernetModule {
	protocols: SmallVec<[(u16, EtherProtocol); 2]>,
	periodic: SmallVec<[EthPeriodic; 2]>,
}

impl EthernetModule {
	pub(crate) fn new() -> Self {
		Self {
			protocols: SmallVec::new(),
			periodic: SmallVec::new(),
		}
	}
}

pub(crate) fn init(_core: &mut StackCore) {}

/// Registers a protocol for an ethertype.
pub(crate) fn add_protocol(core: &mut StackCore, ether_type: u16, protocol: EtherProtocol) {
	core.ethernet.protocols.push((ether_type, protocol));
}

/// Registers a periodic tick callback.
pub(crate) fn register_periodic(core: &mut StackCore, periodic: EthPeriodic) {
	core.ethernet.periodic.push(periodic);
}

/// Validates and dispatches a received frame.
///
/// Returns the packet for release unless a receiver kept it; the
/// accompanying result reports why a frame was dropped, with
/// [`Error::IgnorePacket`] for the silent cases.
pub(crate) fn rx_frame(
	core: &mut StackCore,
	iface: IfaceId,
	mut packet: Packet,
) -> (Result<()>, Option<Packet>) {
	let Some(netif) = core.ifaces.get(iface) else {
		return (Err(Error::InvalidArg), Some(packet));
	};
	let caps = netif.caps;
	let mac = netif.mac;

	use crate::drivers::net::DriverCaps;

	if !caps.contains(DriverCaps::ETH_MIN_FRAME_SIZE)
		&& packet.count() < MIN_ETHERNET_FRAME_SIZE
	{
		return (Err(Error::PacketTooShort), Some(packet));
	}

	if !caps.contains(DriverCaps::ETH_CS_CHECK) {
		// The FCS follows the valid region; check the residue over both.
		let with_fcs = packet.count() + ETHERNET_CS_SIZE;
		if packet.as_bytes().len() < with_fcs
			|| wire::ethernet_crc(&packet.as_bytes()[..with_fcs]) != wire::ETHERNET_CRC_RESIDUE
		{
			return (Err(Error::InvalidCrc), Some(packet));
		}
	}

	let mut dest_address = MacAddr::default();
	let mut src_address = MacAddr::default();
	packet.read_into(&mut dest_address.0);
	packet.read_into(&mut src_address.0);

	if !caps.contains(DriverCaps::DEST_MAC_ADDR_CHECK)
		&& dest_address != mac
		&& !dest_address.is_broadcast()
	{
		return (Err(Error::IgnorePacket), Some(packet));
	}

	let ether_type = packet.read_u16();
	let header = EthHeader {
		dest_address,
		src_address,
		ether_type,
	};

	let protocol = core
		.ethernet
		.protocols
		.iter()
		.find(|(registered, _)| *registered == ether_type)
		.map(|(_, protocol)| *protocol);

	match protocol {
		Some(EtherProtocol::Arp) => arp::rx_frame(core, iface, &header, packet),
		Some(EtherProtocol::Ipv4) => ipv4::rx_frame(core, iface, &header, packet),
		None => (Err(Error::ProtocolNotFound), Some(packet)),
	}
}

/// Allocates a Tx buffer with the Ethernet header area reserved.
pub fn allocate_packet(core: &mut StackCore, payload_size: usize) -> Result<Packet> {
	// Room for padding to the minimum frame size plus the FCS must always
	// exist, even when the payload is shorter.
	let total = (payload_size + ETHERNET_HEADER_SIZE + ETHERNET_CS_SIZE)
		.max(MIN_ETHERNET_FRAME_SIZE + ETHERNET_CS_SIZE);

	let mut packet = core.allocator.allocate(total)?;
	packet.flags = PacketFlags::TX;
	packet.write_skip(ETHERNET_HEADER_SIZE);
	Ok(packet)
}

/// Finalizes a frame (padding, header, FCS) and hands it to the driver.
pub(crate) fn send_packet(
	core: &mut StackCore,
	iface: IfaceId,
	header: &EthHeader,
	mut packet: Packet,
) -> Result<()> {
	let Some(netif) = core.ifaces.get_mut(iface) else {
		core.allocator.release(packet);
		return Err(Error::InvalidArg);
	};

	use crate::drivers::net::DriverCaps;

	if packet.count() < MIN_ETHERNET_FRAME_SIZE
		&& !netif.caps.contains(DriverCaps::ETH_FRAME_PADDING)
	{
		let position = packet.position();
		let padding = MIN_ETHERNET_FRAME_SIZE - packet.count();
		packet.as_bytes_mut()[position..position + padding].fill(0);
		packet.set_count(MIN_ETHERNET_FRAME_SIZE);
	}

	packet.rewind();
	packet.write_slice_no_count(&header.dest_address.0);
	packet.write_slice_no_count(&header.src_address.0);
	packet.write_u16_no_count(header.ether_type);

	if !netif.caps.contains(DriverCaps::ETH_CS_COMPUTATION) {
		let count = packet.count();
		let fcs = wire::ethernet_fcs(wire::ethernet_crc(&packet.as_bytes()[..count]));
		packet.as_bytes_mut()[count..count + ETHERNET_CS_SIZE].copy_from_slice(&fcs);
		packet.set_count(count + ETHERNET_CS_SIZE);
	}

	packet.net_if = Some(iface);
	netif.driver.send_packet(packet)
}

/// Releases a buffer the stack is done with.
///
/// Tx buffers flagged KEEP flow back to the TCP connection retaining them;
/// other Tx buffers return to the allocator; Rx buffers are requeued on
/// their driver's receive ring.
pub(crate) fn release_packet(core: &mut StackCore, mut packet: Packet) {
	#[cfg(feature = "tcp")]
	if packet.flags.contains(PacketFlags::KEEP) && packet.keeper.is_some() {
		crate::net::tcp::reclaim_tx_packet(core, packet);
		return;
	}

	if !packet.flags.contains(PacketFlags::TX) {
		packet.flags = PacketFlags::RX;
		packet.rewind();
		let iface = packet.net_if;
		if let Some(netif) = iface.and_then(|id| core.ifaces.get_mut(id)) {
			if let Err(error) = netif.driver.add_rx_packet(packet) {
				log::error!("failed to requeue an rx packet: {error}");
			}
			return;
		}
	}

	core.allocator.release(packet);
}

/// Runs the registered periodic callbacks with the current timestamp.
pub(crate) fn periodic_task(core: &mut StackCore) {
	let timestamp = time::ms_counter();

	for index in 0..core.ethernet.periodic.len() {
		match core.ethernet.periodic[index] {
			EthPeriodic::Arp => arp::periodic_task(core, timestamp),
			EthPeriodic::Ipv4 => ipv4::periodic_task(core, timestamp),
		}
	}
}
