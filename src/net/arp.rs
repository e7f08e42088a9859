//! Address Resolution Protocol: translation table, request/response
//! handling and the pending-request queue.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config;
use crate::error::{Error, Result};
use crate::net::ethernet::{self, EthHeader};
use crate::net::iface::IfaceId;
use crate::net::{StackCore, ipv4};
use crate::oal::time;
use crate::packet::Packet;
use crate::wire::{self, Ipv4Address, MacAddr};

/// ARP hardware type for Ethernet.
const ARP_HARDWARE_TYPE: u16 = 0x01;

/// ARP payload size for IPv4 over Ethernet.
const ARP_PACKET_SIZE_IPV4: usize = 28;

const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_RESPONSE: u16 = 2;

/// Kind of a translation table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArpEntryKind {
	#[default]
	Unused,
	/// Never expires, never evicted.
	Static,
	/// Expires after [`config::ARP_ENTRY_VALIDITY_PERIOD`].
	Dynamic,
}

#[derive(Debug, Clone, Copy, Default)]
struct ArpEntry {
	kind: ArpEntryKind,
	mac: MacAddr,
	ipv4: Ipv4Address,
	timestamp: u32,
}

/// Ticket identifying a pending ARP request for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpToken(u32);

/// Completion callback of a user ARP request.
pub type ArpCallback = Box<dyn FnMut(&mut StackCore, Option<MacAddr>) + Send>;

/// Who is waiting on a pending request.
pub(crate) enum ArpClient {
	/// An IPv4 send handle parked until the next hop resolves.
	Ipv4(ipv4::Ipv4HandleId),
	User(ArpCallback),
}

struct PendingRequest {
	token: u32,
	ipv4: Ipv4Address,
	deadline: u32,
	client: ArpClient,
}

/// Outcome of [`request`].
pub enum ArpResolution {
	/// The table held a valid entry.
	Resolved(MacAddr),
	/// A request frame went out; the client completes asynchronously.
	Pending(ArpToken),
}

pub(crate) struct ArpModule {
	entries: [ArpEntry; config::MAX_ARP_ENTRY_COUNT],
	pending: Vec<PendingRequest>,
	next_token: u32,
}

impl ArpModule {
	pub(crate) fn new() -> Self {
		Self {
			entries: [ArpEntry::default(); config::MAX_ARP_ENTRY_COUNT],
			pending: Vec::new(),
			next_token: 0,
		}
	}
}

pub(crate) fn init(core: &mut StackCore) {
	ethernet::add_protocol(core, wire::ETHERTYPE_ARP, ethernet::EtherProtocol::Arp);
	ethernet::register_periodic(core, ethernet::EthPeriodic::Arp);
}

/// Adds or refreshes a translation table entry.
///
/// Replacement policy on a full table: prefer the entry for the same
/// address, else a free slot, else the oldest dynamic entry. A dynamic add
/// never touches a static entry for the same address, so the table holds at
/// most one entry per address and static entries are never downgraded.
pub fn add_entry(
	core: &mut StackCore,
	kind: ArpEntryKind,
	mac: MacAddr,
	ipv4: Ipv4Address,
) -> Result<()> {
	if ipv4.is_unspecified() || kind == ArpEntryKind::Unused {
		return Err(Error::InvalidArg);
	}

	let entries = &mut core.arp.entries;
	let mut free = None;
	let mut oldest = None;
	let mut matching = None;

	for (index, entry) in entries.iter().enumerate() {
		match entry.kind {
			ArpEntryKind::Unused => free = free.or(Some(index)),
			_ if entry.ipv4 == ipv4 => {
				matching = Some(index);
				break;
			}
			ArpEntryKind::Dynamic => {
				if oldest.is_none_or(|old: usize| entries[old].timestamp > entry.timestamp) {
					oldest = Some(index);
				}
			}
			ArpEntryKind::Static => {}
		}
	}

	let index = match matching {
		Some(index) => {
			if entries[index].kind == ArpEntryKind::Static && kind == ArpEntryKind::Dynamic {
				// Keep the static mapping authoritative.
				return Ok(());
			}
			index
		}
		None => match free.or(oldest) {
			Some(index) => index,
			None => return Err(Error::Resource),
		},
	};

	entries[index] = ArpEntry {
		kind,
		mac,
		ipv4,
		timestamp: time::ms_counter(),
	};
	Ok(())
}

/// Removes a static entry.
pub fn remove_entry(core: &mut StackCore, ipv4: Ipv4Address) -> Result<()> {
	for entry in &mut core.arp.entries {
		if entry.kind == ArpEntryKind::Static && entry.ipv4 == ipv4 {
			*entry = ArpEntry::default();
			return Ok(());
		}
	}
	Err(Error::InvalidArg)
}

/// Looks up a valid table entry, expiring a stale dynamic one.
fn lookup(core: &mut StackCore, ipv4: Ipv4Address) -> Option<MacAddr> {
	let now = time::ms_counter();
	for entry in &mut core.arp.entries {
		if entry.kind == ArpEntryKind::Unused || entry.ipv4 != ipv4 {
			continue;
		}
		if entry.kind == ArpEntryKind::Static
			|| now.wrapping_sub(entry.timestamp) <= config::ARP_ENTRY_VALIDITY_PERIOD
		{
			return Some(entry.mac);
		}
		// Stale dynamic entry.
		*entry = ArpEntry::default();
		return None;
	}
	None
}

/// Resolves `ipv4` on `iface`, sending a request frame on a table miss.
///
/// On a miss the client is parked on the pending list with a deadline of
/// [`config::ARP_REQUEST_TIMEOUT`] and completed from the response path or
/// the periodic tick.
pub(crate) fn request(
	core: &mut StackCore,
	iface: IfaceId,
	ipv4: Ipv4Address,
	client: ArpClient,
) -> Result<ArpResolution> {
	if let Some(mac) = lookup(core, ipv4) {
		return Ok(ArpResolution::Resolved(mac));
	}

	let Some(netif) = core.ifaces.get(iface) else {
		return Err(Error::InvalidArg);
	};
	let our_mac = netif.mac;
	let our_ipv4 = netif.ipv4;

	let mut packet = ethernet::allocate_packet(core, ARP_PACKET_SIZE_IPV4)?;
	packet.write_u16(ARP_HARDWARE_TYPE);
	packet.write_u16(wire::ETHERTYPE_IPV4);
	packet.write_u8(6);
	packet.write_u8(4);
	packet.write_u16(ARP_OP_REQUEST);
	packet.write_slice(&our_mac.0);
	packet.write_u32(our_ipv4.0);
	packet.write_slice(&MacAddr::NULL.0);
	packet.write_u32(ipv4.0);

	let header = EthHeader {
		dest_address: MacAddr::BROADCAST,
		src_address: our_mac,
		ether_type: wire::ETHERTYPE_ARP,
	};
	ethernet::send_packet(core, iface, &header, packet)?;

	let token = core.arp.next_token;
	core.arp.next_token = core.arp.next_token.wrapping_add(1);
	core.arp.pending.push(PendingRequest {
		token,
		ipv4,
		deadline: time::ms_counter().wrapping_add(config::ARP_REQUEST_TIMEOUT),
		client,
	});

	Ok(ArpResolution::Pending(ArpToken(token)))
}

/// Cancels a pending request; the client completes with failure.
pub(crate) fn cancel(core: &mut StackCore, token: ArpToken) -> Result<()> {
	let Some(index) = core
		.arp
		.pending
		.iter()
		.position(|pending| pending.token == token.0)
	else {
		return Err(Error::InvalidArg);
	};

	let pending = core.arp.pending.remove(index);
	complete(core, pending.client, None);
	Ok(())
}

/// Cancels the pending request belonging to an IPv4 handle, if any.
pub(crate) fn cancel_for_ipv4_handle(core: &mut StackCore, handle: ipv4::Ipv4HandleId) {
	let index = core.arp.pending.iter().position(
		|pending| matches!(pending.client, ArpClient::Ipv4(parked) if parked == handle),
	);
	if let Some(index) = index {
		let pending = core.arp.pending.remove(index);
		complete(core, pending.client, None);
	}
}

fn complete(core: &mut StackCore, client: ArpClient, mac: Option<MacAddr>) {
	match client {
		ArpClient::Ipv4(handle) => ipv4::arp_resolved(core, handle, mac),
		ArpClient::User(mut callback) => callback(core, mac),
	}
}

/// Handles a received ARP frame.
pub(crate) fn rx_frame(
	core: &mut StackCore,
	iface: IfaceId,
	_eth_header: &EthHeader,
	mut packet: Packet,
) -> (Result<()>, Option<Packet>) {
	if packet.count() < ARP_PACKET_SIZE_IPV4 {
		return (Err(Error::PacketTooShort), Some(packet));
	}

	let _hardware_type = packet.read_u16();
	let protocol_type = packet.read_u16();
	let hw_address_length = packet.read_u8();
	let proto_address_length = packet.read_u8();
	let operation = packet.read_u16();
	let mut sender_mac = MacAddr::default();
	packet.read_into(&mut sender_mac.0);
	let sender_ipv4 = Ipv4Address(packet.read_u32());
	let mut target_mac = MacAddr::default();
	packet.read_into(&mut target_mac.0);
	let target_ipv4 = Ipv4Address(packet.read_u32());

	if protocol_type != wire::ETHERTYPE_IPV4 || hw_address_length != 6 || proto_address_length != 4
	{
		return (Err(Error::InvalidArpFrame), Some(packet));
	}

	let result = match operation {
		ARP_OP_REQUEST => handle_request(core, iface, sender_mac, sender_ipv4, target_ipv4),
		ARP_OP_RESPONSE => handle_response(core, iface, sender_mac, sender_ipv4, target_ipv4),
		_ => Err(Error::InvalidArpFrame),
	};
	(result, Some(packet))
}

/// Answers a request targeted at one of our interfaces.
fn handle_request(
	core: &mut StackCore,
	iface: IfaceId,
	sender_mac: MacAddr,
	sender_ipv4: Ipv4Address,
	target_ipv4: Ipv4Address,
) -> Result<()> {
	let Some(netif) = core.ifaces.get(iface) else {
		return Err(Error::InvalidArg);
	};
	if netif.ipv4 != target_ipv4 {
		return Err(Error::IgnorePacket);
	}
	let our_mac = netif.mac;
	let our_ipv4 = netif.ipv4;

	let _ = add_entry(core, ArpEntryKind::Dynamic, sender_mac, sender_ipv4);

	let mut packet = ethernet::allocate_packet(core, ARP_PACKET_SIZE_IPV4)?;
	packet.write_u16(ARP_HARDWARE_TYPE);
	packet.write_u16(wire::ETHERTYPE_IPV4);
	packet.write_u8(6);
	packet.write_u8(4);
	packet.write_u16(ARP_OP_RESPONSE);
	packet.write_slice(&our_mac.0);
	packet.write_u32(our_ipv4.0);
	packet.write_slice(&sender_mac.0);
	packet.write_u32(sender_ipv4.0);

	let header = EthHeader {
		dest_address: sender_mac,
		src_address: our_mac,
		ether_type: wire::ETHERTYPE_ARP,
	};
	ethernet::send_packet(core, iface, &header, packet)
}

/// Completes every pending request answered by a response.
fn handle_response(
	core: &mut StackCore,
	iface: IfaceId,
	sender_mac: MacAddr,
	sender_ipv4: Ipv4Address,
	target_ipv4: Ipv4Address,
) -> Result<()> {
	let Some(netif) = core.ifaces.get(iface) else {
		return Err(Error::InvalidArg);
	};
	if netif.ipv4 != target_ipv4 {
		return Err(Error::IgnorePacket);
	}

	let _ = add_entry(core, ArpEntryKind::Dynamic, sender_mac, sender_ipv4);

	loop {
		let Some(index) = core
			.arp
			.pending
			.iter()
			.position(|pending| pending.ipv4 == sender_ipv4)
		else {
			break;
		};
		let pending = core.arp.pending.remove(index);
		complete(core, pending.client, Some(sender_mac));
	}

	Ok(())
}

/// Fails every pending request past its deadline.
pub(crate) fn periodic_task(core: &mut StackCore, timestamp: u32) {
	loop {
		let Some(index) = core
			.arp
			.pending
			.iter()
			.position(|pending| pending.deadline < timestamp)
		else {
			break;
		};
		let pending = core.arp.pending.remove(index);
		log::debug!("ARP request for {} timed out", pending.ipv4);
		complete(core, pending.client, None);
	}
}

/// Number of valid entries currently in the table. Exposed for diagnostics.
pub(crate) fn entry_count(core: &StackCore) -> usize {
	core.arp
		.entries
		.iter()
		.filter(|entry| entry.kind != ArpEntryKind::Unused)
		.count()
}
