//! ICMP: echo request/reply handling and the ping client.

use crate::error::{Error, Result};
use crate::net::StackCore;
#[cfg(feature = "icmp-ping")]
use crate::net::Stack;
use crate::net::iface::IfaceId;
use crate::net::ipv4::{self, Ipv4Header};
use crate::packet::Packet;
use crate::wire;
#[cfg(feature = "icmp-ping")]
use crate::wire::Ipv4Address;

#[cfg(feature = "icmp-ping")]
use crate::oal::{FlagSet, time};
#[cfg(feature = "icmp-ping")]
use crate::util::Pool;

/// ICMP header size in bytes (type, code, checksum).
const ICMP_HEADER_SIZE: usize = 4;

/// Size of the identifier carried by our echo requests.
#[cfg(feature = "icmp-ping")]
const ICMP_PING_REQ_HEADER_SIZE: usize = 4;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

#[cfg(feature = "icmp-ping")]
const PING_REQ_SUCCESS_FLAG: u32 = 0x01;
#[cfg(feature = "icmp-ping")]
const PING_REQ_CANCEL_FLAG: u32 = 0x02;
#[cfg(feature = "icmp-ping")]
const PING_REQ_TIMEOUT_FLAG: u32 = 0x04;
#[cfg(feature = "icmp-ping")]
const PING_REQ_ARP_ERROR_FLAG: u32 = 0x08;
#[cfg(feature = "icmp-ping")]
const PING_REQ_FAILURE_FLAG: u32 = 0x10;
#[cfg(feature = "icmp-ping")]
const PING_REQ_ALL_FLAGS: u32 = 0x1F;

/// Identifier of a pooled ping request.
#[cfg(feature = "icmp-ping")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingId(pub(crate) usize);

#[cfg(feature = "icmp-ping")]
struct PingRequest {
	identifier: u32,
	ipv4_handle: ipv4::Ipv4HandleId,
	/// Send timestamp until the reply lands, then the round-trip time.
	response_time: u32,
	deadline: u32,
	/// Still on the timeout list (not yet answered/cancelled/expired).
	listed: bool,
	sync: FlagSet,
}

pub(crate) struct IcmpModule {
	/// Send handle used for echo replies.
	ipv4_handle: Option<ipv4::Ipv4HandleId>,
	#[cfg(feature = "icmp-ping")]
	requests: Pool<PingRequest>,
}

impl IcmpModule {
	pub(crate) fn new() -> Self {
		Self {
			ipv4_handle: None,
			#[cfg(feature = "icmp-ping")]
			requests: Pool::new(),
		}
	}
}

pub(crate) fn init(core: &mut StackCore) {
	let reply_handle = ipv4::create_handle(core, ipv4::Ipv4Owner::Icmp);
	core.icmp.ipv4_handle = Some(reply_handle);
	ipv4::add_protocol(core, wire::IP_PROTO_ICMP, ipv4::Ipv4Proto::Icmp);
	#[cfg(feature = "icmp-ping")]
	ipv4::register_periodic(core, ipv4::Ipv4Periodic::Icmp);
}

/// Handles a received ICMP frame.
pub(crate) fn rx_frame(
	core: &mut StackCore,
	_iface: IfaceId,
	ipv4_header: &Ipv4Header,
	mut packet: Packet,
) -> (Result<()>, Option<Packet>) {
	// Use the IP-layer length so Ethernet padding is never included.
	let message_size = ipv4_header.data_length;
	if message_size < ICMP_HEADER_SIZE || message_size > packet.count() {
		return (Err(Error::PacketTooShort), Some(packet));
	}
	packet.set_count(message_size);

	let header_start = packet.position();
	let kind = packet.read_u8();
	packet.read_skip(1); // code
	packet.read_skip(2); // checksum

	let region = &packet.as_bytes()[header_start..header_start + message_size];
	if wire::internet_checksum(&[], region) != 0 {
		return (Err(Error::InvalidChecksum), Some(packet));
	}

	let result = match kind {
		ICMP_ECHO_REQUEST => handle_echo_request(core, ipv4_header, &packet, message_size),
		#[cfg(feature = "icmp-ping")]
		ICMP_ECHO_REPLY => handle_echo_reply(core, &mut packet),
		_ => Err(Error::IgnorePacket),
	};
	(result, Some(packet))
}

/// Builds and sends the echo reply mirroring the request payload.
fn handle_echo_request(
	core: &mut StackCore,
	ipv4_header: &Ipv4Header,
	request: &Packet,
	message_size: usize,
) -> Result<()> {
	let echo_data_start = request.position();
	let echo_data_len = message_size - ICMP_HEADER_SIZE;

	let mut packet = ipv4::allocate_packet(core, message_size)?;
	let header_start = packet.position();
	packet.write_u8(ICMP_ECHO_REPLY);
	packet.write_u8(0x00);
	let checksum_position = packet.position();
	packet.write_u16(0x0000);
	let echo_data = &request.as_bytes()[echo_data_start..echo_data_start + echo_data_len];
	packet.write_slice(echo_data);
	let end_position = packet.position();

	let region = &packet.as_bytes()[header_start..header_start + message_size];
	let checksum = wire::internet_checksum(&[], region);
	packet.seek(checksum_position);
	packet.write_u16_no_count(checksum);
	packet.seek(end_position);

	let header = Ipv4Header {
		src_address: ipv4_header.dest_address,
		dest_address: ipv4_header.src_address,
		data_length: 0,
		protocol: wire::IP_PROTO_ICMP,
	};

	let handle = core.icmp.ipv4_handle.ok_or(Error::Failure)?;
	ipv4::send_packet(core, handle, &header, packet).map(drop)
}

/// Completes the ping request matching a received echo reply.
#[cfg(feature = "icmp-ping")]
fn handle_echo_reply(core: &mut StackCore, packet: &mut Packet) -> Result<()> {
	if packet.count() < ICMP_PING_REQ_HEADER_SIZE {
		return Err(Error::PacketTooShort);
	}
	let identifier = packet.read_u32();

	let entry = core
		.icmp
		.requests
		.iter_mut()
		.find(|(_, request)| request.listed && request.identifier == identifier);
	let Some((_, request)) = entry else {
		return Err(Error::IgnorePacket);
	};

	request.response_time = time::ms_counter().wrapping_sub(request.response_time);
	request.listed = false;
	request.sync.set(PING_REQ_SUCCESS_FLAG);
	Ok(())
}

/// Starts an echo request. The payload is a byte ramp of `data_size`
/// bytes, padded to an even length.
#[cfg(feature = "icmp-ping")]
pub(crate) fn ping_request(
	core: &mut StackCore,
	address: Ipv4Address,
	timeout: u32,
	data_size: u8,
) -> Result<PingId> {
	let data_size = usize::from(data_size);
	let message_size = ICMP_HEADER_SIZE + ICMP_PING_REQ_HEADER_SIZE + data_size + data_size % 2;

	let mut packet = ipv4::allocate_packet(core, message_size)?;
	let header_start = packet.position();
	packet.write_u8(ICMP_ECHO_REQUEST);
	packet.write_u8(0x00);
	let checksum_position = packet.position();
	packet.write_u16(0x0000);

	let identifier = time::ms_counter();
	packet.write_u32(identifier);
	for byte in 0..(data_size + data_size % 2) {
		packet.write_u8(byte as u8);
	}

	let end_position = packet.position();
	let region = &packet.as_bytes()[header_start..header_start + message_size];
	let checksum = wire::internet_checksum(&[], region);
	packet.seek(checksum_position);
	packet.write_u16_no_count(checksum);
	packet.seek(end_position);

	let now = time::ms_counter();
	let ping = PingId(core.icmp.requests.insert(PingRequest {
		identifier,
		ipv4_handle: ipv4::Ipv4HandleId(0),
		response_time: now,
		deadline: now.wrapping_add(timeout),
		listed: true,
		sync: FlagSet::new(),
	}));
	let ipv4_handle = ipv4::create_handle(core, ipv4::Ipv4Owner::Ping(ping.0));
	core.icmp.requests.get_mut(ping.0).unwrap().ipv4_handle = ipv4_handle;

	let header = Ipv4Header {
		src_address: Ipv4Address::ANY,
		dest_address: address,
		data_length: 0,
		protocol: wire::IP_PROTO_ICMP,
	};

	match ipv4::send_packet(core, ipv4_handle, &header, packet) {
		Ok(_) => Ok(ping),
		Err(error) => {
			ipv4::release_handle(core, ipv4_handle);
			core.icmp.requests.remove(ping.0);
			Err(error)
		}
	}
}

/// Waits for the outcome of a ping request, freeing it before returning.
/// The success value is the round-trip time in milliseconds.
#[cfg(feature = "icmp-ping")]
pub(crate) fn ping_wait(stack: &Stack, ping: PingId, timeout: u32) -> Result<u32> {
	let sync = {
		let core = stack.lock();
		core.icmp
			.requests
			.get(ping.0)
			.map(|request| request.sync.clone())
			.ok_or(Error::InvalidArg)?
	};

	let flags = sync.wait(PING_REQ_ALL_FLAGS, true, Some(timeout));

	let mut core = stack.lock();
	let Some(request) = core.icmp.requests.remove(ping.0) else {
		return Err(Error::InvalidArg);
	};
	let ipv4_handle = request.ipv4_handle;
	ipv4::release_handle(&mut core, ipv4_handle);

	match flags {
		Ok(flags) if flags & PING_REQ_SUCCESS_FLAG != 0 => Ok(request.response_time),
		Ok(flags) if flags & PING_REQ_ARP_ERROR_FLAG != 0 => Err(Error::ArpFailure),
		Ok(flags) if flags & PING_REQ_TIMEOUT_FLAG != 0 => Err(Error::Timeout),
		Ok(_) => Err(Error::InvalidPingRequest),
		Err(error) => Err(error),
	}
}

/// Cancels a pending ping request; a parked wait completes with failure.
#[cfg(feature = "icmp-ping")]
pub(crate) fn ping_cancel(core: &mut StackCore, ping: PingId) -> Result<()> {
	let Some(request) = core.icmp.requests.get_mut(ping.0) else {
		return Err(Error::InvalidArg);
	};
	if request.listed {
		request.listed = false;
		request.sync.set(PING_REQ_CANCEL_FLAG);
	}
	Ok(())
}

/// Send-path completion for a ping request.
#[cfg(feature = "icmp-ping")]
pub(crate) fn ping_send_complete(core: &mut StackCore, ping: usize, result: Result<()>) {
	let Some(request) = core.icmp.requests.get_mut(ping) else {
		return;
	};
	match result {
		Ok(()) => {}
		Err(Error::ArpFailure) => {
			request.listed = false;
			request.sync.set(PING_REQ_ARP_ERROR_FLAG);
		}
		Err(_) => {
			request.listed = false;
			request.sync.set(PING_REQ_FAILURE_FLAG);
		}
	}
}

/// Expires ping requests past their deadline.
#[cfg(feature = "icmp-ping")]
pub(crate) fn periodic_task(core: &mut StackCore, timestamp: u32) {
	for (_, request) in core.icmp.requests.iter_mut() {
		if request.listed && request.deadline < timestamp {
			request.listed = false;
			request.sync.set(PING_REQ_TIMEOUT_FLAG);
		}
	}
}
