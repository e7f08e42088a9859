//! TCP: per-connection state machine, retransmission and the accept path.
//!
//! One data segment may be outstanding per connection. The segment buffer
//! is flagged KEEP so that transmit completion routes it back to the
//! connection instead of the allocator; it is retransmitted on a 500 ms
//! deadline up to [`config::TCP_MAX_RETRY_COUNT`] times and finally
//! released when the peer acknowledges it.

use alloc::boxed::Box;

use crate::config;
use crate::error::{Error, Result};
use crate::net::ethernet;
use crate::net::iface::IfaceId;
use crate::net::ipv4::{self, Ipv4Header};
use crate::net::{RxDisposition, StackCore, route};
use crate::oal::time;
use crate::packet::{Packet, PacketFlags};
use crate::util::{Pool, seq_after};
use crate::wire::{self, Ipv4Address};

/// TCP header size in bytes (no options are ever sent).
pub const TCP_HEADER_SIZE: usize = 20;

/// Data offset field for a 20-byte header.
const TCP_HEADER_DATA_OFFSET: u8 = 0x50;

const TCP_FLAG_FIN: u8 = 1 << 0;
const TCP_FLAG_SYN: u8 = 1 << 1;
const TCP_FLAG_RST: u8 = 1 << 2;
const TCP_FLAG_PSH: u8 = 1 << 3;
const TCP_FLAG_ACK: u8 = 1 << 4;

/// Identifier of a TCP handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandleId(pub(crate) usize);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
	Closed,
	/// Opened but neither listening nor connecting yet.
	Idle,
	Listen,
	SynSent,
	SynReceived,
	Established,
	FinWait1,
	FinWait2,
	CloseWait,
	/// Declared for completeness; the brute-force close never enters it.
	Closing,
	/// Declared for completeness; the brute-force close never enters it.
	LastAck,
	TimeWait,
}

/// Receiver of TCP handle events.
///
/// Handlers run with the stack mutex held and may call back into the core
/// through the `&mut StackCore` they are given.
pub trait TcpEventHandler: Send {
	/// A data segment arrived in order. The cursor of `packet` sits at the
	/// payload start and `count` is the payload length.
	fn on_rx(&mut self, core: &mut StackCore, handle: TcpHandleId, packet: Packet)
	-> RxDisposition;

	/// The outstanding segment was acknowledged, or a deferred transmit
	/// completed.
	fn on_tx(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {}

	/// The outstanding segment was dropped after the retransmission limit,
	/// or a deferred transmit failed.
	fn on_tx_failed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, _error: Error) {}

	/// The three-way handshake started by `connect` completed.
	fn on_connected(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {}

	/// No SYN|ACK arrived within the state timeout.
	fn on_connect_timeout(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {}

	/// The connection reached CLOSED. `result` carries the sub-cause:
	/// `Ok` for an orderly close, otherwise `ConnReset`, `Timeout` or
	/// `Failure`.
	fn on_closed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, _result: Result<()>) {}

	/// A SYN arrived on a listening handle. Return a handle in the IDLE
	/// state to accept the connection, `None` to ignore it.
	fn on_accepting(&mut self, _core: &mut StackCore, _listener: TcpHandleId) -> Option<TcpHandleId> {
		None
	}

	/// The handshake of an accepted connection completed.
	fn on_accepted(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {}

	/// An accepted connection failed before reaching ESTABLISHED.
	fn on_accept_failed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, _error: Error) {}
}

/// Bookkeeping for the outstanding data segment.
///
/// An acknowledged record is removed outright, so a buffer coming back
/// from the driver after the ACK finds no record and flows to the
/// allocator.
struct TxRecord {
	/// The segment buffer, once transmit completion returned it to us.
	packet: Option<Packet>,
	/// Saved cursor and count for rewinding before a retransmission.
	position: usize,
	count: usize,
	ipv4_header: Ipv4Header,
	retries: u8,
}

pub(crate) struct TcpHandle {
	pub(crate) ipv4_handle: ipv4::Ipv4HandleId,
	pub(crate) address: Ipv4Address,
	pub(crate) port: u16,
	pub(crate) dest_address: Ipv4Address,
	pub(crate) dest_port: u16,
	pub(crate) state: TcpState,
	/// Participates in segment matching; cleared when the connection is
	/// torn down.
	listed: bool,
	seq_number: u32,
	ack_number: u32,
	last_tx: Option<TxRecord>,
	state_timeout: u32,
	handler: Option<Box<dyn TcpEventHandler>>,
}

pub(crate) struct TcpModule {
	next_free_local_port: u16,
	pub(crate) handles: Pool<TcpHandle>,
}

impl TcpModule {
	pub(crate) fn new() -> Self {
		Self {
			next_free_local_port: config::TCP_PORT_POOL_START
				.wrapping_add((time::ms_counter() & 0xFFFF) as u16),
			handles: Pool::new(),
		}
	}
}

pub(crate) fn init(core: &mut StackCore) {
	ipv4::add_protocol(core, wire::IP_PROTO_TCP, ipv4::Ipv4Proto::Tcp);
	ipv4::register_periodic(core, ipv4::Ipv4Periodic::Tcp);
}

/// Creates a handle in the CLOSED state.
pub fn create(core: &mut StackCore, handler: Box<dyn TcpEventHandler>) -> TcpHandleId {
	let id = core.tcp.handles.insert(TcpHandle {
		ipv4_handle: ipv4::Ipv4HandleId(0),
		address: Ipv4Address::ANY,
		port: 0,
		dest_address: Ipv4Address::ANY,
		dest_port: 0,
		state: TcpState::Closed,
		listed: false,
		seq_number: 0,
		ack_number: 0,
		last_tx: None,
		state_timeout: 0,
		handler: Some(handler),
	});
	let ipv4_handle = ipv4::create_handle(core, ipv4::Ipv4Owner::Tcp(id));
	core.tcp.handles.get_mut(id).unwrap().ipv4_handle = ipv4_handle;
	TcpHandleId(id)
}

/// Releases a CLOSED handle.
pub fn release(core: &mut StackCore, handle: TcpHandleId) -> Result<()> {
	match core.tcp.handles.get(handle.0) {
		Some(entry) if entry.state == TcpState::Closed => {
			destroy(core, handle);
			Ok(())
		}
		Some(_) => Err(Error::InvalidTcpState),
		None => Err(Error::InvalidArg),
	}
}

/// Unconditionally frees a handle and its send machinery.
pub(crate) fn destroy(core: &mut StackCore, handle: TcpHandleId) {
	let Some(entry) = core.tcp.handles.remove(handle.0) else {
		return;
	};
	if let Some(mut record) = entry.last_tx {
		if let Some(mut packet) = record.packet.take() {
			packet.flags.remove(PacketFlags::KEEP);
			packet.keeper = None;
			ethernet::release_packet(core, packet);
		}
	}
	ipv4::release_handle(core, entry.ipv4_handle);
}

/// Moves a CLOSED handle to IDLE and binds its local port; an ephemeral
/// port starting at [`config::TCP_PORT_POOL_START`] is drawn when
/// `local_port` is 0.
pub fn open(core: &mut StackCore, handle: TcpHandleId, local_port: u16) -> Result<()> {
	match core.tcp.handles.get_mut(handle.0) {
		Some(entry) if entry.state == TcpState::Closed => entry.state = TcpState::Idle,
		Some(_) => return Err(Error::InvalidTcpState),
		None => return Err(Error::InvalidArg),
	}

	let bound = if local_port == 0 {
		loop {
			let port = core.tcp.next_free_local_port;
			let advanced = port.wrapping_add((time::ms_counter() & 0xFFFF) as u16);
			core.tcp.next_free_local_port = if advanced == 0 {
				config::TCP_PORT_POOL_START
			} else {
				advanced
			};
			if port != 0 && bind(core, handle, Ipv4Address::ANY, port).is_ok() {
				break Ok(());
			}
		}
	} else {
		bind(core, handle, Ipv4Address::ANY, local_port)
	};

	let entry = core.tcp.handles.get_mut(handle.0).unwrap();
	match bound {
		Ok(()) => {
			entry.listed = true;
			Ok(())
		}
		Err(error) => {
			entry.state = TcpState::Closed;
			Err(error)
		}
	}
}

/// Rebinds the local `(address, port)` pair of an IDLE handle.
pub fn bind(
	core: &mut StackCore,
	handle: TcpHandleId,
	address: Ipv4Address,
	port: u16,
) -> Result<()> {
	if port == 0 {
		return Err(Error::InvalidArg);
	}

	match core.tcp.handles.get(handle.0) {
		Some(entry) if entry.state == TcpState::Idle => {}
		Some(_) => return Err(Error::InvalidTcpState),
		None => return Err(Error::InvalidArg),
	}

	let in_use = core.tcp.handles.iter().any(|(id, other)| {
		id != handle.0 && other.listed && other.port == port && other.address == address
	});
	if in_use {
		return Err(Error::AddressInUse);
	}

	let entry = core.tcp.handles.get_mut(handle.0).unwrap();
	entry.address = address;
	entry.port = port;
	Ok(())
}

/// Starts the three-way handshake towards `(address, port)`.
pub fn connect(
	core: &mut StackCore,
	handle: TcpHandleId,
	address: Ipv4Address,
	port: u16,
) -> Result<()> {
	match core.tcp.handles.get_mut(handle.0) {
		Some(entry) if entry.state == TcpState::Idle => {
			entry.dest_address = address;
			entry.dest_port = port;
			entry.seq_number = time::ms_counter();
		}
		Some(_) => return Err(Error::InvalidTcpState),
		None => return Err(Error::InvalidArg),
	}

	send_control_frame(core, handle, TCP_FLAG_SYN)?;

	let entry = core.tcp.handles.get_mut(handle.0).unwrap();
	entry.state = TcpState::SynSent;
	entry.seq_number = entry.seq_number.wrapping_add(1);
	entry.state_timeout = time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
	Ok(())
}

/// Moves an IDLE handle to LISTEN.
pub fn listen(core: &mut StackCore, handle: TcpHandleId) -> Result<()> {
	match core.tcp.handles.get_mut(handle.0) {
		Some(entry) if entry.state == TcpState::Idle => {
			entry.state = TcpState::Listen;
			Ok(())
		}
		Some(_) => Err(Error::InvalidTcpState),
		None => Err(Error::InvalidArg),
	}
}

/// Forced close.
///
/// From ESTABLISHED a FIN|ACK goes out first, but the handle then drops
/// straight to CLOSED without waiting for the four-way handshake — a
/// deliberate divergence from the RFC 793 graceful close.
pub fn close(core: &mut StackCore, handle: TcpHandleId) -> Result<()> {
	let state = match core.tcp.handles.get(handle.0) {
		Some(entry) => entry.state,
		None => return Err(Error::InvalidArg),
	};

	if state == TcpState::Established {
		let sent = send_control_frame(core, handle, TCP_FLAG_FIN | TCP_FLAG_ACK);
		if sent.is_ok() {
			let entry = core.tcp.handles.get_mut(handle.0).unwrap();
			entry.state = TcpState::FinWait1;
			entry.seq_number = entry.seq_number.wrapping_add(1);
			entry.state_timeout = time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
		}
	}

	let entry = core.tcp.handles.get_mut(handle.0).unwrap();
	if entry.state != TcpState::Idle {
		entry.state = TcpState::Closed;
		entry.listed = false;
		Ok(())
	} else {
		Err(Error::InvalidTcpState)
	}
}

/// Allocates a Tx buffer with all header space reserved and `count` zeroed
/// so that it tracks the payload alone.
pub fn allocate_packet(core: &mut StackCore, payload_size: usize) -> Result<Packet> {
	let mut packet = ipv4::allocate_packet(core, payload_size + TCP_HEADER_SIZE)?;
	packet.write_skip(TCP_HEADER_SIZE);
	packet.set_count(0);
	Ok(packet)
}

/// Is the handle free to start another send?
pub fn handle_is_ready(core: &StackCore, handle: TcpHandleId) -> Result<()> {
	let entry = core.tcp.handles.get(handle.0).ok_or(Error::InvalidArg)?;
	if entry.last_tx.is_some() {
		return Err(Error::Busy);
	}
	ipv4::handle_is_ready(core, entry.ipv4_handle)
}

/// Current connection state.
pub fn state(core: &StackCore, handle: TcpHandleId) -> Result<TcpState> {
	core.tcp
		.handles
		.get(handle.0)
		.map(|entry| entry.state)
		.ok_or(Error::InvalidArg)
}

/// Sends one data segment as PSH|ACK.
///
/// Fails with `Busy` while a previous segment is unacknowledged and with
/// `InvalidTcpState` outside ESTABLISHED. On any error the packet has been
/// released.
pub fn send_packet(
	core: &mut StackCore,
	handle: TcpHandleId,
	mut packet: Packet,
) -> Result<ipv4::SendStatus> {
	let error = match core.tcp.handles.get(handle.0) {
		None => Some(Error::InvalidArg),
		Some(entry) if entry.last_tx.is_some() => Some(Error::Busy),
		Some(entry) if entry.state != TcpState::Established => Some(Error::InvalidTcpState),
		Some(_) => None,
	};
	if let Some(error) = error {
		ethernet::release_packet(core, packet);
		return Err(error);
	}

	let count = packet.count();
	// Keep the buffer across transmit completion for retransmissions.
	packet.flags.insert(PacketFlags::KEEP);
	packet.keeper = Some(handle.0);

	let entry = core.tcp.handles.get_mut(handle.0).unwrap();
	entry.last_tx = Some(TxRecord {
		packet: None,
		position: packet.position(),
		count,
		ipv4_header: Ipv4Header::default(),
		retries: 0,
	});

	match finalize_and_send(core, handle, TCP_FLAG_PSH | TCP_FLAG_ACK, packet) {
		Ok(status) => {
			let entry = core.tcp.handles.get_mut(handle.0).unwrap();
			entry.seq_number = entry.seq_number.wrapping_add(count as u32);
			entry.state_timeout = time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
			Ok(status)
		}
		Err(error) => {
			// The release path already routed the buffer back into the
			// record; drop both.
			let record = core.tcp.handles.get_mut(handle.0).and_then(|entry| entry.last_tx.take());
			if let Some(mut record) = record {
				if let Some(mut parked) = record.packet.take() {
					parked.flags.remove(PacketFlags::KEEP);
					parked.keeper = None;
					ethernet::release_packet(core, parked);
				}
			}
			Err(error)
		}
	}
}

/// Builds a zero-payload control segment and sends it.
fn send_control_frame(core: &mut StackCore, handle: TcpHandleId, flags: u8) -> Result<()> {
	let packet = allocate_packet(core, 0)?;
	finalize_and_send(core, handle, flags, packet).map(drop)
}

/// Writes the TCP header behind the payload, computes the checksum and
/// hands the segment to the IPv4 send sequencer.
fn finalize_and_send(
	core: &mut StackCore,
	handle: TcpHandleId,
	flags: u8,
	mut packet: Packet,
) -> Result<ipv4::SendStatus> {
	let Some(entry) = core.tcp.handles.get(handle.0) else {
		ethernet::release_packet(core, packet);
		return Err(Error::InvalidArg);
	};
	let local_port = entry.port;
	let dest_port = entry.dest_port;
	let seq_number = entry.seq_number;
	let ack_number = entry.ack_number;
	let bound_address = entry.address;
	let dest_address = entry.dest_address;
	let ipv4_handle = entry.ipv4_handle;

	let tcp_length = packet.count() + TCP_HEADER_SIZE;
	let frame_length = packet.position();
	let header_start = frame_length - tcp_length;

	packet.seek(header_start);
	packet.write_u16_no_count(local_port);
	packet.write_u16_no_count(dest_port);
	packet.write_u32_no_count(seq_number);
	packet.write_u32_no_count(if flags & TCP_FLAG_ACK != 0 { ack_number } else { 0 });
	packet.write_u8_no_count(TCP_HEADER_DATA_OFFSET);
	packet.write_u8_no_count(flags);
	packet.write_u16_no_count(config::TCP_WINDOW_SIZE);
	let checksum_position = packet.position();
	packet.write_u32_no_count(0); // checksum and urgent pointer

	let src_address = if bound_address.is_unspecified() {
		let iface = match packet.net_if() {
			Some(iface) => Some(iface),
			None => route::search(core, dest_address).ok().map(|(_, iface)| iface),
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
		dest_address,
		data_length: 0,
		protocol: wire::IP_PROTO_TCP,
	};

	if let Some(record) = core
		.tcp
		.handles
		.get_mut(handle.0)
		.and_then(|entry| entry.last_tx.as_mut())
	{
		record.ipv4_header = header;
	}

	let pseudo =
		wire::pseudo_header(src_address, dest_address, wire::IP_PROTO_TCP, tcp_length as u16);
	let region = &packet.as_bytes()[header_start..header_start + tcp_length];
	let checksum = wire::internet_checksum(&pseudo, region);
	packet.seek(checksum_position);
	packet.write_u16_no_count(checksum);

	packet.seek(frame_length);
	packet.set_count(frame_length);

	ipv4::send_packet(core, ipv4_handle, &header, packet)
}

/// Routes a transmit-completed KEEP buffer back to its connection.
pub(crate) fn reclaim_tx_packet(core: &mut StackCore, mut packet: Packet) {
	let keeper = packet.keeper.take();
	packet.flags.remove(PacketFlags::KEEP);

	if let Some(id) = keeper {
		if let Some(record) = core
			.tcp
			.handles
			.get_mut(id)
			.and_then(|entry| entry.last_tx.as_mut())
		{
			if record.packet.is_none() {
				// Retained for a possible retransmission.
				packet.flags.insert(PacketFlags::KEEP);
				packet.keeper = Some(id);
				record.packet = Some(packet);
				return;
			}
		}
	}

	core.allocator.release(packet);
}

/// Send-path completion from the IPv4 layer.
pub(crate) fn ipv4_send_complete(core: &mut StackCore, handle: usize, result: Result<()>) {
	let established = core
		.tcp
		.handles
		.get(handle)
		.is_some_and(|entry| entry.state == TcpState::Established);

	match result {
		Ok(()) if established => {
			with_handler(core, handle, (), |handler, core| {
				handler.on_tx(core, TcpHandleId(handle));
			});
		}
		Ok(()) => {}
		Err(error) => {
			with_handler(core, handle, (), |handler, core| {
				handler.on_tx_failed(core, TcpHandleId(handle), error);
			});
		}
	}
}

/// Takes the handler out of its slot for the duration of one event.
fn with_handler<R>(
	core: &mut StackCore,
	handle: usize,
	default: R,
	event: impl FnOnce(&mut dyn TcpEventHandler, &mut StackCore) -> R,
) -> R {
	let Some(mut handler) = core
		.tcp
		.handles
		.get_mut(handle)
		.and_then(|entry| entry.handler.take())
	else {
		return default;
	};

	let result = event(handler.as_mut(), core);

	if let Some(entry) = core.tcp.handles.get_mut(handle) {
		if entry.handler.is_none() {
			entry.handler = Some(handler);
		}
	}
	result
}

/// Tears the connection down and reports CLOSED with `result`.
fn force_close(core: &mut StackCore, handle: usize, result: Result<()>) {
	if let Some(entry) = core.tcp.handles.get_mut(handle) {
		entry.state = TcpState::Closed;
		entry.listed = false;
	}
	with_handler(core, handle, (), |handler, core| {
		handler.on_closed(core, TcpHandleId(handle), result);
	});
}

/// A decoded TCP header.
struct SegmentHeader {
	src_port: u16,
	dest_port: u16,
	seq_number: u32,
	ack_number: u32,
	flags: u8,
}

/// Handles a received TCP segment.
pub(crate) fn rx_frame(
	core: &mut StackCore,
	iface: IfaceId,
	ipv4_header: &Ipv4Header,
	mut packet: Packet,
) -> (Result<()>, Option<Packet>) {
	use crate::drivers::net::DriverCaps;

	if packet.count() < TCP_HEADER_SIZE {
		return (Err(Error::PacketTooShort), Some(packet));
	}

	let header_start = packet.position();
	let src_port = packet.read_u16();
	let dest_port = packet.read_u16();
	let seq_number = packet.read_u32();
	let ack_number = packet.read_u32();
	let data_offset = packet.read_u8() >> 4;
	let flags = packet.read_u8() & 0x3F;
	let _window = packet.read_u16();
	let header_bytes = usize::from(data_offset) * 4;
	let Some(options_length) = header_bytes.checked_sub(TCP_HEADER_SIZE) else {
		return (Err(Error::PacketTooShort), Some(packet));
	};
	packet.read_skip(2); // checksum
	packet.read_skip(2); // urgent pointer
	if options_length > packet.count() {
		return (Err(Error::PacketTooShort), Some(packet));
	}
	packet.read_skip(options_length);

	let caps = core
		.ifaces
		.get(iface)
		.map(|netif| netif.caps)
		.unwrap_or(DriverCaps::empty());
	if !caps.contains(DriverCaps::TCP_IPV4_CS_CHECK) {
		if packet.as_bytes().len() < header_start + ipv4_header.data_length {
			return (Err(Error::PacketTooShort), Some(packet));
		}
		let pseudo = wire::pseudo_header(
			ipv4_header.src_address,
			ipv4_header.dest_address,
			wire::IP_PROTO_TCP,
			ipv4_header.data_length as u16,
		);
		let region = &packet.as_bytes()[header_start..header_start + ipv4_header.data_length];
		if wire::internet_checksum(&pseudo, region) != 0 {
			return (Err(Error::InvalidChecksum), Some(packet));
		}
	}

	let Some(length) = ipv4_header.data_length.checked_sub(header_bytes) else {
		return (Err(Error::PacketTooShort), Some(packet));
	};
	if length > packet.count() {
		return (Err(Error::PacketTooShort), Some(packet));
	}
	// Trim Ethernet padding.
	packet.set_count(length);

	let header = SegmentHeader {
		src_port,
		dest_port,
		seq_number,
		ack_number,
		flags,
	};

	// Prefer a full connection match, fall back to a listener on the
	// local port.
	let mut exact = None;
	let mut fallback = None;
	for (id, entry) in core.tcp.handles.iter() {
		if !entry.listed || entry.port != header.dest_port {
			continue;
		}
		if entry.dest_port == header.src_port && entry.dest_address == ipv4_header.src_address {
			exact = Some(id);
			break;
		}
		if fallback.is_none() {
			fallback = Some(id);
		}
	}
	let Some(handle) = exact.or(fallback) else {
		return (Err(Error::IgnorePacket), Some(packet));
	};

	let packet = process_segment(core, handle, ipv4_header, &header, packet);
	(Ok(()), packet)
}

/// Runs one segment through the state machine of `handle`.
///
/// Returns the packet for release unless the receive handler kept it.
fn process_segment(
	core: &mut StackCore,
	handle: usize,
	ipv4_header: &Ipv4Header,
	header: &SegmentHeader,
	packet: Packet,
) -> Option<Packet> {
	let (state, seq_number) = {
		let entry = core.tcp.handles.get(handle).unwrap();
		(entry.state, entry.seq_number)
	};

	// A reset tears the connection down immediately.
	if header.flags & TCP_FLAG_RST != 0 {
		if state != TcpState::Listen && state != TcpState::Idle {
			force_close(core, handle, Err(Error::ConnReset));
		}
		return Some(packet);
	}

	// Ignore segments whose acknowledgement number is stale; a future one
	// is answered with a reset.
	if state != TcpState::Listen && header.ack_number != seq_number {
		if seq_after(header.ack_number, seq_number) {
			let _ = send_control_frame(core, TcpHandleId(handle), TCP_FLAG_RST);
			force_close(core, handle, Err(Error::Failure));
		}
		return Some(packet);
	}

	match state {
		TcpState::Listen => {
			if header.flags == TCP_FLAG_SYN {
				handle_accept(core, handle, ipv4_header, header);
			}
			Some(packet)
		}

		TcpState::SynReceived => {
			if header.flags == TCP_FLAG_ACK {
				core.tcp.handles.get_mut(handle).unwrap().state = TcpState::Established;
				with_handler(core, handle, (), |handler, core| {
					handler.on_accepted(core, TcpHandleId(handle));
				});
			}
			Some(packet)
		}

		TcpState::SynSent => {
			if header.flags == TCP_FLAG_SYN | TCP_FLAG_ACK {
				core.tcp.handles.get_mut(handle).unwrap().ack_number =
					header.seq_number.wrapping_add(1);
				if send_control_frame(core, TcpHandleId(handle), TCP_FLAG_ACK).is_ok() {
					core.tcp.handles.get_mut(handle).unwrap().state = TcpState::Established;
					with_handler(core, handle, (), |handler, core| {
						handler.on_connected(core, TcpHandleId(handle));
					});
				}
			}
			Some(packet)
		}

		TcpState::Established => handle_established(core, handle, header, packet),

		TcpState::CloseWait => {
			if header.flags == TCP_FLAG_ACK {
				force_close(core, handle, Ok(()));
			}
			Some(packet)
		}

		TcpState::FinWait1 => {
			if header.flags == TCP_FLAG_ACK {
				let entry = core.tcp.handles.get_mut(handle).unwrap();
				entry.state = TcpState::FinWait2;
				entry.state_timeout = time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
			} else if header.flags == TCP_FLAG_FIN | TCP_FLAG_ACK {
				// Simultaneous close: acknowledge the peer's FIN.
				core.tcp.handles.get_mut(handle).unwrap().ack_number =
					header.seq_number.wrapping_add(1);
				if send_control_frame(core, TcpHandleId(handle), TCP_FLAG_ACK).is_ok() {
					let entry = core.tcp.handles.get_mut(handle).unwrap();
					entry.state = TcpState::TimeWait;
					entry.state_timeout =
						time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
				}
			}
			Some(packet)
		}

		TcpState::FinWait2 => {
			if header.flags == TCP_FLAG_FIN | TCP_FLAG_ACK {
				core.tcp.handles.get_mut(handle).unwrap().ack_number =
					header.seq_number.wrapping_add(1);
				if send_control_frame(core, TcpHandleId(handle), TCP_FLAG_ACK).is_ok() {
					let entry = core.tcp.handles.get_mut(handle).unwrap();
					entry.state = TcpState::TimeWait;
					entry.state_timeout =
						time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
				}
			}
			Some(packet)
		}

		TcpState::Idle | TcpState::Closed => Some(packet),

		_ => {
			// Unexpected state for an incoming segment: reset.
			let _ = send_control_frame(core, TcpHandleId(handle), TCP_FLAG_RST);
			force_close(core, handle, Err(Error::Failure));
			Some(packet)
		}
	}
}

/// SYN on a listener: ask the handler for an accept handle and start the
/// handshake on it.
fn handle_accept(
	core: &mut StackCore,
	listener: usize,
	ipv4_header: &Ipv4Header,
	header: &SegmentHeader,
) {
	let accept_handle = with_handler(core, listener, None, |handler, core| {
		handler.on_accepting(core, TcpHandleId(listener))
	});
	let Some(child) = accept_handle else {
		return;
	};

	match core.tcp.handles.get_mut(child.0) {
		Some(entry) if entry.state == TcpState::Idle => {
			entry.address = ipv4_header.dest_address;
			entry.port = header.dest_port;
			entry.dest_address = ipv4_header.src_address;
			entry.dest_port = header.src_port;
			entry.seq_number = time::ms_counter();
			entry.ack_number = header.seq_number.wrapping_add(1);
		}
		_ => {
			with_handler(core, child.0, (), |handler, core| {
				handler.on_accept_failed(core, child, Error::InvalidTcpState);
			});
			return;
		}
	}

	if send_control_frame(core, child, TCP_FLAG_SYN | TCP_FLAG_ACK).is_ok() {
		let entry = core.tcp.handles.get_mut(child.0).unwrap();
		entry.seq_number = entry.seq_number.wrapping_add(1);
		entry.state = TcpState::SynReceived;
		entry.state_timeout = time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
	}
}

/// Segment processing in ESTABLISHED.
fn handle_established(
	core: &mut StackCore,
	handle: usize,
	header: &SegmentHeader,
	mut packet: Packet,
) -> Option<Packet> {
	let has_outstanding = core
		.tcp
		.handles
		.get(handle)
		.is_some_and(|entry| entry.last_tx.is_some());

	if packet.count() != 0 && header.flags == TCP_FLAG_PSH | TCP_FLAG_ACK {
		let expected = core.tcp.handles.get(handle).unwrap().ack_number;
		if header.seq_number != expected {
			// Duplicate or out-of-order data: drop without acknowledging.
			return Some(packet);
		}

		let entry = core.tcp.handles.get_mut(handle).unwrap();
		entry.ack_number = header.seq_number.wrapping_add(packet.count() as u32);
		if send_control_frame(core, TcpHandleId(handle), TCP_FLAG_ACK).is_err() {
			return Some(packet);
		}

		let Some(mut handler) = core
			.tcp
			.handles
			.get_mut(handle)
			.and_then(|entry| entry.handler.take())
		else {
			return Some(packet);
		};
		let disposition = handler.on_rx(core, TcpHandleId(handle), packet);
		if let Some(entry) = core.tcp.handles.get_mut(handle) {
			if entry.handler.is_none() {
				entry.handler = Some(handler);
			}
		}
		return match disposition {
			RxDisposition::Release(packet) => Some(packet),
			RxDisposition::Kept => None,
		};
	}

	if has_outstanding && header.flags == TCP_FLAG_ACK {
		// The outstanding segment is acknowledged.
		let record = core.tcp.handles.get_mut(handle).unwrap().last_tx.take();
		if let Some(mut record) = record {
			match record.packet.take() {
				Some(mut parked) => {
					parked.flags.remove(PacketFlags::KEEP);
					parked.keeper = None;
					ethernet::release_packet(core, parked);
				}
				// Still with the driver; reclaim releases it.
				None => {}
			}
		}
		with_handler(core, handle, (), |handler, core| {
			handler.on_tx(core, TcpHandleId(handle));
		});
		return Some(packet);
	}

	if header.flags == TCP_FLAG_FIN | TCP_FLAG_ACK {
		core.tcp.handles.get_mut(handle).unwrap().ack_number =
			header.seq_number.wrapping_add(1);
		if send_control_frame(core, TcpHandleId(handle), TCP_FLAG_FIN | TCP_FLAG_ACK).is_ok() {
			let entry = core.tcp.handles.get_mut(handle).unwrap();
			entry.state = TcpState::CloseWait;
			entry.seq_number = entry.seq_number.wrapping_add(1);
			entry.state_timeout = time::ms_counter().wrapping_add(config::TCP_STATE_TIMEOUT);
		}
	}

	Some(packet)
}

/// Drives state timeouts and retransmissions.
pub(crate) fn periodic_task(core: &mut StackCore, timestamp: u32) {
	for handle in core.tcp.handles.ids() {
		let Some(entry) = core.tcp.handles.get_mut(handle) else {
			continue;
		};
		let state = entry.state;
		let expired = entry.state_timeout <= timestamp;

		match state {
			TcpState::SynSent if expired => {
				entry.state = TcpState::Closed;
				entry.listed = false;
				with_handler(core, handle, (), |handler, core| {
					handler.on_connect_timeout(core, TcpHandleId(handle));
				});
			}

			TcpState::SynReceived if expired => {
				entry.state = TcpState::Closed;
				entry.listed = false;
				with_handler(core, handle, (), |handler, core| {
					handler.on_accept_failed(core, TcpHandleId(handle), Error::Timeout);
				});
			}

			TcpState::Established if expired && entry.last_tx.is_some() => {
				retransmit(core, handle, timestamp);
			}

			TcpState::CloseWait | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::TimeWait
				if expired =>
			{
				entry.state = TcpState::Closed;
				entry.listed = false;
				let result = if state == TcpState::CloseWait {
					Ok(())
				} else {
					Err(Error::Timeout)
				};
				with_handler(core, handle, (), |handler, core| {
					handler.on_closed(core, TcpHandleId(handle), result);
				});
			}

			_ => {}
		}
	}
}

/// One expiry of the retransmission deadline.
fn retransmit(core: &mut StackCore, handle: usize, timestamp: u32) {
	let entry = core.tcp.handles.get_mut(handle).unwrap();
	let record = entry.last_tx.as_mut().unwrap();

	if record.packet.is_none() {
		// The driver still owns the frame; check again next deadline.
		entry.state_timeout = timestamp.wrapping_add(config::TCP_STATE_TIMEOUT);
		return;
	}

	record.retries += 1;
	if record.retries >= config::TCP_MAX_RETRY_COUNT {
		let mut record = entry.last_tx.take().unwrap();
		entry.state = TcpState::Closed;
		entry.listed = false;
		if let Some(mut parked) = record.packet.take() {
			parked.flags.remove(PacketFlags::KEEP);
			parked.keeper = None;
			ethernet::release_packet(core, parked);
		}
		with_handler(core, handle, (), |handler, core| {
			handler.on_tx_failed(core, TcpHandleId(handle), Error::Timeout);
			handler.on_closed(core, TcpHandleId(handle), Err(Error::Timeout));
		});
		return;
	}

	// Rewind the saved cursor and length, then resubmit the same bytes.
	let mut parked = record.packet.take().unwrap();
	parked.seek(record.position);
	parked.set_count(record.count);
	let ipv4_header = record.ipv4_header;
	let ipv4_handle = entry.ipv4_handle;
	entry.state_timeout = entry.state_timeout.wrapping_add(config::TCP_STATE_TIMEOUT);

	if let Err(error) = ipv4::send_packet(core, ipv4_handle, &ipv4_header, parked) {
		log::debug!("tcp retransmission failed: {error}");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::Stack;
	use crate::packet::BigSmallAllocator;
	use alloc::sync::Arc;

	struct NullHandler;

	impl TcpEventHandler for NullHandler {
		fn on_rx(
			&mut self,
			_core: &mut StackCore,
			_handle: TcpHandleId,
			packet: Packet,
		) -> RxDisposition {
			RxDisposition::Release(packet)
		}
	}

	fn stack() -> Stack {
		Stack::new(Arc::new(BigSmallAllocator::new(1600, 8, 128, 8))).unwrap()
	}

	#[test]
	fn open_assigns_ephemeral_ports_from_the_pool() {
		let stack = stack();
		let mut core = stack.lock();

		let first = create(&mut core, Box::new(NullHandler));
		open(&mut core, first, 0).unwrap();
		let second = create(&mut core, Box::new(NullHandler));
		open(&mut core, second, 0).unwrap();

		let port_a = core.tcp.handles.get(first.0).unwrap().port;
		let port_b = core.tcp.handles.get(second.0).unwrap().port;
		assert_ne!(port_a, 0);
		assert_ne!(port_b, 0);
		assert_ne!(port_a, port_b);
	}

	#[test]
	fn bind_rejects_duplicate_pair() {
		let stack = stack();
		let mut core = stack.lock();

		let first = create(&mut core, Box::new(NullHandler));
		open(&mut core, first, 8080).unwrap();
		let second = create(&mut core, Box::new(NullHandler));
		assert_eq!(open(&mut core, second, 8080).unwrap_err(), Error::AddressInUse);
	}

	#[test]
	fn listen_requires_idle() {
		let stack = stack();
		let mut core = stack.lock();

		let handle = create(&mut core, Box::new(NullHandler));
		assert_eq!(listen(&mut core, handle).unwrap_err(), Error::InvalidTcpState);
		open(&mut core, handle, 8081).unwrap();
		listen(&mut core, handle).unwrap();
		assert_eq!(state(&core, handle).unwrap(), TcpState::Listen);
	}

	#[test]
	fn release_requires_closed() {
		let stack = stack();
		let mut core = stack.lock();

		let handle = create(&mut core, Box::new(NullHandler));
		open(&mut core, handle, 8082).unwrap();
		assert_eq!(release(&mut core, handle).unwrap_err(), Error::InvalidTcpState);
	}
}
