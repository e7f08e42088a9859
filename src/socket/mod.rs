//! The socket layer: blocking/non-blocking wrappers over UDP and TCP
//! handles, the accept queue and `poll`.
//!
//! Sockets come from a fixed pool. Each owns an event-flag set with the
//! bits RX, TX and ERR; the protocol event handlers installed by this
//! module translate stack events into queue operations and flag signals.
//! Blocking calls follow one pattern: check under the stack mutex, release
//! it, wait on the flags, re-acquire and re-check — failing when the
//! socket was released concurrently.

use alloc::boxed::Box;
use alloc::collections::vec_deque::VecDeque;
use alloc::vec::Vec;

use crate::config;
use crate::error::{Error, Result};
use crate::net::ipv4::SendStatus;
use crate::net::tcp::{self, TcpEventHandler, TcpHandleId, TcpState};
use crate::net::udp::{self, UdpEventHandler, UdpHandleId, UdpHeader};
use crate::net::{RxDisposition, Stack, StackCore, ethernet};
use crate::oal::FlagSet;
use crate::packet::{Packet, PacketQueue};
use crate::wire::Endpoint;

const SOCKET_EVENT_RX: u32 = 1;
const SOCKET_EVENT_TX: u32 = 2;
const SOCKET_EVENT_ERROR: u32 = 4;
const SOCKET_EVENT_ALL: u32 = SOCKET_EVENT_RX | SOCKET_EVENT_TX | SOCKET_EVENT_ERROR;

bitflags::bitflags! {
	/// Socket options.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SocketOptions: u32 {
		/// Operations that would block return
		/// [`Error::InProgress`](crate::Error::InProgress) instead.
		const NON_BLOCKING = 1;
	}
}

bitflags::bitflags! {
	/// Events requested from and reported by [`Stack::socket_poll`].
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct PollEvents: u32 {
		const POLLIN = 1;
		const POLLOUT = 2;
		const POLLERR = 4;
	}
}

/// Kind of transport behind a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
	Udp,
	Tcp,
}

/// Identifier of a pooled socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketId(pub(crate) usize);

/// One record of a [`Stack::socket_poll`] call.
#[derive(Debug, Clone, Copy)]
pub struct PollData {
	pub socket: SocketId,
	pub req_events: PollEvents,
	pub ret_events: PollEvents,
}

impl PollData {
	pub fn new(socket: SocketId, req_events: PollEvents) -> Self {
		Self {
			socket,
			req_events,
			ret_events: PollEvents::empty(),
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SocketHandle {
	Udp(UdpHandleId),
	Tcp(TcpHandleId),
}

pub(crate) struct SocketEntry {
	free: bool,
	handle: Option<SocketHandle>,
	options: SocketOptions,
	rx_packets: PacketQueue,
	sync: FlagSet,
	#[cfg(feature = "socket-poll")]
	poll: Option<usize>,
	/// Listener this socket was accepted from.
	parent: Option<usize>,
	child_count: usize,
	max_child_count: usize,
	accept_pending: Vec<usize>,
	accepted: VecDeque<usize>,
}

impl SocketEntry {
	fn new() -> Self {
		Self {
			free: true,
			handle: None,
			options: SocketOptions::empty(),
			rx_packets: PacketQueue::new(),
			sync: FlagSet::new(),
			#[cfg(feature = "socket-poll")]
			poll: None,
			parent: None,
			child_count: 0,
			max_child_count: 0,
			accept_pending: Vec::new(),
			accepted: VecDeque::new(),
		}
	}
}

#[cfg(feature = "socket-poll")]
struct PollEntry {
	free: bool,
	sync: FlagSet,
}

pub(crate) struct SocketModule {
	sockets: Vec<SocketEntry>,
	#[cfg(feature = "socket-poll")]
	polls: Vec<PollEntry>,
}

impl SocketModule {
	pub(crate) fn new() -> Self {
		Self {
			sockets: (0..config::SOCKET_MAX_COUNT).map(|_| SocketEntry::new()).collect(),
			#[cfg(feature = "socket-poll")]
			polls: (0..config::SOCKET_MAX_POLL_COUNT)
				.map(|_| PollEntry {
					free: true,
					sync: FlagSet::new(),
				})
				.collect(),
		}
	}
}

fn entry(core: &StackCore, socket: SocketId) -> Result<&SocketEntry> {
	match core.socket.sockets.get(socket.0) {
		Some(entry) if !entry.free => Ok(entry),
		_ => Err(Error::InvalidArg),
	}
}

fn entry_mut(core: &mut StackCore, socket: SocketId) -> Result<&mut SocketEntry> {
	match core.socket.sockets.get_mut(socket.0) {
		Some(entry) if !entry.free => Ok(entry),
		_ => Err(Error::InvalidArg),
	}
}

/// Signals the poll record attached to `socket`, if any.
fn notify_poll(core: &mut StackCore, socket: usize) {
	#[cfg(feature = "socket-poll")]
	{
		let poll = core.socket.sockets[socket].poll;
		if let Some(poll) = poll {
			core.socket.polls[poll].sync.set(SOCKET_EVENT_ALL);
		}
	}
	#[cfg(not(feature = "socket-poll"))]
	let _ = (core, socket);
}

fn signal(core: &mut StackCore, socket: usize, events: u32) {
	core.socket.sockets[socket].sync.set(events);
	notify_poll(core, socket);
}

/// Translator from UDP handle events to socket state.
struct SocketUdpHandler {
	socket: usize,
}

impl UdpEventHandler for SocketUdpHandler {
	fn on_rx(
		&mut self,
		core: &mut StackCore,
		_handle: UdpHandleId,
		_header: &UdpHeader,
		packet: Packet,
	) -> RxDisposition {
		let entry = &mut core.socket.sockets[self.socket];
		if entry.free {
			return RxDisposition::Release(packet);
		}
		entry.rx_packets.push(packet);
		signal(core, self.socket, SOCKET_EVENT_RX);
		RxDisposition::Kept
	}

	fn on_tx(&mut self, core: &mut StackCore, _handle: UdpHandleId) {
		signal(core, self.socket, SOCKET_EVENT_TX);
	}

	fn on_tx_failed(&mut self, core: &mut StackCore, _handle: UdpHandleId, _error: Error) {
		signal(core, self.socket, SOCKET_EVENT_ERROR);
	}
}

/// Translator from TCP handle events to socket state, including the
/// accept queue of listeners.
struct SocketTcpHandler {
	socket: usize,
}

impl SocketTcpHandler {
	fn unlink_from_parent(&self, core: &mut StackCore) -> Option<usize> {
		let parent = core.socket.sockets[self.socket].parent?;
		let pending = &mut core.socket.sockets[parent].accept_pending;
		if let Some(index) = pending.iter().position(|socket| *socket == self.socket) {
			pending.remove(index);
		}
		Some(parent)
	}
}

impl TcpEventHandler for SocketTcpHandler {
	fn on_rx(
		&mut self,
		core: &mut StackCore,
		_handle: TcpHandleId,
		packet: Packet,
	) -> RxDisposition {
		let entry = &mut core.socket.sockets[self.socket];
		if entry.free {
			return RxDisposition::Release(packet);
		}
		entry.rx_packets.push(packet);
		signal(core, self.socket, SOCKET_EVENT_RX);
		RxDisposition::Kept
	}

	fn on_tx(&mut self, core: &mut StackCore, _handle: TcpHandleId) {
		signal(core, self.socket, SOCKET_EVENT_TX);
	}

	fn on_tx_failed(&mut self, core: &mut StackCore, _handle: TcpHandleId, _error: Error) {
		signal(core, self.socket, SOCKET_EVENT_ERROR);
	}

	fn on_connected(&mut self, core: &mut StackCore, _handle: TcpHandleId) {
		signal(core, self.socket, SOCKET_EVENT_TX);
	}

	fn on_connect_timeout(&mut self, core: &mut StackCore, _handle: TcpHandleId) {
		signal(core, self.socket, SOCKET_EVENT_ERROR);
	}

	fn on_closed(&mut self, core: &mut StackCore, _handle: TcpHandleId, _result: Result<()>) {
		let parent = core.socket.sockets[self.socket].parent;
		if let Some(parent) = parent {
			let listener = &mut core.socket.sockets[parent];
			listener.child_count = listener.child_count.saturating_sub(1);
		}
		signal(core, self.socket, SOCKET_EVENT_ERROR);
	}

	fn on_accepting(&mut self, core: &mut StackCore, _listener: TcpHandleId) -> Option<TcpHandleId> {
		let listener = self.socket;
		{
			let entry = &core.socket.sockets[listener];
			if entry.free || entry.child_count >= entry.max_child_count {
				return None;
			}
		}

		let child = allocate(core, SocketType::Tcp).ok()?;
		core.socket.sockets[child.0].parent = Some(listener);
		core.socket.sockets[listener].accept_pending.push(child.0);
		core.socket.sockets[listener].child_count += 1;

		match core.socket.sockets[child.0].handle {
			Some(SocketHandle::Tcp(handle)) => Some(handle),
			_ => None,
		}
	}

	fn on_accepted(&mut self, core: &mut StackCore, _handle: TcpHandleId) {
		let Some(parent) = self.unlink_from_parent(core) else {
			return;
		};
		core.socket.sockets[parent].accepted.push_back(self.socket);
		signal(core, parent, SOCKET_EVENT_RX);
	}

	fn on_accept_failed(&mut self, core: &mut StackCore, _handle: TcpHandleId, _error: Error) {
		if let Some(parent) = self.unlink_from_parent(core) {
			let listener = &mut core.socket.sockets[parent];
			listener.child_count = listener.child_count.saturating_sub(1);
		}
		let _ = release(core, SocketId(self.socket));
	}
}

/// Allocates a socket of the given type.
pub(crate) fn allocate(core: &mut StackCore, kind: SocketType) -> Result<SocketId> {
	let Some(index) = core.socket.sockets.iter().position(|entry| entry.free) else {
		return Err(Error::Resource);
	};

	{
		let entry = &mut core.socket.sockets[index];
		entry.options = SocketOptions::empty();
		entry.sync.reset(u32::MAX);
		#[cfg(feature = "socket-poll")]
		{
			entry.poll = None;
		}
		entry.parent = None;
		entry.child_count = 0;
		entry.max_child_count = 0;
		entry.accept_pending.clear();
		entry.accepted.clear();
	}

	let handle = match kind {
		SocketType::Udp => {
			let handle = udp::open(core, Box::new(SocketUdpHandler { socket: index }))?;
			// A fresh UDP handle may transmit right away.
			core.socket.sockets[index].sync.set(SOCKET_EVENT_TX);
			SocketHandle::Udp(handle)
		}
		SocketType::Tcp => {
			let handle = tcp::create(core, Box::new(SocketTcpHandler { socket: index }));
			if let Err(error) = tcp::open(core, handle, 0) {
				tcp::destroy(core, handle);
				return Err(error);
			}
			SocketHandle::Tcp(handle)
		}
	};

	let entry = &mut core.socket.sockets[index];
	entry.handle = Some(handle);
	entry.free = false;
	Ok(SocketId(index))
}

/// Releases a socket: tears down its transport handle, frees queued
/// packets and wakes every waiter with failure.
pub(crate) fn release(core: &mut StackCore, socket: SocketId) -> Result<()> {
	let handle = entry(core, socket)?.handle;

	match handle {
		Some(SocketHandle::Udp(handle)) => {
			let _ = udp::release(core, handle);
		}
		Some(SocketHandle::Tcp(handle)) => {
			// The forced close fails outside connected states; release the
			// handle regardless.
			let _ = tcp::close(core, handle);
			tcp::destroy(core, handle);
		}
		None => {}
	}

	let packets: Vec<Packet> = {
		let entry = &mut core.socket.sockets[socket.0];
		entry.rx_packets.drain().collect()
	};
	for packet in packets {
		ethernet::release_packet(core, packet);
	}

	let entry = &mut core.socket.sockets[socket.0];
	entry.handle = None;
	entry.free = true;
	entry.sync.set(u32::MAX);
	Ok(())
}

/// Binds the underlying transport handle.
pub(crate) fn bind(core: &mut StackCore, socket: SocketId, endpoint: Endpoint) -> Result<()> {
	match entry(core, socket)?.handle {
		Some(SocketHandle::Udp(handle)) => udp::bind(core, handle, endpoint.address, endpoint.port),
		Some(SocketHandle::Tcp(handle)) => tcp::bind(core, handle, endpoint.address, endpoint.port),
		None => Err(Error::InvalidArg),
	}
}

pub(crate) fn set_non_blocking(
	core: &mut StackCore,
	socket: SocketId,
	non_blocking: bool,
) -> Result<()> {
	let entry = entry_mut(core, socket)?;
	entry.options.set(SocketOptions::NON_BLOCKING, non_blocking);
	Ok(())
}

/// Receives from a socket.
///
/// UDP consumes exactly one queued datagram and fails with
/// `BufferTooSmall` (leaving it queued) when the buffer cannot take it
/// whole. TCP drains bytes across queued segments until the buffer is
/// full or the queue empties.
pub(crate) fn receive_from(
	stack: &Stack,
	socket: SocketId,
	buffer: &mut [u8],
) -> Result<(usize, Endpoint)> {
	let mut core = stack.lock();

	// Reception requires a bound UDP handle or an established connection.
	let handle = entry(&core, socket)?.handle.ok_or(Error::InvalidArg)?;
	match handle {
		SocketHandle::Udp(handle) => {
			let bound = core
				.udp
				.handles
				.get(handle.0)
				.is_some_and(|entry| entry.is_bound);
			if !bound {
				return Err(Error::InvalidArg);
			}
		}
		SocketHandle::Tcp(handle) => {
			if tcp::state(&core, handle)? != TcpState::Established {
				return Err(Error::InvalidTcpState);
			}
		}
	}

	loop {
		let entry = &mut core.socket.sockets[socket.0];
		if entry.free {
			return Err(Error::Failure);
		}

		if !entry.rx_packets.is_empty() {
			match handle {
				SocketHandle::Udp(_) => {
					let length = entry.rx_packets.head().unwrap().count();
					if buffer.len() < length {
						return Err(Error::BufferTooSmall);
					}
					let mut packet = entry.rx_packets.pop().unwrap();
					let endpoint = udp::read_header(&packet);
					packet.read_into(&mut buffer[..length]);
					ethernet::release_packet(&mut core, packet);
					return Ok((length, endpoint));
				}
				SocketHandle::Tcp(handle) => {
					let mut received = 0;
					loop {
						let entry = &mut core.socket.sockets[socket.0];
						let Some(head) = entry.rx_packets.head_mut() else {
							break;
						};
						let take = (buffer.len() - received).min(head.count());
						head.read_into(&mut buffer[received..received + take]);
						received += take;
						if head.count() == 0 {
							let packet = entry.rx_packets.pop().unwrap();
							ethernet::release_packet(&mut core, packet);
						}
						if received == buffer.len() {
							break;
						}
					}
					let endpoint = core
						.tcp
						.handles
						.get(handle.0)
						.map(|entry| Endpoint::new(entry.dest_address, entry.dest_port))
						.unwrap_or_default();
					return Ok((received, endpoint));
				}
			}
		}

		if entry.options.contains(SocketOptions::NON_BLOCKING) {
			return Err(Error::InProgress);
		}

		let sync = entry.sync.clone();
		drop(core);
		let events = sync.wait(SOCKET_EVENT_RX | SOCKET_EVENT_ERROR, true, None)?;
		core = stack.lock();
		if core.socket.sockets[socket.0].free {
			return Err(Error::Failure);
		}
		if events & SOCKET_EVENT_ERROR != 0 {
			return Err(Error::Failure);
		}
	}
}

/// Sends on a socket. The whole payload must fit one datagram/segment.
pub(crate) fn send_to(
	stack: &Stack,
	socket: SocketId,
	data: &[u8],
	endpoint: Option<Endpoint>,
) -> Result<usize> {
	let mut core = stack.lock();
	let handle = entry(&core, socket)?.handle.ok_or(Error::InvalidArg)?;

	match handle {
		SocketHandle::Udp(handle) => {
			let endpoint = endpoint.ok_or(Error::InvalidArg)?;
			loop {
				if core.socket.sockets[socket.0].free {
					return Err(Error::Failure);
				}
				let non_blocking = core.socket.sockets[socket.0]
					.options
					.contains(SocketOptions::NON_BLOCKING);

				match udp::handle_is_ready(&core, handle) {
					Ok(()) => {
						let mut packet = udp::allocate_packet(&mut core, data.len())?;
						packet.write_slice(data);
						match udp::send_packet(
							&mut core,
							handle,
							endpoint.address,
							endpoint.port,
							packet,
						)? {
							SendStatus::Sent => return Ok(data.len()),
							SendStatus::Pending => {
								if non_blocking {
									return Err(Error::InProgress);
								}
								// Await the deferred completion.
								core.socket.sockets[socket.0].sync.reset(SOCKET_EVENT_TX);
								let sync = core.socket.sockets[socket.0].sync.clone();
								drop(core);
								let events = sync.wait(
									SOCKET_EVENT_TX | SOCKET_EVENT_ERROR,
									true,
									None,
								)?;
								core = stack.lock();
								if core.socket.sockets[socket.0].free
									|| events & SOCKET_EVENT_ERROR != 0
								{
									return Err(Error::Failure);
								}
								return Ok(data.len());
							}
						}
					}
					Err(Error::Busy) if !non_blocking => {
						let sync = core.socket.sockets[socket.0].sync.clone();
						drop(core);
						let events =
							sync.wait(SOCKET_EVENT_TX | SOCKET_EVENT_ERROR, true, None)?;
						core = stack.lock();
						if core.socket.sockets[socket.0].free
							|| events & SOCKET_EVENT_ERROR != 0
						{
							return Err(Error::Failure);
						}
					}
					Err(error) => return Err(error),
				}
			}
		}

		SocketHandle::Tcp(handle) => loop {
			if core.socket.sockets[socket.0].free {
				return Err(Error::Failure);
			}
			let non_blocking = core.socket.sockets[socket.0]
				.options
				.contains(SocketOptions::NON_BLOCKING);

			let mut packet = tcp::allocate_packet(&mut core, data.len())?;
			packet.write_slice(data);
			match tcp::send_packet(&mut core, handle, packet) {
				Ok(SendStatus::Sent) => return Ok(data.len()),
				Ok(SendStatus::Pending) => {
					if non_blocking {
						return Err(Error::InProgress);
					}
					let sync = core.socket.sockets[socket.0].sync.clone();
					drop(core);
					let events = sync.wait(SOCKET_EVENT_TX | SOCKET_EVENT_ERROR, true, None)?;
					core = stack.lock();
					if core.socket.sockets[socket.0].free || events & SOCKET_EVENT_ERROR != 0 {
						return Err(Error::Failure);
					}
					return Ok(data.len());
				}
				Err(Error::Busy) => {
					// Previous segment not yet acknowledged.
					if non_blocking {
						return Err(Error::Busy);
					}
					let sync = core.socket.sockets[socket.0].sync.clone();
					drop(core);
					let events = sync.wait(SOCKET_EVENT_TX | SOCKET_EVENT_ERROR, true, None)?;
					core = stack.lock();
					if core.socket.sockets[socket.0].free || events & SOCKET_EVENT_ERROR != 0 {
						return Err(Error::Failure);
					}
				}
				Err(error) => return Err(error),
			}
		},
	}
}

/// Puts a TCP socket into the listening state with a child limit.
pub(crate) fn listen(core: &mut StackCore, socket: SocketId, backlog: usize) -> Result<()> {
	if backlog == 0 || backlog > config::SOMAXCONN {
		return Err(Error::InvalidArg);
	}
	let Some(SocketHandle::Tcp(handle)) = entry(core, socket)?.handle else {
		return Err(Error::InvalidArg);
	};

	core.socket.sockets[socket.0].max_child_count = backlog;
	tcp::listen(core, handle)
}

/// Pops an established connection from the accept queue.
pub(crate) fn accept(stack: &Stack, socket: SocketId) -> Result<(SocketId, Endpoint)> {
	let mut core = stack.lock();

	let Some(SocketHandle::Tcp(handle)) = entry(&core, socket)?.handle else {
		return Err(Error::InvalidArg);
	};
	if tcp::state(&core, handle)? != TcpState::Listen {
		return Err(Error::InvalidTcpState);
	}

	loop {
		if core.socket.sockets[socket.0].free {
			return Err(Error::Failure);
		}

		if let Some(child) = core.socket.sockets[socket.0].accepted.pop_front() {
			let endpoint = match core.socket.sockets[child].handle {
				Some(SocketHandle::Tcp(handle)) => core
					.tcp
					.handles
					.get(handle.0)
					.map(|entry| Endpoint::new(entry.dest_address, entry.dest_port))
					.unwrap_or_default(),
				_ => Endpoint::default(),
			};
			return Ok((SocketId(child), endpoint));
		}

		if core.socket.sockets[socket.0]
			.options
			.contains(SocketOptions::NON_BLOCKING)
		{
			return Err(Error::InProgress);
		}

		let sync = core.socket.sockets[socket.0].sync.clone();
		sync.reset(SOCKET_EVENT_ALL);
		drop(core);
		let events = sync.wait(SOCKET_EVENT_RX | SOCKET_EVENT_ERROR, true, None)?;
		core = stack.lock();
		if core.socket.sockets[socket.0].free || events & SOCKET_EVENT_ERROR != 0 {
			return Err(Error::Failure);
		}
	}
}

/// Connects a TCP socket; blocking mode waits until the handshake ends.
pub(crate) fn connect(stack: &Stack, socket: SocketId, endpoint: Endpoint) -> Result<()> {
	let mut core = stack.lock();

	let Some(SocketHandle::Tcp(handle)) = entry(&core, socket)?.handle else {
		return Err(Error::InvalidArg);
	};

	let sync = core.socket.sockets[socket.0].sync.clone();
	sync.reset(SOCKET_EVENT_ALL);
	tcp::connect(&mut core, handle, endpoint.address, endpoint.port)?;

	if core.socket.sockets[socket.0]
		.options
		.contains(SocketOptions::NON_BLOCKING)
	{
		return Err(Error::InProgress);
	}

	drop(core);
	let events = sync.wait(SOCKET_EVENT_TX | SOCKET_EVENT_ERROR, true, None)?;
	core = stack.lock();

	if core.socket.sockets[socket.0].free || events & SOCKET_EVENT_ERROR != 0 {
		return Err(Error::Failure);
	}
	if tcp::state(&core, handle)? != TcpState::Established {
		return Err(Error::Failure);
	}
	Ok(())
}

/// Waits for events on a set of sockets.
#[cfg(feature = "socket-poll")]
pub(crate) fn poll(
	stack: &Stack,
	records: &mut [PollData],
	timeout: Option<u32>,
) -> Result<usize> {
	if records.is_empty() {
		return Err(Error::InvalidArg);
	}

	let mut core = stack.lock();

	let Some(poll_index) = core.socket.polls.iter().position(|poll| poll.free) else {
		return Err(Error::Resource);
	};
	core.socket.polls[poll_index].free = false;

	let result = loop {
		let mut ready = 0usize;

		let mut invalid = false;
		for record in records.iter_mut() {
			let Ok(_) = entry(&core, record.socket) else {
				invalid = true;
				break;
			};

			let flags = core.socket.sockets[record.socket.0]
				.sync
				.wait(SOCKET_EVENT_ALL, true, Some(0))
				.unwrap_or(0);

			record.ret_events = PollEvents::empty();
			if record.req_events.contains(PollEvents::POLLIN)
				&& (flags & SOCKET_EVENT_RX != 0
					|| !core.socket.sockets[record.socket.0].rx_packets.is_empty()
					|| !core.socket.sockets[record.socket.0].accepted.is_empty())
			{
				record.ret_events |= PollEvents::POLLIN;
			}
			if record.req_events.contains(PollEvents::POLLOUT) {
				let writable = flags & SOCKET_EVENT_TX != 0
					|| match core.socket.sockets[record.socket.0].handle {
						Some(SocketHandle::Udp(handle)) => {
							udp::handle_is_ready(&core, handle).is_ok()
						}
						_ => false,
					};
				if writable {
					record.ret_events |= PollEvents::POLLOUT;
				}
			}
			if record.req_events.contains(PollEvents::POLLERR) && flags & SOCKET_EVENT_ERROR != 0
			{
				record.ret_events |= PollEvents::POLLERR;
			}

			if !record.ret_events.is_empty() {
				ready += 1;
			}
			core.socket.sockets[record.socket.0].poll = Some(poll_index);
		}

		if invalid {
			break Err(Error::InvalidArg);
		}
		if ready != 0 {
			break Ok(ready);
		}

		let sync = core.socket.polls[poll_index].sync.clone();
		sync.reset(u32::MAX);
		drop(core);
		let waited = sync.wait(u32::MAX, true, timeout);
		core = stack.lock();
		if let Err(error) = waited {
			break Err(error);
		}
	};

	core.socket.polls[poll_index].free = true;
	for record in records.iter() {
		if let Some(entry) = core.socket.sockets.get_mut(record.socket.0) {
			entry.poll = None;
		}
	}

	result
}
