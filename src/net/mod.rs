//! The protocol core.
//!
//! All stack state lives in [`StackCore`], a single instance serialized by
//! the stack mutex. [`Stack`] is the cheaply clonable front object: every
//! public operation locks the core once and calls into the protocol
//! modules, which are plain functions over `&mut StackCore`. Event handlers
//! are invoked with the core borrowed mutably, so they may call any module
//! function directly without re-locking — this replaces the recursive
//! mutex re-entry of classic callback stacks.

pub mod arp;
pub mod ethernet;
#[cfg(feature = "icmp")]
pub mod icmp;
pub mod iface;
pub mod ipv4;
pub mod route;
#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::error::Result;
use crate::oal::{self, Mutex};
use crate::packet::{Packet, PacketAllocator};
use crate::wire::{Ipv4Address, MacAddr};
#[cfg(feature = "socket")]
use crate::socket;

pub use iface::IfaceId;

/// What a receive handler decided about the packet it was offered.
///
/// Returning [`RxDisposition::Kept`] transfers ownership of the buffer to
/// the handler; the stack will not release it.
#[derive(Debug)]
pub enum RxDisposition {
	/// The handler is done with the packet; the stack releases it.
	Release(Packet),
	/// The handler took ownership of the packet.
	Kept,
}

/// The process-wide stack state.
///
/// Owned by [`Stack`] behind the stack mutex; handler callbacks receive it
/// as `&mut StackCore`.
pub struct StackCore {
	pub(crate) allocator: Arc<dyn PacketAllocator>,
	pub(crate) ethernet: ethernet::EthernetModule,
	pub(crate) arp: arp::ArpModule,
	pub(crate) route: route::RouteModule,
	pub(crate) ipv4: ipv4::Ipv4Module,
	#[cfg(feature = "icmp")]
	pub(crate) icmp: icmp::IcmpModule,
	#[cfg(feature = "udp")]
	pub(crate) udp: udp::UdpModule,
	#[cfg(feature = "tcp")]
	pub(crate) tcp: tcp::TcpModule,
	#[cfg(feature = "socket")]
	pub(crate) socket: socket::SocketModule,
	pub(crate) ifaces: iface::IfaceModule,
}

impl StackCore {
	fn new(allocator: Arc<dyn PacketAllocator>) -> Self {
		let mut core = Self {
			allocator,
			ethernet: ethernet::EthernetModule::new(),
			arp: arp::ArpModule::new(),
			route: route::RouteModule::new(),
			ipv4: ipv4::Ipv4Module::new(),
			#[cfg(feature = "icmp")]
			icmp: icmp::IcmpModule::new(),
			#[cfg(feature = "udp")]
			udp: udp::UdpModule::new(),
			#[cfg(feature = "tcp")]
			tcp: tcp::TcpModule::new(),
			#[cfg(feature = "socket")]
			socket: socket::SocketModule::new(),
			ifaces: iface::IfaceModule::new(),
		};

		ethernet::init(&mut core);
		arp::init(&mut core);
		ipv4::init(&mut core);
		#[cfg(feature = "icmp")]
		icmp::init(&mut core);
		#[cfg(feature = "udp")]
		udp::init(&mut core);
		#[cfg(feature = "tcp")]
		tcp::init(&mut core);

		core
	}
}

struct StackInner {
	core: Mutex<StackCore>,
}

/// The stack front object.
///
/// Clones share the same stack instance. All methods are safe to call from
/// any task; blocking socket operations release the stack mutex while they
/// wait so interface tasks keep running.
#[derive(Clone)]
pub struct Stack {
	inner: Arc<StackInner>,
}

impl Stack {
	/// Creates a stack using `allocator` for every packet buffer.
	///
	/// With the `localhost` feature the loopback interface is registered as
	/// interface 0 with address `127.0.0.1/8`; it starts delivering frames
	/// once [`Stack::start`] has been called.
	pub fn new(allocator: Arc<dyn PacketAllocator>) -> Result<Stack> {
		let stack = Stack {
			inner: Arc::new(StackInner {
				core: Mutex::new(StackCore::new(allocator)),
			}),
		};

		#[cfg(feature = "localhost")]
		{
			use crate::drivers::net::loopback::LoopbackDriver;

			let iface = stack.add_interface(Box::new(LoopbackDriver::new()), "localhost", 0, 0)?;
			stack.set_ipv4_address(
				iface,
				Ipv4Address::LOCALHOST,
				Ipv4Address::LOCALHOST_NETMASK,
				Ipv4Address::ANY,
			)?;
		}

		Ok(stack)
	}

	/// Starts the stack: brings the loopback interface up.
	///
	/// Hardware interfaces are brought up individually through
	/// [`Stack::iface_up`] once their link is configured.
	pub fn start(&self) -> Result<()> {
		#[cfg(feature = "localhost")]
		self.iface_up(iface::LOCALHOST_INTERFACE)?;
		Ok(())
	}

	pub(crate) fn lock(&self) -> oal::MutexGuard<'_, StackCore> {
		self.inner.core.lock()
	}

	/// Registers a network interface and primes its receive ring with
	/// `rx_packet_count` buffers of `rx_packet_size` bytes.
	pub fn add_interface(
		&self,
		driver: Box<dyn crate::drivers::net::NetDriver>,
		name: &str,
		rx_packet_count: usize,
		rx_packet_size: usize,
	) -> Result<IfaceId> {
		let id = {
			let mut core = self.lock();
			iface::add_interface(&mut core, driver, name, rx_packet_count, rx_packet_size)?
		};

		// One task per interface pumps completions and the periodic tick.
		#[cfg(feature = "std")]
		{
			let events = {
				let core = self.lock();
				core.ifaces.get(id).unwrap().events.clone()
			};
			let stack = self.clone();
			oal::spawn_task(&alloc::format!("nanoip-if{}", id.0), move || {
				iface::task_body(&stack, id, events);
			})?;
		}

		Ok(id)
	}

	/// Removes an interface. Its task exits on its next wakeup.
	pub fn remove_interface(&self, iface: IfaceId) -> Result<()> {
		iface::remove_interface(&mut self.lock(), iface)
	}

	/// Configures the IPv4 address of an interface and installs its
	/// interface-local routes.
	pub fn set_ipv4_address(
		&self,
		iface: IfaceId,
		address: Ipv4Address,
		netmask: Ipv4Address,
		gateway: Ipv4Address,
	) -> Result<()> {
		iface::set_ipv4_address(&mut self.lock(), iface, address, netmask, gateway)
	}

	pub fn set_mac_address(&self, iface: IfaceId, mac: MacAddr) -> Result<()> {
		iface::set_mac_address(&mut self.lock(), iface, mac)
	}

	pub fn iface_up(&self, iface: IfaceId) -> Result<()> {
		iface::up(&mut self.lock(), iface)
	}

	pub fn iface_down(&self, iface: IfaceId) -> Result<()> {
		iface::down(&mut self.lock(), iface)
	}

	pub fn link_state(&self, iface: IfaceId) -> Result<crate::drivers::net::LinkState> {
		iface::link_state(&mut self.lock(), iface)
	}

	/// Runs one pump pass over every interface plus the periodic tick.
	///
	/// This is the cooperative-mode main-loop entry point; hosted builds
	/// normally rely on the per-interface tasks instead, but calling it is
	/// always safe and tests use it to drive the stack deterministically.
	pub fn poll_once(&self) {
		let mut core = self.lock();
		iface::pump_all(&mut core);
	}

	/// Adds a static entry to the ARP translation table.
	pub fn arp_add_static(&self, mac: MacAddr, address: Ipv4Address) -> Result<()> {
		arp::add_entry(&mut self.lock(), arp::ArpEntryKind::Static, mac, address)
	}

	/// Removes a static entry from the ARP translation table.
	pub fn arp_remove_static(&self, address: Ipv4Address) -> Result<()> {
		arp::remove_entry(&mut self.lock(), address)
	}

	/// Resolves `address` on `iface`.
	///
	/// Returns [`arp::ArpResolution::Resolved`] when the table already holds
	/// a valid entry; otherwise an ARP request goes out and `callback` fires
	/// exactly once with the outcome.
	pub fn arp_request(
		&self,
		iface: IfaceId,
		address: Ipv4Address,
		callback: arp::ArpCallback,
	) -> Result<arp::ArpResolution> {
		arp::request(
			&mut self.lock(),
			iface,
			address,
			arp::ArpClient::User(callback),
		)
	}

	/// Cancels a pending ARP request; its callback fires with failure.
	pub fn arp_cancel(&self, token: arp::ArpToken) -> Result<()> {
		arp::cancel(&mut self.lock(), token)
	}

	/// Adds a static route.
	pub fn route_add(
		&self,
		address: Ipv4Address,
		netmask: Ipv4Address,
		gateway: Ipv4Address,
		iface: IfaceId,
	) -> Result<()> {
		route::add(&mut self.lock(), address, netmask, gateway, iface)
	}

	/// Removes a route.
	pub fn route_remove(&self, address: Ipv4Address, netmask: Ipv4Address) -> Result<()> {
		route::remove(&mut self.lock(), address, netmask)
	}
}

#[cfg(feature = "icmp-ping")]
impl Stack {
	/// Starts an ICMP echo request carrying `data_size` bytes of payload.
	pub fn ping_request(
		&self,
		address: Ipv4Address,
		timeout: u32,
		data_size: u8,
	) -> Result<icmp::PingId> {
		icmp::ping_request(&mut self.lock(), address, timeout, data_size)
	}

	/// Waits for the outcome of a ping request and frees it. Returns the
	/// response time in milliseconds.
	pub fn ping_wait(&self, ping: icmp::PingId, timeout: u32) -> Result<u32> {
		icmp::ping_wait(self, ping, timeout)
	}

	/// Cancels a pending ping request; a parked [`Stack::ping_wait`] fails.
	pub fn ping_cancel(&self, ping: icmp::PingId) -> Result<()> {
		icmp::ping_cancel(&mut self.lock(), ping)
	}

	/// Blocking convenience wrapper: request plus wait.
	pub fn ping(&self, address: Ipv4Address, timeout: u32, data_size: u8) -> Result<u32> {
		let ping = self.ping_request(address, timeout, data_size)?;
		self.ping_wait(ping, timeout)
	}
}

#[cfg(feature = "udp")]
impl Stack {
	/// Creates a UDP handle delivering events to `handler`.
	pub fn udp_open(&self, handler: Box<dyn udp::UdpEventHandler>) -> Result<udp::UdpHandleId> {
		udp::open(&mut self.lock(), handler)
	}

	/// Releases a UDP handle, unbinding it if necessary.
	pub fn udp_release(&self, handle: udp::UdpHandleId) -> Result<()> {
		udp::release(&mut self.lock(), handle)
	}

	pub fn udp_bind(
		&self,
		handle: udp::UdpHandleId,
		address: Ipv4Address,
		port: u16,
	) -> Result<()> {
		udp::bind(&mut self.lock(), handle, address, port)
	}

	pub fn udp_unbind(&self, handle: udp::UdpHandleId) -> Result<()> {
		udp::unbind(&mut self.lock(), handle)
	}

	/// Allocates a packet with room for `payload_size` bytes after the
	/// Ethernet, IPv4 and UDP headers.
	pub fn udp_allocate_packet(&self, payload_size: usize) -> Result<Packet> {
		udp::allocate_packet(&mut self.lock(), payload_size)
	}

	/// Is the handle ready for another send?
	pub fn udp_is_ready(&self, handle: udp::UdpHandleId) -> Result<()> {
		udp::handle_is_ready(&self.lock(), handle)
	}

	/// Sends a datagram. On any error the packet has been released.
	pub fn udp_send_to(
		&self,
		handle: udp::UdpHandleId,
		address: Ipv4Address,
		port: u16,
		packet: Packet,
	) -> Result<()> {
		udp::send_packet(&mut self.lock(), handle, address, port, packet).map(drop)
	}
}

#[cfg(feature = "tcp")]
impl Stack {
	/// Creates a TCP handle in the IDLE state, bound to `local_port` (an
	/// ephemeral port is assigned when 0 is passed).
	pub fn tcp_open(
		&self,
		handler: Box<dyn tcp::TcpEventHandler>,
		local_port: u16,
	) -> Result<tcp::TcpHandleId> {
		let mut core = self.lock();
		let handle = tcp::create(&mut core, handler);
		tcp::open(&mut core, handle, local_port).inspect_err(|_| {
			tcp::destroy(&mut core, handle);
		})?;
		Ok(handle)
	}

	pub fn tcp_bind(
		&self,
		handle: tcp::TcpHandleId,
		address: Ipv4Address,
		port: u16,
	) -> Result<()> {
		tcp::bind(&mut self.lock(), handle, address, port)
	}

	pub fn tcp_listen(&self, handle: tcp::TcpHandleId) -> Result<()> {
		tcp::listen(&mut self.lock(), handle)
	}

	pub fn tcp_connect(
		&self,
		handle: tcp::TcpHandleId,
		address: Ipv4Address,
		port: u16,
	) -> Result<()> {
		tcp::connect(&mut self.lock(), handle, address, port)
	}

	/// Forced close: sends FIN|ACK from ESTABLISHED, then drops straight to
	/// CLOSED without waiting for the handshake to complete.
	pub fn tcp_close(&self, handle: tcp::TcpHandleId) -> Result<()> {
		tcp::close(&mut self.lock(), handle)
	}

	/// Releases a CLOSED handle.
	pub fn tcp_release(&self, handle: tcp::TcpHandleId) -> Result<()> {
		tcp::release(&mut self.lock(), handle)
	}

	/// Allocates a packet with room for `payload_size` bytes after the
	/// Ethernet, IPv4 and TCP headers.
	pub fn tcp_allocate_packet(&self, payload_size: usize) -> Result<Packet> {
		tcp::allocate_packet(&mut self.lock(), payload_size)
	}

	/// Sends a data segment. At most one segment may be outstanding; the
	/// handler's `on_tx` fires when it is acknowledged. On any error the
	/// packet has been released.
	pub fn tcp_send(&self, handle: tcp::TcpHandleId, packet: Packet) -> Result<()> {
		tcp::send_packet(&mut self.lock(), handle, packet).map(drop)
	}

	pub fn tcp_state(&self, handle: tcp::TcpHandleId) -> Result<tcp::TcpState> {
		tcp::state(&self.lock(), handle)
	}

	/// Is the handle ready for another send?
	pub fn tcp_is_ready(&self, handle: tcp::TcpHandleId) -> Result<()> {
		tcp::handle_is_ready(&self.lock(), handle)
	}
}

#[cfg(feature = "socket")]
impl Stack {
	pub fn socket(&self, kind: socket::SocketType) -> Result<socket::SocketId> {
		socket::allocate(&mut self.lock(), kind)
	}

	pub fn socket_release(&self, socket: socket::SocketId) -> Result<()> {
		socket::release(&mut self.lock(), socket)
	}

	pub fn socket_bind(&self, socket: socket::SocketId, endpoint: crate::wire::Endpoint) -> Result<()> {
		socket::bind(&mut self.lock(), socket, endpoint)
	}

	pub fn socket_set_non_blocking(&self, socket: socket::SocketId, non_blocking: bool) -> Result<()> {
		socket::set_non_blocking(&mut self.lock(), socket, non_blocking)
	}

	/// Receives one datagram (UDP) or a run of stream bytes (TCP).
	pub fn socket_receive_from(
		&self,
		socket: socket::SocketId,
		buffer: &mut [u8],
	) -> Result<(usize, crate::wire::Endpoint)> {
		socket::receive_from(self, socket, buffer)
	}

	pub fn socket_receive(&self, socket: socket::SocketId, buffer: &mut [u8]) -> Result<usize> {
		socket::receive_from(self, socket, buffer).map(|(received, _)| received)
	}

	pub fn socket_send_to(
		&self,
		socket: socket::SocketId,
		data: &[u8],
		endpoint: crate::wire::Endpoint,
	) -> Result<usize> {
		socket::send_to(self, socket, data, Some(endpoint))
	}

	pub fn socket_send(&self, socket: socket::SocketId, data: &[u8]) -> Result<usize> {
		socket::send_to(self, socket, data, None)
	}

	pub fn socket_listen(&self, socket: socket::SocketId, backlog: usize) -> Result<()> {
		socket::listen(&mut self.lock(), socket, backlog)
	}

	pub fn socket_accept(
		&self,
		socket: socket::SocketId,
	) -> Result<(socket::SocketId, crate::wire::Endpoint)> {
		socket::accept(self, socket)
	}

	pub fn socket_connect(&self, socket: socket::SocketId, endpoint: crate::wire::Endpoint) -> Result<()> {
		socket::connect(self, socket, endpoint)
	}
}

#[cfg(feature = "socket-poll")]
impl Stack {
	/// Waits until any of the polled sockets signals a requested event.
	/// Returns the number of records whose `ret_events` is non-zero.
	pub fn socket_poll(
		&self,
		records: &mut [socket::PollData],
		timeout: Option<u32>,
	) -> Result<usize> {
		socket::poll(self, records, timeout)
	}
}
