//! Network interface management: registration, address configuration and
//! the per-interface Rx/Tx pump.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::config;
use crate::drivers::net::{DriverCallbacks, DriverCaps, LinkState, NetDriver};
use crate::error::{Error, Result};
use crate::net::{StackCore, ethernet, route};
use crate::oal::{FlagSet, time};
use crate::packet::PacketFlags;
use crate::util::Pool;
use crate::wire::{Ipv4Address, MacAddr};

/// Identifier of a registered network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceId(pub(crate) usize);

/// The loopback interface registered by [`Stack::new`](crate::Stack::new).
#[cfg(feature = "localhost")]
pub const LOCALHOST_INTERFACE: IfaceId = IfaceId(0);

pub(crate) struct NetIf {
	pub(crate) name: String,
	pub(crate) mac: MacAddr,
	pub(crate) ipv4: Ipv4Address,
	pub(crate) netmask: Ipv4Address,
	pub(crate) gateway: Ipv4Address,
	pub(crate) driver: Box<dyn NetDriver>,
	pub(crate) caps: DriverCaps,
	pub(crate) events: FlagSet,
	pub(crate) up: bool,
}

pub(crate) struct IfaceModule {
	ifaces: Pool<NetIf>,
	last_tick_ms: u32,
}

impl IfaceModule {
	pub(crate) fn new() -> Self {
		Self {
			ifaces: Pool::new(),
			last_tick_ms: 0,
		}
	}

	pub(crate) fn get(&self, iface: IfaceId) -> Option<&NetIf> {
		self.ifaces.get(iface.0)
	}

	pub(crate) fn get_mut(&mut self, iface: IfaceId) -> Option<&mut NetIf> {
		self.ifaces.get_mut(iface.0)
	}

	fn ids(&self) -> Vec<usize> {
		self.ifaces.ids()
	}
}

/// Registers an interface and primes its receive ring.
pub fn add_interface(
	core: &mut StackCore,
	mut driver: Box<dyn NetDriver>,
	name: &str,
	rx_packet_count: usize,
	rx_packet_size: usize,
) -> Result<IfaceId> {
	if core.ifaces.ifaces.iter().count() >= config::MAX_NET_INTERFACES_COUNT {
		return Err(Error::Resource);
	}

	let events = FlagSet::new();
	driver.init(DriverCallbacks::new(events.clone()))?;
	let caps = driver.capabilities();

	let id = core.ifaces.ifaces.insert(NetIf {
		name: name.into(),
		mac: MacAddr::default(),
		ipv4: Ipv4Address::ANY,
		netmask: Ipv4Address::ANY,
		gateway: Ipv4Address::ANY,
		driver,
		caps,
		events,
		up: false,
	});
	let iface = IfaceId(id);

	for _ in 0..rx_packet_count {
		let mut packet = core.allocator.allocate(rx_packet_size)?;
		packet.flags = PacketFlags::RX;
		packet.net_if = Some(iface);
		let netif = core.ifaces.get_mut(iface).unwrap();
		if let Err(error) = netif.driver.add_rx_packet(packet) {
			log::error!("{name}: priming the rx ring failed: {error}");
			break;
		}
	}

	log::info!("interface {name} registered as {}", iface.0);
	Ok(iface)
}

/// Unregisters an interface; its task exits on the next wakeup.
pub fn remove_interface(core: &mut StackCore, iface: IfaceId) -> Result<()> {
	route::remove_for_iface(core, iface);
	match core.ifaces.ifaces.remove(iface.0) {
		Some(mut netif) => {
			let _ = netif.driver.stop();
			// Wake the interface task so it can observe the removal.
			netif.events.set(u32::MAX);
			Ok(())
		}
		None => Err(Error::InvalidArg),
	}
}

pub fn set_mac_address(core: &mut StackCore, iface: IfaceId, mac: MacAddr) -> Result<()> {
	let netif = core.ifaces.get_mut(iface).ok_or(Error::InvalidArg)?;
	netif.mac = mac;
	netif.driver.set_mac_address(mac)
}

/// Configures the address triple and re-installs the interface-local
/// routes: the connected subnet and, when a gateway is set, the default
/// route through it.
pub fn set_ipv4_address(
	core: &mut StackCore,
	iface: IfaceId,
	address: Ipv4Address,
	netmask: Ipv4Address,
	gateway: Ipv4Address,
) -> Result<()> {
	{
		let netif = core.ifaces.get_mut(iface).ok_or(Error::InvalidArg)?;
		netif.ipv4 = address;
		netif.netmask = netmask;
		netif.gateway = gateway;
		netif.driver.set_ipv4_address(address, netmask, gateway)?;
	}

	route::remove_for_iface(core, iface);
	if !address.is_unspecified() {
		route::add(core, address, netmask, Ipv4Address::ANY, iface)?;
		if !gateway.is_unspecified() {
			route::add(core, Ipv4Address::ANY, Ipv4Address::ANY, gateway, iface)?;
		}
	}
	Ok(())
}

pub fn up(core: &mut StackCore, iface: IfaceId) -> Result<()> {
	let netif = core.ifaces.get_mut(iface).ok_or(Error::InvalidArg)?;
	netif.driver.start()?;
	netif.up = true;
	log::info!("interface {} is up", netif.name);
	Ok(())
}

pub fn down(core: &mut StackCore, iface: IfaceId) -> Result<()> {
	let netif = core.ifaces.get_mut(iface).ok_or(Error::InvalidArg)?;
	netif.driver.stop()?;
	netif.up = false;
	log::info!("interface {} is down", netif.name);
	Ok(())
}

pub fn link_state(core: &mut StackCore, iface: IfaceId) -> Result<LinkState> {
	core.ifaces
		.get(iface)
		.map(|netif| netif.driver.link_state())
		.ok_or(Error::InvalidArg)
}

/// Drains the completion queues of one interface.
///
/// Transmitted buffers go back through the release path (allocator, Rx
/// ring or TCP retransmission slot); received frames run through the
/// Ethernet demultiplexer.
pub(crate) fn pump(core: &mut StackCore, iface: IfaceId) {
	loop {
		let packet = match core.ifaces.get_mut(iface) {
			Some(netif) => netif.driver.next_tx_packet(),
			None => return,
		};
		let Some(packet) = packet else {
			break;
		};
		ethernet::release_packet(core, packet);
	}

	loop {
		let packet = match core.ifaces.get_mut(iface) {
			Some(netif) => netif.driver.next_rx_packet(),
			None => return,
		};
		let Some(mut packet) = packet else {
			break;
		};
		packet.net_if = Some(iface);

		let (result, leftover) = ethernet::rx_frame(core, iface, packet);
		match result {
			Ok(()) | Err(Error::IgnorePacket) => {}
			Err(error) => log::debug!("rx frame dropped: {error}"),
		}
		if let Some(leftover) = leftover {
			ethernet::release_packet(core, leftover);
		}
	}
}

/// Runs the periodic tick when at least one millisecond has elapsed.
pub(crate) fn tick(core: &mut StackCore) {
	let now = time::ms_counter();
	if now != core.ifaces.last_tick_ms {
		core.ifaces.last_tick_ms = now;
		ethernet::periodic_task(core);
	}
}

/// One pump pass over every interface plus the tick.
pub(crate) fn pump_all(core: &mut StackCore) {
	for id in core.ifaces.ids() {
		pump(core, IfaceId(id));
	}
	tick(core);
}

/// Body of the per-interface task: wait for driver completions, then pump
/// under the stack mutex.
#[cfg(feature = "std")]
pub(crate) fn task_body(stack: &crate::net::Stack, iface: IfaceId, events: FlagSet) {
	use crate::oal::IfaceEvent;

	loop {
		// Bounded wait so the millisecond tick keeps running even when the
		// link is quiet.
		let _ = events.wait(IfaceEvent::all().bits(), true, Some(1));

		let mut core = stack.lock();
		if core.ifaces.get(iface).is_none() {
			break;
		}
		pump(&mut core, iface);
		tick(&mut core);
	}
}
