//! Static route table with longest-prefix matching.

use heapless::Vec;

use crate::config;
use crate::error::{Error, Result};
use crate::net::StackCore;
use crate::net::iface::IfaceId;
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
	pub ipv4: Ipv4Address,
	pub netmask: Ipv4Address,
	/// Next hop; `0.0.0.0` means directly connected.
	pub gateway: Ipv4Address,
	pub iface: IfaceId,
}

pub(crate) struct RouteModule {
	entries: Vec<RouteEntry, { config::MAX_NET_ROUTE_COUNT }>,
}

impl RouteModule {
	pub(crate) fn new() -> Self {
		Self { entries: Vec::new() }
	}
}

/// Adds a route. The stored prefix is `ipv4 & netmask`.
pub fn add(
	core: &mut StackCore,
	ipv4: Ipv4Address,
	netmask: Ipv4Address,
	gateway: Ipv4Address,
	iface: IfaceId,
) -> Result<()> {
	let entry = RouteEntry {
		ipv4: Ipv4Address(ipv4.0 & netmask.0),
		netmask,
		gateway,
		iface,
	};
	core.route.entries.push(entry).map_err(|_| Error::Resource)
}

/// Removes the route for `(ipv4, netmask)`.
pub fn remove(core: &mut StackCore, ipv4: Ipv4Address, netmask: Ipv4Address) -> Result<()> {
	let prefix = ipv4.0 & netmask.0;
	let index = core
		.route
		.entries
		.iter()
		.position(|entry| entry.ipv4.0 == prefix && entry.netmask == netmask);
	match index {
		Some(index) => {
			core.route.entries.swap_remove(index);
			Ok(())
		}
		None => Err(Error::InvalidArg),
	}
}

/// Removes every route through `iface`.
pub(crate) fn remove_for_iface(core: &mut StackCore, iface: IfaceId) {
	core.route.entries.retain(|entry| entry.iface != iface);
}

/// Finds the route for `dest` with the longest matching netmask.
pub fn search(core: &StackCore, dest: Ipv4Address) -> Result<(Ipv4Address, IfaceId)> {
	let mut best: Option<&RouteEntry> = None;

	for entry in &core.route.entries {
		if dest.0 & entry.netmask.0 != entry.ipv4.0 {
			continue;
		}
		if best.is_none_or(|current| entry.netmask.0 > current.netmask.0) {
			best = Some(entry);
		}
	}

	best.map(|entry| (entry.gateway, entry.iface))
		.ok_or(Error::Failure)
}
