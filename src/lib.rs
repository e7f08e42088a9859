//! A compact TCP/IP v4 stack for embedded and hosted environments.
//!
//! The stack takes raw Ethernet frames from a driver implementing
//! [`drivers::net::NetDriver`], runs them through the ARP, IPv4, ICMP, UDP
//! and TCP protocols, and exposes two concurrent user surfaces: an
//! event-driven handle API ([`Stack::udp_open`], [`Stack::tcp_open`], ...)
//! and a blocking/non-blocking socket API ([`Stack::socket`],
//! [`Stack::socket_receive_from`], [`Stack::socket_poll`], ...).
//!
//! Packet buffers come from a user-supplied [`packet::PacketAllocator`];
//! the bundled [`packet::BigSmallAllocator`] carves two fixed pools up
//! front so the data path never touches the heap.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nano_ip::packet::BigSmallAllocator;
//! use nano_ip::{Endpoint, Ipv4Address, Stack};
//!
//! let allocator = Arc::new(BigSmallAllocator::new(1536, 8, 128, 8));
//! let stack = Stack::new(allocator).unwrap();
//! stack.start().unwrap();
//!
//! let socket = stack.socket(nano_ip::socket::SocketType::Udp).unwrap();
//! stack
//! 	.socket_bind(socket, Endpoint::new(Ipv4Address::ANY, 4242))
//! 	.unwrap();
//! let mut buffer = [0u8; 1024];
//! let (received, peer) = stack.socket_receive_from(socket, &mut buffer).unwrap();
//! println!("{} bytes from {}", received, peer);
//! ```
//!
//! ## Feature flags
#![cfg_attr(
	feature = "document-features",
	doc = document_features::document_features!()
)]
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(rust_2018_idioms)]

extern crate alloc;

pub mod config;
pub mod drivers;
mod error;
pub mod net;
pub mod oal;
pub mod packet;
#[cfg(feature = "socket")]
pub mod socket;
mod util;
pub mod wire;

pub use error::{Error, Result};
pub use net::{IfaceId, RxDisposition, Stack, StackCore};
pub use wire::{Endpoint, Ipv4Address, MacAddr};
