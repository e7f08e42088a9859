//! Shared test harness: a scripted network driver plus frame builders and
//! parsers for asserting on emitted traffic.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nano_ip::drivers::net::{DriverCallbacks, DriverCaps, LinkState, NetDriver};
use nano_ip::packet::{BigSmallAllocator, Packet};
use nano_ip::wire::internet_checksum;
use nano_ip::{Ipv4Address, MacAddr, Stack};

pub const OUR_MAC: MacAddr = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
pub const OUR_IP: Ipv4Address = Ipv4Address::new(192, 168, 0, 70);
pub const NETMASK: Ipv4Address = Ipv4Address::new(255, 255, 255, 0);
pub const REMOTE_MAC: MacAddr = MacAddr([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
pub const REMOTE_IP: Ipv4Address = Ipv4Address::new(192, 168, 0, 1);

struct Shared {
	callbacks: Option<DriverCallbacks>,
	rx_ring: VecDeque<Packet>,
	rx_done: VecDeque<Packet>,
	tx_done: VecDeque<Packet>,
	sent: Vec<Vec<u8>>,
}

/// A driver whose wire is a pair of in-memory queues.
///
/// The FCS check is claimed as a hardware capability so injected frames do
/// not need one; everything else runs through the software paths. `count`
/// excludes any FCS, matching the driver contract.
pub struct TestDriver {
	shared: Arc<Mutex<Shared>>,
}

/// Test-side access to the driver: inject received frames, read sent ones.
#[derive(Clone)]
pub struct DriverHandle {
	shared: Arc<Mutex<Shared>>,
}

impl TestDriver {
	pub fn new() -> (Self, DriverHandle) {
		let shared = Arc::new(Mutex::new(Shared {
			callbacks: None,
			rx_ring: VecDeque::new(),
			rx_done: VecDeque::new(),
			tx_done: VecDeque::new(),
			sent: Vec::new(),
		}));
		(
			Self {
				shared: shared.clone(),
			},
			DriverHandle { shared },
		)
	}
}

impl NetDriver for TestDriver {
	fn init(&mut self, callbacks: DriverCallbacks) -> nano_ip::Result<()> {
		self.shared.lock().unwrap().callbacks = Some(callbacks);
		Ok(())
	}

	fn start(&mut self) -> nano_ip::Result<()> {
		Ok(())
	}

	fn stop(&mut self) -> nano_ip::Result<()> {
		Ok(())
	}

	fn send_packet(&mut self, packet: Packet) -> nano_ip::Result<()> {
		let mut shared = self.shared.lock().unwrap();
		shared.sent.push(packet.as_bytes()[..packet.count()].to_vec());
		shared.tx_done.push_back(packet);
		if let Some(callbacks) = &shared.callbacks {
			callbacks.packet_sent(false);
		}
		Ok(())
	}

	fn add_rx_packet(&mut self, packet: Packet) -> nano_ip::Result<()> {
		self.shared.lock().unwrap().rx_ring.push_back(packet);
		Ok(())
	}

	fn next_rx_packet(&mut self) -> Option<Packet> {
		self.shared.lock().unwrap().rx_done.pop_front()
	}

	fn next_tx_packet(&mut self) -> Option<Packet> {
		self.shared.lock().unwrap().tx_done.pop_front()
	}

	fn link_state(&self) -> LinkState {
		LinkState::Up100Fd
	}

	fn capabilities(&self) -> DriverCaps {
		DriverCaps::ETH_CS_CHECK
	}
}

impl DriverHandle {
	/// Places a frame on the receive-done queue, as a DMA engine would.
	pub fn inject(&self, frame: &[u8]) {
		let mut shared = self.shared.lock().unwrap();
		let mut packet = shared
			.rx_ring
			.pop_front()
			.expect("receive ring is empty; raise rx_packet_count");
		packet.as_bytes_mut()[..frame.len()].copy_from_slice(frame);
		packet.rewind();
		packet.set_count(frame.len());
		shared.rx_done.push_back(packet);
		if let Some(callbacks) = &shared.callbacks {
			callbacks.packet_received(false);
		}
	}

	/// All frames transmitted so far.
	pub fn sent_frames(&self) -> Vec<Vec<u8>> {
		self.shared.lock().unwrap().sent.clone()
	}

	/// Drains the transmitted-frame log.
	pub fn take_sent_frames(&self) -> Vec<Vec<u8>> {
		std::mem::take(&mut self.shared.lock().unwrap().sent)
	}
}

/// Builds a stack with one test interface at `192.168.0.70/24`.
pub fn test_stack() -> (Stack, DriverHandle, Arc<BigSmallAllocator>, nano_ip::IfaceId) {
	let _ = env_logger::builder().is_test(true).try_init();
	let allocator = Arc::new(BigSmallAllocator::new(1600, 16, 256, 16));
	let stack = Stack::new(allocator.clone()).unwrap();
	let (driver, handle) = TestDriver::new();
	let iface = stack
		.add_interface(Box::new(driver), "test0", 8, 1600)
		.unwrap();
	stack.set_mac_address(iface, OUR_MAC).unwrap();
	stack
		.set_ipv4_address(iface, OUR_IP, NETMASK, Ipv4Address::ANY)
		.unwrap();
	stack.iface_up(iface).unwrap();
	(stack, handle, allocator, iface)
}

/// Polls the stack until `predicate` finds a frame or the tries run out.
pub fn wait_for_frame(
	stack: &Stack,
	handle: &DriverHandle,
	predicate: impl Fn(&[u8]) -> bool,
) -> Vec<u8> {
	for _ in 0..500 {
		stack.poll_once();
		if let Some(frame) = handle.sent_frames().iter().find(|frame| predicate(frame)) {
			return frame.clone();
		}
		std::thread::sleep(Duration::from_millis(1));
	}
	panic!("expected frame never transmitted");
}

// --- frame builders -------------------------------------------------------

/// Wraps `payload` into an Ethernet II frame padded to the minimum size.
pub fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
	let mut frame = Vec::new();
	frame.extend_from_slice(&dst.0);
	frame.extend_from_slice(&src.0);
	frame.extend_from_slice(&ethertype.to_be_bytes());
	frame.extend_from_slice(payload);
	while frame.len() < 60 {
		frame.push(0);
	}
	frame
}

/// Builds an IPv4 header + payload.
pub fn ipv4_packet(src: Ipv4Address, dst: Ipv4Address, protocol: u8, payload: &[u8]) -> Vec<u8> {
	let total = 20 + payload.len();
	let mut header = vec![
		0x45,
		0x00,
		(total >> 8) as u8,
		total as u8,
		0x00,
		0x00,
		0x40, // don't fragment
		0x00,
		0x40,
		protocol,
		0x00,
		0x00,
	];
	header.extend_from_slice(&src.octets());
	header.extend_from_slice(&dst.octets());
	let checksum = internet_checksum(&[], &header);
	header[10..12].copy_from_slice(&checksum.to_be_bytes());
	header.extend_from_slice(payload);
	header
}

fn pseudo_header(src: Ipv4Address, dst: Ipv4Address, protocol: u8, length: u16) -> Vec<u8> {
	let mut pseudo = Vec::new();
	pseudo.extend_from_slice(&src.octets());
	pseudo.extend_from_slice(&dst.octets());
	pseudo.push(0);
	pseudo.push(protocol);
	pseudo.extend_from_slice(&length.to_be_bytes());
	pseudo
}

/// Builds a full Ethernet frame carrying a UDP datagram.
pub fn udp_frame(
	src_mac: MacAddr,
	dst_mac: MacAddr,
	src: Ipv4Address,
	dst: Ipv4Address,
	src_port: u16,
	dst_port: u16,
	payload: &[u8],
) -> Vec<u8> {
	let length = (8 + payload.len()) as u16;
	let mut udp = Vec::new();
	udp.extend_from_slice(&src_port.to_be_bytes());
	udp.extend_from_slice(&dst_port.to_be_bytes());
	udp.extend_from_slice(&length.to_be_bytes());
	udp.extend_from_slice(&[0, 0]);
	udp.extend_from_slice(payload);
	let checksum = internet_checksum(&pseudo_header(src, dst, 0x11, length), &udp);
	udp[6..8].copy_from_slice(&checksum.to_be_bytes());

	eth_frame(dst_mac, src_mac, 0x0800, &ipv4_packet(src, dst, 0x11, &udp))
}

/// Builds a full Ethernet frame carrying a TCP segment.
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
	src_mac: MacAddr,
	dst_mac: MacAddr,
	src: Ipv4Address,
	dst: Ipv4Address,
	src_port: u16,
	dst_port: u16,
	seq: u32,
	ack: u32,
	flags: u8,
	payload: &[u8],
) -> Vec<u8> {
	let length = (20 + payload.len()) as u16;
	let mut tcp = Vec::new();
	tcp.extend_from_slice(&src_port.to_be_bytes());
	tcp.extend_from_slice(&dst_port.to_be_bytes());
	tcp.extend_from_slice(&seq.to_be_bytes());
	tcp.extend_from_slice(&ack.to_be_bytes());
	tcp.push(0x50);
	tcp.push(flags);
	tcp.extend_from_slice(&1024u16.to_be_bytes());
	tcp.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
	tcp.extend_from_slice(payload);
	let checksum = internet_checksum(&pseudo_header(src, dst, 0x06, length), &tcp);
	tcp[16..18].copy_from_slice(&checksum.to_be_bytes());

	eth_frame(dst_mac, src_mac, 0x0800, &ipv4_packet(src, dst, 0x06, &tcp))
}

/// Builds an ARP frame.
pub fn arp_frame(
	operation: u16,
	sender_mac: MacAddr,
	sender_ip: Ipv4Address,
	target_mac: MacAddr,
	target_ip: Ipv4Address,
	eth_dst: MacAddr,
) -> Vec<u8> {
	let mut arp = Vec::new();
	arp.extend_from_slice(&1u16.to_be_bytes());
	arp.extend_from_slice(&0x0800u16.to_be_bytes());
	arp.push(6);
	arp.push(4);
	arp.extend_from_slice(&operation.to_be_bytes());
	arp.extend_from_slice(&sender_mac.0);
	arp.extend_from_slice(&sender_ip.octets());
	arp.extend_from_slice(&target_mac.0);
	arp.extend_from_slice(&target_ip.octets());

	eth_frame(eth_dst, sender_mac, 0x0806, &arp)
}

/// Builds an ICMP echo request with a 32-bit identifier.
pub fn icmp_echo_request_frame(
	src_mac: MacAddr,
	dst_mac: MacAddr,
	src: Ipv4Address,
	dst: Ipv4Address,
	identifier: u32,
	payload: &[u8],
) -> Vec<u8> {
	let mut icmp = vec![8, 0, 0, 0];
	icmp.extend_from_slice(&identifier.to_be_bytes());
	icmp.extend_from_slice(payload);
	let checksum = internet_checksum(&[], &icmp);
	icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

	eth_frame(dst_mac, src_mac, 0x0800, &ipv4_packet(src, dst, 0x01, &icmp))
}

// --- frame parsers --------------------------------------------------------

pub struct EthFields {
	pub dst: MacAddr,
	pub src: MacAddr,
	pub ethertype: u16,
}

pub fn parse_eth(frame: &[u8]) -> (EthFields, &[u8]) {
	let fields = EthFields {
		dst: MacAddr(frame[0..6].try_into().unwrap()),
		src: MacAddr(frame[6..12].try_into().unwrap()),
		ethertype: u16::from_be_bytes([frame[12], frame[13]]),
	};
	(fields, &frame[14..])
}

pub struct Ipv4Fields {
	pub src: Ipv4Address,
	pub dst: Ipv4Address,
	pub protocol: u8,
}

/// Parses an IPv4 header, asserting its checksum, and returns the payload
/// trimmed to the declared total length.
pub fn parse_ipv4(packet: &[u8]) -> (Ipv4Fields, &[u8]) {
	let ihl = usize::from(packet[0] & 0x0F) * 4;
	let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
	assert_eq!(internet_checksum(&[], &packet[..ihl]), 0, "bad IPv4 checksum");
	let fields = Ipv4Fields {
		src: Ipv4Address::from_octets(packet[12..16].try_into().unwrap()),
		dst: Ipv4Address::from_octets(packet[16..20].try_into().unwrap()),
		protocol: packet[9],
	};
	(fields, &packet[ihl..total])
}

pub struct UdpFields {
	pub src_port: u16,
	pub dst_port: u16,
}

/// Parses a UDP datagram, asserting its checksum against the pseudo-header.
pub fn parse_udp<'a>(ip: &Ipv4Fields, segment: &'a [u8]) -> (UdpFields, &'a [u8]) {
	let length = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
	let checksum = u16::from_be_bytes([segment[6], segment[7]]);
	if checksum != 0 {
		let pseudo = pseudo_header(ip.src, ip.dst, 0x11, length as u16);
		assert_eq!(
			internet_checksum(&pseudo, &segment[..length]),
			0,
			"bad UDP checksum"
		);
	}
	let fields = UdpFields {
		src_port: u16::from_be_bytes([segment[0], segment[1]]),
		dst_port: u16::from_be_bytes([segment[2], segment[3]]),
	};
	(fields, &segment[8..length])
}

pub struct TcpFields {
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	pub flags: u8,
	pub window: u16,
}

/// Parses a TCP segment, asserting its checksum against the pseudo-header.
pub fn parse_tcp<'a>(ip: &Ipv4Fields, segment: &'a [u8]) -> (TcpFields, &'a [u8]) {
	let pseudo = pseudo_header(ip.src, ip.dst, 0x06, segment.len() as u16);
	assert_eq!(internet_checksum(&pseudo, segment), 0, "bad TCP checksum");
	let data_offset = usize::from(segment[12] >> 4) * 4;
	let fields = TcpFields {
		src_port: u16::from_be_bytes([segment[0], segment[1]]),
		dst_port: u16::from_be_bytes([segment[2], segment[3]]),
		seq: u32::from_be_bytes(segment[4..8].try_into().unwrap()),
		ack: u32::from_be_bytes(segment[8..12].try_into().unwrap()),
		flags: segment[13] & 0x3F,
		window: u16::from_be_bytes([segment[14], segment[15]]),
	};
	(fields, &segment[data_offset..])
}

/// Is this transmitted frame an IPv4 packet with the given protocol?
pub fn is_ipv4_proto(frame: &[u8], protocol: u8) -> bool {
	frame.len() > 34
		&& u16::from_be_bytes([frame[12], frame[13]]) == 0x0800
		&& frame[23] == protocol
}

/// Is this transmitted frame an ARP frame with the given operation?
pub fn is_arp_op(frame: &[u8], operation: u16) -> bool {
	frame.len() >= 42
		&& u16::from_be_bytes([frame[12], frame[13]]) == 0x0806
		&& u16::from_be_bytes([frame[20], frame[21]]) == operation
}
