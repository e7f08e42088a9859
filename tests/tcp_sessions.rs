//! TCP handshake, data transfer and teardown against a scripted peer.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use nano_ip::net::tcp::{TcpEventHandler, TcpHandleId, TcpState};
use nano_ip::packet::Packet;
use nano_ip::socket::SocketType;
use nano_ip::{Endpoint, Error, RxDisposition, Stack, StackCore};

const FLAG_FIN: u8 = 1 << 0;
const FLAG_SYN: u8 = 1 << 1;
const FLAG_PSH: u8 = 1 << 3;
const FLAG_ACK: u8 = 1 << 4;

#[derive(Default)]
struct EventLog {
	events: Mutex<Vec<String>>,
}

impl EventLog {
	fn push(&self, event: impl Into<String>) {
		self.events.lock().unwrap().push(event.into());
	}

	fn contains(&self, event: &str) -> bool {
		self.events.lock().unwrap().iter().any(|entry| entry == event)
	}

	fn count(&self, event: &str) -> usize {
		self.events
			.lock()
			.unwrap()
			.iter()
			.filter(|entry| *entry == event)
			.count()
	}
}

/// Listener handler handing out a pre-created IDLE handle.
struct Acceptor {
	child: Arc<Mutex<Option<TcpHandleId>>>,
}

impl TcpEventHandler for Acceptor {
	fn on_rx(
		&mut self,
		_core: &mut StackCore,
		_handle: TcpHandleId,
		packet: Packet,
	) -> RxDisposition {
		RxDisposition::Release(packet)
	}

	fn on_accepting(&mut self, _core: &mut StackCore, _listener: TcpHandleId) -> Option<TcpHandleId> {
		self.child.lock().unwrap().take()
	}
}

/// Connection handler recording every event.
struct Recorder {
	log: Arc<EventLog>,
}

impl TcpEventHandler for Recorder {
	fn on_rx(
		&mut self,
		_core: &mut StackCore,
		_handle: TcpHandleId,
		packet: Packet,
	) -> RxDisposition {
		self.log
			.push(format!("rx:{}", String::from_utf8_lossy(packet.contents())));
		RxDisposition::Release(packet)
	}

	fn on_tx(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {
		self.log.push("tx");
	}

	fn on_tx_failed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, _error: Error) {
		self.log.push("tx_failed");
	}

	fn on_connected(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {
		self.log.push("connected");
	}

	fn on_connect_timeout(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {
		self.log.push("connect_timeout");
	}

	fn on_closed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, result: Result<(), Error>) {
		self.log.push(match result {
			Ok(()) => "closed:ok",
			Err(_) => "closed:err",
		});
	}

	fn on_accepted(&mut self, _core: &mut StackCore, _handle: TcpHandleId) {
		self.log.push("accepted");
	}

	fn on_accept_failed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, _error: Error) {
		self.log.push("accept_failed");
	}
}

fn wait_until(stack: &Stack, condition: impl Fn() -> bool) {
	for _ in 0..500 {
		stack.poll_once();
		if condition() {
			return;
		}
		std::thread::sleep(std::time::Duration::from_millis(1));
	}
	panic!("condition never became true");
}

/// Parses the latest TCP segment the stack transmitted.
fn last_tcp_segment(driver: &DriverHandle) -> (TcpFields, Vec<u8>) {
	let frames = driver.sent_frames();
	let frame = frames
		.iter()
		.rev()
		.find(|frame| is_ipv4_proto(frame, 0x06))
		.expect("no TCP segment transmitted");
	let (_, ip_packet) = parse_eth(frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (fields, payload) = parse_tcp(&ip, segment);
	(fields, payload.to_vec())
}

#[test]
fn accept_data_exchange_and_remote_close() {
	let (stack, driver, allocator, _) = test_stack();
	stack.arp_add_static(REMOTE_MAC, REMOTE_IP).unwrap();
	let free_before = allocator.free_buffers();
	let log = Arc::new(EventLog::default());

	// Pre-create the accept handle in IDLE and a listener on port 8765.
	let child = stack
		.tcp_open(Box::new(Recorder { log: log.clone() }), 0)
		.unwrap();
	let listener = stack
		.tcp_open(
			Box::new(Acceptor {
				child: Arc::new(Mutex::new(Some(child))),
			}),
			8765,
		)
		.unwrap();
	stack.tcp_listen(listener).unwrap();

	// Remote SYN, expect SYN|ACK with our ISN and ack = seq + 1.
	driver.inject(&tcp_frame(
		REMOTE_MAC, OUR_MAC, REMOTE_IP, OUR_IP, 40001, 8765, 0x1000, 0, FLAG_SYN, &[],
	));
	let frame = wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x06));
	let (_, ip_packet) = parse_eth(&frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (syn_ack, _) = parse_tcp(&ip, segment);
	assert_eq!(syn_ack.flags, FLAG_SYN | FLAG_ACK);
	assert_eq!(syn_ack.ack, 0x1001);
	assert_eq!(syn_ack.src_port, 8765);
	assert_eq!(syn_ack.dst_port, 40001);
	assert_eq!(syn_ack.window, 1024);
	let isn = syn_ack.seq;

	// Remote completes the handshake.
	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1001,
		isn.wrapping_add(1),
		FLAG_ACK,
		&[],
	));
	wait_until(&stack, || log.contains("accepted"));
	assert_eq!(stack.tcp_state(child).unwrap(), TcpState::Established);

	// Remote pushes data; expect an ACK covering it and an RX event.
	driver.take_sent_frames();
	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1001,
		isn.wrapping_add(1),
		FLAG_PSH | FLAG_ACK,
		b"ping",
	));
	wait_until(&stack, || log.contains("rx:ping"));
	let (ack, _) = last_tcp_segment(&driver);
	assert_eq!(ack.flags, FLAG_ACK);
	assert_eq!(ack.ack, 0x1005);

	// We answer with data of our own; the segment stays outstanding until
	// the remote acknowledges it.
	driver.take_sent_frames();
	let mut packet = stack.tcp_allocate_packet(4).unwrap();
	packet.write_slice(b"pong");
	stack.tcp_send(child, packet).unwrap();
	let (data, payload) = last_tcp_segment(&driver);
	assert_eq!(data.flags, FLAG_PSH | FLAG_ACK);
	assert_eq!(data.seq, isn.wrapping_add(1));
	assert_eq!(payload, b"pong");
	assert_eq!(stack.tcp_is_ready(child).unwrap_err(), Error::Busy);

	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1005,
		isn.wrapping_add(5),
		FLAG_ACK,
		&[],
	));
	wait_until(&stack, || log.contains("tx"));
	stack.tcp_is_ready(child).unwrap();

	// Remote closes: FIN|ACK out, the final ACK reaches CLOSED exactly once.
	driver.take_sent_frames();
	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1005,
		isn.wrapping_add(5),
		FLAG_FIN | FLAG_ACK,
		&[],
	));
	let frame = wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x06));
	let (_, ip_packet) = parse_eth(&frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (fin_ack, _) = parse_tcp(&ip, segment);
	assert_eq!(fin_ack.flags, FLAG_FIN | FLAG_ACK);
	assert_eq!(fin_ack.ack, 0x1006);

	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1006,
		isn.wrapping_add(6),
		FLAG_ACK,
		&[],
	));
	wait_until(&stack, || log.contains("closed:ok"));
	assert_eq!(log.count("closed:ok"), 1);
	assert_eq!(stack.tcp_state(child).unwrap(), TcpState::Closed);

	stack.tcp_release(child).unwrap();
	stack.tcp_close(listener).unwrap();
	stack.tcp_release(listener).unwrap();

	// Every buffer returned to the pool or the receive ring.
	assert_eq!(allocator.free_buffers(), free_before);
}

#[test]
fn reset_tears_the_connection_down() {
	let (stack, driver, _, _) = test_stack();
	stack.arp_add_static(REMOTE_MAC, REMOTE_IP).unwrap();
	let log = Arc::new(EventLog::default());

	let handle = stack
		.tcp_open(Box::new(Recorder { log: log.clone() }), 0)
		.unwrap();
	stack.tcp_connect(handle, REMOTE_IP, 7777).unwrap();

	let frame = wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x06));
	let (_, ip_packet) = parse_eth(&frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (syn, _) = parse_tcp(&ip, segment);
	assert_eq!(syn.flags, FLAG_SYN);

	// The peer refuses with RST.
	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		7777,
		syn.src_port,
		0,
		syn.seq.wrapping_add(1),
		1 << 2,
		&[],
	));
	wait_until(&stack, || log.contains("closed:err"));
	assert_eq!(stack.tcp_state(handle).unwrap(), TcpState::Closed);
}

#[test]
fn socket_accept_returns_connected_peer() {
	let (stack, driver, _, _) = test_stack();
	stack.arp_add_static(REMOTE_MAC, REMOTE_IP).unwrap();

	let listener = stack.socket(SocketType::Tcp).unwrap();
	stack
		.socket_bind(listener, Endpoint::new(nano_ip::Ipv4Address::ANY, 8765))
		.unwrap();
	stack.socket_listen(listener, 3).unwrap();

	driver.inject(&tcp_frame(
		REMOTE_MAC, OUR_MAC, REMOTE_IP, OUR_IP, 40001, 8765, 0x1000, 0, FLAG_SYN, &[],
	));
	let frame = wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x06));
	let (_, ip_packet) = parse_eth(&frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (syn_ack, _) = parse_tcp(&ip, segment);
	assert_eq!(syn_ack.flags, FLAG_SYN | FLAG_ACK);

	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1001,
		syn_ack.seq.wrapping_add(1),
		FLAG_ACK,
		&[],
	));

	let (child, endpoint) = stack.socket_accept(listener).unwrap();
	assert_eq!(endpoint, Endpoint::new(REMOTE_IP, 40001));

	// Data lands in the accepted socket's queue.
	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		40001,
		8765,
		0x1001,
		syn_ack.seq.wrapping_add(1),
		FLAG_PSH | FLAG_ACK,
		b"hi there",
	));
	let mut buffer = [0u8; 64];
	let (received, from) = stack.socket_receive_from(child, &mut buffer).unwrap();
	assert_eq!(&buffer[..received], b"hi there");
	assert_eq!(from, Endpoint::new(REMOTE_IP, 40001));

	stack.socket_release(child).unwrap();
	stack.socket_release(listener).unwrap();
}
