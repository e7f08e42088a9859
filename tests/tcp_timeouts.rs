//! TCP retransmission: an unacknowledged segment goes out again on every
//! deadline and the connection dies at the retry limit.
//!
//! This test advances the millisecond counter artificially; it lives in
//! its own binary so other scenarios never see the jumps.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use nano_ip::net::tcp::{TcpEventHandler, TcpHandleId, TcpState};
use nano_ip::oal::time;
use nano_ip::packet::Packet;
use nano_ip::{Error, RxDisposition, Stack, StackCore};

const FLAG_SYN: u8 = 1 << 1;
const FLAG_PSH: u8 = 1 << 3;
const FLAG_ACK: u8 = 1 << 4;

#[derive(Default)]
struct Log(Mutex<Vec<&'static str>>);

impl Log {
	fn push(&self, event: &'static str) {
		self.0.lock().unwrap().push(event);
	}

	fn contains(&self, event: &str) -> bool {
		self.0.lock().unwrap().iter().any(|entry| *entry == event)
	}
}

struct Recorder {
	log: Arc<Log>,
}

impl TcpEventHandler for Recorder {
	fn on_rx(
		&mut self,
		_core: &mut StackCore,
		_handle: TcpHandleId,
		packet: Packet,
	) -> RxDisposition {
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

	fn on_closed(&mut self, _core: &mut StackCore, _handle: TcpHandleId, _result: Result<(), Error>) {
		self.log.push("closed");
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

#[test]
fn unacknowledged_segment_retransmits_then_fails() {
	let (stack, driver, allocator, _) = test_stack();
	stack.arp_add_static(REMOTE_MAC, REMOTE_IP).unwrap();
	let free_before = allocator.free_buffers();
	let log = Arc::new(Log::default());

	// Connect actively so the test owns both sequence numbers.
	let handle = stack
		.tcp_open(Box::new(Recorder { log: log.clone() }), 0)
		.unwrap();
	stack.tcp_connect(handle, REMOTE_IP, 7000).unwrap();
	let frame = wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x06));
	let (_, ip_packet) = parse_eth(&frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (syn, _) = parse_tcp(&ip, segment);
	driver.inject(&tcp_frame(
		REMOTE_MAC,
		OUR_MAC,
		REMOTE_IP,
		OUR_IP,
		7000,
		syn.src_port,
		0x9000,
		syn.seq.wrapping_add(1),
		FLAG_SYN | FLAG_ACK,
		&[],
	));
	wait_until(&stack, || log.contains("connected"));

	// One outstanding data segment that the peer never acknowledges.
	driver.take_sent_frames();
	let mut packet = stack.tcp_allocate_packet(5).unwrap();
	packet.write_slice(b"stale");
	stack.tcp_send(handle, packet).unwrap();

	let count_data_segments = || {
		driver
			.sent_frames()
			.iter()
			.filter(|frame| {
				is_ipv4_proto(frame, 0x06) && {
					let (_, ip_packet) = parse_eth(frame);
					let (ip, segment) = parse_ipv4(ip_packet);
					let (fields, payload) = parse_tcp(&ip, segment);
					fields.flags == FLAG_PSH | FLAG_ACK && payload == b"stale"
				}
			})
			.count()
	};
	assert_eq!(count_data_segments(), 1);

	// First deadline: the same bytes go out again.
	time::advance_ms(501);
	wait_until(&stack, || count_data_segments() >= 2);

	// Exhaust the remaining retries; the connection dies.
	for _ in 0..5 {
		time::advance_ms(501);
		for _ in 0..20 {
			stack.poll_once();
		}
		if log.contains("tx_failed") {
			break;
		}
	}
	wait_until(&stack, || log.contains("tx_failed"));
	wait_until(&stack, || log.contains("closed"));
	assert_eq!(stack.tcp_state(handle).unwrap(), TcpState::Closed);

	// The dropped segment buffer went back to the allocator.
	wait_until(&stack, || allocator.free_buffers() == free_before);
}
