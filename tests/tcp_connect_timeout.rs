//! TCP connect timeout: ARP resolves, but the peer never answers the
//! SYN. Lives alone in this binary because it jumps the millisecond
//! counter.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use nano_ip::net::tcp::{TcpEventHandler, TcpHandleId, TcpState};
use nano_ip::oal::time;
use nano_ip::packet::Packet;
use nano_ip::{Error, RxDisposition, Stack, StackCore};

const FLAG_SYN: u8 = 1 << 1;

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
fn connect_times_out_without_a_peer() {
	let (stack, driver, _, _) = test_stack();
	let peer = nano_ip::Ipv4Address::new(192, 168, 0, 2);
	stack
		.arp_add_static(nano_ip::MacAddr([2; 6]), peer)
		.unwrap();
	let log = Arc::new(Log::default());

	let handle = stack
		.tcp_open(Box::new(Recorder { log: log.clone() }), 0)
		.unwrap();
	stack.tcp_connect(handle, peer, 9999).unwrap();

	// The SYN goes out, the peer stays silent.
	let frame = wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x06));
	let (_, ip_packet) = parse_eth(&frame);
	let (ip, segment) = parse_ipv4(ip_packet);
	let (syn, _) = parse_tcp(&ip, segment);
	assert_eq!(syn.flags, FLAG_SYN);

	time::advance_ms(501);
	wait_until(&stack, || log.contains("connect_timeout"));
	assert_eq!(stack.tcp_state(handle).unwrap(), TcpState::Closed);
}
