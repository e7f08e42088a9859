//! ICMP ping client: a round trip against our own echo responder over
//! loopback, and cancellation of a request nobody answers.

mod common;

use std::sync::Arc;

use common::*;
use nano_ip::packet::BigSmallAllocator;
use nano_ip::{Error, Ipv4Address, Stack};

#[test]
fn ping_localhost_round_trip() {
	let allocator = Arc::new(BigSmallAllocator::new(1600, 8, 256, 8));
	let stack = Stack::new(allocator.clone()).unwrap();
	stack.start().unwrap();

	let response_time = stack.ping(Ipv4Address::LOCALHOST, 1000, 32).unwrap();
	assert!(response_time < 1000);

	// Both the request and the reply buffer are back in the pool.
	for _ in 0..100 {
		stack.poll_once();
		if allocator.free_buffers() == (8, 8) {
			break;
		}
		std::thread::sleep(std::time::Duration::from_millis(1));
	}
	assert_eq!(allocator.free_buffers(), (8, 8));
}

#[test]
fn cancelled_ping_fails_the_waiter() {
	let (stack, driver, _, _) = test_stack();
	stack.arp_add_static(REMOTE_MAC, REMOTE_IP).unwrap();

	// The echo request goes out; the peer never answers.
	let ping = stack.ping_request(REMOTE_IP, 10_000, 8).unwrap();
	wait_for_frame(&stack, &driver, |frame| is_ipv4_proto(frame, 0x01));

	stack.ping_cancel(ping).unwrap();
	assert_eq!(
		stack.ping_wait(ping, 100).unwrap_err(),
		Error::InvalidPingRequest
	);
}
