//! Full-stack TCP echo over the loopback interface: two sockets on the
//! same stack talk to each other through the blocking API while the
//! interface task pumps the frames.

mod common;

use std::sync::Arc;
use std::thread;

use nano_ip::packet::BigSmallAllocator;
use nano_ip::socket::SocketType;
use nano_ip::{Endpoint, Ipv4Address, Stack};

#[test]
fn tcp_echo_over_localhost() {
	let allocator = Arc::new(BigSmallAllocator::new(1600, 16, 256, 16));
	let stack = Stack::new(allocator).unwrap();
	stack.start().unwrap();

	let listener = stack.socket(SocketType::Tcp).unwrap();
	stack
		.socket_bind(listener, Endpoint::new(Ipv4Address::ANY, 7000))
		.unwrap();
	stack.socket_listen(listener, 3).unwrap();

	let server_stack = stack.clone();
	let server = thread::spawn(move || {
		let (client, peer) = server_stack.socket_accept(listener).unwrap();
		assert_eq!(peer.address, Ipv4Address::LOCALHOST);

		let mut buffer = [0u8; 64];
		let received = server_stack.socket_receive(client, &mut buffer).unwrap();
		assert_eq!(&buffer[..received], b"ping");

		let sent = server_stack.socket_send(client, b"pong").unwrap();
		assert_eq!(sent, 4);

		// Wait for the segment to be acknowledged before tearing down.
		let mut scratch = [0u8; 1];
		let _ = server_stack.socket_receive(client, &mut scratch);
		server_stack.socket_release(client).unwrap();
	});

	let client = stack.socket(SocketType::Tcp).unwrap();
	stack
		.socket_connect(client, Endpoint::new(Ipv4Address::LOCALHOST, 7000))
		.unwrap();

	let sent = stack.socket_send(client, b"ping").unwrap();
	assert_eq!(sent, 4);

	let mut buffer = [0u8; 64];
	let received = stack.socket_receive(client, &mut buffer).unwrap();
	assert_eq!(&buffer[..received], b"pong");

	stack.socket_release(client).unwrap();
	server.join().unwrap();
	stack.socket_release(listener).unwrap();
}

#[test]
fn udp_datagram_over_localhost() {
	let allocator = Arc::new(BigSmallAllocator::new(1600, 16, 256, 16));
	let stack = Stack::new(allocator).unwrap();
	stack.start().unwrap();

	let receiver = stack.socket(SocketType::Udp).unwrap();
	stack
		.socket_bind(receiver, Endpoint::new(Ipv4Address::ANY, 5353))
		.unwrap();

	let sender = stack.socket(SocketType::Udp).unwrap();
	stack
		.socket_bind(sender, Endpoint::new(Ipv4Address::ANY, 5354))
		.unwrap();
	let sent = stack
		.socket_send_to(
			sender,
			b"hello self",
			Endpoint::new(Ipv4Address::LOCALHOST, 5353),
		)
		.unwrap();
	assert_eq!(sent, 10);

	let mut buffer = [0u8; 64];
	let (received, from) = stack.socket_receive_from(receiver, &mut buffer).unwrap();
	assert_eq!(&buffer[..received], b"hello self");
	assert_eq!(from, Endpoint::new(Ipv4Address::LOCALHOST, 5354));

	stack.socket_release(sender).unwrap();
	stack.socket_release(receiver).unwrap();
}
