use thiserror::Error;

/// Errors reported by the stack.
///
/// Every fallible operation in the crate returns this flat enumeration.
/// `InProgress` and `Busy` are retriable conditions which the socket layer
/// translates into blocking waits; they are not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
	/// The operation has been started and will complete asynchronously.
	#[error("operation in progress")]
	InProgress,
	/// A previous operation on the same handle has not completed yet.
	#[error("handle is busy")]
	Busy,
	/// An argument is outside its valid domain.
	#[error("invalid argument")]
	InvalidArg,
	/// A fixed-capacity pool or table is exhausted.
	#[error("out of resources")]
	Resource,
	/// The packet is smaller than the protocol's minimum size.
	#[error("packet too short")]
	PacketTooShort,
	/// The packet does not fit into any allocator buffer.
	#[error("packet too big")]
	PacketTooBig,
	/// Ethernet frame check sequence mismatch.
	#[error("invalid CRC")]
	InvalidCrc,
	/// IPv4/ICMP/UDP/TCP checksum mismatch.
	#[error("invalid checksum")]
	InvalidChecksum,
	/// Malformed ARP frame.
	#[error("invalid ARP frame")]
	InvalidArpFrame,
	/// The operation is not permitted in the current TCP state.
	#[error("invalid TCP state")]
	InvalidTcpState,
	/// Malformed or unknown ICMP ping request.
	#[error("invalid ping request")]
	InvalidPingRequest,
	/// The `(address, port)` pair is already bound.
	#[error("address in use")]
	AddressInUse,
	/// No packet is available in the queried queue.
	#[error("packet not found")]
	PacketNotFound,
	/// No protocol handler is registered for the received frame.
	#[error("protocol not found")]
	ProtocolNotFound,
	/// The next-hop hardware address could not be resolved.
	#[error("ARP resolution failed")]
	ArpFailure,
	/// The peer reset the connection.
	#[error("connection reset")]
	ConnReset,
	/// A deadline expired.
	#[error("timeout")]
	Timeout,
	/// The caller's buffer is smaller than the pending datagram.
	#[error("buffer too small")]
	BufferTooSmall,
	/// Unspecified failure.
	#[error("failure")]
	Failure,
	/// Rx-path sentinel: the packet is not for us or is malformed and must
	/// be dropped silently. Never escapes a public API.
	#[error("ignore packet")]
	IgnorePacket,
}

pub type Result<T> = core::result::Result<T, Error>;
