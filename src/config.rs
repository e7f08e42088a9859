//! Compile-time configuration of the stack.
//!
//! Optional subsystems are selected through cargo features; the numeric
//! knobs live here so that a port can be tuned by editing a single file.
//! Log verbosity is not configured here: the stack logs through the `log`
//! facade and the host's logger picks the level.

/// Maximum number of network interfaces.
pub const MAX_NET_INTERFACES_COUNT: usize = 2;

/// Maximum number of network routes.
///
/// Every interface installs up to two routes (connected subnet and default
/// gateway), plus two slots for application routes.
pub const MAX_NET_ROUTE_COUNT: usize = 2 * MAX_NET_INTERFACES_COUNT + 2;

/// Maximum number of ARP table entries.
pub const MAX_ARP_ENTRY_COUNT: usize = 10;

/// Validity period in milliseconds of a dynamic entry in the ARP table.
pub const ARP_ENTRY_VALIDITY_PERIOD: u32 = 600_000;

/// ARP request timeout in milliseconds.
pub const ARP_REQUEST_TIMEOUT: u32 = 500;

/// Advertised TCP receive window in bytes.
///
/// The window is fixed; it is not updated as receive buffers are consumed.
#[cfg(feature = "tcp")]
pub const TCP_WINDOW_SIZE: u16 = 1024;

/// Number of retransmissions of an unacknowledged TCP segment before the
/// connection is torn down.
#[cfg(feature = "tcp")]
pub const TCP_MAX_RETRY_COUNT: u8 = 5;

/// Timeout in milliseconds for transient TCP states and retransmissions.
#[cfg(feature = "tcp")]
pub const TCP_STATE_TIMEOUT: u32 = 500;

/// First port of the ephemeral TCP port pool.
#[cfg(feature = "tcp")]
pub const TCP_PORT_POOL_START: u16 = 10_000;

/// Maximum number of sockets.
#[cfg(feature = "socket")]
pub const SOCKET_MAX_COUNT: usize = 10;

/// Maximum number of simultaneous calls to the socket `poll()` function.
#[cfg(feature = "socket-poll")]
pub const SOCKET_MAX_POLL_COUNT: usize = 3;

/// Maximum backlog accepted by `listen()`.
#[cfg(feature = "socket")]
pub const SOMAXCONN: usize = SOCKET_MAX_COUNT - 1;
