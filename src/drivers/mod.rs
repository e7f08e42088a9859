//! Hardware abstraction: the network driver contract and the built-in
//! drivers.

pub mod net;
