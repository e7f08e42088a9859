//! Ethernet PHY management over MDIO.
//!
//! An extension point for [`NetDriver`](crate::drivers::net::NetDriver)
//! implementors: a MAC driver owns its [`MdioDriver`] register access and
//! resets, configures and polls the PHY through a [`PhyDriver`] — usually
//! [`GenericPhy`], which only relies on the IEEE 802.3 basic register set
//! — to answer `link_state`. The protocol core never talks to a PHY
//! itself.

use crate::drivers::net::LinkState;
use crate::error::{Error, Result};

/// Basic control register.
const REG_BASIC_CONTROL: u8 = 0x00;
/// Basic status register.
const REG_BASIC_STATUS: u8 = 0x01;

const PHY_CTRL_RESET: u16 = 1 << 15;
const PHY_CTRL_100MB: u16 = 1 << 13;
const PHY_CTRL_AUTO_NEGO: u16 = 1 << 12;
const PHY_CTRL_FULL_DUPLEX: u16 = 1 << 8;
const PHY_CTRL_1000MB: u16 = 1 << 6;

const PHY_STATUS_AUTO_NEG_COMPLETED: u16 = 1 << 5;
const PHY_STATUS_LINK_UP: u16 = 1 << 2;

/// Link speed requested from a PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
	Mb10,
	Mb100,
	Mb1000,
}

/// Duplex mode requested from a PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
	Half,
	Full,
	/// Let the PHY auto-negotiate speed and duplex.
	Auto,
}

/// Access to the management interface of a MAC.
pub trait MdioDriver {
	fn read(&mut self, phy_address: u8, register: u8) -> Result<u16>;
	fn write(&mut self, phy_address: u8, register: u8, value: u16) -> Result<()>;
}

/// An Ethernet PHY.
pub trait PhyDriver {
	fn reset(&self, mdio: &mut dyn MdioDriver, phy_address: u8) -> Result<()>;
	fn configure(
		&self,
		mdio: &mut dyn MdioDriver,
		phy_address: u8,
		speed: Speed,
		duplex: Duplex,
	) -> Result<()>;
	fn link_state(&self, mdio: &mut dyn MdioDriver, phy_address: u8) -> Result<LinkState>;
}

/// Driver for PHYs only using the IEEE 802.3 basic register set.
pub struct GenericPhy;

impl PhyDriver for GenericPhy {
	fn reset(&self, mdio: &mut dyn MdioDriver, phy_address: u8) -> Result<()> {
		mdio.write(phy_address, REG_BASIC_CONTROL, PHY_CTRL_RESET)?;

		// Wait for the PHY to clear the reset flag.
		let mut timeout = 0x10_0000u32;
		loop {
			let value = mdio.read(phy_address, REG_BASIC_CONTROL)?;
			if value & PHY_CTRL_RESET == 0 {
				return Ok(());
			}
			timeout -= 1;
			if timeout == 0 {
				return Err(Error::Timeout);
			}
		}
	}

	fn configure(
		&self,
		mdio: &mut dyn MdioDriver,
		phy_address: u8,
		speed: Speed,
		duplex: Duplex,
	) -> Result<()> {
		let mut value = match duplex {
			Duplex::Full => PHY_CTRL_FULL_DUPLEX,
			Duplex::Half => 0,
			Duplex::Auto => PHY_CTRL_AUTO_NEGO,
		};
		if duplex != Duplex::Auto {
			value |= match speed {
				Speed::Mb10 => 0,
				Speed::Mb100 => PHY_CTRL_100MB,
				Speed::Mb1000 => PHY_CTRL_1000MB,
			};
		}

		mdio.write(phy_address, REG_BASIC_CONTROL, value)
	}

	fn link_state(&self, mdio: &mut dyn MdioDriver, phy_address: u8) -> Result<LinkState> {
		let status = mdio.read(phy_address, REG_BASIC_STATUS)?;

		let state = if status & PHY_STATUS_LINK_UP == 0 {
			LinkState::Down
		} else if status & PHY_STATUS_AUTO_NEG_COMPLETED == 0 {
			LinkState::AutoNego
		} else {
			// No generic register reports the negotiated speed and duplex.
			LinkState::Up
		};
		Ok(state)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FakeMdio {
		control: u16,
		status: u16,
	}

	impl MdioDriver for FakeMdio {
		fn read(&mut self, _phy: u8, register: u8) -> Result<u16> {
			match register {
				REG_BASIC_CONTROL => Ok(self.control),
				REG_BASIC_STATUS => Ok(self.status),
				_ => Err(Error::InvalidArg),
			}
		}

		fn write(&mut self, _phy: u8, register: u8, value: u16) -> Result<()> {
			if register == REG_BASIC_CONTROL {
				// A real PHY self-clears the reset flag.
				self.control = value & !PHY_CTRL_RESET;
			}
			Ok(())
		}
	}

	#[test]
	fn configure_auto_negotiation() {
		let mut mdio = FakeMdio { control: 0, status: 0 };
		GenericPhy
			.configure(&mut mdio, 0, Speed::Mb100, Duplex::Auto)
			.unwrap();
		assert_eq!(mdio.control, PHY_CTRL_AUTO_NEGO);
	}

	#[test]
	fn link_state_maps_status_bits() {
		let mut mdio = FakeMdio { control: 0, status: 0 };
		assert_eq!(GenericPhy.link_state(&mut mdio, 0).unwrap(), LinkState::Down);
		mdio.status = PHY_STATUS_LINK_UP;
		assert_eq!(GenericPhy.link_state(&mut mdio, 0).unwrap(), LinkState::AutoNego);
		mdio.status = PHY_STATUS_LINK_UP | PHY_STATUS_AUTO_NEG_COMPLETED;
		assert_eq!(GenericPhy.link_state(&mut mdio, 0).unwrap(), LinkState::Up);
	}
}
