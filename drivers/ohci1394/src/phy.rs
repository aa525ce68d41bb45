//! PHY register access through the PhyControl side-band interface.
//!
//! Both directions poll the completion bit on a 5 ms cadence; a read whose
//! returned address differs from the requested one is reported as a
//! register inconsistency rather than retried.

use alloc::sync::Arc;

use helios_core::error::{HeliosError, Result};
use helios_core::platform::TimeSource;

use crate::regs::{phy_control, Registers, PHY_CONTROL};

const PHY_POLL_MS: u32 = 5;
const PHY_POLL_BUDGET: u32 = 100; // ~500 ms

pub struct Phy {
    regs: Registers,
    time: Arc<dyn TimeSource>,
}

impl Phy {
    pub fn new(regs: Registers, time: Arc<dyn TimeSource>) -> Self {
        Phy { regs, time }
    }

    fn wait_clear(&self, bit: u32) -> Result<u32> {
        let mut budget = PHY_POLL_BUDGET;
        loop {
            let value = self.regs.read(PHY_CONTROL);
            if value & bit == 0 {
                return Ok(value);
            }
            if budget == 0 {
                return Err(HeliosError::Timeout);
            }
            budget -= 1;
            self.time.delay_ms(PHY_POLL_MS);
        }
    }

    pub fn read(&self, addr: u8) -> Result<u8> {
        if self.regs.read(PHY_CONTROL) & phy_control::WR_REG != 0 {
            return Err(HeliosError::Busy);
        }
        self.regs.write(PHY_CONTROL, phy_control::read_request(addr));
        let value = self.wait_clear(phy_control::RD_REG)?;
        if phy_control::read_addr(value) != addr & 0xf {
            return Err(HeliosError::RegisterInconsistent);
        }
        Ok(phy_control::read_data(value))
    }

    /// Read-modify-write of one PHY register.
    pub fn update(&self, addr: u8, clear_bits: u8, set_bits: u8) -> Result<()> {
        let old = self.read(addr)?;
        let new = (old & !clear_bits) | set_bits;
        self.regs
            .write(PHY_CONTROL, phy_control::write_request(addr, new));
        self.wait_clear(phy_control::WR_REG)?;
        Ok(())
    }
}
