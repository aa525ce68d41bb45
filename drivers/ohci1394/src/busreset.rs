//! Bus-reset / self-ID handling, run on the bus-reset worker.
//!
//! OHCI keeps the BUSRESET interrupt event asserted until software has
//! dealt with the reset; the asynchronous transmit contexts must be
//! stopped before the bit is cleared (OHCI 1.1 §7.2.3.2). A pending ROM
//! update is applied in the same exclusive section, so external readers
//! only ever observe the image the controller is serving.

use helios_core::event::{HW_BUSRESET, HW_SELFID};
use helios_core::types::LOCAL_BUS;
use helios_core::{log_error, log_warn};

use crate::regs::{intr, node_id, selfid_count, BUS_OPTIONS, CONFIG_ROM_HDR, INT_EVENT_CLEAR,
    NODE_ID, PHY_REQ_FILTER_HI_SET, PHY_REQ_FILTER_LO_SET, SELFID_COUNT};
use crate::OhciUnit;

impl OhciUnit {
    /// Self-ID-complete service. Invalid intermediate states simply
    /// return: every reset raises another interrupt, so the final state is
    /// always processed.
    pub(crate) fn handle_self_id_complete(&self) {
        let reg = self.regs.read(NODE_ID);
        if reg & node_id::ID_VALID == 0 {
            log_warn!("bus reset still in progress, waiting for next event");
            return;
        }
        let node_number = node_id::node_number(reg);
        if node_number == 63 {
            log_error!("controller reports broadcast node number");
            return;
        }

        let count = self.regs.read(SELFID_COUNT);
        self.listeners
            .send(HW_BUSRESET, selfid_count::generation(count) as u32);
        if count & selfid_count::ERROR != 0 {
            log_error!("self-ID receive error flagged");
            return;
        }

        let stream = match self.selfid.validate(&self.regs, node_number) {
            Ok(stream) => stream,
            Err(_) => {
                log_error!("self-ID validation failed, raising short bus reset");
                if self.raise_bus_reset_internal(true).is_err() {
                    self.flag_unrecoverable("cannot raise recovery bus reset");
                }
                return;
            }
        };
        let generation = stream.generation;

        {
            let mut state = self.state.write();
            state.last_generation = generation;
            state.local_node_id = Some(LOCAL_BUS | node_number as u16);

            // Quiesce transmit DMA before acknowledging the reset.
            self.at_request.stop();
            self.at_response.stop();
            self.regs.write(INT_EVENT_CLEAR, intr::BUS_RESET);

            // A staged ROM becomes live exactly here; the controller
            // latched its physical address when the reset hit.
            if let Some(staged) = state.next_rom.take() {
                let old = state.rom.take();
                self.regs.write(CONFIG_ROM_HDR, staged.data[0]);
                self.regs.write(BUS_OPTIONS, staged.data[2]);
                state.rom = Some(staged);

                // The controller may force bits in BusOptions; mirror what
                // it actually serves.
                let options = self.regs.read(BUS_OPTIONS);
                state.bus_options = options;
                if let Some(rom) = state.rom.as_mut() {
                    rom.data[2] = options;
                }
                if let Some(old) = old {
                    self.free_rom_image(old);
                }
            }

            self.regs.write(PHY_REQ_FILTER_HI_SET, !0);
            self.regs.write(PHY_REQ_FILTER_LO_SET, !0);

            state.stream = Some(stream);
        }

        // Every in-flight transaction belongs to a dead generation now.
        self.tlayer.flush_all();

        log_warn!(
            "bus reset complete: generation {}, local node {}",
            generation,
            node_number
        );
        self.listeners.send(HW_SELFID, generation as u32);
    }
}
