//! Link Power Management handshakes.
//!
//! The hardware latches the BESL value and remote-wakeup permission from
//! each LPM token; the configured handshake response applies to the *next*
//! token. Accepting is a protocol formality, so the default response is ACK;
//! choosing an actual low-power mode based on the BESL value is the job of
//! the registered LPM callback.

use crate::{ral, regs};

/// The handshake returned for the next LPM token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum LpmResponse {
    Ack,
    Nack,
}

pub struct Lpm {
    response: LpmResponse,
}

impl Lpm {
    pub fn new() -> Self {
        Lpm {
            response: LpmResponse::Ack,
        }
    }

    /// Enable or disable LPM token handling, resetting the response to ACK.
    pub fn initialize(&mut self, usb: &regs::RegisterBlock, enabled: bool) {
        self.response = LpmResponse::Ack;
        if enabled {
            ral::write_reg!(crate::regs, usb, LPM_CTL, LPM_EN: 1, LPM_ACK_RESP: 1);
        } else {
            usb.LPM_CTL.write(0);
        }
    }

    /// The BESL value latched from the most recent LPM token.
    pub fn besl_value(&self, usb: &regs::RegisterBlock) -> u8 {
        ral::read_reg!(crate::regs, usb, LPM_STAT, BESL) as u8
    }

    /// Whether the most recent LPM token permitted remote wakeup.
    pub fn remote_wakeup_allowed(&self, usb: &regs::RegisterBlock) -> bool {
        ral::read_reg!(crate::regs, usb, LPM_STAT, REMOTE_WAKEUP_EN == 1)
    }

    pub fn set_response(&mut self, usb: &regs::RegisterBlock, response: LpmResponse) {
        self.response = response;
        let ack = matches!(response, LpmResponse::Ack) as u32;
        ral::modify_reg!(crate::regs, usb, LPM_CTL, LPM_ACK_RESP: ack);
    }

    pub fn response(&self) -> LpmResponse {
        self.response
    }
}
