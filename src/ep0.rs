//! The control endpoint 0 engine.
//!
//! EP0 runs the three-stage Setup / Data / Status state machine and is
//! independent of the data-endpoint strategies; its 8-byte buffer is a bank
//! of dedicated data registers, not part of the shared endpoint memory.
//!
//! The hardware latches an incoming SETUP in `EP0_CR` and ignores mode
//! writes while the latch is set, so a new setup can never be answered with
//! a stale response. Software mirrors that: every count + mode commit checks
//! the latch first and defers to the next interrupt when a setup raced in.

use crate::{ral, regs, EP0_SIZE};

/// The control endpoint engine's scratch state.
pub struct Ep0 {
    /// The data toggle for the next EP0 transaction.
    toggle: bool,
    /// Count and mode staged while a setup latch blocked the commit.
    pending: Option<(u32, u32)>,
}

impl Ep0 {
    pub fn new() -> Self {
        Ep0 {
            toggle: false,
            pending: None,
        }
    }

    /// Arm EP0 for the next setup: NAK everything else, clear the latches.
    pub fn initialize(&mut self, usb: &regs::RegisterBlock) {
        self.toggle = false;
        self.pending = None;
        usb.EP0_CNT.write(0);
        ral::write_reg!(crate::regs, usb, EP0_CR, MODE: NAK_IN_OUT);
    }

    /// The unlock-and-reset sequence for a received setup.
    ///
    /// Reads the control register, writes it back with the setup latch
    /// cleared, and re-verifies the latch actually cleared. If it did not, a
    /// new setup arrived mid-sequence: no state is committed, and the caller
    /// retries on the next interrupt. On success the byte-count / toggle
    /// scratch is reset, and the caller may invoke the setup callback.
    ///
    /// Running the sequence twice without an intervening commit is harmless;
    /// it resets the scratch to the same values.
    pub fn unlock_setup(&mut self, usb: &regs::RegisterBlock) -> bool {
        let cr = ral::read_reg!(crate::regs, usb, EP0_CR);
        usb.EP0_CR.write(cr & !regs::EP0_CR::SETUP_RCVD::mask);
        if ral::read_reg!(crate::regs, usb, EP0_CR, SETUP_RCVD == 1) {
            return false;
        }
        self.toggle = false;
        self.pending = None;
        true
    }

    /// Copy the received setup packet out of the EP0 data registers.
    pub fn setup(&self, usb: &regs::RegisterBlock, buffer: &mut [u8; EP0_SIZE]) {
        for (byte, dr) in buffer.iter_mut().zip(usb.EP0_DR.iter()) {
            *byte = dr.read() as u8;
        }
    }

    /// Stage a Data-In packet (`Some`) or the final Status-In (`None`).
    ///
    /// Returns the number of bytes staged, constrained by the EP0 buffer
    /// capacity. The commit is deferred if a new setup is latched.
    pub fn write(&mut self, usb: &regs::RegisterBlock, data: Option<&[u8]>) -> usize {
        match data {
            Some(data) => {
                let size = data.len().min(EP0_SIZE);
                for (byte, dr) in data[..size].iter().zip(usb.EP0_DR.iter()) {
                    dr.write(u32::from(*byte));
                }
                self.toggle = !self.toggle;
                let cnt = size as u32 | self.toggle_bit();
                self.commit(usb, cnt, regs::mode::ACK_IN_STATUS_OUT);
                size
            }
            None => {
                // Zero-length handshake; the status stage is always DATA1.
                self.toggle = true;
                self.commit(usb, self.toggle_bit(), regs::mode::STATUS_IN_ONLY);
                0
            }
        }
    }

    /// Stage a Data-Out packet (`Some`) or the final Status-Out (`None`).
    ///
    /// When the hardware already latched a received OUT packet, `Some`
    /// copies the bytes into `buffer` and returns the received count
    /// (CRC excluded); otherwise it arms the OUT stage and returns 0.
    pub fn read(&mut self, usb: &regs::RegisterBlock, buffer: Option<&mut [u8]>) -> usize {
        match buffer {
            Some(buffer) => {
                if ral::read_reg!(crate::regs, usb, EP0_CR, OUT_RCVD == 1) {
                    let count = ral::read_reg!(crate::regs, usb, EP0_CNT, COUNT) as usize;
                    let count = count.saturating_sub(2).min(EP0_SIZE).min(buffer.len());
                    for (byte, dr) in buffer[..count].iter_mut().zip(usb.EP0_DR.iter()) {
                        *byte = dr.read() as u8;
                    }
                    let cr = ral::read_reg!(crate::regs, usb, EP0_CR);
                    usb.EP0_CR.write(cr & !regs::EP0_CR::OUT_RCVD::mask);
                    count
                } else {
                    self.toggle = !self.toggle;
                    self.commit(usb, self.toggle_bit(), regs::mode::ACK_OUT_STATUS_IN);
                    0
                }
            }
            None => {
                self.toggle = true;
                self.commit(usb, self.toggle_bit(), regs::mode::STATUS_OUT_ONLY);
                0
            }
        }
    }

    /// Force an immediate stall of both directions, used by the caller on
    /// protocol errors. Bypasses the scratch; a stall is never deferred.
    pub fn stall(&mut self, usb: &regs::RegisterBlock) {
        self.pending = None;
        ral::modify_reg!(crate::regs, usb, EP0_CR, MODE: STALL_IN_OUT);
    }

    /// An IN packet event: clear the latch, then retry any deferred commit.
    pub fn on_in_event(&mut self, usb: &regs::RegisterBlock) {
        let cr = ral::read_reg!(crate::regs, usb, EP0_CR);
        usb.EP0_CR.write(cr & !regs::EP0_CR::IN_RCVD::mask);
        self.commit_pending(usb);
    }

    /// An OUT packet event: clear the acked-transaction flag, keep the
    /// OUT latch for `read`, then retry any deferred commit.
    pub fn on_out_event(&mut self, usb: &regs::RegisterBlock) {
        let cr = ral::read_reg!(crate::regs, usb, EP0_CR);
        usb.EP0_CR.write(cr & !regs::EP0_CR::ACKED_TXN::mask);
        self.commit_pending(usb);
    }

    fn toggle_bit(&self) -> u32 {
        (self.toggle as u32) << regs::EP0_CNT::DATA_TOGGLE::offset
    }

    /// Commit the count and mode registers as one tight sequence, or defer
    /// when a new setup is latched (the hardware would ignore the write).
    fn commit(&mut self, usb: &regs::RegisterBlock, cnt: u32, mode: u32) {
        if ral::read_reg!(crate::regs, usb, EP0_CR, SETUP_RCVD == 1) {
            self.pending = Some((cnt, mode));
            return;
        }
        usb.EP0_CNT.write(cnt | regs::EP0_CNT::DATA_VALID::mask);
        ral::modify_reg!(crate::regs, usb, EP0_CR, MODE: mode);
        self.pending = None;
    }

    fn commit_pending(&mut self, usb: &regs::RegisterBlock) {
        if let Some((cnt, mode)) = self.pending.take() {
            self.commit(usb, cnt, mode);
        }
    }
}
