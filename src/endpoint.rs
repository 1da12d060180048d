//! Data endpoint records.
//!
//! One record per physical endpoint 1 through 8. The record tracks the
//! lifecycle state machine, the data toggle, the reserved buffer region, and
//! (for the DMA strategies) the bound channel. All hardware sequencing for a
//! single endpoint lives here; the strategy code in `transfer` decides when
//! to call it.

use crate::{
    buffer::{Buffer, Region},
    dma, ral, regs, vcell, Error, Result,
};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// How many times `abort_complete` polls for quiescence before reporting
/// [`Error::DynamicReconfigurationTimeout`].
const DYN_RECONFIG_RETRIES: usize = 25;

/// CRC16 bytes the SIE appends to an OUT count.
const CRC_SIZE: u16 = 2;

bitflags::bitflags! {
    /// Advisory per-transfer error bits, passed to the completion callback.
    ///
    /// These are signals, not failures: the driver never retries a transfer
    /// on its own. Retransmission is the host's decision.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TransferErrors: u8 {
        /// The SIE saw a transaction error: bad CRC, bit stuffing, or no
        /// response.
        const TRANSFER_ERROR = 1 << 0;
        /// The received data toggle matched the previous transaction's
        /// toggle, which indicates a host retransmission.
        const RETRANSMISSION = 1 << 1;
    }
}

/// Endpoint lifecycle state.
///
/// `Pending` is only entered from `Idle` or `Completed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum EndpointState {
    /// Configured, no transfer staged.
    Idle,
    /// A transfer is staged or in flight.
    Pending,
    /// The last transfer finished; results may be read.
    Completed,
    /// The endpoint answers every token with STALL.
    Stalled,
    /// Configured but not responding.
    Disabled,
    /// Not configured on this controller instance.
    Invalid,
}

/// A data endpoint record.
pub struct Endpoint {
    address: EndpointAddress,
    kind: EndpointType,
    state: EndpointState,
    toggle: bool,
    region: Region,
    shadow: Option<Buffer>,
    count: u16,
    dma: Option<dma::Channel>,
    pub(crate) callback: Option<crate::driver::EndpointCallback>,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, kind: EndpointType, region: Region) -> Self {
        Endpoint {
            address,
            kind,
            state: EndpointState::Idle,
            toggle: false,
            region,
            shadow: None,
            count: 0,
            dma: None,
            callback: None,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    /// The endpoint number, 1 through 8.
    pub(crate) fn index(&self) -> usize {
        self.address.index()
    }

    pub fn max_packet_len(&self) -> usize {
        self.region.len()
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// The byte count of the last staged or completed transfer.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Stage the byte count for a deferred arm.
    pub fn set_count(&mut self, count: u16) {
        self.count = count;
    }

    pub fn is_isochronous(&self) -> bool {
        matches!(self.kind, EndpointType::Isochronous { .. })
    }

    pub fn set_shadow(&mut self, shadow: Buffer) {
        self.shadow = Some(shadow);
    }

    pub fn shadow(&self) -> Option<&Buffer> {
        self.shadow.as_ref()
    }

    pub fn shadow_mut(&mut self) -> Option<&mut Buffer> {
        self.shadow.as_mut()
    }

    pub fn bind_dma(&mut self, channel: dma::Channel) {
        self.dma = Some(channel);
    }

    pub fn unbind_dma(&mut self) -> Option<dma::Channel> {
        self.dma.take()
    }

    pub fn dma_mut(&mut self) -> Option<&mut dma::Channel> {
        self.dma.as_mut()
    }

    /// Enter `Pending`, which is legal only from `Idle` or `Completed`.
    pub fn make_pending(&mut self) -> Result<()> {
        match self.state {
            EndpointState::Idle | EndpointState::Completed => {
                self.state = EndpointState::Pending;
                Ok(())
            }
            _ => Err(Error::BadParameter),
        }
    }

    /// The SIE response for an armed transaction on this endpoint.
    fn ack_mode(&self) -> u32 {
        use regs::mode;
        match (self.address.direction(), self.is_isochronous()) {
            (UsbDirection::In, false) => mode::ACK_IN,
            (UsbDirection::In, true) => mode::ISO_IN,
            (UsbDirection::Out, false) => mode::ACK_OUT,
            (UsbDirection::Out, true) => mode::ISO_OUT,
        }
    }

    /// Program the byte count and toggle, then arm the SIE response.
    pub fn arm(&mut self, usb: &regs::RegisterBlock, count: u16) {
        self.count = count;
        let sie = ral::sie_ep::register(usb, self.index());
        ral::write_reg!(
            ral::sie_ep,
            &sie,
            CNT,
            COUNT: u32::from(count),
            DATA_TOGGLE: self.toggle as u32
        );
        ral::modify_reg!(ral::sie_ep, &sie, CR, MODE: self.ack_mode());
    }

    /// Halt the arm state: respond NAK until re-armed.
    pub fn nak(&mut self, usb: &regs::RegisterBlock) {
        let sie = ral::sie_ep::register(usb, self.index());
        ral::modify_reg!(ral::sie_ep, &sie, CR, MODE: NAK_IN_OUT);
    }

    /// Stall or unstall the endpoint.
    ///
    /// Unstalling resets the data toggle, per the usual ClearFeature(HALT)
    /// semantics.
    pub fn set_stalled(&mut self, usb: &regs::RegisterBlock, stall: bool) {
        let sie = ral::sie_ep::register(usb, self.index());
        if stall {
            ral::modify_reg!(ral::sie_ep, &sie, CR, MODE: STALL_IN_OUT, STALL: 1);
            self.state = EndpointState::Stalled;
        } else {
            ral::modify_reg!(ral::sie_ep, &sie, CR, MODE: NAK_IN_OUT, STALL: 0);
            self.toggle = false;
            self.state = EndpointState::Idle;
        }
    }

    /// Return the endpoint to its post-reset condition: toggle at DATA0, no
    /// transfer staged, NAK until re-armed. Disabled endpoints stay disabled.
    pub fn bus_reset(&mut self, usb: &regs::RegisterBlock) {
        self.toggle = false;
        self.count = 0;
        if self.state != EndpointState::Disabled {
            self.nak(usb);
            self.state = EndpointState::Idle;
        }
    }

    pub fn is_stalled(&self, usb: &regs::RegisterBlock) -> bool {
        let sie = ral::sie_ep::register(usb, self.index());
        ral::read_reg!(ral::sie_ep, &sie, CR, STALL == 1)
    }

    /// Enable (`true`) or disable (`false`) the endpoint's bus response.
    pub fn set_enabled(&mut self, usb: &regs::RegisterBlock, enabled: bool) {
        let sie = ral::sie_ep::register(usb, self.index());
        if enabled {
            ral::modify_reg!(ral::sie_ep, &sie, CR, MODE: NAK_IN_OUT);
            self.state = EndpointState::Idle;
        } else {
            ral::modify_reg!(ral::sie_ep, &sie, CR, MODE: DISABLE);
            self.state = EndpointState::Disabled;
        }
    }

    /// Apply the arbiter configuration for this endpoint: event interrupt
    /// enables, pointer reset, and the read/write pointers at the region
    /// start.
    pub fn configure_arbiter(&mut self, usb: &regs::RegisterBlock, event_mask: u32) {
        let arb = ral::arb_ep::register(usb, self.index());
        ral::write_reg!(ral::arb_ep, &arb, INT_EN, event_mask);
        ral::modify_reg!(ral::arb_ep, &arb, CFG, RESET_PTR: 1);
        ral::write_reg!(ral::arb_ep, &arb, WA, ADDRESS: self.region.start() as u32);
        ral::write_reg!(ral::arb_ep, &arb, RA, ADDRESS: self.region.start() as u32);
        ral::modify_reg!(ral::arb_ep, &arb, CFG, RESET_PTR: 0);
    }

    /// Copy `data` into the endpoint's hardware buffer region and mark the
    /// data ready for the SIE. Returns the number of bytes written,
    /// constrained by the region size.
    pub fn write_fifo(&mut self, usb: &regs::RegisterBlock, data: &[u8]) -> usize {
        let size = self.region.len().min(data.len());
        let arb = ral::arb_ep::register(usb, self.index());
        ral::write_reg!(ral::arb_ep, &arb, WA, ADDRESS: self.region.start() as u32);
        vcell::write_bytes(
            &usb.EP_MEM[self.region.start()..self.region.end()],
            &data[..size],
        );
        ral::modify_reg!(ral::arb_ep, &arb, CFG, IN_DATA_RDY: 1);
        size
    }

    /// Copy the received bytes out of the endpoint's hardware buffer region.
    /// Returns the number of bytes read, constrained by the received count
    /// and `dst`.
    pub fn read_fifo(&self, usb: &regs::RegisterBlock, dst: &mut [u8]) -> usize {
        let size = usize::from(self.received_count(usb)).min(dst.len());
        let arb = ral::arb_ep::register(usb, self.index());
        ral::write_reg!(ral::arb_ep, &arb, RA, ADDRESS: self.region.start() as u32);
        vcell::read_bytes(
            &usb.EP_MEM[self.region.start()..self.region.start() + size],
            &mut dst[..size],
        )
    }

    /// The SIE's received byte count, CRC excluded.
    ///
    /// A babbling host or a glitched transaction can leave a count larger
    /// than the endpoint ever reserved; the value is clamped to the region
    /// length so it is always safe to index with.
    pub fn received_count(&self, usb: &regs::RegisterBlock) -> u16 {
        let sie = ral::sie_ep::register(usb, self.index());
        let count = ral::read_reg!(ral::sie_ep, &sie, CNT, COUNT) as u16;
        count.saturating_sub(CRC_SIZE).min(self.region.len() as u16)
    }

    /// Record a completed transaction: collect the advisory error bits, flip
    /// the toggle (non-isochronous only), and transition to `Completed`.
    pub fn complete(&mut self, usb: &regs::RegisterBlock, count: u16) -> TransferErrors {
        let mut errors = TransferErrors::empty();

        let sie = ral::sie_ep::register(usb, self.index());
        let (cr, received_toggle) = (
            ral::read_reg!(ral::sie_ep, &sie, CR),
            ral::read_reg!(ral::sie_ep, &sie, CNT, DATA_TOGGLE == 1),
        );
        if cr & regs::SIE_EP_CR::ERR_IN_TXN::mask != 0 {
            errors |= TransferErrors::TRANSFER_ERROR;
            sie.CR.write(cr & !regs::SIE_EP_CR::ERR_IN_TXN::mask);
        }

        if !self.is_isochronous() {
            // A received toggle equal to the previous transaction's toggle
            // means the host saw no handshake and retransmitted.
            if received_toggle != self.toggle {
                errors |= TransferErrors::RETRANSMISSION;
            }
            self.toggle = !self.toggle;
        }

        self.count = count;
        self.state = EndpointState::Completed;
        errors
    }

    /// The data toggle the next transaction will use.
    #[cfg(test)]
    pub fn toggle(&self) -> bool {
        self.toggle
    }

    /// Force the endpoint out of `Pending` by halting its arm state. Returns
    /// the state observed before the abort. Valid at any time, even mid-DMA;
    /// call [`abort_complete`](Self::abort_complete) afterwards to confirm
    /// the hardware quiesced.
    pub fn abort(&mut self, usb: &regs::RegisterBlock) -> EndpointState {
        let previous = self.state;
        self.nak(usb);
        if self.state == EndpointState::Pending {
            self.state = EndpointState::Idle;
        }
        previous
    }

    /// Confirm an abort has quiesced: the arbiter released the endpoint
    /// buffer and any bound DMA channel went idle. Polls a bounded number of
    /// times, then reports [`Error::DynamicReconfigurationTimeout`].
    pub fn abort_complete(&mut self, usb: &regs::RegisterBlock) -> Result<()> {
        let arb = ral::arb_ep::register(usb, self.index());
        for _ in 0..DYN_RECONFIG_RETRIES {
            let buffer_busy = ral::read_reg!(ral::arb_ep, &arb, SR, IN_BUF_FULL == 1);
            let dma_busy = self.dma.as_ref().map(dma::Channel::is_busy).unwrap_or(false);
            if !buffer_busy && !dma_busy {
                // Flush: drop any bytes left behind by the aborted transfer.
                ral::write_reg!(ral::arb_ep, &arb, WA, ADDRESS: self.region.start() as u32);
                ral::write_reg!(ral::arb_ep, &arb, RA, ADDRESS: self.region.start() as u32);
                return Ok(());
            }
        }
        Err(Error::DynamicReconfigurationTimeout)
    }
}
