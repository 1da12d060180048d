//! The three endpoint data-transfer execution strategies.
//!
//! The strategy is fixed once, for the whole controller, when the driver is
//! constructed; per-endpoint behavior differs only in whether the endpoint
//! owns a DMA channel at all. Dispatch is a `match` over [`TransferMode`].
//!
//! - [`TransferMode::DirectCopy`] moves bytes synchronously between the
//!   caller's buffer and the shared hardware buffer.
//! - [`TransferMode::TriggeredDma`] programs one DMA transfer per call. The
//!   channel must drain the caller's buffer before the call returns, so the
//!   transfer is waited on with a bounded poll; the arbiter buffer-full and
//!   DMA-grant events still drive completion on the bus side.
//! - [`TransferMode::AutonomousDma`] pre-arms circular descriptors between a
//!   caller-supplied RAM shadow buffer and the hardware FIFO; hardware
//!   streams without per-packet software intervention.

use crate::{buffer::Region, dma, endpoint::Endpoint, ral, regs, Error, Result};

/// How the driver moves endpoint data, selected once at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum TransferMode {
    /// Software copies through the shared hardware buffer.
    DirectCopy,
    /// Software arms one DMA transfer per load / read call.
    TriggeredDma,
    /// Hardware streams continuously between the FIFO and a RAM shadow.
    AutonomousDma,
}

impl TransferMode {
    pub(crate) fn uses_dma(self) -> bool {
        !matches!(self, TransferMode::DirectCopy)
    }
}

/// Data-register access width. Word access requires even buffer lengths;
/// the allocators pad regions accordingly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
}

impl AccessWidth {
    pub(crate) fn word_access(self) -> bool {
        matches!(self, AccessWidth::Word)
    }
}

/// The memory-copy primitive for RAM shadow traffic. Overridable so a caller
/// can substitute a DMA-accelerated copy.
pub type CopyFn = fn(&mut [u8], &[u8]);

/// The default [`CopyFn`].
pub(crate) fn copy_slice(dst: &mut [u8], src: &[u8]) {
    dst.copy_from_slice(src);
}

/// Bounded poll budget for an in-call DMA wait.
const DMA_RETRIES: usize = 25;

/// The bus address of an endpoint's slice of the hardware buffer.
fn fifo_address(usb: &regs::RegisterBlock, region: Region) -> u32 {
    &usb.EP_MEM[region.start()] as *const _ as u32
}

fn settles(channel: &dma::Channel) -> bool {
    (0..DMA_RETRIES).any(|_| !channel.is_busy())
}

/// Check the endpoint carries every binding its strategy needs, before any
/// state is touched. `add_endpoint` guarantees these, so a miss means the
/// endpoint was built by hand.
fn check_bindings(ep: &mut Endpoint, mode: TransferMode) -> Result<()> {
    if matches!(mode, TransferMode::AutonomousDma) && ep.shadow().is_none() {
        return Err(Error::BadParameter);
    }
    if mode.uses_dma() && ep.dma_mut().is_none() {
        return Err(Error::DmaConfigurationFailed);
    }
    Ok(())
}

/// Stage an IN transfer: move the caller's bytes toward the hardware and
/// mark the endpoint `Pending`.
///
/// Under direct-copy and autonomous-DMA the endpoint is armed here; under
/// triggered-DMA the arbiter's buffer-full event arms it once the hardware
/// buffer actually filled.
pub(crate) fn load_in(
    usb: &regs::RegisterBlock,
    ep: &mut Endpoint,
    mode: TransferMode,
    copy: CopyFn,
    data: &[u8],
) -> Result<usize> {
    check_bindings(ep, mode)?;
    ep.make_pending()?;
    match mode {
        TransferMode::DirectCopy => {
            let size = ep.write_fifo(usb, data);
            ep.arm(usb, size as u16);
            Ok(size)
        }
        TransferMode::TriggeredDma => {
            let size = data.len().min(ep.max_packet_len());
            let region = ep.region();
            let arb = ral::arb_ep::register(usb, ep.index());
            ral::write_reg!(ral::arb_ep, &arb, WA, ADDRESS: region.start() as u32);

            let dst = fifo_address(usb, region);
            let channel = ep.dma_mut().ok_or(Error::DmaConfigurationFailed)?;
            channel.program_single(data.as_ptr() as u32, dst, size as u16);
            channel.enable();
            channel.trigger();
            // The borrow of `data` ends with this call, so the channel must
            // be done with it before we return.
            if !settles(channel) {
                // The descriptor points at `data`, whose borrow ends with
                // this call; the channel must not touch it afterwards.
                channel.halt();
                warning!("endpoint {=usize} DMA write did not settle", ep.index());
                ep.abort(usb);
                return Err(Error::DmaWriteTimeout);
            }

            ral::modify_reg!(ral::arb_ep, &arb, CFG, IN_DATA_RDY: 1);
            ep.set_count(size as u16);
            Ok(size)
        }
        TransferMode::AutonomousDma => {
            let region = ep.region();
            let fifo = fifo_address(usb, region);
            let shadow = ep.shadow_mut().ok_or(Error::BadParameter)?;
            let size = shadow.fill(data, copy);
            let src = shadow.as_ptr() as u32;

            let channel = ep.dma_mut().ok_or(Error::DmaConfigurationFailed)?;
            channel.program_circular(src, fifo, size as u16);
            channel.enable();

            let arb = ral::arb_ep::register(usb, ep.index());
            ral::modify_reg!(ral::arb_ep, &arb, CFG, DMA_REQ: 1);
            ep.arm(usb, size as u16);
            Ok(size)
        }
    }
}

/// Drain a completed OUT transfer into the caller's buffer. The returned
/// count is the received byte count recorded at completion, CRC excluded.
pub(crate) fn read_out(
    usb: &regs::RegisterBlock,
    ep: &mut Endpoint,
    mode: TransferMode,
    copy: CopyFn,
    buffer: &mut [u8],
) -> Result<usize> {
    match mode {
        TransferMode::DirectCopy => Ok(ep.read_fifo(usb, buffer)),
        TransferMode::TriggeredDma => {
            let count = usize::from(ep.count()).min(buffer.len());
            let region = ep.region();
            let arb = ral::arb_ep::register(usb, ep.index());
            ral::write_reg!(ral::arb_ep, &arb, RA, ADDRESS: region.start() as u32);

            let src = fifo_address(usb, region);
            let channel = ep.dma_mut().ok_or(Error::DmaConfigurationFailed)?;
            channel.program_single(src, buffer.as_mut_ptr() as u32, count as u16);
            channel.enable();
            ral::modify_reg!(ral::arb_ep, &arb, CFG, DMA_REQ: 1);
            channel.trigger();
            if !settles(channel) {
                channel.halt();
                warning!("endpoint {=usize} DMA read did not settle", ep.index());
                return Err(Error::DmaReadTimeout);
            }
            Ok(count)
        }
        TransferMode::AutonomousDma => {
            let count = usize::from(ep.count());
            let shadow = ep.shadow().ok_or(Error::BadParameter)?;
            Ok(shadow.drain(buffer, count, copy))
        }
    }
}

/// Arm an OUT endpoint for the next packet from the host.
pub(crate) fn start_out(
    usb: &regs::RegisterBlock,
    ep: &mut Endpoint,
    mode: TransferMode,
) -> Result<()> {
    check_bindings(ep, mode)?;
    ep.make_pending()?;
    if let TransferMode::AutonomousDma = mode {
        let region = ep.region();
        let fifo = fifo_address(usb, region);
        let dst = ep.shadow().ok_or(Error::BadParameter)?.as_ptr() as u32;
        let len = region.len() as u16;
        let channel = ep.dma_mut().ok_or(Error::DmaConfigurationFailed)?;
        channel.program_circular(fifo, dst, len);
        channel.enable();
    }
    ep.arm(usb, 0);
    Ok(())
}
