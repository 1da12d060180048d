//! The USB full-speed device controller register block.
//!
//! The module implements a RAL-compatible interface for the controller's
//! memory-mapped registers, so the rest of the driver can use the usual
//! `read_reg!` / `write_reg!` / `modify_reg!` macros against it.
//!
//! Status and latch bits are plain read / write storage: the driver clears a
//! bit by writing the register value back with that bit masked out. Keeping
//! the block free of write-1-to-clear magic means a zeroed copy of it in RAM
//! behaves like idle hardware, which is how the driver tests simulate the
//! controller.

#![allow(non_snake_case, non_upper_case_globals, dead_code)]

use crate::ral::RWRegister;
use crate::vcell::VCell;
use core::ops::Deref;
use core::ptr::NonNull;

#[repr(C)]
pub struct RegisterBlock {
    /// Device address and enable.
    pub CR0: RWRegister<u32>,
    /// Bus activity latch.
    pub CR1: RWRegister<u32>,
    /// Forced bus state (J / K / SE0).
    pub USBIO_CR0: RWRegister<u32>,
    /// D+ pull-up control.
    pub USBIO_CR1: RWRegister<u32>,
    /// Current frame number, latched at each SOF token.
    pub SOF_NR: RWRegister<u32>,
    /// Bus reset detection counter.
    pub BUS_RST_CNT: RWRegister<u32>,
    /// Analog front-end power control.
    pub POWER_CTL: RWRegister<u32>,
    /// Controller clock gate.
    pub USB_CLK_EN: RWRegister<u32>,
    /// Control endpoint mode and transaction latches.
    pub EP0_CR: RWRegister<u32>,
    /// Control endpoint byte count and data toggle.
    pub EP0_CNT: RWRegister<u32>,
    /// Control endpoint data buffer, one byte per register.
    pub EP0_DR: [RWRegister<u32>; 8],
    /// Link Power Management control.
    pub LPM_CTL: RWRegister<u32>,
    /// BESL and remote-wake values latched at each LPM token.
    pub LPM_STAT: RWRegister<u32>,
    /// Per-endpoint SIE transaction-complete bits.
    pub INTR_SIE: RWRegister<u32>,
    pub INTR_SIE_MASK: RWRegister<u32>,
    /// Static interrupt source-to-level routing.
    pub INTR_LVL_SEL: RWRegister<u32>,
    pub INTR_CAUSE_HI: RWRegister<u32>,
    pub INTR_CAUSE_MED: RWRegister<u32>,
    pub INTR_CAUSE_LO: RWRegister<u32>,
    /// DMA burst threshold.
    pub DMA_THRES: RWRegister<u32>,
    /// Arbiter configuration: endpoint-management mode, common-area enable.
    pub ARB_CFG: RWRegister<u32>,
    /// Per-endpoint arbiter event pending bits.
    pub ARB_INT_SR: RWRegister<u32>,
    pub ARB_INT_EN: RWRegister<u32>,
    pub SIE_EP_CR: [RWRegister<u32>; 8],
    pub SIE_EP_CNT: [RWRegister<u32>; 8],
    pub ARB_EP_CFG: [RWRegister<u32>; 8],
    pub ARB_EP_INT_EN: [RWRegister<u32>; 8],
    pub ARB_EP_SR: [RWRegister<u32>; 8],
    /// Arbiter write-address pointers into the endpoint memory.
    pub ARB_RW_WA: [RWRegister<u32>; 8],
    /// Arbiter read-address pointers into the endpoint memory.
    pub ARB_RW_RA: [RWRegister<u32>; 8],
    /// The shared endpoint data memory.
    pub EP_MEM: [VCell<u8>; crate::EP_MEM_SIZE],
}

const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 86 * 4 + 512) as usize];

#[cfg(test)]
impl RegisterBlock {
    /// A zeroed register block, behaving like idle hardware.
    pub(crate) fn idle() -> Self {
        // Safety: every register is a transparent wrapper over a u32 or u8,
        // and zero is a valid (reset) value for all of them.
        unsafe { core::mem::zeroed() }
    }
}

/// An owned handle to a controller register block.
pub struct Instance {
    ptr: NonNull<RegisterBlock>,
}

impl Instance {
    /// # Safety
    ///
    /// `ptr` must point at a controller register block that stays valid, and
    /// unaliased by other drivers, for the life of this instance.
    pub unsafe fn new(ptr: *const ()) -> Self {
        Instance {
            ptr: NonNull::new_unchecked(ptr as *mut RegisterBlock),
        }
    }
}

impl Deref for Instance {
    type Target = RegisterBlock;
    fn deref(&self) -> &RegisterBlock {
        // Safety: construction guarantees a valid, live register block.
        unsafe { self.ptr.as_ref() }
    }
}

// Safety: the register block is a hardware resource; the driver that owns the
// instance is the only software writer.
unsafe impl Send for Instance {}

bitflags::bitflags! {
    /// Interrupt-cause bitmask, as read from `INTR_CAUSE_LO` / `_MED` / `_HI`.
    ///
    /// Each hardware source is routed to exactly one of the three levels by
    /// `INTR_LVL_SEL`; all three cause registers share this layout.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterruptCause: u32 {
        const SOF = 1 << 0;
        const BUS_RESET = 1 << 1;
        const EP0 = 1 << 2;
        const LPM = 1 << 3;
        const RESUME = 1 << 4;
        const ARBITER = 1 << 7;
        const EP1 = 1 << 8;
        const EP2 = 1 << 9;
        const EP3 = 1 << 10;
        const EP4 = 1 << 11;
        const EP5 = 1 << 12;
        const EP6 = 1 << 13;
        const EP7 = 1 << 14;
        const EP8 = 1 << 15;
    }
}

impl InterruptCause {
    /// The cause bit for data endpoint `endpoint` (1 through 8).
    pub fn data_endpoint(endpoint: usize) -> Self {
        InterruptCause::from_bits_truncate(InterruptCause::EP1.bits() << (endpoint - 1))
    }
}

pub mod CR0 {
    pub mod DEVICE_ADDRESS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod USB_ENABLE {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod CR1 {
    pub mod BUS_ACTIVITY {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod USBIO_CR0 {
    pub mod FORCE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x3 << offset;
        pub mod RW {
            pub const OFF: u32 = 0;
            pub const J: u32 = 1;
            pub const K: u32 = 2;
            pub const SE0: u32 = 3;
        }
        pub mod R {}
        pub mod W {}
    }
}

pub mod USBIO_CR1 {
    pub mod PULLUP_EN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod SOF_NR {
    pub mod FRAME_NUMBER {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod POWER_CTL {
    pub mod SUSPEND {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ENABLE {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod USB_CLK_EN {
    pub mod CLK_EN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Shared SIE response ("arm") encoding, used by `EP0_CR::MODE` and
/// `SIE_EP_CR::MODE`.
pub mod mode {
    pub const DISABLE: u32 = 0x0;
    pub const NAK_IN_OUT: u32 = 0x1;
    pub const STATUS_OUT_ONLY: u32 = 0x2;
    pub const STALL_IN_OUT: u32 = 0x3;
    pub const ISO_OUT: u32 = 0x5;
    pub const STATUS_IN_ONLY: u32 = 0x6;
    pub const ISO_IN: u32 = 0x7;
    pub const NAK_OUT: u32 = 0x8;
    pub const ACK_OUT: u32 = 0x9;
    pub const ACK_OUT_STATUS_IN: u32 = 0xB;
    pub const NAK_IN: u32 = 0xC;
    pub const ACK_IN: u32 = 0xD;
    pub const ACK_IN_STATUS_OUT: u32 = 0xF;
}

pub mod EP0_CR {
    pub mod MODE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {
            pub use crate::regs::mode::*;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod SETUP_RCVD {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IN_RCVD {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod OUT_RCVD {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ACKED_TXN {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod EP0_CNT {
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA_VALID {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA_TOGGLE {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod EP0_DR {
    pub mod DATA {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod LPM_CTL {
    pub mod LPM_EN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod LPM_ACK_RESP {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NYET_EN {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod LPM_STAT {
    pub mod BESL {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod REMOTE_WAKEUP_EN {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Layout shared by `INTR_SIE`, `INTR_SIE_MASK`, `ARB_INT_SR`, and
/// `ARB_INT_EN`: one bit per data endpoint, endpoint 1 at bit 0.
pub mod EP_INTR {
    pub mod EP_INTR {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod ARB_CFG {
    pub mod AUTO_MEM {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DMA_CFG {
        pub const offset: u32 = 5;
        pub const mask: u32 = 0x3 << offset;
        pub mod RW {
            pub const MANUAL: u32 = 0;
            pub const DMA: u32 = 1;
            pub const AUTO: u32 = 2;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod CFG_CMP {
        pub const offset: u32 = 31;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod SIE_EP_CR {
    pub mod MODE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {
            pub use crate::regs::mode::*;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod NAK_INT_EN {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ERR_IN_TXN {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod STALL {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod SIE_EP_CNT {
    /// Byte count. For OUT transactions the SIE includes the two CRC16
    /// bytes it received.
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA_VALID {
        pub const offset: u32 = 14;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA_TOGGLE {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod ARB_EP_CFG {
    pub mod IN_DATA_RDY {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DMA_REQ {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod CRC_BYPASS {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod RESET_PTR {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Layout shared by `ARB_EP_INT_EN` and `ARB_EP_SR`.
pub mod ARB_EP_SR {
    pub mod IN_BUF_FULL {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DMA_GNT {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BUF_OVER {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BUF_UNDER {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ERR_IN_TXN {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DMA_TERMIN {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub use ARB_EP_SR as ARB_EP_INT_EN;

/// Layout shared by `ARB_RW_WA` and `ARB_RW_RA`.
pub mod ARB_RW {
    pub mod ADDRESS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x1FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}
