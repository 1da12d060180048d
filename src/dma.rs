//! DMA channels and transfer descriptors.
//!
//! Endpoints in the triggered and autonomous strategies each own exactly one
//! DMA channel for their lifetime. A channel is a small register block plus a
//! pair of pre-allocated descriptors: the triggered strategy programs the
//! first descriptor for a single transfer, while the autonomous strategy
//! links both descriptors into a ring so the hardware restarts itself without
//! CPU intervention.

#![allow(non_snake_case, non_upper_case_globals, dead_code)]

use crate::ral::{self, RWRegister};
use crate::vcell::VCell;
use core::ptr::NonNull;

/// A DMA transfer descriptor.
#[repr(C)]
pub struct Descriptor {
    pub SRC: VCell<u32>,
    pub DST: VCell<u32>,
    pub CTRL: VCell<u32>,
    pub NEXT: VCell<u32>,
}

impl Descriptor {
    pub const fn new() -> Self {
        Descriptor {
            SRC: VCell::new(0),
            DST: VCell::new(0),
            CTRL: VCell::new(0),
            NEXT: VCell::new(0),
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Descriptor>() == 16) as usize];

pub mod CTRL {
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod INTR_EN {
        pub const offset: u32 = 16;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod NEXT {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ADDRESS {
        pub const offset: u32 = 2;
        pub const mask: u32 = 0x3FFF_FFFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// A DMA channel's control registers.
#[repr(C)]
pub struct ChannelRegisters {
    pub CTL: RWRegister<u32>,
    pub STATUS: RWRegister<u32>,
    pub DESCR_PTR: RWRegister<u32>,
}

pub mod CTL {
    pub mod ENABLED {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TRIG {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod STATUS {
    pub mod BUSY {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod REMAINING {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0xFFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Descriptor storage for one channel.
///
/// Allocate these wherever the DMA engine can reach them; their addresses are
/// handed to the hardware.
#[repr(C, align(16))]
pub struct DescriptorPair(pub [Descriptor; 2]);

impl DescriptorPair {
    pub const fn new() -> Self {
        DescriptorPair([Descriptor::new(), Descriptor::new()])
    }
}

/// A bound DMA channel: control registers plus its descriptor pair.
pub struct Channel {
    regs: NonNull<ChannelRegisters>,
    descriptors: NonNull<DescriptorPair>,
}

// Safety: the channel is exclusively owned by one endpoint record; the DMA
// engine is the only other reader of the descriptors.
unsafe impl Send for Channel {}

impl Channel {
    /// # Safety
    ///
    /// `regs` must point at a DMA channel register block, and `descriptors`
    /// at storage the DMA engine may read. Both must stay valid and unaliased
    /// for the life of the channel, and nothing else may program this
    /// channel.
    pub unsafe fn new(regs: *const (), descriptors: NonNull<DescriptorPair>) -> Self {
        Channel {
            regs: NonNull::new_unchecked(regs as *mut ChannelRegisters),
            descriptors,
        }
    }

    fn regs(&self) -> &ChannelRegisters {
        // Safety: valid per the construction contract.
        unsafe { self.regs.as_ref() }
    }

    fn descriptor(&self, index: usize) -> &Descriptor {
        // Safety: valid per the construction contract.
        &unsafe { self.descriptors.as_ref() }.0[index]
    }

    /// Program a one-shot transfer into the first descriptor.
    pub fn program_single(&mut self, src: u32, dst: u32, len: u16) {
        let descr = self.descriptor(0);
        descr.SRC.write(src);
        descr.DST.write(dst);
        ral::write_reg!(crate::dma, descr, CTRL, COUNT: u32::from(len), INTR_EN: 1);
        ral::write_reg!(crate::dma, descr, NEXT, TERMINATE: 1);
        self.regs()
            .DESCR_PTR
            .write(self.descriptors.as_ptr() as u32);
    }

    /// Link both descriptors into a ring of two `len`-byte transfers, so the
    /// hardware restarts streaming without CPU intervention.
    pub fn program_circular(&mut self, src: u32, dst: u32, len: u16) {
        let base = self.descriptors.as_ptr() as u32;
        for half in 0..2 {
            let descr = self.descriptor(half);
            let offset = u32::from(len) * half as u32;
            descr.SRC.write(src + offset);
            descr.DST.write(dst + offset);
            ral::write_reg!(crate::dma, descr, CTRL, COUNT: u32::from(len), INTR_EN: 1);
            let peer = base + ((half as u32 + 1) % 2) * 16;
            ral::write_reg!(crate::dma, descr, NEXT, ADDRESS: peer >> 2, TERMINATE: 0);
        }
        self.regs().DESCR_PTR.write(base);
    }

    pub fn enable(&mut self) {
        ral::modify_reg!(crate::dma, self.regs(), CTL, ENABLED: 1);
    }

    pub fn disable(&mut self) {
        ral::modify_reg!(crate::dma, self.regs(), CTL, ENABLED: 0);
    }

    /// Stop the channel and drop its descriptor binding, so the hardware
    /// holds no reference to the transfer's buffers.
    pub fn halt(&mut self) {
        ral::modify_reg!(crate::dma, self.regs(), CTL, ENABLED: 0, TRIG: 0);
        self.regs().DESCR_PTR.write(0);
    }

    /// Request one descriptor's worth of service from the channel.
    pub fn trigger(&mut self) {
        ral::modify_reg!(crate::dma, self.regs(), CTL, TRIG: 1);
    }

    pub fn is_busy(&self) -> bool {
        ral::read_reg!(crate::dma, self.regs(), STATUS, BUSY == 1)
    }

    /// Bytes left in the descriptor the channel is currently serving.
    pub fn remaining(&self) -> u16 {
        ral::read_reg!(crate::dma, self.regs(), STATUS, REMAINING) as u16
    }
}
