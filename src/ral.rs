//! Facade over the `ral-registers` APIs.
//!
//! Re-exports the register access macros, and adds per-endpoint register
//! windows. The controller exposes the SIE and arbiter registers for the
//! eight data endpoints as arrays; the RAL macros want uniquely-named
//! register fields, so these helpers collect one endpoint's registers behind
//! the names the field modules use.

pub use ral_registers::{modify_reg, read_reg, write_reg, RWRegister};

/// One data endpoint's SIE registers.
pub mod sie_ep {
    use crate::{ral, regs};

    #[allow(non_snake_case)]
    pub struct SieEp<'a> {
        pub CR: &'a ral::RWRegister<u32>,
        pub CNT: &'a ral::RWRegister<u32>,
    }

    #[allow(non_snake_case)]
    pub mod CR {
        pub use crate::regs::SIE_EP_CR::*;
    }

    #[allow(non_snake_case)]
    pub mod CNT {
        pub use crate::regs::SIE_EP_CNT::*;
    }

    /// `endpoint` is the endpoint number, 1 through 8.
    pub fn register(usb: &regs::RegisterBlock, endpoint: usize) -> SieEp<'_> {
        SieEp {
            CR: &usb.SIE_EP_CR[endpoint - 1],
            CNT: &usb.SIE_EP_CNT[endpoint - 1],
        }
    }
}

/// One data endpoint's arbiter registers.
pub mod arb_ep {
    use crate::{ral, regs};

    #[allow(non_snake_case)]
    pub struct ArbEp<'a> {
        pub CFG: &'a ral::RWRegister<u32>,
        pub INT_EN: &'a ral::RWRegister<u32>,
        pub SR: &'a ral::RWRegister<u32>,
        pub WA: &'a ral::RWRegister<u32>,
        pub RA: &'a ral::RWRegister<u32>,
    }

    #[allow(non_snake_case)]
    pub mod CFG {
        pub use crate::regs::ARB_EP_CFG::*;
    }

    #[allow(non_snake_case)]
    pub mod INT_EN {
        pub use crate::regs::ARB_EP_INT_EN::*;
    }

    #[allow(non_snake_case)]
    pub mod SR {
        pub use crate::regs::ARB_EP_SR::*;
    }

    #[allow(non_snake_case)]
    pub mod WA {
        pub use crate::regs::ARB_RW::*;
    }

    #[allow(non_snake_case)]
    pub mod RA {
        pub use crate::regs::ARB_RW::*;
    }

    /// `endpoint` is the endpoint number, 1 through 8.
    pub fn register(usb: &regs::RegisterBlock, endpoint: usize) -> ArbEp<'_> {
        let index = endpoint - 1;
        ArbEp {
            CFG: &usb.ARB_EP_CFG[index],
            INT_EN: &usb.ARB_EP_INT_EN[index],
            SR: &usb.ARB_EP_SR[index],
            WA: &usb.ARB_RW_WA[index],
            RA: &usb.ARB_RW_RA[index],
        }
    }
}
