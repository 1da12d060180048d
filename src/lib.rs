//! A USB full-speed device controller driver.
//!
//! `usbfs-device` drives a fixed-function full-speed USB peripheral with one
//! control endpoint and up to eight data endpoints. The controller supports
//! three endpoint-management strategies, selected once when the driver is
//! created:
//!
//! - [`TransferMode::DirectCopy`] copies data between caller buffers and the
//!   hardware endpoint memory with the CPU.
//! - [`TransferMode::TriggeredDma`] arms one DMA transfer per load / read
//!   call.
//! - [`TransferMode::AutonomousDma`] pre-arms DMA channels so the hardware
//!   streams between the endpoint FIFOs and a caller-supplied RAM buffer
//!   without per-transfer software intervention.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. See the trait documentation for more information. The
//! driver performs no locking; the caller serializes its own access, and the
//! interrupt dispatcher ([`Driver::interrupt`]) is expected to run from a
//! single interrupt context.

#![no_std]

#[macro_use]
mod log;

mod buffer;
mod dma;
mod endpoint;
mod ep0;
mod lpm;
mod ral;
mod regs;
mod transfer;
mod vcell;

pub mod driver;

pub use buffer::{Allocator, Buffer, EndpointMemory};
pub use dma::{Channel, Descriptor, DescriptorPair};
pub use driver::{
    BusState, Config, Driver, EndpointCallback, EndpointConfig, LpmCallback, ServiceCallback,
    ServiceEvent, SofCallback,
};
pub use endpoint::{EndpointState, TransferErrors};
pub use lpm::LpmResponse;
pub use regs::InterruptCause;
pub use transfer::{AccessWidth, CopyFn, TransferMode};

/// Number of general-purpose data endpoints (1 through 8).
pub const EP_COUNT: usize = 8;

/// Size of the shared hardware endpoint buffer, in bytes.
pub const EP_MEM_SIZE: usize = 512;

/// Size of the control endpoint 0 buffer, in bytes.
pub const EP0_SIZE: usize = 8;

/// Everything that can go wrong in this driver.
///
/// Configuration errors are returned synchronously and leave the hardware
/// untouched. Per-transfer protocol errors (bad CRC, bit stuffing, toggle
/// mismatch) are never surfaced here; they arrive as advisory
/// [`TransferErrors`] bits in the endpoint completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Error {
    /// An invalid pointer, endpoint number, or state at the API boundary.
    BadParameter,
    /// The endpoint buffer does not fit the remaining hardware or RAM budget.
    BufferAllocationFailed,
    /// Binding a DMA channel or descriptor to the endpoint failed.
    DmaConfigurationFailed,
    /// An aborted endpoint did not quiesce within the retry bound.
    DynamicReconfigurationTimeout,
    /// The DMA channel did not service a read request in time (triggered-DMA
    /// mode only).
    DmaReadTimeout,
    /// The DMA channel did not service a write request in time (triggered-DMA
    /// mode only).
    DmaWriteTimeout,
}

pub type Result<T> = core::result::Result<T, Error>;

/// A type that owns the USB controller register block.
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// controller's register block. The pointer returned by
/// [`usbfs`](Peripherals::usbfs) is assumed to be valid for the lifetime of
/// the driver, and will be cast to the register block definition.
///
/// # Example
///
/// ```
/// use usbfs_device::Peripherals;
///
/// struct Instances {
///     // Register block handles from your PAC...
/// }
///
/// unsafe impl Peripherals for Instances {
///     fn usbfs(&self) -> *const () {
///         0x4020_0000 as _
///     }
/// }
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB controller registers for this
    /// peripheral instance.
    fn usbfs(&self) -> *const ();
}
