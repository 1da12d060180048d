//! The USB device controller driver.
//!
//! [`Driver`] owns one controller instance: the endpoint record table, the
//! buffer allocators, the EP0 engine, and the LPM state. Construct it with
//! [`Driver::new`], call [`initialize`](Driver::initialize) to program the
//! controller, add endpoints, then [`enable`](Driver::enable) to present the
//! device on the bus.
//!
//! Two execution contexts touch the driver: task context through the public
//! API, and one interrupt context through [`interrupt`](Driver::interrupt).
//! Nothing here blocks or sleeps; the caller serializes its own access, and
//! registered callbacks run on the interrupt context, so they must not block
//! or re-enter the driver's configuration calls.

use usb_device::{endpoint::EndpointAddress, endpoint::EndpointType, UsbDirection};

use crate::{
    buffer::{Allocator, HardwareAllocator},
    dma::Channel,
    endpoint::{Endpoint, EndpointState, TransferErrors},
    ep0::Ep0,
    lpm::{Lpm, LpmResponse},
    ral,
    regs::{self, InterruptCause},
    transfer::{self, AccessWidth, CopyFn, TransferMode},
    Error, Peripherals, Result, EP0_SIZE, EP_COUNT, EP_MEM_SIZE,
};

/// Bus-reset detection window, in 12 MHz clocks.
const BUS_RESET_PERIOD: u32 = 0x10;

/// Arbiter burst threshold for autonomous streaming.
const DMA_BURST_THRESHOLD: u32 = 0x8;

/// Service callback, invoked on the interrupt context.
pub type ServiceCallback = fn(&mut Driver, ServiceEvent);

/// Endpoint completion callback: the endpoint that completed and the
/// advisory error bits for the transaction.
pub type EndpointCallback = fn(&mut Driver, EndpointAddress, TransferErrors);

/// Start-of-frame callback, with the frame number latched at the SOF token.
pub type SofCallback = fn(&mut Driver, u16);

/// LPM token callback: the latched BESL value and remote-wakeup permission.
pub type LpmCallback = fn(&mut Driver, u8, bool);

/// Interrupt sources that accept a [`ServiceCallback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum ServiceEvent {
    BusReset,
    Ep0Setup,
    Ep0In,
    Ep0Out,
    Resume,
}

const SERVICE_COUNT: usize = 5;

impl ServiceEvent {
    fn index(self) -> usize {
        match self {
            ServiceEvent::BusReset => 0,
            ServiceEvent::Ep0Setup => 1,
            ServiceEvent::Ep0In => 2,
            ServiceEvent::Ep0Out => 3,
            ServiceEvent::Resume => 4,
        }
    }
}

/// A bus state that [`Driver::force`] can drive, for remote-wakeup
/// signaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState {
    /// Stop forcing; the SIE drives the bus.
    Off,
    J,
    K,
    Se0,
}

/// Driver configuration, consumed by [`Driver::new`].
pub struct Config {
    /// The endpoint-management strategy, fixed for the driver's lifetime.
    pub mode: TransferMode,
    /// Data-register access width. Word access pads buffer regions to even
    /// lengths.
    pub access_width: AccessWidth,
    /// Respond to LPM tokens.
    pub enable_lpm: bool,
    /// Interrupt source-to-level routing, written verbatim to the routing
    /// register during [`Driver::initialize`].
    pub interrupt_levels: u32,
    /// Memory-copy primitive for RAM shadow traffic
    /// ([`TransferMode::AutonomousDma`] only). Replace it to substitute a
    /// DMA-accelerated copy.
    pub copy_fn: CopyFn,
    /// RAM shadow allocator ([`TransferMode::AutonomousDma`] only). See
    /// [`EndpointMemory`](crate::EndpointMemory).
    pub shadow: Option<Allocator>,
}

impl Config {
    pub fn new(mode: TransferMode) -> Self {
        Config {
            mode,
            access_width: AccessWidth::Byte,
            enable_lpm: false,
            interrupt_levels: 0,
            copy_fn: transfer::copy_slice,
            shadow: None,
        }
    }
}

/// One data endpoint's configuration, consumed by
/// [`Driver::add_endpoint`].
pub struct EndpointConfig {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    /// Maximum packet length; also the size of the reserved buffer region.
    pub max_packet_len: u16,
    /// Whether the endpoint responds on the bus immediately.
    pub enabled: bool,
    /// The DMA channel this endpoint owns, required by the DMA strategies.
    pub channel: Option<Channel>,
}

const NO_ENDPOINT: Option<Endpoint> = None;

/// A USB full-speed device controller.
pub struct Driver {
    usb: regs::Instance,
    mode: TransferMode,
    access_width: AccessWidth,
    copy_fn: CopyFn,
    hw_alloc: HardwareAllocator,
    shadow_alloc: Option<Allocator>,
    endpoints: [Option<Endpoint>; EP_COUNT],
    ep0: Ep0,
    lpm: Lpm,
    lpm_enabled: bool,
    interrupt_levels: u32,
    service: [Option<ServiceCallback>; SERVICE_COUNT],
    sof_callback: Option<SofCallback>,
    lpm_callback: Option<LpmCallback>,
}

impl Driver {
    /// Create the driver over the controller owned by `peripherals`.
    ///
    /// The hardware is untouched until [`initialize`](Driver::initialize).
    pub fn new<P: Peripherals>(peripherals: P, config: Config) -> Self {
        let usb = unsafe { regs::Instance::new(peripherals.usbfs()) };
        Driver {
            usb,
            mode: config.mode,
            access_width: config.access_width,
            copy_fn: config.copy_fn,
            hw_alloc: HardwareAllocator::new(
                EP_MEM_SIZE as u16,
                config.access_width.word_access(),
            ),
            shadow_alloc: config.shadow,
            endpoints: [NO_ENDPOINT; EP_COUNT],
            ep0: Ep0::new(),
            lpm: Lpm::new(),
            lpm_enabled: config.enable_lpm,
            interrupt_levels: config.interrupt_levels,
            service: [None; SERVICE_COUNT],
            sof_callback: None,
            lpm_callback: None,
        }
    }

    /// Program the controller: clocking, arbiter mode, interrupt routing,
    /// EP0, and LPM. The device stays invisible on the bus until
    /// [`enable`](Driver::enable).
    pub fn initialize(&mut self) {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::modify_reg!(crate::regs, usb, USB_CLK_EN, CLK_EN: 1);
        usb.INTR_LVL_SEL.write(self.interrupt_levels);
        usb.BUS_RST_CNT.write(BUS_RESET_PERIOD);

        let dma_cfg = match self.mode {
            TransferMode::DirectCopy => regs::ARB_CFG::DMA_CFG::RW::MANUAL,
            TransferMode::TriggeredDma => regs::ARB_CFG::DMA_CFG::RW::DMA,
            TransferMode::AutonomousDma => regs::ARB_CFG::DMA_CFG::RW::AUTO,
        };
        let auto_mem = matches!(self.mode, TransferMode::AutonomousDma) as u32;
        ral::write_reg!(crate::regs, usb, ARB_CFG, DMA_CFG: dma_cfg, AUTO_MEM: auto_mem);
        if self.mode.uses_dma() {
            usb.DMA_THRES.write(DMA_BURST_THRESHOLD);
            usb.ARB_INT_EN.write(regs::EP_INTR::EP_INTR::mask);
        }
        usb.INTR_SIE_MASK.write(regs::EP_INTR::EP_INTR::mask);

        self.ep0.initialize(usb);
        self.lpm.initialize(usb, self.lpm_enabled);
        ral::modify_reg!(crate::regs, usb, POWER_CTL, ENABLE: 1, SUSPEND: 0);
        ral::modify_reg!(crate::regs, usb, ARB_CFG, CFG_CMP: 1);
    }

    /// Tear the driver down: detach from the bus, release every endpoint and
    /// its DMA binding, return the buffer budgets, and gate the clock.
    pub fn deinit(&mut self) {
        self.disable();
        let usb: &regs::RegisterBlock = &self.usb;
        for slot in self.endpoints.iter_mut() {
            if let Some(mut ep) = slot.take() {
                ep.set_enabled(usb, false);
                ep.unbind_dma();
            }
        }
        self.hw_alloc = HardwareAllocator::new(
            EP_MEM_SIZE as u16,
            self.access_width.word_access(),
        );
        if let Some(alloc) = self.shadow_alloc.as_mut() {
            alloc.rewind(0);
        }
        usb.INTR_SIE_MASK.write(0);
        usb.ARB_INT_EN.write(0);
        usb.EP0_CR.write(0);
        ral::modify_reg!(crate::regs, usb, POWER_CTL, ENABLE: 0);
        ral::modify_reg!(crate::regs, usb, USB_CLK_EN, CLK_EN: 0);
    }

    /// Present the device on the bus: respond at address 0 and raise the D+
    /// pull-up.
    pub fn enable(&mut self) {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::modify_reg!(crate::regs, usb, CR0, DEVICE_ADDRESS: 0, USB_ENABLE: 1);
        ral::modify_reg!(crate::regs, usb, USBIO_CR1, PULLUP_EN: 1);
    }

    /// Detach from the bus.
    pub fn disable(&mut self) {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::modify_reg!(crate::regs, usb, USBIO_CR1, PULLUP_EN: 0);
        ral::modify_reg!(crate::regs, usb, CR0, USB_ENABLE: 0);
    }

    /// Set the device address assigned by the host. Takes effect
    /// immediately, so call it once the SetAddress status stage completed.
    pub fn set_address(&mut self, address: u8) {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::modify_reg!(crate::regs, usb, CR0, DEVICE_ADDRESS: u32::from(address));
    }

    /// The frame number latched at the most recent SOF token.
    pub fn frame_number(&self) -> u16 {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::read_reg!(crate::regs, usb, SOF_NR, FRAME_NUMBER) as u16
    }

    /// Configure a data endpoint.
    ///
    /// Configuration is transactional: on any error the hardware and both
    /// buffer budgets are left exactly as they were.
    pub fn add_endpoint(&mut self, config: EndpointConfig) -> Result<()> {
        let number = config.address.index();
        if number == 0 || number > EP_COUNT || config.max_packet_len == 0 {
            return Err(Error::BadParameter);
        }
        if self.endpoints[number - 1].is_some() {
            return Err(Error::BadParameter);
        }

        let region = self
            .hw_alloc
            .allocate(config.max_packet_len)
            .ok_or(Error::BufferAllocationFailed)?;
        let hw_mark = region.start() as u16;

        let shadow = if matches!(self.mode, TransferMode::AutonomousDma) {
            let word = self.access_width.word_access();
            let buffer = self
                .shadow_alloc
                .as_mut()
                .and_then(|alloc| alloc.allocate(usize::from(config.max_packet_len), word));
            match buffer {
                Some(buffer) => Some(buffer),
                None => {
                    self.hw_alloc.rewind(hw_mark);
                    return Err(Error::BufferAllocationFailed);
                }
            }
        } else {
            None
        };
        let shadow_len = shadow.as_ref().map(crate::buffer::Buffer::len);

        let channel = if self.mode.uses_dma() {
            match config.channel {
                Some(channel) => Some(channel),
                None => {
                    if let (Some(alloc), Some(len)) = (self.shadow_alloc.as_mut(), shadow_len) {
                        let mark = alloc.mark();
                        alloc.rewind(mark - len);
                    }
                    self.hw_alloc.rewind(hw_mark);
                    return Err(Error::DmaConfigurationFailed);
                }
            }
        } else {
            None
        };

        let mut ep = Endpoint::new(config.address, config.kind, region);
        if let Some(buffer) = shadow {
            ep.set_shadow(buffer);
        }
        if let Some(channel) = channel {
            ep.bind_dma(channel);
        }

        let usb: &regs::RegisterBlock = &self.usb;
        ep.configure_arbiter(usb, arbiter_events(self.mode));
        ep.set_enabled(usb, config.enabled);
        debug!("configured endpoint {=usize} at offset {=usize}", number, region.start());
        self.endpoints[number - 1] = Some(ep);
        Ok(())
    }

    /// Release a data endpoint, aborting any transfer still in flight, and
    /// return its buffer region to the budget where possible.
    pub fn remove_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        {
            let usb: &regs::RegisterBlock = &self.usb;
            let ep = Self::entry(&mut self.endpoints, address)?;
            if ep.state() == EndpointState::Pending {
                ep.abort(usb);
                ep.abort_complete(usb)?;
            }
            ep.set_enabled(usb, false);
            ep.unbind_dma();
        }
        self.endpoints[address.index() - 1] = None;

        let high_water = self
            .endpoints
            .iter()
            .flatten()
            .map(|ep| ep.region().end())
            .max()
            .unwrap_or(0);
        self.hw_alloc.rewind(high_water as u16);
        if self.endpoints.iter().all(Option::is_none) {
            if let Some(alloc) = self.shadow_alloc.as_mut() {
                alloc.rewind(0);
            }
        }
        Ok(())
    }

    /// Stage an IN transfer on a configured endpoint. Returns the number of
    /// bytes accepted, bounded by the endpoint's maximum packet length.
    ///
    /// The endpoint must be `Idle` or `Completed`; loading a `Pending`
    /// endpoint is a usage error.
    pub fn load_in_endpoint(&mut self, address: EndpointAddress, data: &[u8]) -> Result<usize> {
        if address.direction() != UsbDirection::In {
            return Err(Error::BadParameter);
        }
        let usb: &regs::RegisterBlock = &self.usb;
        let (mode, copy) = (self.mode, self.copy_fn);
        let ep = Self::entry(&mut self.endpoints, address)?;
        transfer::load_in(usb, ep, mode, copy, data)
    }

    /// Drain a completed OUT transfer. Returns the received byte count, CRC
    /// excluded. The endpoint stays `Completed`; use
    /// [`enable_out_endpoint`](Driver::enable_out_endpoint) to accept the
    /// next packet.
    pub fn read_out_endpoint(
        &mut self,
        address: EndpointAddress,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if address.direction() != UsbDirection::Out {
            return Err(Error::BadParameter);
        }
        let usb: &regs::RegisterBlock = &self.usb;
        let (mode, copy) = (self.mode, self.copy_fn);
        let ep = Self::entry(&mut self.endpoints, address)?;
        if ep.state() != EndpointState::Completed {
            return Err(Error::BadParameter);
        }
        transfer::read_out(usb, ep, mode, copy, buffer)
    }

    /// Arm an OUT endpoint to accept the next packet from the host.
    pub fn enable_out_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        if address.direction() != UsbDirection::Out {
            return Err(Error::BadParameter);
        }
        let usb: &regs::RegisterBlock = &self.usb;
        let mode = self.mode;
        let ep = Self::entry(&mut self.endpoints, address)?;
        transfer::start_out(usb, ep, mode)
    }

    /// Force an endpoint out of `Pending` immediately. Returns the state
    /// observed before the abort. Follow with
    /// [`abort_complete`](Driver::abort_complete).
    pub fn abort(&mut self, address: EndpointAddress) -> Result<EndpointState> {
        let usb: &regs::RegisterBlock = &self.usb;
        let ep = Self::entry(&mut self.endpoints, address)?;
        Ok(ep.abort(usb))
    }

    /// Confirm an aborted endpoint quiesced. Bounded; reports
    /// [`Error::DynamicReconfigurationTimeout`] when the hardware does not
    /// let go in time.
    pub fn abort_complete(&mut self, address: EndpointAddress) -> Result<()> {
        let usb: &regs::RegisterBlock = &self.usb;
        let ep = Self::entry(&mut self.endpoints, address)?;
        ep.abort_complete(usb)
    }

    pub fn stall_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let usb: &regs::RegisterBlock = &self.usb;
        let ep = Self::entry(&mut self.endpoints, address)?;
        ep.set_stalled(usb, true);
        Ok(())
    }

    pub fn unstall_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let usb: &regs::RegisterBlock = &self.usb;
        let ep = Self::entry(&mut self.endpoints, address)?;
        ep.set_stalled(usb, false);
        Ok(())
    }

    /// Whether the endpoint's STALL bit is set in hardware. Unconfigured
    /// endpoints report `false`.
    pub fn is_endpoint_stalled(&self, address: EndpointAddress) -> bool {
        let number = address.index();
        if number == 0 || number > EP_COUNT {
            return false;
        }
        self.endpoints[number - 1]
            .as_ref()
            .filter(|ep| ep.address() == address)
            .map(|ep| ep.is_stalled(&self.usb))
            .unwrap_or(false)
    }

    /// The endpoint's lifecycle state; `Invalid` when the endpoint is not
    /// configured on this controller.
    pub fn endpoint_state(&self, address: EndpointAddress) -> EndpointState {
        let number = address.index();
        if number == 0 || number > EP_COUNT {
            return EndpointState::Invalid;
        }
        self.endpoints[number - 1]
            .as_ref()
            .filter(|ep| ep.address() == address)
            .map(Endpoint::state)
            .unwrap_or(EndpointState::Invalid)
    }

    /// Copy the most recent setup packet out of the EP0 buffer.
    pub fn ep0_setup(&mut self, buffer: &mut [u8; EP0_SIZE]) {
        self.ep0.setup(&self.usb, buffer);
    }

    /// Stage an EP0 Data-In packet (`Some`) or the final Status-In (`None`).
    /// Returns the number of bytes staged.
    pub fn ep0_write(&mut self, data: Option<&[u8]>) -> usize {
        self.ep0.write(&self.usb, data)
    }

    /// Fetch a received EP0 Data-Out packet or arm the next Data-Out /
    /// Status-Out stage (`None`). Returns the received byte count.
    pub fn ep0_read(&mut self, buffer: Option<&mut [u8]>) -> usize {
        self.ep0.read(&self.usb, buffer)
    }

    /// Stall both EP0 directions, for protocol errors.
    pub fn ep0_stall(&mut self) {
        self.ep0.stall(&self.usb);
    }

    pub fn register_service_callback(&mut self, event: ServiceEvent, callback: ServiceCallback) {
        self.service[event.index()] = Some(callback);
    }

    pub fn register_endpoint_callback(
        &mut self,
        address: EndpointAddress,
        callback: EndpointCallback,
    ) -> Result<()> {
        let ep = Self::entry(&mut self.endpoints, address)?;
        ep.callback = Some(callback);
        Ok(())
    }

    pub fn register_sof_callback(&mut self, callback: SofCallback) {
        self.sof_callback = Some(callback);
    }

    pub fn register_lpm_callback(&mut self, callback: LpmCallback) {
        self.lpm_callback = Some(callback);
    }

    /// The BESL value latched from the most recent LPM token.
    pub fn lpm_besl_value(&self) -> u8 {
        self.lpm.besl_value(&self.usb)
    }

    /// Whether the most recent LPM token permitted remote wakeup.
    pub fn lpm_remote_wakeup_allowed(&self) -> bool {
        self.lpm.remote_wakeup_allowed(&self.usb)
    }

    /// Choose the handshake for the next LPM token. The default is
    /// [`LpmResponse::Ack`].
    pub fn lpm_set_response(&mut self, response: LpmResponse) {
        self.lpm.set_response(&self.usb, response);
    }

    pub fn lpm_response(&self) -> LpmResponse {
        self.lpm.response()
    }

    /// Read and clear the low-priority interrupt cause group.
    pub fn interrupt_cause_lo(&self) -> InterruptCause {
        let cause = self.usb.INTR_CAUSE_LO.read();
        self.usb.INTR_CAUSE_LO.write(0);
        InterruptCause::from_bits_truncate(cause)
    }

    /// Read and clear the medium-priority interrupt cause group.
    pub fn interrupt_cause_med(&self) -> InterruptCause {
        let cause = self.usb.INTR_CAUSE_MED.read();
        self.usb.INTR_CAUSE_MED.write(0);
        InterruptCause::from_bits_truncate(cause)
    }

    /// Read and clear the high-priority interrupt cause group.
    pub fn interrupt_cause_hi(&self) -> InterruptCause {
        let cause = self.usb.INTR_CAUSE_HI.read();
        self.usb.INTR_CAUSE_HI.write(0);
        InterruptCause::from_bits_truncate(cause)
    }

    /// The interrupt dispatcher. Call from the interrupt handler with a
    /// cause mask obtained from one of the three cause readers.
    ///
    /// Sources run in fixed priority order: LPM, arbiter, EP0, SOF, bus
    /// reset, resume, then the per-endpoint SIE completion bits.
    pub fn interrupt(&mut self, cause: InterruptCause) {
        if cause.contains(InterruptCause::LPM) {
            self.handle_lpm();
        }
        if cause.contains(InterruptCause::ARBITER) {
            self.handle_arbiter();
        }
        if cause.contains(InterruptCause::EP0) {
            self.handle_ep0();
        }
        if cause.contains(InterruptCause::SOF) {
            self.handle_sof();
        }
        if cause.contains(InterruptCause::BUS_RESET) {
            self.handle_bus_reset();
        }
        if cause.contains(InterruptCause::RESUME) {
            self.service(ServiceEvent::Resume);
        }
        for number in 1..=EP_COUNT {
            if cause.contains(InterruptCause::data_endpoint(number)) {
                self.handle_endpoint(number);
            }
        }
    }

    /// Put the analog front-end into suspend. DMA channels are disabled;
    /// their register state persists for [`resume`](Driver::resume). Data
    /// still sitting in endpoint buffers is not preserved.
    pub fn suspend(&mut self) {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::modify_reg!(crate::regs, usb, POWER_CTL, SUSPEND: 1);
        for ep in self.endpoints.iter_mut().flatten() {
            if let Some(channel) = ep.dma_mut() {
                channel.disable();
            }
        }
    }

    /// Leave suspend. Every configured endpoint is reprogrammed before the
    /// analog front-end wakes, so the controller never responds to bus
    /// traffic half-configured.
    pub fn resume(&mut self) {
        let usb: &regs::RegisterBlock = &self.usb;
        ral::modify_reg!(crate::regs, usb, USB_CLK_EN, CLK_EN: 1);
        let events = arbiter_events(self.mode);
        for ep in self.endpoints.iter_mut().flatten() {
            ep.configure_arbiter(usb, events);
            if let Some(channel) = ep.dma_mut() {
                channel.enable();
            }
        }
        ral::modify_reg!(crate::regs, usb, POWER_CTL, SUSPEND: 0);
    }

    /// Read and clear the bus-activity latch. An idle bus between two calls
    /// is the caller's cue to suspend.
    pub fn check_activity(&mut self) -> bool {
        let usb: &regs::RegisterBlock = &self.usb;
        let active = ral::read_reg!(crate::regs, usb, CR1, BUS_ACTIVITY == 1);
        let cr1 = usb.CR1.read();
        usb.CR1.write(cr1 & !regs::CR1::BUS_ACTIVITY::mask);
        active
    }

    /// Drive a bus state directly, for remote-wakeup signaling. Pass
    /// [`BusState::Off`] to hand the bus back to the SIE.
    pub fn force(&mut self, state: BusState) {
        let usb: &regs::RegisterBlock = &self.usb;
        let value = match state {
            BusState::Off => regs::USBIO_CR0::FORCE::RW::OFF,
            BusState::J => regs::USBIO_CR0::FORCE::RW::J,
            BusState::K => regs::USBIO_CR0::FORCE::RW::K,
            BusState::Se0 => regs::USBIO_CR0::FORCE::RW::SE0,
        };
        ral::modify_reg!(crate::regs, usb, USBIO_CR0, FORCE: value);
    }

    fn entry(
        endpoints: &mut [Option<Endpoint>; EP_COUNT],
        address: EndpointAddress,
    ) -> Result<&mut Endpoint> {
        let number = address.index();
        if number == 0 || number > EP_COUNT {
            return Err(Error::BadParameter);
        }
        endpoints[number - 1]
            .as_mut()
            .filter(|ep| ep.address() == address)
            .ok_or(Error::BadParameter)
    }

    fn service(&mut self, event: ServiceEvent) {
        if let Some(callback) = self.service[event.index()] {
            callback(self, event);
        }
    }

    fn handle_lpm(&mut self) {
        let besl = self.lpm.besl_value(&self.usb);
        let remote_wakeup = self.lpm.remote_wakeup_allowed(&self.usb);
        debug!("LPM token, BESL {=u8}", besl);
        if let Some(callback) = self.lpm_callback {
            callback(self, besl, remote_wakeup);
        }
    }

    fn handle_arbiter(&mut self) {
        let pending = {
            let usb: &regs::RegisterBlock = &self.usb;
            let pending = usb.ARB_INT_SR.read() & regs::EP_INTR::EP_INTR::mask;
            usb.ARB_INT_SR.write(0);
            pending
        };
        for number in 1..=EP_COUNT {
            if pending & (1 << (number - 1)) == 0 {
                continue;
            }
            let mut fire = None;
            {
                let usb: &regs::RegisterBlock = &self.usb;
                let Some(ep) = self.endpoints[number - 1].as_mut() else {
                    continue;
                };
                let arb = ral::arb_ep::register(usb, number);
                let events = ral::read_reg!(ral::arb_ep, &arb, SR);
                if events & regs::ARB_EP_SR::BUF_OVER::mask != 0 {
                    panic!("endpoint {} FIFO overflow", number);
                }
                if events & regs::ARB_EP_SR::BUF_UNDER::mask != 0 {
                    panic!("endpoint {} FIFO underflow", number);
                }
                arb.SR.write(0);

                // Triggered-DMA IN: the hardware buffer filled; arm the SIE
                // with the count staged at load time.
                if events & regs::ARB_EP_SR::IN_BUF_FULL::mask != 0
                    && ep.state() == EndpointState::Pending
                    && ep.address().direction() == UsbDirection::In
                {
                    let count = ep.count();
                    ep.arm(usb, count);
                }

                // Autonomous-DMA OUT: the channel hit terminal count, so the
                // packet is fully in the RAM shadow.
                if events & regs::ARB_EP_SR::DMA_TERMIN::mask != 0
                    && ep.state() == EndpointState::Pending
                    && ep.address().direction() == UsbDirection::Out
                {
                    let count = ep.received_count(usb);
                    let errors = ep.complete(usb, count);
                    fire = ep.callback.map(|cb| (cb, ep.address(), errors));
                }
            }
            if let Some((callback, address, errors)) = fire {
                callback(self, address, errors);
            }
        }
    }

    fn handle_ep0(&mut self) {
        let usb: &regs::RegisterBlock = &self.usb;
        let cr = ral::read_reg!(crate::regs, usb, EP0_CR);
        if cr & regs::EP0_CR::SETUP_RCVD::mask != 0 {
            // If the latch will not clear a new setup raced in; the next EP0
            // interrupt retries with the fresh packet.
            if self.ep0.unlock_setup(usb) {
                self.service(ServiceEvent::Ep0Setup);
            } else {
                warning!("setup latch re-raised, deferring to the next interrupt");
            }
        } else if cr & regs::EP0_CR::IN_RCVD::mask != 0 {
            self.ep0.on_in_event(usb);
            self.service(ServiceEvent::Ep0In);
        } else if cr & regs::EP0_CR::OUT_RCVD::mask != 0 {
            self.ep0.on_out_event(usb);
            self.service(ServiceEvent::Ep0Out);
        }
    }

    fn handle_sof(&mut self) {
        let frame = self.frame_number();
        if let Some(callback) = self.sof_callback {
            callback(self, frame);
        }
    }

    fn handle_bus_reset(&mut self) {
        {
            let usb: &regs::RegisterBlock = &self.usb;
            // A reset can only come from an attached bus. Without the
            // pull-up this is noise on a floating line.
            if !ral::read_reg!(crate::regs, usb, USBIO_CR1, PULLUP_EN == 1) {
                return;
            }
            debug!("bus reset");
            ral::modify_reg!(crate::regs, usb, CR0, DEVICE_ADDRESS: 0, USB_ENABLE: 1);
            self.ep0.initialize(usb);
            for ep in self.endpoints.iter_mut().flatten() {
                ep.bus_reset(usb);
            }
        }
        self.service(ServiceEvent::BusReset);
    }

    fn handle_endpoint(&mut self, number: usize) {
        let mut fire = None;
        {
            let usb: &regs::RegisterBlock = &self.usb;
            let pending = usb.INTR_SIE.read();
            usb.INTR_SIE.write(pending & !(1u32 << (number - 1)));
            let Some(ep) = self.endpoints[number - 1].as_mut() else {
                return;
            };
            if ep.state() != EndpointState::Pending {
                return;
            }
            let out = ep.address().direction() == UsbDirection::Out;
            let count = if out { ep.received_count(usb) } else { ep.count() };
            if out && self.mode == TransferMode::AutonomousDma && count != 0 {
                // A non-empty autonomous OUT completes on the DMA terminal
                // event, once the bytes made it to the shadow. Only a
                // zero-length packet completes here.
                return;
            }
            let errors = ep.complete(usb, count);
            fire = ep.callback.map(|cb| (cb, ep.address(), errors));
        }
        if let Some((callback, address, errors)) = fire {
            callback(self, address, errors);
        }
    }
}

/// The arbiter events each strategy needs to observe. Overflow and
/// underflow are always fatal, so they are only watched where the arbiter
/// is in play at all.
fn arbiter_events(mode: TransferMode) -> u32 {
    use regs::ARB_EP_SR::{BUF_OVER, BUF_UNDER, DMA_GNT, DMA_TERMIN, IN_BUF_FULL};
    match mode {
        TransferMode::DirectCopy => 0,
        TransferMode::TriggeredDma => {
            IN_BUF_FULL::mask | DMA_GNT::mask | BUF_OVER::mask | BUF_UNDER::mask
        }
        TransferMode::AutonomousDma => DMA_TERMIN::mask | BUF_OVER::mask | BUF_UNDER::mask,
    }
}

#[cfg(test)]
mod test {
    use super::{Config, Driver, EndpointConfig, ServiceEvent};
    use crate::dma::{self, DescriptorPair};
    use crate::endpoint::{EndpointState, TransferErrors};
    use crate::lpm::LpmResponse;
    use crate::regs::{self, InterruptCause, RegisterBlock};
    use crate::{BusState, EndpointMemory, Error, TransferMode};
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use usb_device::{
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection,
    };

    struct Registers(*const ());

    unsafe impl crate::Peripherals for Registers {
        fn usbfs(&self) -> *const () {
            self.0
        }
    }

    /// A driver over a zeroed in-RAM register block. Status registers start
    /// at their reset values; tests poke them to simulate hardware events.
    fn driver(usb: &RegisterBlock, config: Config) -> Driver {
        let mut driver = Driver::new(Registers(usb as *const RegisterBlock as *const ()), config);
        driver.initialize();
        driver
    }

    fn channel(ch: &dma::ChannelRegisters, pair: &DescriptorPair) -> dma::Channel {
        unsafe { dma::Channel::new(ch as *const _ as _, NonNull::from(pair)) }
    }

    fn endpoint_config(
        number: usize,
        dir: UsbDirection,
        max_packet_len: u16,
        channel: Option<dma::Channel>,
    ) -> EndpointConfig {
        EndpointConfig {
            address: EndpointAddress::from_parts(number, dir),
            kind: EndpointType::Bulk,
            max_packet_len,
            enabled: true,
            channel,
        }
    }

    fn in_ep(number: usize) -> EndpointAddress {
        EndpointAddress::from_parts(number, UsbDirection::In)
    }

    fn out_ep(number: usize) -> EndpointAddress {
        EndpointAddress::from_parts(number, UsbDirection::Out)
    }

    #[test]
    fn direct_copy_in_transfer_completes_once() {
        static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(driver: &mut Driver, address: EndpointAddress, errors: TransferErrors) {
            assert!(errors.is_empty());
            assert_eq!(driver.endpoint_state(address), EndpointState::Completed);
            COMPLETIONS.fetch_add(1, Ordering::SeqCst);
        }

        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 64, None))
            .unwrap();
        drv.register_endpoint_callback(in_ep(1), on_complete).unwrap();

        assert_eq!(drv.load_in_endpoint(in_ep(1), &[0xA5; 10]).unwrap(), 10);
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Pending);

        // The host reads the packet; the SIE raises the completion bit.
        usb.INTR_SIE.write(1);
        drv.interrupt(InterruptCause::EP1);

        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Completed);
    }

    #[test]
    fn toggle_alternates_over_successive_completions() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 64, None))
            .unwrap();

        for round in 0..4 {
            drv.load_in_endpoint(in_ep(1), &[round as u8; 8]).unwrap();
            let toggled =
                usb.SIE_EP_CNT[0].read() & regs::SIE_EP_CNT::DATA_TOGGLE::mask != 0;
            assert_eq!(toggled, round % 2 == 1, "round {}", round);
            usb.INTR_SIE.write(1);
            drv.interrupt(InterruptCause::EP1);
            assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Completed);
        }
    }

    #[test]
    fn loads_are_rejected_off_the_legal_states() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 64, None))
            .unwrap();
        let mut disabled = endpoint_config(3, UsbDirection::In, 8, None);
        disabled.enabled = false;
        drv.add_endpoint(disabled).unwrap();

        // Pending rejects another load until completion.
        drv.load_in_endpoint(in_ep(1), &[1]).unwrap();
        assert_eq!(
            drv.load_in_endpoint(in_ep(1), &[2]).unwrap_err(),
            Error::BadParameter
        );
        // Unconfigured and disabled endpoints reject loads outright.
        assert_eq!(
            drv.load_in_endpoint(in_ep(2), &[2]).unwrap_err(),
            Error::BadParameter
        );
        assert_eq!(drv.endpoint_state(in_ep(2)), EndpointState::Invalid);
        assert_eq!(
            drv.load_in_endpoint(in_ep(3), &[2]).unwrap_err(),
            Error::BadParameter
        );
        // Direction mismatches never reach the endpoint table.
        assert_eq!(
            drv.load_in_endpoint(out_ep(1), &[2]).unwrap_err(),
            Error::BadParameter
        );
    }

    #[test]
    fn buffer_budget_is_never_exceeded() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));

        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 300, None))
            .unwrap();
        assert_eq!(
            drv.add_endpoint(endpoint_config(2, UsbDirection::In, 300, None))
                .unwrap_err(),
            Error::BufferAllocationFailed
        );
        // The failure left the budget untouched: the rest still fits.
        drv.add_endpoint(endpoint_config(2, UsbDirection::In, 212, None))
            .unwrap();
        assert_eq!(
            drv.add_endpoint(endpoint_config(3, UsbDirection::In, 1, None))
                .unwrap_err(),
            Error::BufferAllocationFailed
        );
    }

    #[test]
    fn removing_an_endpoint_returns_its_region() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));

        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 512, None))
            .unwrap();
        drv.remove_endpoint(in_ep(1)).unwrap();
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Invalid);
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 512, None))
            .unwrap();

        assert_eq!(
            drv.remove_endpoint(in_ep(4)).unwrap_err(),
            Error::BadParameter
        );
    }

    #[test]
    fn triggered_dma_in_arms_on_buffer_full() {
        static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(_: &mut Driver, _: EndpointAddress, errors: TransferErrors) {
            assert!(errors.is_empty());
            COMPLETIONS.fetch_add(1, Ordering::SeqCst);
        }

        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::TriggeredDma));
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            1,
            UsbDirection::In,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();
        drv.register_endpoint_callback(in_ep(1), on_complete).unwrap();

        drv.load_in_endpoint(in_ep(1), &[9; 12]).unwrap();
        // Not armed yet; the endpoint still NAKs.
        assert_eq!(
            usb.SIE_EP_CR[0].read() & regs::SIE_EP_CR::MODE::mask,
            regs::mode::NAK_IN_OUT
        );

        // The channel filled the hardware buffer.
        usb.ARB_INT_SR.write(1);
        usb.ARB_EP_SR[0].write(regs::ARB_EP_SR::IN_BUF_FULL::mask);
        drv.interrupt(InterruptCause::ARBITER);
        assert_eq!(
            usb.SIE_EP_CR[0].read() & regs::SIE_EP_CR::MODE::mask,
            regs::mode::ACK_IN
        );
        assert_eq!(usb.SIE_EP_CNT[0].read() & regs::SIE_EP_CNT::COUNT::mask, 12);

        // The host read it out.
        usb.INTR_SIE.write(1);
        drv.interrupt(InterruptCause::EP1);
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Completed);
    }

    #[test]
    fn babble_counts_are_clamped_to_the_endpoint_region() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.add_endpoint(endpoint_config(2, UsbDirection::Out, 64, None))
            .unwrap();
        drv.enable_out_endpoint(out_ep(2)).unwrap();

        // A glitched transaction leaves a count far past the 64 bytes the
        // endpoint reserved.
        usb.SIE_EP_CNT[1].write(600);
        usb.INTR_SIE.write(1 << 1);
        drv.interrupt(InterruptCause::EP2);
        assert_eq!(drv.endpoint_state(out_ep(2)), EndpointState::Completed);

        let mut buffer = [0u8; 1024];
        assert_eq!(drv.read_out_endpoint(out_ep(2), &mut buffer).unwrap(), 64);
    }

    #[test]
    fn dma_write_timeout_releases_channel_and_endpoint() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::TriggeredDma));
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        ch.STATUS.write(1); // busy, forever
        drv.add_endpoint(endpoint_config(
            1,
            UsbDirection::In,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();

        assert_eq!(
            drv.load_in_endpoint(in_ep(1), &[1; 8]).unwrap_err(),
            Error::DmaWriteTimeout
        );
        assert_eq!(ch.CTL.read() & 1, 0);
        assert_eq!(ch.DESCR_PTR.read(), 0);
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Idle);
    }

    #[test]
    fn abort_leaves_pending_immediately_and_quiesces_in_bound() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::TriggeredDma));
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            1,
            UsbDirection::In,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();

        drv.load_in_endpoint(in_ep(1), &[1; 32]).unwrap();
        assert_eq!(drv.abort(in_ep(1)).unwrap(), EndpointState::Pending);
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Idle);
        // Nominal latency: the hardware lets go well within the retry bound.
        drv.abort_complete(in_ep(1)).unwrap();
    }

    #[test]
    fn autonomous_out_zero_length_completes_via_sie() {
        static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(_: &mut Driver, _: EndpointAddress, errors: TransferErrors) {
            assert!(errors.is_empty());
            COMPLETIONS.fetch_add(1, Ordering::SeqCst);
        }

        static EP_SHADOW: EndpointMemory<128> = EndpointMemory::new();
        let usb = RegisterBlock::idle();
        let mut config = Config::new(TransferMode::AutonomousDma);
        config.shadow = EP_SHADOW.allocator();
        let mut drv = driver(&usb, config);
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            2,
            UsbDirection::Out,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();
        drv.register_endpoint_callback(out_ep(2), on_complete).unwrap();

        drv.enable_out_endpoint(out_ep(2)).unwrap();
        assert_eq!(drv.endpoint_state(out_ep(2)), EndpointState::Pending);
        assert_eq!(
            usb.SIE_EP_CR[1].read() & regs::SIE_EP_CR::MODE::mask,
            regs::mode::ACK_OUT
        );

        // Zero-length packet: the SIE count holds only the CRC16. No DMA
        // terminal event will ever come for it.
        usb.SIE_EP_CNT[1].write(2);
        usb.INTR_SIE.write(1 << 1);
        drv.interrupt(InterruptCause::EP2);

        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
        assert_eq!(drv.endpoint_state(out_ep(2)), EndpointState::Completed);
        let mut buffer = [0u8; 8];
        assert_eq!(drv.read_out_endpoint(out_ep(2), &mut buffer).unwrap(), 0);
    }

    #[test]
    fn autonomous_out_with_data_waits_for_the_dma_terminal() {
        static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(_: &mut Driver, _: EndpointAddress, errors: TransferErrors) {
            assert!(errors.is_empty());
            COMPLETIONS.fetch_add(1, Ordering::SeqCst);
        }

        static EP_SHADOW: EndpointMemory<128> = EndpointMemory::new();
        let usb = RegisterBlock::idle();
        let mut config = Config::new(TransferMode::AutonomousDma);
        config.shadow = EP_SHADOW.allocator();
        let mut drv = driver(&usb, config);
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            2,
            UsbDirection::Out,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();
        drv.register_endpoint_callback(out_ep(2), on_complete).unwrap();
        drv.enable_out_endpoint(out_ep(2)).unwrap();

        // 5 bytes received: the SIE event alone must not complete it, since
        // the channel may still be draining the FIFO into the shadow.
        usb.SIE_EP_CNT[1].write(5 + 2);
        usb.INTR_SIE.write(1 << 1);
        drv.interrupt(InterruptCause::EP2);
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 0);
        assert_eq!(drv.endpoint_state(out_ep(2)), EndpointState::Pending);

        // The channel hit terminal count.
        usb.ARB_INT_SR.write(1 << 1);
        usb.ARB_EP_SR[1].write(regs::ARB_EP_SR::DMA_TERMIN::mask);
        drv.interrupt(InterruptCause::ARBITER);
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);

        let mut buffer = [0u8; 16];
        assert_eq!(drv.read_out_endpoint(out_ep(2), &mut buffer).unwrap(), 5);
    }

    #[test]
    fn autonomous_in_completes_via_sie() {
        static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(_: &mut Driver, _: EndpointAddress, errors: TransferErrors) {
            assert!(errors.is_empty());
            COMPLETIONS.fetch_add(1, Ordering::SeqCst);
        }

        static EP_SHADOW: EndpointMemory<128> = EndpointMemory::new();
        let usb = RegisterBlock::idle();
        let mut config = Config::new(TransferMode::AutonomousDma);
        config.shadow = EP_SHADOW.allocator();
        let mut drv = driver(&usb, config);
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            1,
            UsbDirection::In,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();
        drv.register_endpoint_callback(in_ep(1), on_complete).unwrap();

        assert_eq!(drv.load_in_endpoint(in_ep(1), &[6; 20]).unwrap(), 20);
        assert_eq!(
            usb.SIE_EP_CR[0].read() & regs::SIE_EP_CR::MODE::mask,
            regs::mode::ACK_IN
        );
        usb.INTR_SIE.write(1);
        drv.interrupt(InterruptCause::EP1);
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lpm_token_is_acked_by_default() {
        static BESL: AtomicUsize = AtomicUsize::new(usize::MAX);
        fn on_lpm(_: &mut Driver, besl: u8, remote_wakeup: bool) {
            assert!(remote_wakeup);
            BESL.store(usize::from(besl), Ordering::SeqCst);
        }

        let usb = RegisterBlock::idle();
        let mut config = Config::new(TransferMode::DirectCopy);
        config.enable_lpm = true;
        let mut drv = driver(&usb, config);
        drv.register_lpm_callback(on_lpm);

        usb.LPM_STAT
            .write(0x5 | regs::LPM_STAT::REMOTE_WAKEUP_EN::mask);
        drv.interrupt(InterruptCause::LPM);

        assert_eq!(BESL.load(Ordering::SeqCst), 5);
        assert_eq!(drv.lpm_response(), LpmResponse::Ack);
        assert_ne!(usb.LPM_CTL.read() & regs::LPM_CTL::LPM_ACK_RESP::mask, 0);
    }

    #[test]
    fn bus_reset_requires_the_pull_up() {
        static RESETS: AtomicUsize = AtomicUsize::new(0);
        fn on_service(_: &mut Driver, event: ServiceEvent) {
            assert_eq!(event, ServiceEvent::BusReset);
            RESETS.fetch_add(1, Ordering::SeqCst);
        }

        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.register_service_callback(ServiceEvent::BusReset, on_service);

        // Detached: a reset on a floating line is noise.
        drv.interrupt(InterruptCause::BUS_RESET);
        assert_eq!(RESETS.load(Ordering::SeqCst), 0);

        drv.enable();
        drv.set_address(5);
        drv.interrupt(InterruptCause::BUS_RESET);
        assert_eq!(RESETS.load(Ordering::SeqCst), 1);
        assert_eq!(usb.CR0.read() & regs::CR0::DEVICE_ADDRESS::mask, 0);
        assert_ne!(usb.CR0.read() & regs::CR0::USB_ENABLE::mask, 0);
        assert_eq!(
            usb.EP0_CR.read() & regs::EP0_CR::MODE::mask,
            regs::mode::NAK_IN_OUT
        );
    }

    #[test]
    fn ep0_setup_flow_runs_the_service_callbacks() {
        static SETUPS: AtomicUsize = AtomicUsize::new(0);
        static INS: AtomicUsize = AtomicUsize::new(0);
        fn on_service(driver: &mut Driver, event: ServiceEvent) {
            match event {
                ServiceEvent::Ep0Setup => {
                    let mut setup = [0u8; 8];
                    driver.ep0_setup(&mut setup);
                    assert_eq!(setup[0], 0x80);
                    assert_eq!(setup[1], 0x06);
                    driver.ep0_write(Some(&[0x12, 0x01]));
                    SETUPS.fetch_add(1, Ordering::SeqCst);
                }
                ServiceEvent::Ep0In => {
                    INS.fetch_add(1, Ordering::SeqCst);
                }
                _ => panic!("unexpected event"),
            }
        }

        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.register_service_callback(ServiceEvent::Ep0Setup, on_service);
        drv.register_service_callback(ServiceEvent::Ep0In, on_service);
        drv.enable();

        // GET_DESCRIPTOR(DEVICE) arrives.
        for (i, byte) in [0x80u8, 0x06, 0, 1, 0, 0, 8, 0].iter().enumerate() {
            usb.EP0_DR[i].write(u32::from(*byte));
        }
        usb.EP0_CR
            .write(usb.EP0_CR.read() | regs::EP0_CR::SETUP_RCVD::mask);
        drv.interrupt(InterruptCause::EP0);

        assert_eq!(SETUPS.load(Ordering::SeqCst), 1);
        assert_eq!(
            usb.EP0_CR.read() & regs::EP0_CR::MODE::mask,
            regs::mode::ACK_IN_STATUS_OUT
        );
        assert_eq!(usb.EP0_DR[0].read(), 0x12);
        assert_eq!(usb.EP0_CNT.read() & regs::EP0_CNT::COUNT::mask, 2);

        // The host collected the data packet.
        usb.EP0_CR
            .write(usb.EP0_CR.read() | regs::EP0_CR::IN_RCVD::mask);
        drv.interrupt(InterruptCause::EP0);
        assert_eq!(INS.load(Ordering::SeqCst), 1);
        assert_eq!(usb.EP0_CR.read() & regs::EP0_CR::IN_RCVD::mask, 0);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn fifo_overflow_is_fatal() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::TriggeredDma));
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            1,
            UsbDirection::In,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();

        usb.ARB_INT_SR.write(1);
        usb.ARB_EP_SR[0].write(regs::ARB_EP_SR::BUF_OVER::mask);
        drv.interrupt(InterruptCause::ARBITER);
    }

    #[test]
    fn suspend_then_resume_reprograms_endpoints() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::TriggeredDma));
        let (ch, pair): (dma::ChannelRegisters, _) =
            (unsafe { core::mem::zeroed() }, DescriptorPair::new());
        drv.add_endpoint(endpoint_config(
            1,
            UsbDirection::In,
            64,
            Some(channel(&ch, &pair)),
        ))
        .unwrap();
        drv.load_in_endpoint(in_ep(1), &[2; 8]).unwrap();
        assert_ne!(ch.CTL.read() & 1, 0);

        drv.suspend();
        assert_ne!(usb.POWER_CTL.read() & regs::POWER_CTL::SUSPEND::mask, 0);
        assert_eq!(ch.CTL.read() & 1, 0);

        usb.ARB_EP_INT_EN[0].write(0);
        drv.resume();
        assert_eq!(usb.POWER_CTL.read() & regs::POWER_CTL::SUSPEND::mask, 0);
        assert_ne!(ch.CTL.read() & 1, 0);
        // Arbiter event enables were re-applied before leaving suspend.
        assert_ne!(
            usb.ARB_EP_INT_EN[0].read() & regs::ARB_EP_SR::IN_BUF_FULL::mask,
            0
        );
    }

    #[test]
    fn stall_and_unstall_round_trip() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 64, None))
            .unwrap();

        drv.stall_endpoint(in_ep(1)).unwrap();
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Stalled);
        assert!(drv.is_endpoint_stalled(in_ep(1)));
        assert!(!drv.is_endpoint_stalled(in_ep(4)));
        assert_eq!(
            drv.load_in_endpoint(in_ep(1), &[1]).unwrap_err(),
            Error::BadParameter
        );

        drv.unstall_endpoint(in_ep(1)).unwrap();
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Idle);
        drv.load_in_endpoint(in_ep(1), &[1]).unwrap();
    }

    #[test]
    fn activity_latch_reads_and_clears() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        usb.CR1.write(regs::CR1::BUS_ACTIVITY::mask);
        assert!(drv.check_activity());
        assert!(!drv.check_activity());
    }

    #[test]
    fn forced_bus_states_drive_the_transceiver() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.force(BusState::K);
        assert_eq!(
            usb.USBIO_CR0.read() & regs::USBIO_CR0::FORCE::mask,
            regs::USBIO_CR0::FORCE::RW::K
        );
        drv.force(BusState::Off);
        assert_eq!(usb.USBIO_CR0.read() & regs::USBIO_CR0::FORCE::mask, 0);
    }

    #[test]
    fn cause_readers_clear_their_group() {
        let usb = RegisterBlock::idle();
        let drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        usb.INTR_CAUSE_MED
            .write((InterruptCause::EP0 | InterruptCause::SOF).bits());
        let cause = drv.interrupt_cause_med();
        assert!(cause.contains(InterruptCause::EP0));
        assert!(cause.contains(InterruptCause::SOF));
        assert_eq!(usb.INTR_CAUSE_MED.read(), 0);
        assert!(drv.interrupt_cause_lo().is_empty());
        assert!(drv.interrupt_cause_hi().is_empty());
    }

    #[test]
    fn sof_callback_receives_the_frame_number() {
        static FRAME: AtomicUsize = AtomicUsize::new(0);
        fn on_sof(_: &mut Driver, frame: u16) {
            FRAME.store(usize::from(frame), Ordering::SeqCst);
        }

        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.register_sof_callback(on_sof);
        usb.SOF_NR.write(0x2A7);
        drv.interrupt(InterruptCause::SOF);
        assert_eq!(FRAME.load(Ordering::SeqCst), 0x2A7);
        assert_eq!(drv.frame_number(), 0x2A7);
    }

    #[test]
    fn deinit_releases_endpoints_and_detaches() {
        let usb = RegisterBlock::idle();
        let mut drv = driver(&usb, Config::new(TransferMode::DirectCopy));
        drv.enable();
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 512, None))
            .unwrap();

        drv.deinit();
        assert_eq!(drv.endpoint_state(in_ep(1)), EndpointState::Invalid);
        assert_eq!(usb.USBIO_CR1.read() & regs::USBIO_CR1::PULLUP_EN::mask, 0);

        // The whole budget is available again.
        drv.initialize();
        drv.add_endpoint(endpoint_config(1, UsbDirection::In, 512, None))
            .unwrap();
    }
}
