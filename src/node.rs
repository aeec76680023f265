use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use embedded_hal::{delay::DelayNs, digital::OutputPin};

use crate::{
    an400::{Decoder, DecoderConfig},
    controller::CanController,
    envelope::EnvelopeEncoder,
    ndjson::{status_line, NdjsonEncoder, NdjsonError},
    packet::PacketEncoder,
    snapshot::Snapshot,
};

/// Blink half-period of the fail-stop indicator
pub const HALT_BLINK_MS: u32 = 250;

/// Receive passes one interrupt-armed tick makes before handing the rest
/// back to the next tick through the latch
pub const MAX_DRAIN_PASSES: usize = 4;

/// Outbound transport for encoded telemetry.
pub trait Uplink {
    type Error;

    /// Sends one line or datagram and returns once transmission has
    /// completed. Only one packet is ever in flight.
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// Free-running millisecond clock. Wraps at `u32::MAX`.
pub trait Clock {
    fn now_ms(&mut self) -> u32;
}

/// Wire format the node emits on its uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UplinkFormat {
    /// One JSON object per line over USB serial
    #[default]
    Ndjson,
    /// 22-byte radio packets
    Binary,
    /// 38-byte framed radio datagrams
    Framed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiveMode {
    /// Receive flags are read on every tick
    #[default]
    Polled,
    /// Receive flags are only read after the controller's interrupt line has
    /// fired, see [`RxInterruptLatch`]
    InterruptArmed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    /// Emission period, 50 ms gives the nominal 20 Hz
    pub emit_period_ms: u32,
    pub node_id: u8,
    pub uplink: UplinkFormat,
    pub receive: ReceiveMode,
    pub decoder: DecoderConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            emit_period_ms: 50,
            node_id: 1,
            uplink: UplinkFormat::default(),
            receive: ReceiveMode::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

/// Set from the CAN interrupt handler, consumed by the node loop.
///
/// The handler never touches the controller or the snapshot. All register
/// access stays on the loop.
#[derive(Debug, Default)]
pub struct RxInterruptLatch {
    pending: AtomicBool,
}

impl RxInterruptLatch {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Called from the interrupt handler.
    pub fn signal(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns whether the interrupt fired since the last call and re-arms the
    /// latch. The latch is cleared before the caller drains the controller so
    /// an interrupt raised during the drain is kept for the next tick.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeStats {
    pub frames_read: u32,
    pub frames_decoded: u32,
    pub frames_ignored: u32,
    pub overflows_cleared: u32,
    pub packets_sent: u32,
}

/// What one call to [`TelemetryNode::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickReport {
    pub frames_read: usize,
    pub overflow_cleared: bool,
    pub emitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError<C, U> {
    #[error("CAN controller access failed")]
    Can(C),
    #[error("Uplink transmission failed")]
    Uplink(U),
    #[error("Failed to render a telemetry line ({0})")]
    Encode(NdjsonError),
}

/// The transmitting node: drains the CAN controller into the snapshot and
/// emits it on a fixed period.
pub struct TelemetryNode<'l, C, U, K> {
    can: C,
    uplink: U,
    clock: K,
    config: NodeConfig,
    decoder: Decoder,
    snapshot: Snapshot,
    ndjson: NdjsonEncoder,
    packets: PacketEncoder,
    envelopes: EnvelopeEncoder,
    latch: Option<&'l RxInterruptLatch>,
    last_emit_ms: Option<u32>,
    stats: NodeStats,
}

impl<'l, C, U, K> TelemetryNode<'l, C, U, K>
where
    C: CanController,
    U: Uplink,
    K: Clock,
{
    /// `can` must already be initialized and in normal mode.
    pub fn new(can: C, uplink: U, clock: K, config: NodeConfig) -> Self {
        Self {
            can,
            uplink,
            clock,
            decoder: Decoder::new(config.decoder),
            snapshot: Snapshot::new(),
            ndjson: NdjsonEncoder::new(config.node_id, config.decoder.variant),
            packets: PacketEncoder::new(),
            envelopes: EnvelopeEncoder::new(),
            latch: None,
            last_emit_ms: None,
            stats: NodeStats::default(),
            config,
        }
    }

    /// Attaches the latch the CAN interrupt handler signals. Only consulted
    /// in [`ReceiveMode::InterruptArmed`].
    pub fn with_interrupt_latch(mut self, latch: &'l RxInterruptLatch) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn release(self) -> (C, U, K) {
        (self.can, self.uplink, self.clock)
    }

    /// One pass of the loop: drain buffer 0 then buffer 1, recover from
    /// receive overflow, and emit if the period has elapsed.
    ///
    /// The period is measured from the last packet actually sent, so the
    /// first packet goes out on the first tick after a frame was decoded.
    pub fn tick(&mut self) -> Result<TickReport, NodeError<C::Error, U::Error>> {
        let mut report = TickReport::default();

        if self.should_poll() {
            report.frames_read = self.drain()?;
        }

        report.overflow_cleared = self.recover_overflow()?;

        let now = self.clock.now_ms();
        if self.emit_due(now) && self.emit(now)? {
            self.last_emit_ms = Some(now);
            report.emitted = true;
        }

        Ok(report)
    }

    /// Sends a `#` status line. Dropped on radio uplinks, which only carry
    /// telemetry.
    pub fn send_status(&mut self, args: fmt::Arguments<'_>) -> Result<(), NodeError<C::Error, U::Error>> {
        if self.config.uplink != UplinkFormat::Ndjson {
            return Ok(());
        }

        let line = status_line(args).map_err(NodeError::Encode)?;
        self.uplink
            .transmit(line.as_bytes())
            .map_err(NodeError::Uplink)
    }

    fn should_poll(&self) -> bool {
        match (self.config.receive, self.latch) {
            (ReceiveMode::InterruptArmed, Some(latch)) => latch.take(),
            _ => true,
        }
    }

    /// Polled mode reads each buffer once per tick. Interrupt-armed mode
    /// keeps reading until both buffers are empty: the interrupt line stays
    /// asserted while any flag is set, so a frame landing mid-drain raises
    /// no new edge.
    fn drain(&mut self) -> Result<usize, NodeError<C::Error, U::Error>> {
        let latch = match (self.config.receive, self.latch) {
            (ReceiveMode::InterruptArmed, Some(latch)) => latch,
            _ => return self.drain_pass(),
        };

        let mut count = 0;

        for _ in 0..MAX_DRAIN_PASSES {
            let read = self.drain_pass()?;
            if read == 0 {
                return Ok(count);
            }
            count += read;
        }

        if !self.can.poll_receive_flags().map_err(NodeError::Can)?.is_empty() {
            latch.signal();
        }

        Ok(count)
    }

    fn drain_pass(&mut self) -> Result<usize, NodeError<C::Error, U::Error>> {
        let flags = self.can.poll_receive_flags().map_err(NodeError::Can)?;
        let mut count = 0;

        for buffer in flags.pending() {
            let frame = self.can.read_frame(buffer).map_err(NodeError::Can)?;
            self.can
                .clear_receive_flag(buffer)
                .map_err(NodeError::Can)?;

            count += 1;
            self.stats.frames_read = self.stats.frames_read.wrapping_add(1);

            match self.decoder.decode(&frame, &mut self.snapshot) {
                Some(_message) => {
                    #[cfg(feature = "defmt")]
                    debug!("Decoded {} from {}", _message, buffer);

                    self.stats.frames_decoded = self.stats.frames_decoded.wrapping_add(1);
                }
                None => self.stats.frames_ignored = self.stats.frames_ignored.wrapping_add(1),
            }
        }

        Ok(count)
    }

    fn recover_overflow(&mut self) -> Result<bool, NodeError<C::Error, U::Error>> {
        let flags = self.can.error_flags().map_err(NodeError::Can)?;

        if !flags.has_overflow() {
            return Ok(false);
        }

        #[cfg(feature = "defmt")]
        warn!("Receive overflow, frames were lost: {}", flags);

        self.can.clear_overflow(flags).map_err(NodeError::Can)?;
        self.stats.overflows_cleared = self.stats.overflows_cleared.wrapping_add(1);

        self.send_status(format_args!(
            "CAN RX overflow cleared (rx0={}, rx1={})",
            flags.rx0_overflow as u8, flags.rx1_overflow as u8
        ))?;

        Ok(true)
    }

    fn emit_due(&self, now: u32) -> bool {
        match self.last_emit_ms {
            None => true,
            Some(last) => now.wrapping_sub(last) >= self.config.emit_period_ms,
        }
    }

    fn emit(&mut self, now: u32) -> Result<bool, NodeError<C::Error, U::Error>> {
        let sent = match self.config.uplink {
            UplinkFormat::Ndjson => match self.ndjson.encode(now, &self.snapshot) {
                Ok(Some(line)) => self.transmit(line.as_bytes())?,
                Ok(None) => false,
                Err(e) => return Err(NodeError::Encode(e)),
            },
            UplinkFormat::Binary => match self.packets.encode(&self.snapshot) {
                Some(packet) => self.transmit(&packet)?,
                None => false,
            },
            UplinkFormat::Framed => match self.envelopes.encode(now, &self.snapshot) {
                Some(datagram) => self.transmit(&datagram)?,
                None => false,
            },
        };

        Ok(sent)
    }

    fn transmit(&mut self, bytes: &[u8]) -> Result<bool, NodeError<C::Error, U::Error>> {
        self.uplink.transmit(bytes).map_err(NodeError::Uplink)?;
        self.stats.packets_sent = self.stats.packets_sent.wrapping_add(1);
        Ok(true)
    }
}

/// Fail-stop after an initialization failure: blinks `led` forever.
///
/// There is no retry. A node that cannot reach its CAN controller or radio
/// must look dead rather than send empty telemetry.
pub fn halt<P: OutputPin, D: DelayNs>(mut led: P, mut delay: D) -> ! {
    #[cfg(feature = "defmt")]
    defmt::error!("Initialization failed, halting");

    loop {
        let _ = led.set_high();
        delay.delay_ms(HALT_BLINK_MS);
        let _ = led.set_low();
        delay.delay_ms(HALT_BLINK_MS);
    }
}
