//! Register-level driver for the MCP2515 stand-alone CAN controller.

#[cfg(feature = "defmt")]
use defmt::warn;
use embedded_can::{ExtendedId, Frame, Id, StandardId};
use embedded_hal::spi::{Operation, SpiDevice};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    controller::{CanController, ErrorFlags, RxBuffer, RxFlags},
    frame::{RawFrame, MAX_DLC},
};

/// CANSTAT reads after a mode request before giving up on confirmation
const MODE_CONFIRM_ATTEMPTS: usize = 10;

/// REQOP bits of CANCTRL and OPMOD bits of CANSTAT
const MODE_MASK: u8 = 0xE0;

/// SIDH, SIDL, EID8, EID0, DLC and eight data registers
const RX_BUFFER_LEN: usize = 5 + MAX_DLC;

/* Register bits */

const SIDL_EXIDE: u8 = 0x08;
const SIDL_SRR: u8 = 0x10;
const DLC_RTR: u8 = 0x40;
const DLC_MASK: u8 = 0x0F;

const CANINTF_RX0IF: u8 = 0x01;
const CANINTF_RX1IF: u8 = 0x02;
const CANINTE_RX0IE: u8 = 0x01;
const CANINTE_RX1IE: u8 = 0x02;

const EFLG_RX0OVR: u8 = 0x40;
const EFLG_RX1OVR: u8 = 0x80;

/// Turns masks and filters off for the buffer
const RXBCTRL_RXM_ANY: u8 = 0x60;
/// Lets a full buffer 0 roll over into buffer 1
const RXB0CTRL_BUKT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
enum Instruction {
    Reset = 0xC0,
    Read = 0x03,
    Write = 0x02,
    BitModify = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Register {
    CanStat = 0x0E,
    CanCtrl = 0x0F,
    Cnf3 = 0x28,
    Cnf2 = 0x29,
    Cnf1 = 0x2A,
    CanIntE = 0x2B,
    CanIntF = 0x2C,
    Eflg = 0x2D,
    Rxb0Ctrl = 0x60,
    Rxb0Sidh = 0x61,
    Rxb1Ctrl = 0x70,
    Rxb1Sidh = 0x71,
}

/// Controller operating mode as encoded in CANCTRL.REQOP / CANSTAT.OPMOD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OperatingMode {
    /// Sends and receives on the bus
    Normal = 0x00,
    Sleep = 0x20,
    Loopback = 0x40,
    ListenOnly = 0x60,
    /// Required for writing bit timing and filter registers. Entered on reset.
    #[default]
    Configuration = 0x80,
}

/// Bit timing presets for a given bus speed and crystal. The ECU broadcasts
/// at a fixed 250 kbit/s, so there is no bitrate negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitrateProfile {
    /// 250 kbit/s with a 16 MHz crystal
    #[default]
    Rate250KbitAt16MHz,
    /// 500 kbit/s with a 16 MHz crystal
    Rate500KbitAt16MHz,
    /// 125 kbit/s with a 16 MHz crystal
    Rate125KbitAt16MHz,
    /// 250 kbit/s with an 8 MHz crystal
    Rate250KbitAt8MHz,
}

impl BitrateProfile {
    /// CNF1, CNF2 and CNF3 values
    pub const fn registers(&self) -> [u8; 3] {
        match self {
            Self::Rate250KbitAt16MHz => [0x41, 0xF1, 0x85],
            Self::Rate500KbitAt16MHz => [0x00, 0xF0, 0x86],
            Self::Rate125KbitAt16MHz => [0x03, 0xF0, 0x86],
            Self::Rate250KbitAt8MHz => [0x00, 0xB1, 0x85],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error<E> {
    #[error("SPI transaction with the controller failed")]
    Spi(E),
    #[error("Requested {requested:?} mode but CANSTAT still reads ({observed:#04x})")]
    ModeNotConfirmed {
        requested: OperatingMode,
        observed: u8,
    },
}

impl RxBuffer {
    const fn sidh_register(self) -> Register {
        match self {
            Self::Rx0 => Register::Rxb0Sidh,
            Self::Rx1 => Register::Rxb1Sidh,
        }
    }

    const fn interrupt_flag(self) -> u8 {
        match self {
            Self::Rx0 => CANINTF_RX0IF,
            Self::Rx1 => CANINTF_RX1IF,
        }
    }
}

/// Rebuilds a frame from the SIDH..D7 register block of a receive buffer.
fn frame_from_registers(regs: &[u8; RX_BUFFER_LEN]) -> RawFrame {
    let [sidh, sidl, eid8, eid0, dlc_reg, ..] = *regs;
    let dlc = dlc_reg & DLC_MASK;

    let (id, remote): (Id, bool) = if sidl & SIDL_EXIDE != 0 {
        let raw = (sidh as u32) << 21
            | ((sidl & 0xE0) as u32) << 13
            | ((sidl & 0x03) as u32) << 16
            | (eid8 as u32) << 8
            | eid0 as u32;

        // The shifts above set at most the low 29 bits
        let id = ExtendedId::new(raw).unwrap_or(ExtendedId::ZERO);
        (id.into(), dlc_reg & DLC_RTR != 0)
    } else {
        let raw = (sidh as u16) << 3 | (sidl >> 5) as u16;

        let id = StandardId::new(raw).unwrap_or(StandardId::ZERO);
        (id.into(), sidl & SIDL_SRR != 0)
    };

    if remote {
        if let Some(frame) = RawFrame::new_remote(id, (dlc as usize).min(MAX_DLC)) {
            return frame;
        }
    }

    RawFrame::from_parts(id, dlc, &regs[5..])
}

/// An MCP2515 behind an SPI device.
pub struct Mcp2515<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> Mcp2515<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub fn release(self) -> SPI {
        self.spi
    }

    /// Brings the controller from power-on to receiving: reset,
    /// configuration mode, bit timing, receive-any filtering, normal mode.
    ///
    /// Any error here means the node has no CAN data and must not continue.
    pub fn init(&mut self, profile: BitrateProfile) -> Result<(), Error<SPI::Error>> {
        self.reset()?;
        self.set_mode(OperatingMode::Configuration)?;
        self.configure_bit_timing(profile)?;
        self.enable_receive_any()?;
        self.set_mode(OperatingMode::Normal)
    }

    /// Hardware reset through the SPI RESET instruction. The controller comes
    /// back in configuration mode with every register at its default.
    pub fn reset(&mut self) -> Result<(), Error<SPI::Error>> {
        self.spi
            .write(&[Instruction::Reset.into()])
            .map_err(Error::Spi)
    }

    pub fn read_register(&mut self, register: Register) -> Result<u8, Error<SPI::Error>> {
        let mut value = [0u8];
        self.read_registers(register, &mut value)?;
        Ok(value[0])
    }

    /// Sequential read starting at `start`; the controller auto-increments
    /// the address.
    fn read_registers(&mut self, start: Register, buf: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[Instruction::Read.into(), start.into()]),
                Operation::Read(buf),
            ])
            .map_err(Error::Spi)
    }

    pub fn write_register(&mut self, register: Register, value: u8) -> Result<(), Error<SPI::Error>> {
        self.spi
            .write(&[Instruction::Write.into(), register.into(), value])
            .map_err(Error::Spi)
    }

    /// Writes only the bits of `value` selected by `mask`.
    pub fn modify_register(
        &mut self,
        register: Register,
        mask: u8,
        value: u8,
    ) -> Result<(), Error<SPI::Error>> {
        self.spi
            .write(&[Instruction::BitModify.into(), register.into(), mask, value])
            .map_err(Error::Spi)
    }

    /// Requests `mode` and waits for CANSTAT to report it. A controller that
    /// never confirms is an initialization failure.
    pub fn set_mode(&mut self, mode: OperatingMode) -> Result<(), Error<SPI::Error>> {
        self.modify_register(Register::CanCtrl, MODE_MASK, mode.into())?;

        let mut observed = 0;
        for _ in 0..MODE_CONFIRM_ATTEMPTS {
            observed = self.read_register(Register::CanStat)?;

            if observed & MODE_MASK == u8::from(mode) {
                return Ok(());
            }
        }

        #[cfg(feature = "defmt")]
        warn!("MCP2515 did not enter {} (CANSTAT = {=u8:#x})", mode, observed);

        Err(Error::ModeNotConfirmed {
            requested: mode,
            observed,
        })
    }

    /// Current operating mode, `None` if OPMOD holds a reserved value.
    pub fn mode(&mut self) -> Result<Option<OperatingMode>, Error<SPI::Error>> {
        let stat = self.read_register(Register::CanStat)?;
        Ok(OperatingMode::try_from(stat & MODE_MASK).ok())
    }

    /// Only takes effect in configuration mode.
    pub fn configure_bit_timing(&mut self, profile: BitrateProfile) -> Result<(), Error<SPI::Error>> {
        let [cnf1, cnf2, cnf3] = profile.registers();

        self.write_register(Register::Cnf1, cnf1)?;
        self.write_register(Register::Cnf2, cnf2)?;
        self.write_register(Register::Cnf3, cnf3)
    }

    /// Accept every frame into both buffers regardless of masks and filters.
    pub fn enable_receive_any(&mut self) -> Result<(), Error<SPI::Error>> {
        self.write_register(Register::Rxb0Ctrl, RXBCTRL_RXM_ANY | RXB0CTRL_BUKT)?;
        self.write_register(Register::Rxb1Ctrl, RXBCTRL_RXM_ANY)
    }

    /// Drives the INT pin when either receive buffer fills. Register reads
    /// still happen from the polling path.
    pub fn enable_receive_interrupts(&mut self) -> Result<(), Error<SPI::Error>> {
        self.write_register(Register::CanIntE, CANINTE_RX0IE | CANINTE_RX1IE)
    }
}

impl<SPI: SpiDevice> CanController for Mcp2515<SPI> {
    type Error = Error<SPI::Error>;

    fn poll_receive_flags(&mut self) -> Result<RxFlags, Self::Error> {
        let intf = self.read_register(Register::CanIntF)?;

        Ok(RxFlags {
            rx0: intf & CANINTF_RX0IF != 0,
            rx1: intf & CANINTF_RX1IF != 0,
        })
    }

    fn read_frame(&mut self, buffer: RxBuffer) -> Result<RawFrame, Self::Error> {
        let mut regs = [0u8; RX_BUFFER_LEN];
        self.read_registers(buffer.sidh_register(), &mut regs)?;

        Ok(frame_from_registers(&regs))
    }

    fn clear_receive_flag(&mut self, buffer: RxBuffer) -> Result<(), Self::Error> {
        self.modify_register(Register::CanIntF, buffer.interrupt_flag(), 0)
    }

    fn error_flags(&mut self) -> Result<ErrorFlags, Self::Error> {
        let eflg = self.read_register(Register::Eflg)?;

        Ok(ErrorFlags {
            rx0_overflow: eflg & EFLG_RX0OVR != 0,
            rx1_overflow: eflg & EFLG_RX1OVR != 0,
        })
    }

    fn clear_overflow(&mut self, flags: ErrorFlags) -> Result<(), Self::Error> {
        let mut mask = 0;
        if flags.rx0_overflow {
            mask |= EFLG_RX0OVR;
        }
        if flags.rx1_overflow {
            mask |= EFLG_RX1OVR;
        }

        if mask == 0 {
            return Ok(());
        }

        self.modify_register(Register::Eflg, mask, 0)
    }
}
