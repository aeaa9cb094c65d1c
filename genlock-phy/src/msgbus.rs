//! Message-bus access to Cx0 (C10/C20) PHY internal registers.
//!
//! Each port/lane pair owns a host-to-PHY control register and a PHY-to-host
//! status register. A transaction writes the control register with the
//! pending bit set, waits for the PHY to drop it, and for acknowledged
//! commands waits for a response in the status register. Every timeout or
//! protocol error resets the bus before the attempt is reported as failed.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use tock_registers::{LocalRegisterCopy, register_bitfields};

use crate::{
    config::BusConfig,
    err::{PllError, Result},
    regmap::Regmap,
};

const M2P_MSGBUS_CTL_LN0_A: u32 = 0x64040;
const M2P_MSGBUS_CTL_LN0_B: u32 = 0x64140;
const M2P_MSGBUS_CTL_LN0_USBC1: u32 = 0x16F240;
const M2P_MSGBUS_CTL_LN0_USBC2: u32 = 0x16F440;
const PORT_TC1: u32 = 3;

// C20 SRAM is reached through these message-bus registers.
pub const C20_WR_ADDRESS_L: u16 = 0xC02;
pub const C20_WR_ADDRESS_H: u16 = 0xC03;
pub const C20_WR_DATA_L: u16 = 0xC04;
pub const C20_WR_DATA_H: u16 = 0xC05;
pub const C20_RD_ADDRESS_L: u16 = 0xC06;
pub const C20_RD_ADDRESS_H: u16 = 0xC07;
pub const C20_RD_DATA_L: u16 = 0xC08;
pub const C20_RD_DATA_H: u16 = 0xC09;

register_bitfields![u32,
    pub M2P_MSGBUS_CTL [
        TRANSACTION_PENDING OFFSET(31) NUMBITS(1) [],
        COMMAND OFFSET(27) NUMBITS(4) [
            WriteUncommitted = 1,
            WriteCommitted = 2,
            Read = 3
        ],
        DATA OFFSET(16) NUMBITS(8) [],
        TRANSACTION_RESET OFFSET(15) NUMBITS(1) [],
        ADDRESS OFFSET(0) NUMBITS(12) []
    ],
    pub P2M_MSGBUS_STATUS [
        RESPONSE_READY OFFSET(31) NUMBITS(1) [],
        COMMAND OFFSET(27) NUMBITS(4) [],
        DATA OFFSET(16) NUMBITS(8) [],
        ERROR_SET OFFSET(15) NUMBITS(1) []
    ]
];

type CtlVal = LocalRegisterCopy<u32, M2P_MSGBUS_CTL::Register>;
type StatusVal = LocalRegisterCopy<u32, P2M_MSGBUS_STATUS::Register>;

/// Response types reported in the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum P2mCommand {
    ReadAck = 4,
    WriteAck = 5,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LaneMask: u8 {
        const LANE0 = 1 << 0;
        const LANE1 = 1 << 1;
        const BOTH = Self::LANE0.bits() | Self::LANE1.bits();
    }
}

impl LaneMask {
    /// Lanes selected by the mask, in ascending order.
    pub fn lanes(self) -> impl Iterator<Item = u8> {
        (0..2u8).filter(move |lane| self.bits() & (1 << lane) != 0)
    }

    /// The single lane a read is issued on: the highest selected one.
    pub fn read_lane(self) -> u8 {
        match self.bits() {
            0 => 0,
            bits => bits.ilog2() as u8,
        }
    }
}

/// Host-to-PHY control register of `port`/`lane`.
pub const fn ctl_reg(port: u32, lane: u8) -> u32 {
    let base = if port < PORT_TC1 {
        M2P_MSGBUS_CTL_LN0_A + port * (M2P_MSGBUS_CTL_LN0_B - M2P_MSGBUS_CTL_LN0_A)
    } else {
        M2P_MSGBUS_CTL_LN0_USBC1 + (port - PORT_TC1) * (M2P_MSGBUS_CTL_LN0_USBC2 - M2P_MSGBUS_CTL_LN0_USBC1)
    };
    base + lane as u32 * 4
}

/// PHY-to-host status register of `port`/`lane`.
pub const fn status_reg(port: u32, lane: u8) -> u32 {
    ctl_reg(port, lane) + 8
}

const PENDING: u32 = M2P_MSGBUS_CTL::TRANSACTION_PENDING::SET.value;
const RESET: u32 = M2P_MSGBUS_CTL::TRANSACTION_RESET::SET.value;
const RESPONSE_READY: u32 = P2M_MSGBUS_STATUS::RESPONSE_READY::SET.value;
const ERROR_SET: u32 = P2M_MSGBUS_STATUS::ERROR_SET::SET.value;

/// Message bus of one PHY port.
#[derive(Debug, Clone)]
pub struct MsgBus {
    regmap: Regmap,
    port: u32,
    config: BusConfig,
}

impl MsgBus {
    pub fn new(regmap: Regmap, port: u32) -> Self {
        Self::with_config(regmap, port, BusConfig::default())
    }

    pub fn with_config(regmap: Regmap, port: u32, config: BusConfig) -> Self {
        Self {
            regmap,
            port,
            config,
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    fn timeout(&self, lane: u8) -> PllError {
        PllError::BusTimeout {
            port: self.port,
            lane,
            reg: ctl_reg(self.port, lane),
        }
    }

    fn clear_response_ready(&self, lane: u8) {
        self.regmap
            .update_bits(status_reg(self.port, lane), 0, RESPONSE_READY | ERROR_SET);
    }

    /// Best effort; a failed reset is logged and left to the caller's retry.
    fn bus_reset(&self, lane: u8) {
        let ctl = ctl_reg(self.port, lane);
        self.regmap.write(ctl, RESET);

        if self
            .regmap
            .wait_for_clear(ctl, RESET, self.config.timeout)
            .is_err()
        {
            error!("Port {} failed to bring lane {lane} to idle", self.port);
            return;
        }

        self.clear_response_ready(lane);
    }

    fn wait_for_ack(&self, lane: u8, expected: P2mCommand) -> Result<StatusVal> {
        let status_reg = status_reg(self.port, lane);
        let status = match self.regmap.wait_for_register(
            status_reg,
            RESPONSE_READY,
            RESPONSE_READY,
            self.config.timeout,
        ) {
            Ok(val) => StatusVal::new(val),
            Err(val) => {
                error!(
                    "Port {} timeout waiting for message ACK. Status: {val:#x}",
                    self.port
                );
                self.bus_reset(lane);
                return Err(self.timeout(lane));
            }
        };

        let protocol_error = PllError::BusProtocolError {
            port: self.port,
            lane,
            status: status.get(),
        };

        if status.is_set(P2M_MSGBUS_STATUS::ERROR_SET) {
            error!(
                "Port {} error during {expected:?} transaction. Status: {:#x}",
                self.port,
                status.get()
            );
            self.bus_reset(lane);
            return Err(protocol_error);
        }

        match P2mCommand::try_from(status.read(P2M_MSGBUS_STATUS::COMMAND)) {
            Ok(cmd) if cmd == expected => Ok(status),
            _ => {
                error!(
                    "Port {} not a {expected:?} response. Status: {:#x}",
                    self.port,
                    status.get()
                );
                self.bus_reset(lane);
                Err(protocol_error)
            }
        }
    }

    fn wait_idle(&self, lane: u8, what: &str) -> Result {
        let ctl = ctl_reg(self.port, lane);
        if self
            .regmap
            .wait_for_clear(ctl, PENDING, self.config.timeout)
            .is_err()
        {
            error!(
                "Port {} timeout waiting for {what} to complete. Resetting the bus.",
                self.port
            );
            self.bus_reset(lane);
            return Err(self.timeout(lane));
        }
        Ok(())
    }

    fn read_once(&self, lane: u8, addr: u16) -> Result<u8> {
        self.wait_idle(lane, "previous transaction")?;

        let mut ctl = CtlVal::new(0);
        ctl.modify(
            M2P_MSGBUS_CTL::TRANSACTION_PENDING::SET
                + M2P_MSGBUS_CTL::COMMAND::Read
                + M2P_MSGBUS_CTL::ADDRESS.val(addr as u32),
        );
        self.regmap.write(ctl_reg(self.port, lane), ctl.get());

        let status = self.wait_for_ack(lane, P2mCommand::ReadAck)?;
        self.clear_response_ready(lane);

        Ok(status.read(P2M_MSGBUS_STATUS::DATA) as u8)
    }

    fn write_once(&self, lane: u8, addr: u16, data: u8, committed: bool) -> Result {
        self.wait_idle(lane, "previous transaction")?;

        let command = if committed {
            M2P_MSGBUS_CTL::COMMAND::WriteCommitted
        } else {
            M2P_MSGBUS_CTL::COMMAND::WriteUncommitted
        };
        let mut ctl = CtlVal::new(0);
        ctl.modify(
            M2P_MSGBUS_CTL::TRANSACTION_PENDING::SET
                + command
                + M2P_MSGBUS_CTL::DATA.val(data as u32)
                + M2P_MSGBUS_CTL::ADDRESS.val(addr as u32),
        );
        self.regmap.write(ctl_reg(self.port, lane), ctl.get());

        self.wait_idle(lane, "write")?;

        if committed {
            self.wait_for_ack(lane, P2mCommand::WriteAck)?;
        } else {
            let status = self.regmap.read(status_reg(self.port, lane));
            if status & ERROR_SET != 0 {
                error!("Port {} error during write command. Status: {status:#x}", self.port);
                self.bus_reset(lane);
                return Err(PllError::BusProtocolError {
                    port: self.port,
                    lane,
                    status,
                });
            }
        }

        self.clear_response_ready(lane);
        Ok(())
    }

    /// Reads one PHY register byte, retrying on bus errors.
    pub fn try_read(&self, lane: u8, addr: u16) -> Result<u8> {
        let mut last = self.timeout(lane);
        for attempt in 1..=self.config.retries {
            match self.read_once(lane, addr) {
                Ok(val) => {
                    trace!("Port {} lane {lane} read {addr:#06x} = {val:#04x}", self.port);
                    return Ok(val);
                }
                Err(e) => {
                    debug!("Port {} read {addr:#06x} attempt {attempt} failed: {e}", self.port);
                    last = e;
                }
            }
        }

        error!(
            "Port {} read {addr:#06x} failed after {} retries",
            self.port, self.config.retries
        );
        Err(last)
    }

    /// Writes one PHY register byte, retrying on bus errors.
    pub fn try_write(&self, lane: u8, addr: u16, data: u8, committed: bool) -> Result {
        let mut last = self.timeout(lane);
        for attempt in 1..=self.config.retries {
            match self.write_once(lane, addr, data, committed) {
                Ok(()) => {
                    trace!("Port {} lane {lane} write {addr:#06x} <- {data:#04x}", self.port);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Port {} write {addr:#06x} attempt {attempt} failed: {e}", self.port);
                    last = e;
                }
            }
        }

        error!(
            "Port {} write {addr:#06x} failed after {} retries",
            self.port, self.config.retries
        );
        Err(last)
    }

    /// Reads from the highest lane in `lanes`.
    ///
    /// A read that exhausts its retries yields 0, which cannot be told apart
    /// from a register holding 0. Use [`MsgBus::try_read`] to distinguish.
    pub fn read(&self, lanes: LaneMask, addr: u16) -> u8 {
        self.try_read(lanes.read_lane(), addr).unwrap_or(0)
    }

    pub fn write(&self, lanes: LaneMask, addr: u16, data: u8, committed: bool) -> Result {
        for lane in lanes.lanes() {
            self.try_write(lane, addr, data, committed)?;
        }
        Ok(())
    }

    /// Read-modify-write on every lane in `lanes`; unchanged values are not written.
    pub fn rmw(&self, lanes: LaneMask, addr: u16, clear: u8, set: u8, committed: bool) -> Result {
        for lane in lanes.lanes() {
            let old = self.try_read(lane, addr)?;
            let val = (old & !clear) | set;
            if val != old {
                self.try_write(lane, addr, val, committed)?;
            }
        }
        Ok(())
    }

    /// Reads a 16-bit word from C20 SRAM.
    pub fn sram_read(&self, lanes: LaneMask, addr: u16) -> Result<u16> {
        self.write(lanes, C20_RD_ADDRESS_H, (addr >> 8) as u8, false)?;
        self.write(lanes, C20_RD_ADDRESS_L, addr as u8, true)?;

        let lane = lanes.read_lane();
        let high = self.try_read(lane, C20_RD_DATA_H)? as u16;
        let low = self.try_read(lane, C20_RD_DATA_L)? as u16;
        Ok(high << 8 | low)
    }

    /// Writes a 16-bit word to C20 SRAM. Only the final data byte is committed.
    pub fn sram_write(&self, lanes: LaneMask, addr: u16, data: u16) -> Result {
        self.write(lanes, C20_WR_ADDRESS_H, (addr >> 8) as u8, false)?;
        self.write(lanes, C20_WR_ADDRESS_L, addr as u8, false)?;
        self.write(lanes, C20_WR_DATA_H, (data >> 8) as u8, false)?;
        self.write(lanes, C20_WR_DATA_L, data as u8, true)
    }
}
