use std::sync::Arc;

use genlock_if::platform::PhyType;
use tock_registers::{LocalRegisterCopy, register_bitfields};

use super::{PhyOps, RegisterSlot};
use crate::{
    err::{Result, check_frequency},
    msgbus::{LaneMask, MsgBus},
    regmap::Regmap,
    registry::{PllGuard, PllRegistry},
};

const REF_CLK_KHZ: u64 = 38400;

const PLL_REG_COUNT: usize = 20;
const PHY_C10_VDR_PLL: u16 = 0xC00;
const PHY_C10_VDR_CONTROL1: u16 = 0xC70;
const PHY_C10_VDR_CUSTOM_WIDTH: u16 = 0xD02;

// Byte indices into the PLL register file.
const PLL_MULT_LOW: usize = 2;
const PLL_MULT_HIGH: usize = 3;
const PLL_DEN_LOW: usize = 9;
const PLL_DEN_HIGH: usize = 10;
const PLL_QUOT_LOW: usize = 11;
const PLL_QUOT_HIGH: usize = 12;
const PLL_REM_LOW: usize = 13;
const PLL_REM_HIGH: usize = 14;
const PLL_TX_CLK: usize = 15;

register_bitfields![u8,
    C10_PLL0 [
        FRACEN OFFSET(4) NUMBITS(1) []
    ],
    C10_PLL3 [
        MULTIPLIER_HIGH OFFSET(0) NUMBITS(4) []
    ],
    C10_PLL15 [
        HDMIDIV OFFSET(3) NUMBITS(3) [],
        TXCLKDIV OFFSET(0) NUMBITS(3) []
    ],
    C10_VDR_CONTROL [
        MSGBUS_ACCESS OFFSET(2) NUMBITS(1) [],
        MASTER_LANE OFFSET(1) NUMBITS(1) [],
        UPDATE_CFG OFFSET(0) NUMBITS(1) []
    ],
    C10_VDR_CUSTOM_WIDTH [
        WIDTH OFFSET(0) NUMBITS(2) []
    ]
];

const MSGBUS_ACCESS: u8 = C10_VDR_CONTROL::MSGBUS_ACCESS::SET.value;
const MASTER_LANE: u8 = C10_VDR_CONTROL::MASTER_LANE::SET.value;
const UPDATE_CFG: u8 = C10_VDR_CONTROL::UPDATE_CFG::SET.value;
const CUSTOM_WIDTH_MASK: u8 = C10_VDR_CUSTOM_WIDTH::WIDTH.mask << C10_VDR_CUSTOM_WIDTH::WIDTH.shift;

/// Decoded divider fields of a C10 PLL register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct C10Dividers {
    multiplier: u64,
    quot: u64,
    rem: u64,
    den: u64,
    tx_clk_div: u32,
}

fn div_round_closest(n: u64, d: u64) -> u64 {
    (n + d / 2) / d
}

impl C10Dividers {
    fn decode(pll: &[u8; PLL_REG_COUNT]) -> Self {
        let word = |low: usize, high: usize| (pll[high] as u64) << 8 | pll[low] as u64;
        let mult_high = LocalRegisterCopy::<u8, C10_PLL3::Register>::new(pll[PLL_MULT_HIGH])
            .read(C10_PLL3::MULTIPLIER_HIGH) as u64;
        let tx_clk = LocalRegisterCopy::<u8, C10_PLL15::Register>::new(pll[PLL_TX_CLK]);
        Self {
            multiplier: ((mult_high << 8) | pll[PLL_MULT_LOW] as u64) / 2 + 16,
            quot: word(PLL_QUOT_LOW, PLL_QUOT_HIGH),
            rem: word(PLL_REM_LOW, PLL_REM_HIGH),
            den: word(PLL_DEN_LOW, PLL_DEN_HIGH),
            tx_clk_div: tx_clk.read(C10_PLL15::TXCLKDIV) as u32,
        }
    }

    fn divisor(&self) -> u64 {
        10 << (self.tx_clk_div + 16)
    }

    /// Contribution of the fractional remainder, in reference-clock units.
    fn rem_term(&self) -> u64 {
        if self.den == 0 {
            0
        } else {
            div_round_closest(REF_CLK_KHZ * self.rem, self.den)
        }
    }

    fn freq_khz(&self) -> f64 {
        let numerator = REF_CLK_KHZ * ((self.multiplier << 16) + self.quot) + self.rem_term();
        div_round_closest(numerator, self.divisor()) as f64
    }
}

/// Snapshot PHY on the non-Type-C ports of Xe LPD+ platforms, reached over
/// the message bus. Only the fraction quotient is retuned.
#[derive(Debug)]
pub struct C10Phy {
    bus: MsgBus,
    pll: [RegisterSlot<u8>; PLL_REG_COUNT],
    captured: bool,
    _guard: PllGuard,
}

impl C10Phy {
    pub fn new(regmap: Regmap, registry: &Arc<PllRegistry>, port: u32) -> Result<Self> {
        Self::with_bus(MsgBus::new(regmap, port), registry)
    }

    pub fn with_bus(bus: MsgBus, registry: &Arc<PllRegistry>) -> Result<Self> {
        let guard = registry.claim(PhyType::C10, bus.port() as u8)?;
        Ok(Self {
            pll: core::array::from_fn(|i| RegisterSlot::at((PHY_C10_VDR_PLL + i as u16) as u32)),
            bus,
            captured: false,
            _guard: guard,
        })
    }

    fn snapshot(&self, use_modified: bool) -> [u8; PLL_REG_COUNT] {
        core::array::from_fn(|i| self.pll[i].value(use_modified))
    }
}

impl PhyOps for C10Phy {
    fn kind(&self) -> PhyType {
        PhyType::C10
    }

    fn is_captured(&self) -> bool {
        self.captured
    }

    fn read_registers(&mut self) -> Result {
        self.captured = false;
        for (i, slot) in self.pll.iter_mut().enumerate() {
            let val = self.bus.try_read(0, slot.addr as u16)?;
            slot.capture(val);
            debug!("C10 port {}: pll_state[{i}] = {val:#x}", self.bus.port());
        }
        self.captured = true;
        Ok(())
    }

    fn calculate_pll_clock(&self) -> f64 {
        C10Dividers::decode(&self.snapshot(false)).freq_khz()
    }

    fn calculate_modified_pll_clock(&self) -> f64 {
        C10Dividers::decode(&self.snapshot(true)).freq_khz()
    }

    fn calculate_feedback_dividers(&mut self, target: f64) -> Result {
        check_frequency(target, "C10 target")?;

        // The remainder keeps its captured value; only the quotient follows
        // the target.
        let div = C10Dividers::decode(&self.snapshot(true));
        let quot = ((target * div.divisor() as f64) as u64)
            .saturating_sub(div.rem_term())
            / REF_CLK_KHZ;
        let quot = quot.saturating_sub(div.multiplier << 16).min(u16::MAX as u64) as u16;

        self.pll[PLL_QUOT_LOW].modified = quot as u8;
        self.pll[PLL_QUOT_HIGH].modified = (quot >> 8) as u8;

        debug!(
            "C10 port {}: quotient {:#x} -> {quot:#x}, remainder {:#x}, denominator {:#x}, multiplier {:#x}",
            self.bus.port(),
            div.quot,
            div.rem,
            div.den,
            div.multiplier
        );
        Ok(())
    }

    fn program_mmio(&mut self, use_modified: bool) -> Result {
        let bus = &self.bus;
        bus.rmw(LaneMask::BOTH, PHY_C10_VDR_CONTROL1, 0, MSGBUS_ACCESS, true)?;
        bus.rmw(LaneMask::BOTH, PHY_C10_VDR_CUSTOM_WIDTH, CUSTOM_WIDTH_MASK, 0, true)?;
        bus.rmw(LaneMask::BOTH, PHY_C10_VDR_CONTROL1, 0, UPDATE_CFG, true)?;

        for slot in &self.pll[PLL_QUOT_LOW..=PLL_QUOT_HIGH] {
            bus.try_write(0, slot.addr as u16, slot.value(use_modified), true)?;
        }

        bus.rmw(
            LaneMask::LANE0,
            PHY_C10_VDR_CONTROL1,
            0,
            MASTER_LANE | UPDATE_CFG,
            true,
        )
    }

    fn print_registers(&self) {
        for (i, slot) in self.pll.iter().enumerate() {
            debug!(
                "C10 port {}: pll[{i}] @{:#x}: orig {:#x} mod {:#x}",
                self.bus.port(),
                slot.addr,
                slot.orig,
                slot.modified
            );
        }
        let div = C10Dividers::decode(&self.snapshot(true));
        let pll0 = LocalRegisterCopy::<u8, C10_PLL0::Register>::new(self.pll[0].modified);
        let pll15 = LocalRegisterCopy::<u8, C10_PLL15::Register>::new(self.pll[PLL_TX_CLK].modified);
        debug!(
            "C10 port {}: fracen {} multiplier {} quot {:#x} rem {:#x} den {:#x} txclkdiv {} hdmidiv {}",
            self.bus.port(),
            pll0.read(C10_PLL0::FRACEN),
            div.multiplier,
            div.quot,
            div.rem,
            div.den,
            div.tx_clk_div,
            pll15.read(C10_PLL15::HDMIDIV)
        );
    }
}
