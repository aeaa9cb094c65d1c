use std::sync::Arc;

use genlock_if::platform::PhyType;
use tock_registers::{LocalRegisterCopy, register_bitfields};

use super::{PhyOps, RegisterSlot, clamp_field};
use crate::{
    err::{Result, check_frequency},
    msgbus::{LaneMask, MsgBus},
    regmap::Regmap,
    registry::{PllGuard, PllRegistry},
};

const REF_CLK_KHZ: f64 = 38400.0;
const TX_RATE_MULT: u32 = 1;

const PHY_C20_VDR_CUSTOM_SERDES_RATE: u16 = 0xD00;

const TX_CNTX_COUNT: usize = 3;
const CMN_CNTX_COUNT: usize = 4;
const MPLL_CNTX_COUNT: usize = 10;

const MPLL_CFG_MULT: usize = 0;
const MPLL_CFG_TX_CLK: usize = 1;
const MPLL_CFG_FRAC: usize = 6;
const MPLL_CFG_FRAC_DEN: usize = 7;
const MPLL_CFG_FRAC_QUOT: usize = 8;
const MPLL_CFG_FRAC_REM: usize = 9;

register_bitfields![u16,
    SERDES_RATE [
        CONTEXT_TOGGLE OFFSET(0) NUMBITS(1) []
    ],
    TX_CNTX_CFG0 [
        USE_MPLLB OFFSET(7) NUMBITS(1) [],
        TX_RATE OFFSET(0) NUMBITS(3) []
    ],
    MPLLA_CFG0 [
        FB_CLK_DIV4_EN OFFSET(13) NUMBITS(1) [],
        MULTIPLIER OFFSET(0) NUMBITS(12) []
    ],
    MPLLA_CFG1 [
        TX_CLK_DIV OFFSET(8) NUMBITS(3) []
    ],
    MPLLA_CFG6 [
        FRACEN OFFSET(14) NUMBITS(1) [],
        REF_CLK_DIV OFFSET(10) NUMBITS(3) []
    ],
    MPLLB_CFG0 [
        TX_CLK_DIV OFFSET(13) NUMBITS(3) [],
        MULTIPLIER OFFSET(0) NUMBITS(12) []
    ],
    MPLLB_CFG6 [
        FRACEN OFFSET(13) NUMBITS(1) [],
        REF_CLK_DIV OFFSET(10) NUMBITS(3) []
    ]
];

/// Which of the two MPLL blocks drives the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpllBlock {
    A,
    B,
}

impl MpllBlock {
    fn cntx_cfg(self, context_b: bool, idx: usize) -> u32 {
        let top: u32 = match (self, context_b) {
            (MpllBlock::A, false) => 0xCCF0,
            (MpllBlock::A, true) => 0xCCE5,
            (MpllBlock::B, false) => 0xCB5A,
            (MpllBlock::B, true) => 0xCB4E,
        };
        top - idx as u32
    }

    /// RAWCMN digital registers holding the live fraction quotient and remainder.
    fn rawcmn_frac(self) -> (u32, u32) {
        match self {
            MpllBlock::A => (0x130, 0x131),
            MpllBlock::B => (0x13C, 0x13D),
        }
    }

    fn frac_update(self) -> u16 {
        match self {
            MpllBlock::A => 0x110,
            MpllBlock::B => 0x111,
        }
    }
}

fn tx_cntx_cfg(context_b: bool, idx: usize) -> u32 {
    (if context_b { 0xCF2A } else { 0xCF2E }) - idx as u32
}

fn cmn_cntx_cfg(context_b: bool, idx: usize) -> u32 {
    (if context_b { 0xCDA5 } else { 0xCDAA }) - idx as u32
}

/// Divider fields decoded from the active MPLL context at capture time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MpllFields {
    frac_en: bool,
    fb_clk_div4_en: u32,
    tx_rate: u32,
    tx_rate_mult: u32,
    tx_clk_div: u32,
    ref_clk_div: u32,
    multiplier: u32,
}

impl MpllFields {
    fn decode(block: MpllBlock, tx0: u16, mpll: &[u16; MPLL_CNTX_COUNT]) -> Self {
        let tx_rate = LocalRegisterCopy::<u16, TX_CNTX_CFG0::Register>::new(tx0)
            .read(TX_CNTX_CFG0::TX_RATE) as u32;
        match block {
            MpllBlock::A => {
                let cfg0 = LocalRegisterCopy::<u16, MPLLA_CFG0::Register>::new(mpll[MPLL_CFG_MULT]);
                let cfg1 =
                    LocalRegisterCopy::<u16, MPLLA_CFG1::Register>::new(mpll[MPLL_CFG_TX_CLK]);
                let cfg6 = LocalRegisterCopy::<u16, MPLLA_CFG6::Register>::new(mpll[MPLL_CFG_FRAC]);
                Self {
                    frac_en: cfg6.is_set(MPLLA_CFG6::FRACEN),
                    fb_clk_div4_en: cfg0.read(MPLLA_CFG0::FB_CLK_DIV4_EN) as u32,
                    tx_rate,
                    tx_rate_mult: TX_RATE_MULT,
                    tx_clk_div: cfg1.read(MPLLA_CFG1::TX_CLK_DIV) as u32,
                    ref_clk_div: cfg6.read(MPLLA_CFG6::REF_CLK_DIV) as u32,
                    multiplier: cfg0.read(MPLLA_CFG0::MULTIPLIER) as u32,
                }
            }
            MpllBlock::B => {
                let cfg0 = LocalRegisterCopy::<u16, MPLLB_CFG0::Register>::new(mpll[MPLL_CFG_MULT]);
                let cfg6 = LocalRegisterCopy::<u16, MPLLB_CFG6::Register>::new(mpll[MPLL_CFG_FRAC]);
                Self {
                    frac_en: cfg6.is_set(MPLLB_CFG6::FRACEN),
                    fb_clk_div4_en: 0,
                    tx_rate,
                    tx_rate_mult: TX_RATE_MULT,
                    tx_clk_div: cfg0.read(MPLLB_CFG0::TX_CLK_DIV) as u32,
                    ref_clk_div: cfg6.read(MPLLB_CFG6::REF_CLK_DIV) as u32,
                    multiplier: cfg0.read(MPLLB_CFG0::MULTIPLIER) as u32,
                }
            }
        }
    }

    fn ref_khz(&self) -> f64 {
        REF_CLK_KHZ * (1u32 << (1 + self.fb_clk_div4_en)) as f64 / (1u32 << self.ref_clk_div) as f64
    }

    /// Output clock divided down from the VCO.
    fn post_div(&self) -> f64 {
        (1u32 << self.tx_rate) as f64 * (1u32 << self.tx_clk_div) as f64
            / (1u32 << self.tx_rate_mult) as f64
    }

    fn freq_khz(&self, quot: u16, rem: u16, den: u16) -> f64 {
        let frac = if self.frac_en && den != 0 {
            quot as f64 + rem as f64 / den as f64
        } else {
            0.0
        };
        let vco = self.ref_khz() * ((self.multiplier << 15) as f64 + frac) / (1u32 << 17) as f64
            / 10.0;
        vco / self.post_div()
    }
}

/// USB-C capable PHY on Xe LPD+ platforms. The fraction lives in the MPLL
/// context SRAM reached through the message bus.
#[derive(Debug)]
pub struct C20Phy {
    bus: MsgBus,
    context_b: bool,
    block: MpllBlock,
    tx: [RegisterSlot<u16>; TX_CNTX_COUNT],
    cmn: [RegisterSlot<u16>; CMN_CNTX_COUNT],
    mpll: [RegisterSlot<u16>; MPLL_CNTX_COUNT],
    fields: MpllFields,
    captured: bool,
    _guard: PllGuard,
}

impl C20Phy {
    pub fn new(regmap: Regmap, registry: &Arc<PllRegistry>, port: u32) -> Result<Self> {
        Self::with_bus(MsgBus::new(regmap, port), registry)
    }

    pub fn with_bus(bus: MsgBus, registry: &Arc<PllRegistry>) -> Result<Self> {
        let guard = registry.claim(PhyType::C20, bus.port() as u8)?;
        Ok(Self {
            bus,
            context_b: false,
            block: MpllBlock::A,
            tx: [RegisterSlot::at(0); TX_CNTX_COUNT],
            cmn: [RegisterSlot::at(0); CMN_CNTX_COUNT],
            mpll: [RegisterSlot::at(0); MPLL_CNTX_COUNT],
            fields: MpllFields::default(),
            captured: false,
            _guard: guard,
        })
    }

    pub fn block(&self) -> MpllBlock {
        self.block
    }

    fn sram_capture(bus: &MsgBus, slot: &mut RegisterSlot<u16>, addr: u32) -> Result {
        slot.addr = addr;
        slot.capture(bus.sram_read(LaneMask::LANE0, addr as u16)?);
        Ok(())
    }

    fn frac(&self, use_modified: bool) -> (u16, u16, u16) {
        (
            self.mpll[MPLL_CFG_FRAC_QUOT].value(use_modified),
            self.mpll[MPLL_CFG_FRAC_REM].value(use_modified),
            self.mpll[MPLL_CFG_FRAC_DEN].value(use_modified),
        )
    }
}

impl PhyOps for C20Phy {
    fn kind(&self) -> PhyType {
        PhyType::C20
    }

    fn is_captured(&self) -> bool {
        self.captured
    }

    fn read_registers(&mut self) -> Result {
        self.captured = false;
        let bus = &self.bus;
        let serdes = LocalRegisterCopy::<u16, SERDES_RATE::Register>::new(
            bus.try_read(0, PHY_C20_VDR_CUSTOM_SERDES_RATE)? as u16,
        );
        self.context_b = serdes.is_set(SERDES_RATE::CONTEXT_TOGGLE);

        for (i, slot) in self.tx.iter_mut().enumerate() {
            Self::sram_capture(bus, slot, tx_cntx_cfg(self.context_b, i))?;
        }
        for (i, slot) in self.cmn.iter_mut().enumerate() {
            Self::sram_capture(bus, slot, cmn_cntx_cfg(self.context_b, i))?;
        }

        let tx0 = LocalRegisterCopy::<u16, TX_CNTX_CFG0::Register>::new(self.tx[0].orig);
        self.block = if tx0.is_set(TX_CNTX_CFG0::USE_MPLLB) {
            MpllBlock::B
        } else {
            MpllBlock::A
        };

        for (i, slot) in self.mpll.iter_mut().enumerate() {
            Self::sram_capture(bus, slot, self.block.cntx_cfg(self.context_b, i))?;
        }

        // The context copy of the fraction is only loaded at mode set; the
        // running values sit in RAWCMN.
        let (quot, rem) = self.block.rawcmn_frac();
        Self::sram_capture(bus, &mut self.mpll[MPLL_CFG_FRAC_QUOT], quot)?;
        Self::sram_capture(bus, &mut self.mpll[MPLL_CFG_FRAC_REM], rem)?;

        let mpll: [u16; MPLL_CNTX_COUNT] = core::array::from_fn(|i| self.mpll[i].orig);
        self.fields = MpllFields::decode(self.block, self.tx[0].orig, &mpll);
        self.captured = true;

        debug!(
            "C20 port {}: context {} MPLL{:?} {:?}",
            bus.port(),
            if self.context_b { 'B' } else { 'A' },
            self.block,
            self.fields
        );
        Ok(())
    }

    fn calculate_pll_clock(&self) -> f64 {
        let (quot, rem, den) = self.frac(false);
        self.fields.freq_khz(quot, rem, den)
    }

    fn calculate_modified_pll_clock(&self) -> f64 {
        let (quot, rem, den) = self.frac(true);
        self.fields.freq_khz(quot, rem, den)
    }

    fn calculate_feedback_dividers(&mut self, target: f64) -> Result {
        check_frequency(target, "C20 target")?;

        let fields = self.fields;
        if !fields.frac_en {
            warn!(
                "C20 port {}: fractional divider disabled, new quotient has no effect",
                self.bus.port()
            );
        }

        let den = self.mpll[MPLL_CFG_FRAC_DEN].orig;
        let vco = target * fields.post_div();
        let frac_scaled =
            vco * 10.0 * (1u32 << 17) as f64 / fields.ref_khz() - (fields.multiplier << 15) as f64;

        let quot = clamp_field(frac_scaled.floor(), u16::MAX as u32);
        let rem = (frac_scaled - quot as f64) * den as f64;
        if rem.round() > u16::MAX as f64 {
            debug!("C20 port {}: remainder {rem:.0} clamped to 65535", self.bus.port());
        }
        let rem = clamp_field(rem.round(), u16::MAX as u32);

        let (old_quot, old_rem, _) = self.frac(false);
        info!(
            "C20 port {}: quot {old_quot:#x} -> {quot:#x}, rem {old_rem:#x} -> {rem:#x}",
            self.bus.port()
        );

        self.mpll[MPLL_CFG_FRAC_QUOT].modified = quot as u16;
        self.mpll[MPLL_CFG_FRAC_REM].modified = rem as u16;
        Ok(())
    }

    fn program_mmio(&mut self, use_modified: bool) -> Result {
        for slot in &self.mpll[MPLL_CFG_FRAC_QUOT..=MPLL_CFG_FRAC_REM] {
            self.bus
                .sram_write(LaneMask::LANE0, slot.addr as u16, slot.value(use_modified))?;
        }
        self.bus
            .sram_write(LaneMask::LANE0, self.block.frac_update(), 0x1)
    }

    fn print_registers(&self) {
        let port = self.bus.port();
        for (i, slot) in self.tx.iter().enumerate() {
            debug!("C20 port {port}: tx[{i}] @{:#x} = {:#x}", slot.addr, slot.orig);
        }
        for (i, slot) in self.cmn.iter().enumerate() {
            debug!("C20 port {port}: cmn[{i}] @{:#x} = {:#x}", slot.addr, slot.orig);
        }
        for (i, slot) in self.mpll.iter().enumerate() {
            debug!(
                "C20 port {port}: mpll{:?}[{i}] @{:#x}: orig {:#x} mod {:#x}",
                self.block, slot.addr, slot.orig, slot.modified
            );
        }
    }
}
