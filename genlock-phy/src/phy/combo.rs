use std::sync::Arc;

use genlock_if::platform::{DpllRegs, PhyType};
use tock_registers::{LocalRegisterCopy, register_bitfields};

use super::{PhyOps, RegisterSlot, clamp_field};
use crate::{
    err::{Result, check_frequency},
    regmap::Regmap,
    registry::{PllGuard, PllRegistry},
};

const REF_CLK_KHZ: f64 = 19200.0;

register_bitfields![u32,
    DPLL_CFGCR0 [
        DCO_FRACTION OFFSET(10) NUMBITS(15) [],
        DCO_INTEGER OFFSET(0) NUMBITS(10) []
    ],
    DPLL_CFGCR1 [
        QDIV_RATIO OFFSET(10) NUMBITS(8) [],
        QDIV_MODE OFFSET(9) NUMBITS(1) [],
        KDIV OFFSET(6) NUMBITS(3) [],
        PDIV OFFSET(2) NUMBITS(4) []
    ]
];

type Cfgcr0 = LocalRegisterCopy<u32, DPLL_CFGCR0::Register>;
type Cfgcr1 = LocalRegisterCopy<u32, DPLL_CFGCR1::Register>;

const DCO_INTEGER_MAX: u32 = (1 << 10) - 1;
const DCO_FRACTION_MAX: u32 = (1 << 15) - 1;

/// Combo PHY DPLL. Only the DCO dividers in CFGCR0 are adjusted.
#[derive(Debug)]
pub struct ComboPhy {
    regmap: Regmap,
    index: u8,
    cfgcr0: RegisterSlot,
    cfgcr1: RegisterSlot,
    captured: bool,
    _guard: PllGuard,
}

impl ComboPhy {
    pub fn new(
        regmap: Regmap,
        registry: &Arc<PllRegistry>,
        index: u8,
        regs: DpllRegs,
    ) -> Result<Self> {
        let guard = registry.claim(PhyType::Combo, index)?;
        Ok(Self {
            regmap,
            index,
            cfgcr0: RegisterSlot::at(regs.cfgcr0),
            cfgcr1: RegisterSlot::at(regs.cfgcr1),
            captured: false,
            _guard: guard,
        })
    }

    fn dco_khz(cfgcr0: u32) -> f64 {
        let reg = Cfgcr0::new(cfgcr0);
        let integer = reg.read(DPLL_CFGCR0::DCO_INTEGER) as f64;
        let fraction = reg.read(DPLL_CFGCR0::DCO_FRACTION) as f64;
        integer * REF_CLK_KHZ + fraction * 2.0 * REF_CLK_KHZ / 32768.0
    }
}

impl PhyOps for ComboPhy {
    fn kind(&self) -> PhyType {
        PhyType::Combo
    }

    fn is_captured(&self) -> bool {
        self.captured
    }

    fn read_registers(&mut self) -> Result {
        self.cfgcr0.capture(self.regmap.read(self.cfgcr0.addr));
        self.cfgcr1.capture(self.regmap.read(self.cfgcr1.addr));
        self.captured = true;
        debug!(
            "DPLL{}: cfgcr0 {:#x} cfgcr1 {:#x}",
            self.index, self.cfgcr0.orig, self.cfgcr1.orig
        );
        Ok(())
    }

    fn calculate_pll_clock(&self) -> f64 {
        Self::dco_khz(self.cfgcr0.orig)
    }

    fn calculate_modified_pll_clock(&self) -> f64 {
        Self::dco_khz(self.cfgcr0.modified)
    }

    fn calculate_feedback_dividers(&mut self, target: f64) -> Result {
        check_frequency(target, "DCO target")?;

        let integer = clamp_field((target / REF_CLK_KHZ).floor(), DCO_INTEGER_MAX);
        let remainder = target - integer as f64 * REF_CLK_KHZ;
        let fraction = clamp_field(
            (remainder * 32768.0 / (2.0 * REF_CLK_KHZ)).round(),
            DCO_FRACTION_MAX,
        );

        let mut reg = Cfgcr0::new(self.cfgcr0.modified);
        reg.modify(DPLL_CFGCR0::DCO_INTEGER.val(integer) + DPLL_CFGCR0::DCO_FRACTION.val(fraction));
        self.cfgcr0.modified = reg.get();

        debug!(
            "DPLL{}: target {target:.3} kHz -> integer {integer:#x} fraction {fraction:#x}",
            self.index
        );
        Ok(())
    }

    fn program_mmio(&mut self, use_modified: bool) -> Result {
        // CFGCR1 carries no adjusted field but the DPLL latches on the pair.
        self.regmap
            .write(self.cfgcr0.addr, self.cfgcr0.value(use_modified));
        self.regmap
            .write(self.cfgcr1.addr, self.cfgcr1.value(use_modified));
        Ok(())
    }

    fn print_registers(&self) {
        for (name, slot) in [("cfgcr0", &self.cfgcr0), ("cfgcr1", &self.cfgcr1)] {
            debug!(
                "DPLL{} {name} @{:#x}: orig {:#x} mod {:#x}",
                self.index, slot.addr, slot.orig, slot.modified
            );
        }
        let cfgcr0 = Cfgcr0::new(self.cfgcr0.modified);
        let cfgcr1 = Cfgcr1::new(self.cfgcr1.modified);
        debug!(
            "DPLL{}: dco_integer {} dco_fraction {:#x} qdiv_ratio {} qdiv_mode {} kdiv {} pdiv {}",
            self.index,
            cfgcr0.read(DPLL_CFGCR0::DCO_INTEGER),
            cfgcr0.read(DPLL_CFGCR0::DCO_FRACTION),
            cfgcr1.read(DPLL_CFGCR1::QDIV_RATIO),
            cfgcr1.read(DPLL_CFGCR1::QDIV_MODE),
            cfgcr1.read(DPLL_CFGCR1::KDIV),
            cfgcr1.read(DPLL_CFGCR1::PDIV),
        );
    }
}
