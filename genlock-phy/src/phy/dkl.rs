use std::sync::Arc;

use genlock_if::platform::PhyType;
use tock_registers::{LocalRegisterCopy, register_bitfields};

use super::{PhyOps, RegisterSlot, clamp_field};
use crate::{
    err::{PllError, Result, check_frequency},
    regmap::Regmap,
    registry::{PllGuard, PllRegistry},
};

const REF_CLK_MHZ: f64 = 38.4;
const FRAC_SCALE: f64 = (1u32 << 22) as f64;

const DKL_PHY_BASE: u32 = 0x168000;
const DKL_PHY_STRIDE: u32 = 0x1000;

const DKL_PLL_DIV0: u32 = 0x200;
const DKL_PLL_SSC: u32 = 0x210;
const DKL_PLL_BIAS: u32 = 0x214;
const DKL_VISA_SERIALIZER: u32 = 0x220;
const DKL_DCO: u32 = 0x224;

register_bitfields![u32,
    PLL_DIV0 [
        FBPREDIV OFFSET(8) NUMBITS(4) [],
        FBDIV_INT OFFSET(0) NUMBITS(8) []
    ],
    PLL_SSC [
        SSC_STEP_LEN OFFSET(29) NUMBITS(3) [],
        SSC_EN OFFSET(13) NUMBITS(1) []
    ],
    PLL_BIAS [
        FBDIV_FRAC OFFSET(8) NUMBITS(22) []
    ],
    VISA_SERIALIZER [
        DIV OFFSET(9) NUMBITS(1) [],
        MODE OFFSET(0) NUMBITS(3) []
    ],
    DCO [
        DCO_EN OFFSET(2) NUMBITS(1) []
    ]
];

const FBDIV_INT_MAX: u32 = 0xFF;
const FBDIV_FRAC_MAX: u32 = 0x3F_FFFF;

/// Dekel Type-C PHY PLL, addressed directly through MMIO.
#[derive(Debug)]
pub struct DklPhy {
    regmap: Regmap,
    index: u8,
    div0: RegisterSlot,
    ssc: RegisterSlot,
    bias: RegisterSlot,
    serializer: RegisterSlot,
    dco: RegisterSlot,
    captured: bool,
    _guard: PllGuard,
}

impl DklPhy {
    pub fn new(regmap: Regmap, registry: &Arc<PllRegistry>, index: u8) -> Result<Self> {
        let guard = registry.claim(PhyType::Dkl, index)?;
        let base = Self::base(index);
        Ok(Self {
            regmap,
            index,
            div0: RegisterSlot::at(base + DKL_PLL_DIV0),
            ssc: RegisterSlot::at(base + DKL_PLL_SSC),
            bias: RegisterSlot::at(base + DKL_PLL_BIAS),
            serializer: RegisterSlot::at(base + DKL_VISA_SERIALIZER),
            dco: RegisterSlot::at(base + DKL_DCO),
            captured: false,
            _guard: guard,
        })
    }

    pub const fn base(index: u8) -> u32 {
        DKL_PHY_BASE + DKL_PHY_STRIDE * index as u32
    }

    /// DIV0 address of PHY `index`, used to detect enabled PHYs.
    pub const fn div0_reg(index: u8) -> u32 {
        Self::base(index) + DKL_PLL_DIV0
    }

    fn slots(&self) -> [(&'static str, &RegisterSlot); 5] {
        [
            ("div0", &self.div0),
            ("ssc", &self.ssc),
            ("bias", &self.bias),
            ("serializer", &self.serializer),
            ("dco", &self.dco),
        ]
    }

    fn freq_mhz(div0: u32, bias: u32) -> f64 {
        let div0 = LocalRegisterCopy::<u32, PLL_DIV0::Register>::new(div0);
        let bias = LocalRegisterCopy::<u32, PLL_BIAS::Register>::new(bias);
        let prediv = div0.read(PLL_DIV0::FBPREDIV) as f64;
        let integer = div0.read(PLL_DIV0::FBDIV_INT) as f64;
        let fraction = bias.read(PLL_BIAS::FBDIV_FRAC) as f64;
        REF_CLK_MHZ * prediv * (integer + fraction / FRAC_SCALE)
    }
}

impl PhyOps for DklPhy {
    fn kind(&self) -> PhyType {
        PhyType::Dkl
    }

    fn is_captured(&self) -> bool {
        self.captured
    }

    fn read_registers(&mut self) -> Result {
        self.captured = false;
        let regmap = self.regmap.clone();
        for slot in [
            &mut self.div0,
            &mut self.ssc,
            &mut self.bias,
            &mut self.serializer,
            &mut self.dco,
        ] {
            let val = regmap.read(slot.addr);
            if val == u32::MAX {
                error!("DKL PHY {}: register {:#x} reads all ones", self.index, slot.addr);
                return Err(PllError::HardwareReadAnomaly { addr: slot.addr });
            }
            slot.capture(val);
        }
        self.captured = true;
        Ok(())
    }

    fn calculate_pll_clock(&self) -> f64 {
        Self::freq_mhz(self.div0.orig, self.bias.orig)
    }

    fn calculate_modified_pll_clock(&self) -> f64 {
        Self::freq_mhz(self.div0.modified, self.bias.modified)
    }

    fn calculate_feedback_dividers(&mut self, target: f64) -> Result {
        check_frequency(target, "DKL target")?;

        let mut div0 = LocalRegisterCopy::<u32, PLL_DIV0::Register>::new(self.div0.modified);
        let prediv = div0.read(PLL_DIV0::FBPREDIV);
        if prediv == 0 {
            error!("DKL PHY {}: feedback pre-divider is zero", self.index);
            return Err(PllError::InvalidArgument("DKL pre-divider is zero"));
        }

        let ratio = target / (REF_CLK_MHZ * prediv as f64);
        let integer = clamp_field(ratio.floor(), FBDIV_INT_MAX);
        let fraction = clamp_field(
            ((ratio - integer as f64) * FRAC_SCALE).round(),
            FBDIV_FRAC_MAX,
        );

        div0.modify(PLL_DIV0::FBDIV_INT.val(integer));
        self.div0.modified = div0.get();

        let mut bias = LocalRegisterCopy::<u32, PLL_BIAS::Register>::new(self.bias.modified);
        bias.modify(PLL_BIAS::FBDIV_FRAC.val(fraction));
        self.bias.modified = bias.get();

        // The PLL only relocks cleanly with these auxiliary fields in place.
        let mut serializer =
            LocalRegisterCopy::<u32, VISA_SERIALIZER::Register>::new(self.serializer.modified);
        serializer.modify(VISA_SERIALIZER::MODE.val(0) + VISA_SERIALIZER::DIV::SET);
        self.serializer.modified = serializer.get();

        let mut ssc = LocalRegisterCopy::<u32, PLL_SSC::Register>::new(self.ssc.modified);
        ssc.modify(PLL_SSC::SSC_STEP_LEN.val(2) + PLL_SSC::SSC_EN::SET);
        self.ssc.modified = ssc.get();

        let mut dco = LocalRegisterCopy::<u32, DCO::Register>::new(self.dco.modified);
        dco.modify(DCO::DCO_EN::SET);
        self.dco.modified = dco.get();

        debug!(
            "DKL PHY {}: target {target:.4} MHz -> integer {integer:#x} fraction {fraction:#x}",
            self.index
        );
        Ok(())
    }

    fn program_mmio(&mut self, use_modified: bool) -> Result {
        for slot in [
            &self.div0,
            &self.serializer,
            &self.bias,
            &self.ssc,
            &self.dco,
        ] {
            self.regmap.write(slot.addr, slot.value(use_modified));
        }
        Ok(())
    }

    fn print_registers(&self) {
        for (name, slot) in self.slots() {
            debug!(
                "DKL PHY {} {name} @{:#x}: orig {:#x} mod {:#x}",
                self.index, slot.addr, slot.orig, slot.modified
            );
        }
        let div0 = LocalRegisterCopy::<u32, PLL_DIV0::Register>::new(self.div0.modified);
        let bias = LocalRegisterCopy::<u32, PLL_BIAS::Register>::new(self.bias.modified);
        debug!(
            "DKL PHY {}: prediv {} integer {} fraction {:#x}",
            self.index,
            div0.read(PLL_DIV0::FBPREDIV),
            div0.read(PLL_DIV0::FBDIV_INT),
            bias.read(PLL_BIAS::FBDIV_FRAC)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{phy::rel_err, test_utils::RegisterFile};

    const INDEX: u8 = 1;

    fn setup() -> (Arc<RegisterFile>, DklPhy) {
        let file = Arc::new(RegisterFile::new());
        let base = DklPhy::base(INDEX);
        file.poke(base + DKL_PLL_DIV0, 0x5028_4274);
        file.poke(base + DKL_VISA_SERIALIZER, 0x5432_1000);
        file.poke(base + DKL_PLL_BIAS, 0xC100_0000);
        file.poke(base + DKL_PLL_SSC, 0x4000_20FF);
        file.poke(base + DKL_DCO, 0xE400_4080);
        let phy = DklPhy::new(Regmap::from_arc(file.clone()), &PllRegistry::new(), INDEX).unwrap();
        (file, phy)
    }

    #[test]
    fn decodes_frequency() {
        let (_, mut phy) = setup();
        phy.read_registers().unwrap();
        // prediv 2, integer 116, fraction 0x10000
        assert!((phy.calculate_pll_clock() - 8910.0).abs() < 1e-9);
    }

    #[test]
    fn dividers_round_trip_and_force_aux_fields() {
        let (_, mut phy) = setup();
        phy.read_registers().unwrap();
        let freq = phy.calculate_pll_clock();
        phy.calculate_feedback_dividers(freq * 0.999).unwrap();
        assert!(rel_err(phy.calculate_modified_pll_clock(), freq * 0.999) < 0.001);

        assert_eq!(phy.serializer.modified & 0x7, 0);
        assert_ne!(phy.serializer.modified & 0x200, 0);
        assert_eq!(phy.ssc.modified >> 29, 2);
        assert_ne!(phy.ssc.modified & 0x2000, 0);
        assert_ne!(phy.dco.modified & 0x4, 0);
        // Fields outside the divider are preserved.
        assert_eq!(phy.div0.modified & !0xFF, 0x5028_4200);
    }

    #[test]
    fn fraction_saturates() {
        let (_, mut phy) = setup();
        phy.read_registers().unwrap();
        // Far beyond 255 * 76.8 MHz: integer and fraction both clamp.
        phy.calculate_feedback_dividers(1.0e6).unwrap();
        assert_eq!(phy.div0.modified & 0xFF, FBDIV_INT_MAX);
        assert_eq!((phy.bias.modified >> 8) & FBDIV_FRAC_MAX, FBDIV_FRAC_MAX);
        // Neighbouring bias bits survive the clamp.
        assert_eq!(phy.bias.modified & 0xC000_0000, 0xC000_0000);
    }

    #[test]
    fn program_order_and_restore() {
        let (file, mut phy) = setup();
        phy.read_registers().unwrap();
        phy.calculate_feedback_dividers(8900.0).unwrap();
        phy.program_mmio(true).unwrap();

        let base = DklPhy::base(INDEX);
        let order: Vec<u32> = file.writes().iter().map(|(reg, _)| reg - base).collect();
        assert_eq!(
            order,
            vec![DKL_PLL_DIV0, DKL_VISA_SERIALIZER, DKL_PLL_BIAS, DKL_PLL_SSC, DKL_DCO]
        );

        phy.program_mmio(false).unwrap();
        let once: Vec<u32> = phy.slots().iter().map(|(_, s)| file.peek(s.addr)).collect();
        phy.program_mmio(false).unwrap();
        let twice: Vec<u32> = phy.slots().iter().map(|(_, s)| file.peek(s.addr)).collect();
        assert_eq!(once, twice);
        assert_eq!(once, vec![0x5028_4274, 0x4000_20FF, 0xC100_0000, 0x5432_1000, 0xE400_4080]);
    }

    #[test]
    fn all_ones_is_an_anomaly() {
        let (file, mut phy) = setup();
        file.poke(DklPhy::base(INDEX) + DKL_PLL_BIAS, u32::MAX);
        assert_eq!(
            phy.read_registers(),
            Err(PllError::HardwareReadAnomaly {
                addr: DklPhy::base(INDEX) + DKL_PLL_BIAS
            })
        );
        assert!(!phy.is_captured());
    }
}
