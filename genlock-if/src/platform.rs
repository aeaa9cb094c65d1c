//! Static display output tables.
//!
//! These describe which PHY family drives each DDI and where the clock-select
//! bits live. They are data only; the engine decides what to do with them.

/// PHY families with PLL control support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhyType {
    Combo,
    Dkl,
    C10,
    C20,
    /// DisplayPort link M/N values used as a clock proxy.
    DpMn,
}

/// Per-output descriptor, immutable after table construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdiSelector {
    pub name: &'static str,
    pub phy: PhyType,
    pub de_clk: u32,
    /// Clock-select register used to find the DPLL driving this output.
    /// Zero when the PLL is fixed per port.
    pub dpclk_reg: u32,
    /// Clock-off bit in `dpclk_reg`.
    pub clock_bit: u32,
    /// Low bit of the 2-bit DPLL mux field in `dpclk_reg`.
    pub mux_select_low_bit: u32,
    /// PLL or PHY index for families with a fixed mapping.
    pub dpll_num: u32,
}

impl DdiSelector {
    const fn new(
        name: &'static str,
        phy: PhyType,
        de_clk: u32,
        dpclk_reg: u32,
        clock_bit: u32,
        mux_select_low_bit: u32,
        dpll_num: u32,
    ) -> Self {
        Self {
            name,
            phy,
            de_clk,
            dpclk_reg,
            clock_bit,
            mux_select_low_bit,
            dpll_num,
        }
    }

    /// Hardware port index.
    pub const fn port(&self) -> u32 {
        self.de_clk.saturating_sub(1)
    }
}

/// DPLL configuration register pair of a Combo PHY PLL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpllRegs {
    pub cfgcr0: u32,
    pub cfgcr1: u32,
}

pub const DPCLKA_CFGCR0: u32 = 0x164280;
pub const ADLS_DPCLKA_CFGCR1: u32 = 0x1642BC;

use PhyType::*;

pub static TGL_DDI_SEL: [DdiSelector; 9] = [
    DdiSelector::new("DDI_A", Combo, 1, DPCLKA_CFGCR0, 10, 0, 0),
    DdiSelector::new("DDI_B", Combo, 2, DPCLKA_CFGCR0, 11, 2, 0),
    DdiSelector::new("DDI_C", Combo, 3, DPCLKA_CFGCR0, 24, 4, 0),
    DdiSelector::new("DDI_TC1", Dkl, 4, 0, 0, 0, 0),
    DdiSelector::new("DDI_TC2", Dkl, 5, 0, 0, 0, 1),
    DdiSelector::new("DDI_TC3", Dkl, 6, 0, 0, 0, 2),
    DdiSelector::new("DDI_TC4", Dkl, 7, 0, 0, 0, 3),
    DdiSelector::new("DDI_TC5", Dkl, 8, 0, 0, 0, 4),
    DdiSelector::new("DDI_TC6", Dkl, 9, 0, 0, 0, 5),
];

pub static ADL_S_DDI_SEL: [DdiSelector; 5] = [
    DdiSelector::new("DDI_A", Combo, 1, DPCLKA_CFGCR0, 10, 0, 0),
    DdiSelector::new("DDI_C1", Combo, 4, DPCLKA_CFGCR0, 11, 2, 0),
    DdiSelector::new("DDI_C2", Combo, 5, DPCLKA_CFGCR0, 24, 4, 0),
    DdiSelector::new("DDI_C3", Combo, 6, ADLS_DPCLKA_CFGCR1, 4, 0, 0),
    DdiSelector::new("DDI_C4", Combo, 7, ADLS_DPCLKA_CFGCR1, 5, 2, 0),
];

// Type-C ports start at port index 3 on the message-bus register layout.
pub static MTL_DDI_SEL: [DdiSelector; 6] = [
    DdiSelector::new("DDI_A", C10, 1, 0, 0, 0, 0),
    DdiSelector::new("DDI_B", C10, 2, 0, 0, 0, 1),
    DdiSelector::new("DDI_TC1", C20, 4, 0, 0, 0, 3),
    DdiSelector::new("DDI_TC2", C20, 5, 0, 0, 0, 4),
    DdiSelector::new("DDI_TC3", C20, 6, 0, 0, 0, 5),
    DdiSelector::new("DDI_TC4", C20, 7, 0, 0, 0, 6),
];

/// Indexed by the DPCLKA mux value.
pub static TGL_DPLLS: [DpllRegs; 3] = [
    DpllRegs { cfgcr0: 0x164284, cfgcr1: 0x164288 },
    DpllRegs { cfgcr0: 0x16428C, cfgcr1: 0x164290 },
    DpllRegs { cfgcr0: 0x164294, cfgcr1: 0x164298 },
];

pub static ADL_S_DPLLS: [DpllRegs; 4] = [
    DpllRegs { cfgcr0: 0x164284, cfgcr1: 0x164288 },
    DpllRegs { cfgcr0: 0x16428C, cfgcr1: 0x164290 },
    DpllRegs { cfgcr0: 0x16429C, cfgcr1: 0x1642A0 },
    DpllRegs { cfgcr0: 0x1642C0, cfgcr1: 0x1642C4 },
];

const TGL_IDS: &[u16] = &[
    0x9A60, 0x9A68, 0x9A70, 0x9A40, 0x9A49, 0x9A59, 0x9A78, 0x9AC0, 0x9AC9, 0x9AD9, 0x9AF8,
];

// ADL-P and RPL-P/H share the TGL output topology.
const ADL_P_FAM_IDS: &[u16] = &[
    0x46A0, 0x46A1, 0x46A2, 0x46A3, 0x46A6, 0x46A8, 0x46AA, 0x462A, 0x4626, 0x4628, 0x46B0,
    0x46B1, 0x46B2, 0x46B3, 0x46C0, 0x46C1, 0x46C2, 0x46C3, 0xA7A0, 0xA7A8, 0xA788, 0xA78B,
];

const ADL_S_FAM_IDS: &[u16] = &[
    0x4680, 0x4682, 0x4688, 0x468A, 0x468B, 0x4690, 0x4692, 0x4693, 0xA780, 0xA782, 0xA783,
];

const MTL_FAM_IDS: &[u16] = &[
    0x7D40, 0x7D41, 0x7D60, 0x7D67, 0x7D45, 0x7D55, 0x7DD5, 0x7D51, 0x7DD1,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Tgl,
    AdlS,
    Mtl,
}

impl Platform {
    pub fn from_device_id(device_id: u16) -> Option<Self> {
        if ADL_S_FAM_IDS.contains(&device_id) {
            Some(Platform::AdlS)
        } else if TGL_IDS.contains(&device_id) || ADL_P_FAM_IDS.contains(&device_id) {
            Some(Platform::Tgl)
        } else if MTL_FAM_IDS.contains(&device_id) {
            Some(Platform::Mtl)
        } else {
            log::debug!("Unsupported device id {device_id:#06x}");
            None
        }
    }

    pub fn ddi_selectors(self) -> &'static [DdiSelector] {
        match self {
            Platform::Tgl => &TGL_DDI_SEL,
            Platform::AdlS => &ADL_S_DDI_SEL,
            Platform::Mtl => &MTL_DDI_SEL,
        }
    }

    pub fn combo_dplls(self) -> &'static [DpllRegs] {
        match self {
            Platform::Tgl => &TGL_DPLLS,
            Platform::AdlS => &ADL_S_DPLLS,
            Platform::Mtl => &[],
        }
    }

    pub fn find_ddi(self, name: &str) -> Option<&'static DdiSelector> {
        self.ddi_selectors()
            .iter()
            .find(|ds| ds.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_map_to_platforms() {
        assert_eq!(Platform::from_device_id(0x9A49), Some(Platform::Tgl));
        assert_eq!(Platform::from_device_id(0x46A6), Some(Platform::Tgl));
        assert_eq!(Platform::from_device_id(0x4680), Some(Platform::AdlS));
        // RPL-H ids also listed under ADL-S resolve to ADL-S.
        assert_eq!(Platform::from_device_id(0x4688), Some(Platform::AdlS));
        assert_eq!(Platform::from_device_id(0x7D55), Some(Platform::Mtl));
        assert_eq!(Platform::from_device_id(0x1234), None);
    }

    #[test]
    fn mtl_type_c_ports_start_at_three() {
        let tc1 = Platform::Mtl.find_ddi("ddi_tc1").unwrap();
        assert_eq!(tc1.phy, PhyType::C20);
        assert_eq!(tc1.port(), 3);
        assert_eq!(Platform::Mtl.find_ddi("DDI_A").unwrap().port(), 0);
    }

    #[test]
    fn combo_tables_cover_mux_values() {
        assert_eq!(Platform::Tgl.combo_dplls().len(), 3);
        assert_eq!(Platform::AdlS.combo_dplls().len(), 4);
        assert!(Platform::Mtl.combo_dplls().is_empty());
        for ds in Platform::AdlS.ddi_selectors() {
            assert_eq!(ds.phy, PhyType::Combo);
            assert_ne!(ds.dpclk_reg, 0);
        }
    }
}
