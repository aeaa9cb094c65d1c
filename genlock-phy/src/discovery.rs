//! Locating the PLL behind an output and probing which PHYs are powered.

use genlock_if::platform::{DdiSelector, PhyType, Platform};

use crate::{phy::DklPhy, regmap::Regmap};

const ICL_PHY_MISC_A: u32 = 0x64C00;
const ICL_PHY_MISC_DE_IO_COMP_PWR_DOWN: u32 = 1 << 23;
const ICL_PORT_COMP: u32 = 0x100;
const COMP_INIT: u32 = 1 << 31;

const COMBO_PHY_BASES: [u32; 5] = [0x162000, 0x6C000, 0x160000, 0x161000, 0x16B000];
const DKL_PHY_COUNT: u8 = 6;

/// Index of the PLL driving `selector`.
///
/// Combo outputs are routed through a DPLL mux; `None` means the output
/// clock is gated. Other families map to a fixed PHY or port index.
pub fn resolve_pll_index(selector: &DdiSelector, regmap: &Regmap) -> Option<u8> {
    match selector.phy {
        PhyType::Combo => {
            let val = regmap.read(selector.dpclk_reg);
            if val & (1 << selector.clock_bit) != 0 {
                debug!(
                    "{}: clock off in {:#x} = {val:#x}",
                    selector.name, selector.dpclk_reg
                );
                return None;
            }
            Some(((val >> selector.mux_select_low_bit) & 0x3) as u8)
        }
        _ => u8::try_from(selector.dpll_num).ok(),
    }
}

/// DKL PHYs whose PLL divider reads as programmed.
pub fn enabled_dkl_phys(regmap: &Regmap) -> Vec<u8> {
    let enabled: Vec<u8> = (0..DKL_PHY_COUNT)
        .filter(|&phy| {
            let div0 = regmap.read(DklPhy::div0_reg(phy));
            div0 != 0 && div0 != u32::MAX
        })
        .collect();
    debug!("DKL PHYs on: {enabled:?}");
    enabled
}

/// Combo PHYs that are powered up and have completed compensation.
pub fn enabled_combo_phys(regmap: &Regmap) -> Vec<u8> {
    let enabled: Vec<u8> = COMBO_PHY_BASES
        .iter()
        .enumerate()
        .filter(|&(phy, base)| {
            let misc = regmap.read(ICL_PHY_MISC_A + 4 * phy as u32);
            let dw0 = regmap.read(base + ICL_PORT_COMP);
            trace!("Combo PHY {phy}: misc {misc:#x} comp_dw0 {dw0:#x}");
            misc & ICL_PHY_MISC_DE_IO_COMP_PWR_DOWN == 0 && dw0 & COMP_INIT != 0
        })
        .map(|(phy, _)| phy as u8)
        .collect();
    debug!("Combo PHYs on: {enabled:?}");
    enabled
}

/// Outputs of `platform` that currently have a PLL to adjust.
pub fn active_outputs(platform: Platform, regmap: &Regmap) -> Vec<&'static DdiSelector> {
    let dkl = enabled_dkl_phys(regmap);
    platform
        .ddi_selectors()
        .iter()
        .filter(|ds| match ds.phy {
            PhyType::Combo => resolve_pll_index(ds, regmap).is_some(),
            PhyType::Dkl => resolve_pll_index(ds, regmap).is_some_and(|i| dkl.contains(&i)),
            PhyType::C10 | PhyType::C20 | PhyType::DpMn => true,
        })
        .collect()
}
