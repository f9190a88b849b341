use std::fs;
use std::path::Path;

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stats::types::{FuTable, FuType};

/// Bits per architectural register when converting register counts to storage.
pub const REGISTER_WIDTH_BITS: f64 = 32.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FuCoefficients {
    pub area_um2: f64,
    pub leakage_mw: f64,
    pub dynamic_read_mw: f64,
    pub dynamic_write_mw: f64,
}

impl FuCoefficients {
    pub const fn new(area_um2: f64, leakage_mw: f64, dynamic_read_mw: f64, dynamic_write_mw: f64) -> Self {
        Self {
            area_um2,
            leakage_mw,
            dynamic_read_mw,
            dynamic_write_mw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterCoefficients {
    pub area_per_bit_um2: f64,
    pub leakage_per_bit_mw: f64,
    pub dynamic_read_mw: f64,
    pub dynamic_write_mw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryCoefficients {
    pub leakage_per_kb_mw: f64,
    pub read_dynamic_per_access_mw: f64,
    pub write_dynamic_per_access_mw: f64,
    pub area_per_kb_um2: f64,
}

/// Technology parameters used to turn activity counts into power and area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerAreaCoefficients {
    pub technology_node: String,
    pub voltage: f64,
    pub temperature_c: f64,
    pub register: RegisterCoefficients,
    pub spm: MemoryCoefficients,
    pub cache: MemoryCoefficients,
    pub functional_units: FuTable<FuCoefficients>,
}

fn default_fu_coefficients(fu: FuType) -> FuCoefficients {
    match fu {
        FuType::IntAddSub => FuCoefficients::new(179.443, 2.380803e-03, 8.115300e-03, 6.162853e-03),
        FuType::IntMulDiv => FuCoefficients::new(4595.0, 4.817683e-02, 5.725752e-01, 8.662890e-01),
        FuType::IntBitwise => FuCoefficients::new(50.36996, 6.111633e-04, 1.680942e-03, 1.322420e-03),
        FuType::IntShift => FuCoefficients::new(100.0, 1.0e-03, 2.0e-03, 1.5e-03),
        FuType::FpFloatAddSub => FuCoefficients::new(1500.0, 1.5e-02, 5.0e-02, 4.0e-02),
        FuType::FpFloatMulDiv => FuCoefficients::new(3000.0, 3.0e-02, 1.0e-01, 8.0e-02),
        FuType::FpDoubleAddSub => FuCoefficients::new(3000.0, 3.0e-02, 1.0e-01, 8.0e-02),
        FuType::FpDoubleMulDiv => FuCoefficients::new(6000.0, 6.0e-02, 2.0e-01, 1.5e-01),
        FuType::Gep => FuCoefficients::new(200.0, 2.0e-03, 5.0e-03, 4.0e-03),
        FuType::Conversion => FuCoefficients::new(150.0, 1.5e-03, 4.0e-03, 3.0e-03),
        FuType::Counter | FuType::ZeroCycle | FuType::Other => FuCoefficients::default(),
    }
}

/// 45nm, 1.0V, 25C
impl Default for PowerAreaCoefficients {
    fn default() -> Self {
        Self {
            technology_node: "45nm".to_string(),
            voltage: 1.0,
            temperature_c: 25.0,
            register: RegisterCoefficients {
                area_per_bit_um2: 5.981433,
                leakage_per_bit_mw: 7.395312e-05,
                dynamic_read_mw: 1.322600e-03,
                dynamic_write_mw: 1.792126e-04,
            },
            spm: MemoryCoefficients {
                leakage_per_kb_mw: 0.5,
                read_dynamic_per_access_mw: 0.1,
                write_dynamic_per_access_mw: 0.15,
                area_per_kb_um2: 10000.0,
            },
            cache: MemoryCoefficients {
                leakage_per_kb_mw: 0.8,
                read_dynamic_per_access_mw: 0.2,
                write_dynamic_per_access_mw: 0.25,
                area_per_kb_um2: 15000.0,
            },
            functional_units: FuTable::from_fn(default_fu_coefficients),
        }
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("toml")
}

impl PowerAreaCoefficients {
    /// Reads a coefficient file (JSON, or TOML by extension).  Keys the file omits keep
    /// their default values.
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read coefficients from {}", path.display()))?;
        let overlay: Value = if is_toml(path) {
            toml::from_str(&text).with_context(|| format!("malformed TOML in {}", path.display()))?
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("malformed JSON in {}", path.display()))?
        };

        let mut merged = serde_json::to_value(Self::default())?;
        merge(&mut merged, overlay);
        let coeffs = serde_json::from_value(merged)
            .with_context(|| format!("bad coefficient values in {}", path.display()))?;
        Ok(coeffs)
    }

    /// Like `load`, but any failure yields the built-in defaults.  The flag reports whether
    /// the file was used.
    pub fn load_or_default(path: &Path) -> (Self, bool) {
        match Self::load(path) {
            Ok(coeffs) => {
                info!("loaded power/area coefficients from {}", path.display());
                (coeffs, true)
            }
            Err(err) => {
                warn!("{:#}; using {} defaults", err, Self::default().technology_node);
                (Self::default(), false)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        let text = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        fs::write(path, text)
            .with_context(|| format!("cannot write coefficients to {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerStats {
    pub fu_leakage: f64,
    pub fu_dynamic: f64,
    pub fu_total: f64,
    pub reg_leakage: f64,
    pub reg_dynamic: f64,
    pub reg_total: f64,
    pub spm_leakage: f64,
    pub spm_read_dynamic: f64,
    pub spm_write_dynamic: f64,
    pub spm_total: f64,
    pub cache_leakage: f64,
    pub cache_read_dynamic: f64,
    pub cache_write_dynamic: f64,
    pub cache_total: f64,
    pub total_power: f64,
    pub total_energy_nj: f64,
    pub fu_energy_nj: f64,
    pub mem_energy_nj: f64,
    pub reg_energy_nj: f64,
}

/// Leakage and dynamic components of every block, in mW.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerBlocks {
    pub fu_leakage: f64,
    pub fu_dynamic: f64,
    pub reg_leakage: f64,
    pub reg_dynamic: f64,
    pub spm_leakage: f64,
    pub spm_read_dynamic: f64,
    pub spm_write_dynamic: f64,
    pub cache_leakage: f64,
    pub cache_read_dynamic: f64,
    pub cache_write_dynamic: f64,
}

/// mW * ns = pJ
fn energy_nj(power_mw: f64, runtime_ns: f64) -> f64 {
    power_mw * runtime_ns / 1e3
}

impl PowerStats {
    /// Derives block totals, the grand total and energy from per-block components.
    pub fn from_blocks(blocks: &PowerBlocks, runtime_ns: f64) -> Self {
        let fu_total = blocks.fu_leakage + blocks.fu_dynamic;
        let reg_total = blocks.reg_leakage + blocks.reg_dynamic;
        let spm_total = blocks.spm_leakage + blocks.spm_read_dynamic + blocks.spm_write_dynamic;
        let cache_total =
            blocks.cache_leakage + blocks.cache_read_dynamic + blocks.cache_write_dynamic;
        let total_power = fu_total + reg_total + spm_total + cache_total;

        Self {
            fu_leakage: blocks.fu_leakage,
            fu_dynamic: blocks.fu_dynamic,
            fu_total,
            reg_leakage: blocks.reg_leakage,
            reg_dynamic: blocks.reg_dynamic,
            reg_total,
            spm_leakage: blocks.spm_leakage,
            spm_read_dynamic: blocks.spm_read_dynamic,
            spm_write_dynamic: blocks.spm_write_dynamic,
            spm_total,
            cache_leakage: blocks.cache_leakage,
            cache_read_dynamic: blocks.cache_read_dynamic,
            cache_write_dynamic: blocks.cache_write_dynamic,
            cache_total,
            total_power,
            total_energy_nj: energy_nj(total_power, runtime_ns),
            fu_energy_nj: energy_nj(fu_total, runtime_ns),
            mem_energy_nj: energy_nj(spm_total + cache_total, runtime_ns),
            reg_energy_nj: energy_nj(reg_total, runtime_ns),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AreaStats {
    pub fu_area_um2: f64,
    pub reg_area_um2: f64,
    pub spm_area_um2: f64,
    pub cache_area_um2: f64,
    pub total_area_um2: f64,
    pub fu_area_by_type: FuTable<f64>,
}

impl AreaStats {
    pub fn from_blocks(fu: f64, reg: f64, spm: f64, cache: f64) -> Self {
        Self {
            fu_area_um2: fu,
            reg_area_um2: reg,
            spm_area_um2: spm,
            cache_area_um2: cache,
            total_area_um2: fu + reg + spm + cache,
            fu_area_by_type: FuTable::default(),
        }
    }

    pub fn total_area_mm2(&self) -> f64 {
        self.total_area_um2 / 1e6
    }
}

/// Counts that power and area are derived from.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    pub static_count: FuTable<u32>,
    pub operations: FuTable<u64>,
    pub registers: u64,
    pub register_reads: u64,
    pub register_writes: u64,
    pub spm_size_kb: f64,
    pub cache_size_kb: f64,
    pub spm_reads: u64,
    pub spm_writes: u64,
    pub cache_reads: u64,
    pub cache_writes: u64,
    pub runtime_ns: f64,
}

pub fn power_from_activity(coeffs: &PowerAreaCoefficients, activity: &Activity) -> PowerStats {
    let mut blocks = PowerBlocks::default();
    for (fu, c) in coeffs.functional_units.iter() {
        blocks.fu_leakage += activity.static_count[fu] as f64 * c.leakage_mw;
        blocks.fu_dynamic +=
            activity.operations[fu] as f64 * (c.dynamic_read_mw + c.dynamic_write_mw);
    }

    let reg = &coeffs.register;
    blocks.reg_leakage = activity.registers as f64 * REGISTER_WIDTH_BITS * reg.leakage_per_bit_mw;
    blocks.reg_dynamic = activity.register_reads as f64 * reg.dynamic_read_mw
        + activity.register_writes as f64 * reg.dynamic_write_mw;

    blocks.spm_leakage = activity.spm_size_kb * coeffs.spm.leakage_per_kb_mw;
    blocks.spm_read_dynamic = activity.spm_reads as f64 * coeffs.spm.read_dynamic_per_access_mw;
    blocks.spm_write_dynamic = activity.spm_writes as f64 * coeffs.spm.write_dynamic_per_access_mw;

    blocks.cache_leakage = activity.cache_size_kb * coeffs.cache.leakage_per_kb_mw;
    blocks.cache_read_dynamic =
        activity.cache_reads as f64 * coeffs.cache.read_dynamic_per_access_mw;
    blocks.cache_write_dynamic =
        activity.cache_writes as f64 * coeffs.cache.write_dynamic_per_access_mw;

    PowerStats::from_blocks(&blocks, activity.runtime_ns)
}

pub fn area_from_activity(coeffs: &PowerAreaCoefficients, activity: &Activity) -> AreaStats {
    let by_type = FuTable::from_fn(|fu| {
        activity.static_count[fu] as f64 * coeffs.functional_units[fu].area_um2
    });
    let fu: f64 = by_type.values().sum();
    let reg = activity.registers as f64 * REGISTER_WIDTH_BITS * coeffs.register.area_per_bit_um2;
    let spm = activity.spm_size_kb * coeffs.spm.area_per_kb_um2;
    let cache = activity.cache_size_kb * coeffs.cache.area_per_kb_um2;

    AreaStats {
        fu_area_by_type: by_type,
        ..AreaStats::from_blocks(fu, reg, spm, cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn adder_only() -> PowerAreaCoefficients {
        let mut coeffs = PowerAreaCoefficients::default();
        coeffs.functional_units[FuType::IntAddSub] = FuCoefficients::new(179.443, 0.00238, 0.0081, 0.0062);
        coeffs
    }

    #[test]
    fn single_adder_power() {
        let mut activity = Activity::default();
        activity.static_count[FuType::IntAddSub] = 1;
        activity.operations[FuType::IntAddSub] = 4;
        let power = power_from_activity(&adder_only(), &activity);
        assert!(close(0.00238, power.fu_leakage));
        assert!(close(0.0572, power.fu_dynamic));
        assert!(close(0.05958, power.fu_total));
        assert!(close(power.fu_total, power.total_power));

        let area = area_from_activity(&adder_only(), &activity);
        assert!(close(179.443, area.fu_area_um2));
        assert!(close(179.443, area.fu_area_by_type[FuType::IntAddSub]));
    }

    #[test]
    fn totals_are_block_sums() {
        let coeffs = PowerAreaCoefficients::default();
        let mut activity = Activity {
            registers: 48,
            register_reads: 900,
            register_writes: 400,
            spm_size_kb: 64.0,
            cache_size_kb: 16.0,
            spm_reads: 120,
            spm_writes: 80,
            cache_reads: 30,
            cache_writes: 10,
            runtime_ns: 5000.0,
            ..Activity::default()
        };
        activity.static_count[FuType::FpDoubleMulDiv] = 2;
        activity.operations[FuType::FpDoubleMulDiv] = 37;
        activity.static_count[FuType::Gep] = 3;
        activity.operations[FuType::Gep] = 11;

        let power = power_from_activity(&coeffs, &activity);
        assert!(close(power.fu_leakage + power.fu_dynamic, power.fu_total));
        assert!(close(
            power.fu_total + power.reg_total + power.spm_total + power.cache_total,
            power.total_power
        ));
        assert!(close(16.0 * 0.8 + 30.0 * 0.2 + 10.0 * 0.25, power.cache_total));
        assert!(close(power.total_power * 5.0, power.total_energy_nj));
        assert_eq!(power, power_from_activity(&coeffs, &activity));

        let area = area_from_activity(&coeffs, &activity);
        assert!(close(
            area.fu_area_um2 + area.reg_area_um2 + area.spm_area_um2 + area.cache_area_um2,
            area.total_area_um2
        ));
        assert!(close(area.total_area_um2 / 1e6, area.total_area_mm2()));
    }

    #[test]
    fn manual_blocks_derive_totals() {
        let blocks = PowerBlocks {
            fu_leakage: 1.0,
            fu_dynamic: 2.0,
            spm_read_dynamic: 0.5,
            cache_leakage: 0.25,
            ..PowerBlocks::default()
        };
        let power = PowerStats::from_blocks(&blocks, 0.0);
        assert_eq!(3.0, power.fu_total);
        assert_eq!(3.75, power.total_power);
        assert_eq!(0.0, power.total_energy_nj);
    }

    #[test]
    fn save_then_load_json_and_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coeffs = adder_only();
        for name in ["coeffs.json", "coeffs.toml"] {
            let path = dir.path().join(name);
            coeffs.save(&path).expect("save");
            let loaded = PowerAreaCoefficients::load(&path).expect("load");
            assert_eq!(coeffs, loaded, "{}", name);
        }
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.json");
        fs::write(
            &path,
            r#"{"technology_node": "22nm", "functional_units": {"gep": {"area_um2": 90.0}}}"#,
        )
        .expect("write");
        let loaded = PowerAreaCoefficients::load(&path).expect("load");
        let defaults = PowerAreaCoefficients::default();
        assert_eq!("22nm", loaded.technology_node);
        assert_eq!(90.0, loaded.functional_units[FuType::Gep].area_um2);
        assert_eq!(
            defaults.functional_units[FuType::Gep].leakage_mw,
            loaded.functional_units[FuType::Gep].leakage_mw
        );
        assert_eq!(defaults.cache, loaded.cache);
    }

    #[test]
    fn malformed_or_missing_file_falls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").expect("write");
        let (coeffs, used) = PowerAreaCoefficients::load_or_default(&path);
        assert!(!used);
        assert_eq!(PowerAreaCoefficients::default(), coeffs);

        let (_, used) = PowerAreaCoefficients::load_or_default(&dir.path().join("missing.json"));
        assert!(!used);
    }
}
