use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use phf::phf_map;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Closed enumeration usable as a table key.
pub trait TableKey: Copy + Eq + 'static {
    const ALL: &'static [Self];

    fn index(self) -> usize;

    fn name(self) -> &'static str;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, Serialize, Deserialize,
)]
pub enum FuType {
    #[serde(rename = "counter")]
    Counter,
    #[serde(rename = "int_addsub", alias = "int_add_sub")]
    IntAddSub,
    #[serde(rename = "int_muldiv", alias = "int_mul_div")]
    IntMulDiv,
    #[serde(rename = "int_shift")]
    IntShift,
    #[serde(rename = "int_bitwise")]
    IntBitwise,
    #[serde(rename = "fp_float_addsub")]
    FpFloatAddSub,
    #[serde(rename = "fp_float_muldiv")]
    FpFloatMulDiv,
    #[serde(rename = "fp_double_addsub")]
    FpDoubleAddSub,
    #[serde(rename = "fp_double_muldiv")]
    FpDoubleMulDiv,
    #[serde(rename = "zero_cycle")]
    ZeroCycle,
    #[serde(rename = "gep")]
    Gep,
    #[serde(rename = "conversion")]
    Conversion,
    #[serde(rename = "other")]
    Other,
}

static FU_NAMES: phf::Map<&'static str, FuType> = phf_map! {
    "counter" => FuType::Counter,
    "int_addsub" => FuType::IntAddSub,
    "int_add_sub" => FuType::IntAddSub,
    "int_muldiv" => FuType::IntMulDiv,
    "int_mul_div" => FuType::IntMulDiv,
    "int_shift" => FuType::IntShift,
    "int_bitwise" => FuType::IntBitwise,
    "fp_float_addsub" => FuType::FpFloatAddSub,
    "fp_float_muldiv" => FuType::FpFloatMulDiv,
    "fp_double_addsub" => FuType::FpDoubleAddSub,
    "fp_double_muldiv" => FuType::FpDoubleMulDiv,
    "zero_cycle" => FuType::ZeroCycle,
    "gep" => FuType::Gep,
    "conversion" => FuType::Conversion,
    "other" => FuType::Other,
};

impl FuType {
    /// FU types whose bit is set in a busy mask.
    pub fn from_mask(mask: u32) -> impl Iterator<Item = FuType> {
        (0..32u32)
            .filter(move |bit| mask & (1 << bit) != 0)
            .filter_map(FuType::from_u32)
    }

    pub fn mask_bit(self) -> u32 {
        1 << self as u32
    }

    /// Cycles an operation occupies the unit when the workload does not say otherwise.
    pub fn default_latency(self) -> u32 {
        match self {
            FuType::ZeroCycle => 0,
            FuType::Counter | FuType::IntAddSub | FuType::IntBitwise | FuType::IntShift => 1,
            FuType::Gep | FuType::Conversion | FuType::Other => 1,
            FuType::IntMulDiv => 3,
            FuType::FpFloatAddSub | FuType::FpDoubleAddSub => 4,
            FuType::FpFloatMulDiv => 5,
            FuType::FpDoubleMulDiv => 6,
        }
    }
}

impl TableKey for FuType {
    const ALL: &'static [Self] = &[
        FuType::Counter,
        FuType::IntAddSub,
        FuType::IntMulDiv,
        FuType::IntShift,
        FuType::IntBitwise,
        FuType::FpFloatAddSub,
        FuType::FpFloatMulDiv,
        FuType::FpDoubleAddSub,
        FuType::FpDoubleMulDiv,
        FuType::ZeroCycle,
        FuType::Gep,
        FuType::Conversion,
        FuType::Other,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            FuType::Counter => "counter",
            FuType::IntAddSub => "int_addsub",
            FuType::IntMulDiv => "int_muldiv",
            FuType::IntShift => "int_shift",
            FuType::IntBitwise => "int_bitwise",
            FuType::FpFloatAddSub => "fp_float_addsub",
            FuType::FpFloatMulDiv => "fp_float_muldiv",
            FuType::FpDoubleAddSub => "fp_double_addsub",
            FuType::FpDoubleMulDiv => "fp_double_muldiv",
            FuType::ZeroCycle => "zero_cycle",
            FuType::Gep => "gep",
            FuType::Conversion => "conversion",
            FuType::Other => "other",
        }
    }
}

impl FromStr for FuType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FU_NAMES
            .get(value)
            .copied()
            .ok_or_else(|| format!("unknown functional unit type '{}'", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallCause {
    #[default]
    None,
    MemoryLatency,
    RawHazard,
    WawHazard,
    WarHazard,
    FuContention,
    PortContention,
    ControlFlow,
    DmaPending,
    ResourceLimit,
}

impl StallCause {
    /// Bottleneck label reported for a dominant cause.
    pub fn bottleneck_name(self) -> &'static str {
        match self {
            StallCause::MemoryLatency => "memory_latency",
            StallCause::RawHazard | StallCause::WawHazard | StallCause::WarHazard => {
                "data_dependency"
            }
            StallCause::FuContention => "compute_bound",
            StallCause::PortContention => "memory_bandwidth",
            StallCause::ControlFlow => "control_flow",
            StallCause::DmaPending => "dma",
            StallCause::ResourceLimit => "resource_limit",
            StallCause::None => "none",
        }
    }
}

impl TableKey for StallCause {
    const ALL: &'static [Self] = &[
        StallCause::None,
        StallCause::MemoryLatency,
        StallCause::RawHazard,
        StallCause::WawHazard,
        StallCause::WarHazard,
        StallCause::FuContention,
        StallCause::PortContention,
        StallCause::ControlFlow,
        StallCause::DmaPending,
        StallCause::ResourceLimit,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            StallCause::None => "none",
            StallCause::MemoryLatency => "memory_latency",
            StallCause::RawHazard => "raw_hazard",
            StallCause::WawHazard => "waw_hazard",
            StallCause::WarHazard => "war_hazard",
            StallCause::FuContention => "fu_contention",
            StallCause::PortContention => "port_contention",
            StallCause::ControlFlow => "control_flow",
            StallCause::DmaPending => "dma_pending",
            StallCause::ResourceLimit => "resource_limit",
        }
    }
}

/// Where a memory operation is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemClass {
    #[default]
    Spm,
    Cache,
    Dma,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemAccessType {
    CacheRead,
    CacheWrite,
    SpmRead,
    SpmWrite,
    DmaRead,
    DmaWrite,
    LocalRead,
    LocalWrite,
}

impl MemAccessType {
    pub fn new(class: MemClass, is_write: bool) -> Self {
        match (class, is_write) {
            (MemClass::Cache, false) => MemAccessType::CacheRead,
            (MemClass::Cache, true) => MemAccessType::CacheWrite,
            (MemClass::Spm, false) => MemAccessType::SpmRead,
            (MemClass::Spm, true) => MemAccessType::SpmWrite,
            (MemClass::Dma, false) => MemAccessType::DmaRead,
            (MemClass::Dma, true) => MemAccessType::DmaWrite,
            (MemClass::Local, false) => MemAccessType::LocalRead,
            (MemClass::Local, true) => MemAccessType::LocalWrite,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MemAccessType::CacheRead => "cache_read",
            MemAccessType::CacheWrite => "cache_write",
            MemAccessType::SpmRead => "spm_read",
            MemAccessType::SpmWrite => "spm_write",
            MemAccessType::DmaRead => "dma_read",
            MemAccessType::DmaWrite => "dma_write",
            MemAccessType::LocalRead => "local_read",
            MemAccessType::LocalWrite => "local_write",
        }
    }
}

/// Which operation classes were active during a stalled cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessClass {
    LoadOnly,
    StoreOnly,
    CompOnly,
    LoadStore,
    LoadComp,
    StoreComp,
    LoadStoreComp,
}

impl AccessClass {
    pub fn from_activity(load: bool, store: bool, comp: bool) -> Option<Self> {
        match (load, store, comp) {
            (true, false, false) => Some(AccessClass::LoadOnly),
            (false, true, false) => Some(AccessClass::StoreOnly),
            (false, false, true) => Some(AccessClass::CompOnly),
            (true, true, false) => Some(AccessClass::LoadStore),
            (true, false, true) => Some(AccessClass::LoadComp),
            (false, true, true) => Some(AccessClass::StoreComp),
            (true, true, true) => Some(AccessClass::LoadStoreComp),
            (false, false, false) => None,
        }
    }
}

impl TableKey for AccessClass {
    const ALL: &'static [Self] = &[
        AccessClass::LoadOnly,
        AccessClass::StoreOnly,
        AccessClass::CompOnly,
        AccessClass::LoadStore,
        AccessClass::LoadComp,
        AccessClass::StoreComp,
        AccessClass::LoadStoreComp,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            AccessClass::LoadOnly => "load_only",
            AccessClass::StoreOnly => "store_only",
            AccessClass::CompOnly => "comp_only",
            AccessClass::LoadStore => "load_store",
            AccessClass::LoadComp => "load_comp",
            AccessClass::StoreComp => "store_comp",
            AccessClass::LoadStoreComp => "load_store_comp",
        }
    }
}

/// Dense table with one slot per enumerator, indexed by the enum itself.
#[derive(Clone, PartialEq)]
pub struct EnumTable<K: TableKey, T> {
    slots: Vec<T>,
    _key: PhantomData<K>,
}

pub type FuTable<T> = EnumTable<FuType, T>;
pub type CauseTable<T> = EnumTable<StallCause, T>;
pub type ClassTable<T> = EnumTable<AccessClass, T>;

impl<K: TableKey, T> EnumTable<K, T> {
    pub fn from_fn(mut f: impl FnMut(K) -> T) -> Self {
        Self {
            slots: K::ALL.iter().map(|&key| f(key)).collect(),
            _key: PhantomData,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        K::ALL.iter().copied().zip(self.slots.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> + '_ {
        K::ALL.iter().copied().zip(self.slots.iter_mut())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter()
    }
}

impl<K: TableKey, T: Default> Default for EnumTable<K, T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<K: TableKey, T> Index<K> for EnumTable<K, T> {
    type Output = T;

    fn index(&self, key: K) -> &T {
        &self.slots[key.index()]
    }
}

impl<K: TableKey, T> IndexMut<K> for EnumTable<K, T> {
    fn index_mut(&mut self, key: K) -> &mut T {
        &mut self.slots[key.index()]
    }
}

impl<K: TableKey, T: fmt::Debug> fmt::Debug for EnumTable<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(key, value)| (key.name(), value)))
            .finish()
    }
}

impl<K: TableKey, T: Serialize> Serialize for EnumTable<K, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key.name(), value)?;
        }
        map.end()
    }
}

/// Missing keys take `T::default()`.
impl<'de, K, T> Deserialize<'de> for EnumTable<K, T>
where
    K: TableKey + Ord + Deserialize<'de>,
    T: Default + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut given: BTreeMap<K, T> = BTreeMap::deserialize(deserializer)?;
        Ok(Self::from_fn(|key| given.remove(&key).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_cover_every_enumerator() {
        let mut table: FuTable<u32> = FuTable::default();
        table[FuType::Other] += 3;
        assert_eq!(FuType::ALL.len(), table.values().count());
        assert_eq!(3, table[FuType::Other]);
        assert_eq!(Some((FuType::Other, &3)), table.iter().last());
    }

    #[test]
    fn fu_names_parse_both_spellings() {
        assert_eq!(Ok(FuType::IntAddSub), "int_addsub".parse::<FuType>());
        assert_eq!(Ok(FuType::IntAddSub), "int_add_sub".parse::<FuType>());
        assert!("vector".parse::<FuType>().is_err());
        for fu in FuType::ALL {
            assert_eq!(Ok(*fu), fu.name().parse::<FuType>());
        }
    }

    #[test]
    fn busy_mask_round_trips_through_bits() {
        let mask = FuType::IntMulDiv.mask_bit() | FuType::Gep.mask_bit();
        let busy: Vec<FuType> = FuType::from_mask(mask).collect();
        assert_eq!(vec![FuType::IntMulDiv, FuType::Gep], busy);
    }

    #[test]
    fn table_deserializes_partial_map() {
        let table: FuTable<u32> = serde_json::from_str(r#"{"int_addsub": 2, "gep": 1}"#)
            .expect("parse");
        assert_eq!(2, table[FuType::IntAddSub]);
        assert_eq!(1, table[FuType::Gep]);
        assert_eq!(0, table[FuType::Counter]);
    }

    #[test]
    fn access_class_from_activity() {
        assert_eq!(None, AccessClass::from_activity(false, false, false));
        assert_eq!(
            Some(AccessClass::LoadStoreComp),
            AccessClass::from_activity(true, true, true)
        );
    }

    #[test]
    fn serialized_table_uses_names() {
        let mut table: CauseTable<u64> = CauseTable::default();
        table[StallCause::RawHazard] = 4;
        let json = serde_json::to_value(&table).expect("serialize");
        assert_eq!(4, json["raw_hazard"]);
        assert_eq!(0, json["none"]);
    }
}
