//! Common Types for 5G GNodeB
//!
//! Defines fundamental identifiers shared by the MAC scheduler components

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// First C-RNTI value that may be assigned to a UE
    pub const MIN_CRNTI: Self = Self(0x0001);
    /// Last C-RNTI value that may be assigned to a UE
    pub const MAX_CRNTI: Self = Self(0xFFEF);

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether the value lies in the C-RNTI range
    pub fn is_crnti(&self) -> bool {
        self.0 >= Self::MIN_CRNTI.0 && self.0 <= Self::MAX_CRNTI.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Index of a UE inside the DU, dense from zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DuUeIndex(pub u16);

impl DuUeIndex {
    /// Get the index as a usize for table addressing
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DuUeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HARQ process identifier, scoped to one UE and one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HarqId(pub u8);

impl HarqId {
    /// Get the id as a usize for table addressing
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HarqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RAN slice identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RanSliceId(pub u8);

/// Logical Channel ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// SRB0 (CCCH)
    pub const SRB0: Self = Self(0);
    /// SRB1
    pub const SRB1: Self = Self(1);
    /// First DRB LCID
    pub const MIN_DRB: Self = Self(4);
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology index (mu) as per TS 38.211
    pub fn numerology(&self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }
}

/// MCS table used for a PDSCH/PUSCH grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McsTable {
    /// 64QAM table (TS 38.214 Table 5.1.3.1-1)
    #[default]
    Qam64,
    /// 256QAM table (TS 38.214 Table 5.1.3.1-2)
    Qam256,
    /// Low spectral efficiency 64QAM table (TS 38.214 Table 5.1.3.1-3)
    Qam64LowSe,
}
