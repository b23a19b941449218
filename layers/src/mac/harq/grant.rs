//! Grant snapshots kept by HARQ processes
//!
//! The scheduler hands over the allocation context and the grant it built;
//! the HARQ process stores both verbatim so a retransmission can reuse them.

use common::{Lcid, McsTable, RanSliceId};

/// DCI format used for a PDSCH grant
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DciDlFormat {
    /// Fallback DCI 1_0
    #[default]
    F1_0,
    /// Non-fallback DCI 1_1
    F1_1,
}

/// DCI format used for a PUSCH grant
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DciUlFormat {
    /// Fallback DCI 0_0
    #[default]
    F0_0,
    /// Non-fallback DCI 0_1
    F0_1,
}

/// Contiguous range of virtual resource blocks `[start, stop)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VrbInterval {
    pub start: u16,
    pub stop: u16,
}

impl VrbInterval {
    pub fn new(start: u16, stop: u16) -> Self {
        Self { start, stop }
    }

    pub fn len(&self) -> u16 {
        self.stop.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bytes scheduled for one logical channel inside a PDSCH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcSchedInfo {
    pub lcid: Lcid,
    pub sched_bytes: u32,
}

/// Context in which a DL HARQ was allocated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DlHarqAllocContext {
    pub dci_format: DciDlFormat,
    /// MCS suggested by outer-loop link adaptation
    pub olla_mcs: Option<u8>,
    pub slice_id: Option<RanSliceId>,
    pub is_fallback: bool,
}

/// Context in which a UL HARQ was allocated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UlHarqAllocContext {
    pub dci_format: DciUlFormat,
    pub olla_mcs: Option<u8>,
    pub slice_id: Option<RanSliceId>,
}

/// PDSCH grant as built by the scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdschGrant {
    pub rbs: VrbInterval,
    pub mcs_table: McsTable,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub nof_layers: u8,
    pub lc_sched_info: Vec<LcSchedInfo>,
}

/// PUSCH grant as built by the scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PuschGrant {
    pub rbs: VrbInterval,
    pub mcs_table: McsTable,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub nof_layers: u8,
}

/// Last DL grant of a HARQ process
#[derive(Debug, Clone, PartialEq)]
pub struct DlHarqGrantParams {
    pub dci_format: DciDlFormat,
    pub olla_mcs: Option<u8>,
    pub slice_id: Option<RanSliceId>,
    pub is_fallback: bool,
    pub rbs: VrbInterval,
    pub mcs_table: McsTable,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub nof_layers: u8,
    pub lc_sched_info: Vec<LcSchedInfo>,
}

impl DlHarqGrantParams {
    pub fn new(ctx: &DlHarqAllocContext, grant: &PdschGrant) -> Self {
        Self {
            dci_format: ctx.dci_format,
            olla_mcs: ctx.olla_mcs,
            slice_id: ctx.slice_id,
            is_fallback: ctx.is_fallback,
            rbs: grant.rbs,
            mcs_table: grant.mcs_table,
            mcs: grant.mcs,
            tbs_bytes: grant.tbs_bytes,
            nof_layers: grant.nof_layers,
            lc_sched_info: grant.lc_sched_info.clone(),
        }
    }
}

/// Last UL grant of a HARQ process
#[derive(Debug, Clone, PartialEq)]
pub struct UlHarqGrantParams {
    pub dci_format: DciUlFormat,
    pub olla_mcs: Option<u8>,
    pub slice_id: Option<RanSliceId>,
    pub rbs: VrbInterval,
    pub mcs_table: McsTable,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub nof_layers: u8,
}

impl UlHarqGrantParams {
    pub fn new(ctx: &UlHarqAllocContext, grant: &PuschGrant) -> Self {
        Self {
            dci_format: ctx.dci_format,
            olla_mcs: ctx.olla_mcs,
            slice_id: ctx.slice_id,
            rbs: grant.rbs,
            mcs_table: grant.mcs_table,
            mcs: grant.mcs,
            tbs_bytes: grant.tbs_bytes,
            nof_layers: grant.nof_layers,
        }
    }
}
