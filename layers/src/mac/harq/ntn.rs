//! NTN HARQ history
//!
//! With HARQ feedback disabled, processes are flushed right after their
//! feedback slot so they can be reused, while the feedback of a satellite link
//! still arrives `ntn_cs_koffset` slots later. The history keeps a snapshot of
//! each flushed transmission until that late feedback window has passed.

use super::{NTN_HISTORY_GRACE_SLOTS, NTN_HISTORY_MAX_ENTRIES};
use common::{DuUeIndex, HarqId, Rnti, SlotPoint};
use std::collections::VecDeque;
use tracing::debug;

/// Transmission of a flushed HARQ-disabled process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtnHarqSnapshot {
    pub ue_index: DuUeIndex,
    pub h_id: HarqId,
    pub rnti: Rnti,
    pub slot_tx: SlotPoint,
    pub slot_ack: SlotPoint,
    pub tbs_bytes: u32,
}

#[derive(Debug)]
pub(crate) struct NtnHarqHistory {
    entries: VecDeque<NtnHarqSnapshot>,
    cs_koffset: u32,
}

impl NtnHarqHistory {
    pub(crate) fn new(cs_koffset: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            cs_koffset,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Slot at which the delayed feedback of a snapshot is due
    fn feedback_slot(&self, snapshot: &NtnHarqSnapshot) -> SlotPoint {
        snapshot.slot_ack + self.cs_koffset as i32
    }

    pub(crate) fn save(&mut self, snapshot: NtnHarqSnapshot) {
        if self.entries.len() >= NTN_HISTORY_MAX_ENTRIES {
            if let Some(old) = self.entries.pop_front() {
                debug!(
                    "NTN HARQ history full, dropping ue={} h_id={} slot_ack={}",
                    old.ue_index, old.h_id, old.slot_ack
                );
            }
        }
        self.entries.push_back(snapshot);
    }

    /// Drop snapshots whose feedback window closed before `now`
    pub(crate) fn purge(&mut self, now: SlotPoint) {
        let retention = NTN_HISTORY_GRACE_SLOTS as i32;
        while let Some(front) = self.entries.front() {
            if now - self.feedback_slot(front) > retention {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn remove_ue(&mut self, ue_index: DuUeIndex) {
        self.entries.retain(|e| e.ue_index != ue_index);
    }

    /// Most recent snapshot of a UE with the given feedback slot
    pub(crate) fn find(&self, ue_index: DuUeIndex, slot_ack: SlotPoint) -> Option<&NtnHarqSnapshot> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.ue_index == ue_index && e.slot_ack == slot_ack)
    }

    /// Bytes of a UE whose delayed feedback is still due at or after `now`
    pub(crate) fn bytes_waiting_feedback(&self, ue_index: DuUeIndex, now: SlotPoint) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.ue_index == ue_index && self.feedback_slot(e) >= now)
            .map(|e| e.tbs_bytes)
            .sum()
    }
}
