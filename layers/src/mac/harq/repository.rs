//! Cell HARQ repository
//!
//! Owns the HARQ tables of every UE of the cell for one direction, the
//! cross-UE list of processes pending retransmission and the timeout wheel.
//!
//! A record sits in wheel bucket `slot_timeout mod wheel_size` whenever it is
//! not `Empty`, and in the pending list exactly while it is `PendingRetx`.
//! Both lists thread through links stored in the records themselves.

use super::config::HarqConfig;
use super::grant::{DlHarqAllocContext, DlHarqGrantParams, PdschGrant, PuschGrant, UlHarqAllocContext, UlHarqGrantParams};
use super::list::{HarqList, LinkStore, ListKind, ListLinks};
use super::manager::HarqTimeoutNotifier;
use super::ntn::{NtnHarqHistory, NtnHarqSnapshot};
use super::process::{Dl, HarqDirection, HarqProcess, Ul};
use super::{
    HarqAckStatus, HarqError, HarqRef, HarqState, HarqStatusUpdate, UlCrcOutcome,
    SHORT_ACK_TIMEOUT_DTX,
};
use common::{DuUeIndex, HarqId, Rnti, SlotPoint};
use tracing::{debug, info, trace, warn};

/// DL repository
pub type DlHarqRepository = CellHarqRepository<Dl>;
/// UL repository
pub type UlHarqRepository = CellHarqRepository<Ul>;

/// HARQ processes of one UE in one direction
#[derive(Debug)]
pub struct UeHarqTable<D: HarqDirection> {
    rnti: Rnti,
    harqs: Vec<HarqProcess<D::Extra>>,
    /// Free ids, popped from the back; lowest id on top
    free_harq_ids: Vec<HarqId>,
    last_tx_slot: Option<SlotPoint>,
}

impl<D: HarqDirection> UeHarqTable<D> {
    fn new(ue_index: DuUeIndex, rnti: Rnti, nof_harqs: usize) -> Self {
        let mut table = Self {
            rnti,
            harqs: Vec::with_capacity(nof_harqs),
            free_harq_ids: Vec::with_capacity(nof_harqs),
            last_tx_slot: None,
        };
        table.grow(ue_index, nof_harqs);
        table
    }

    fn grow(&mut self, ue_index: DuUeIndex, nof_harqs: usize) {
        let old = self.harqs.len();
        if nof_harqs <= old {
            return;
        }
        for id in old..nof_harqs {
            self.harqs.push(HarqProcess::new(ue_index, self.rnti, HarqId(id as u8)));
        }
        // New ids are higher than every existing one, so they go below them on the stack
        self.free_harq_ids
            .splice(0..0, (old..nof_harqs).rev().map(|id| HarqId(id as u8)));
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn nof_harqs(&self) -> usize {
        self.harqs.len()
    }

    pub fn nof_empty_harqs(&self) -> usize {
        self.free_harq_ids.len()
    }

    /// Slot of the most recent new transmission
    pub fn last_tx_slot(&self) -> Option<SlotPoint> {
        self.last_tx_slot
    }

    pub fn harq(&self, h_id: HarqId) -> Option<&HarqProcess<D::Extra>> {
        self.harqs.get(h_id.as_usize())
    }

    pub fn harqs(&self) -> impl Iterator<Item = &HarqProcess<D::Extra>> {
        self.harqs.iter()
    }
}

/// Per-UE tables addressed by UE index
#[derive(Debug)]
struct UeHarqTables<D: HarqDirection> {
    tables: Vec<Option<UeHarqTable<D>>>,
}

impl<D: HarqDirection> UeHarqTables<D> {
    fn new(max_ues: usize) -> Self {
        Self {
            tables: (0..max_ues).map(|_| None).collect(),
        }
    }

    fn get(&self, ue_index: DuUeIndex) -> Option<&UeHarqTable<D>> {
        self.tables.get(ue_index.as_usize()).and_then(|t| t.as_ref())
    }

    fn get_mut(&mut self, ue_index: DuUeIndex) -> Option<&mut UeHarqTable<D>> {
        self.tables.get_mut(ue_index.as_usize()).and_then(|t| t.as_mut())
    }

    fn record(&self, r: HarqRef) -> Option<&HarqProcess<D::Extra>> {
        self.get(r.ue_index).and_then(|t| t.harqs.get(r.h_id.as_usize()))
    }

    fn record_mut(&mut self, r: HarqRef) -> Option<&mut HarqProcess<D::Extra>> {
        self.get_mut(r.ue_index).and_then(|t| t.harqs.get_mut(r.h_id.as_usize()))
    }

    /// Record reachable from a list. Lists only ever hold live records.
    fn linked_record(&self, r: HarqRef) -> &HarqProcess<D::Extra> {
        match self.record(r) {
            Some(h) => h,
            None => panic!("{} HARQ list references a missing record {}", D::NAME, r),
        }
    }

    fn linked_record_mut(&mut self, r: HarqRef) -> &mut HarqProcess<D::Extra> {
        match self.record_mut(r) {
            Some(h) => h,
            None => panic!("{} HARQ list references a missing record {}", D::NAME, r),
        }
    }
}

impl<D: HarqDirection> LinkStore for UeHarqTables<D> {
    fn links(&self, node: HarqRef, kind: ListKind) -> &ListLinks {
        self.linked_record(node).links(kind)
    }

    fn links_mut(&mut self, node: HarqRef, kind: ListKind) -> &mut ListLinks {
        self.linked_record_mut(node).links_mut(kind)
    }
}

/// All HARQ processes of a cell in one direction
#[derive(Debug)]
pub struct CellHarqRepository<D: HarqDirection> {
    ues: UeHarqTables<D>,
    pending_retxs: HarqList,
    timeout_wheel: Vec<HarqList>,
    last_slot_ind: Option<SlotPoint>,
    max_harqs_per_ue: usize,
    ack_wait_in_slots: u32,
    harq_retx_timeout: u32,
    harq_disabled: bool,
    ntn_history: NtnHarqHistory,
    next_epoch: u64,
    next_pending_seq: u64,
}

impl<D: HarqDirection> CellHarqRepository<D> {
    /// Create a repository. The configuration is expected to be validated.
    pub fn new(cfg: &HarqConfig) -> Self {
        let wheel_size = cfg.timeout_wheel_size(D::IS_DL);
        debug!(
            "Creating {} HARQ repository: max_ues={}, wheel_size={}, harq_disabled={}",
            D::NAME,
            cfg.max_ues,
            wheel_size,
            cfg.harq_disabled(D::IS_DL)
        );
        Self {
            ues: UeHarqTables::new(cfg.max_ues as usize),
            pending_retxs: HarqList::new(ListKind::PendingRetx),
            timeout_wheel: (0..wheel_size).map(|_| HarqList::new(ListKind::Timeout)).collect(),
            last_slot_ind: None,
            max_harqs_per_ue: cfg.max_harqs_per_ue as usize,
            ack_wait_in_slots: cfg.ack_wait_in_slots(D::IS_DL).min(wheel_size as u32 - 1),
            harq_retx_timeout: cfg.harq_retx_timeout(D::IS_DL),
            harq_disabled: cfg.harq_disabled(D::IS_DL),
            ntn_history: NtnHarqHistory::new(cfg.ntn_cs_koffset),
            next_epoch: 1,
            next_pending_seq: 1,
        }
    }

    pub fn max_ues(&self) -> usize {
        self.ues.tables.len()
    }

    pub fn wheel_size(&self) -> usize {
        self.timeout_wheel.len()
    }

    pub fn last_slot(&self) -> Option<SlotPoint> {
        self.last_slot_ind
    }

    pub fn is_harq_disabled(&self) -> bool {
        self.harq_disabled
    }

    pub fn contains(&self, ue_index: DuUeIndex) -> bool {
        self.ues.get(ue_index).is_some()
    }

    pub fn ue(&self, ue_index: DuUeIndex) -> Option<&UeHarqTable<D>> {
        self.ues.get(ue_index)
    }

    pub fn harq(&self, r: HarqRef) -> Option<&HarqProcess<D::Extra>> {
        self.ues.record(r)
    }

    /// Record still holding the transmission stamped with `epoch`
    pub fn harq_in_epoch(&self, r: HarqRef, epoch: u64) -> Option<&HarqProcess<D::Extra>> {
        self.ues
            .record(r)
            .filter(|h| h.epoch == epoch && h.state != HarqState::Empty)
    }

    pub(crate) fn is_current(&self, r: HarqRef, epoch: u64) -> bool {
        self.harq_in_epoch(r, epoch).is_some()
    }

    pub fn nof_pending_retxs(&self) -> usize {
        self.pending_retxs.len()
    }

    /// Processes pending retransmission, oldest first
    pub fn pending_retxs(&self) -> impl Iterator<Item = HarqRef> + '_ {
        self.pending_retxs.iter(&self.ues)
    }

    /// Queue position the next NACKed process will get
    pub(crate) fn pending_seq_end(&self) -> u64 {
        self.next_pending_seq
    }

    /// Pending process queued after `prev`, a pair previously returned by this
    /// function, or the oldest one when `prev` is `None`. If `prev` has left the
    /// list meanwhile, the walk resumes at the first entry queued after it.
    /// Entries queued at or after `end_seq` are not returned.
    pub(crate) fn pending_retx_after(&self, prev: Option<(HarqRef, u64)>, end_seq: u64) -> Option<(HarqRef, u64)> {
        let next = match prev {
            None => self.pending_retxs.front(),
            Some((r, seq)) => match self.ues.record(r) {
                Some(h) if h.pending_link.is_linked() && h.pending_seq == seq => {
                    self.pending_retxs.next_of(&self.ues, r)
                }
                _ => self
                    .pending_retxs
                    .iter(&self.ues)
                    .find(|n| self.ues.linked_record(*n).pending_seq > seq),
            },
        }?;
        let seq = self.ues.linked_record(next).pending_seq;
        (seq < end_seq).then_some((next, seq))
    }

    /// Number of records linked in the timeout wheel
    pub fn nof_armed_timeouts(&self) -> usize {
        self.timeout_wheel.iter().map(|b| b.len()).sum()
    }

    pub(crate) fn ntn_history_len(&self) -> usize {
        self.ntn_history.len()
    }

    /// Create or grow the HARQ table of a UE
    pub fn reserve_ue_harqs(
        &mut self,
        ue_index: DuUeIndex,
        rnti: Rnti,
        nof_harqs: usize,
    ) -> Result<(), HarqError> {
        if ue_index.as_usize() >= self.max_ues() {
            return Err(HarqError::UeIndexOutOfRange {
                ue_index,
                max_ues: self.max_ues(),
            });
        }
        if nof_harqs == 0 || nof_harqs > self.max_harqs_per_ue {
            return Err(HarqError::InvalidHarqCount {
                requested: nof_harqs,
                max: self.max_harqs_per_ue,
            });
        }

        let entry = &mut self.ues.tables[ue_index.as_usize()];
        if let Some(table) = entry.as_mut() {
            table.grow(ue_index, nof_harqs);
        } else {
            *entry = Some(UeHarqTable::new(ue_index, rnti, nof_harqs));
        }
        debug!(
            "{} HARQ table of ue={} rnti={} reserved with {} processes",
            D::NAME,
            ue_index,
            rnti,
            nof_harqs
        );
        Ok(())
    }

    /// Empty every process of a UE and drop its table
    pub fn destroy_ue(&mut self, ue_index: DuUeIndex) {
        let Some(table) = self.ues.get(ue_index) else {
            return;
        };
        let busy: Vec<HarqRef> = table
            .harqs
            .iter()
            .filter(|h| h.state != HarqState::Empty)
            .map(|h| HarqRef::new(ue_index, h.h_id))
            .collect();
        for r in busy {
            self.dealloc_harq(r);
        }
        self.ues.tables[ue_index.as_usize()] = None;
        self.ntn_history.remove_ue(ue_index);
        debug!("{} HARQ table of ue={} destroyed", D::NAME, ue_index);
    }

    /// Take a free process of a UE for a new transmission
    pub fn alloc_harq(
        &mut self,
        ue_index: DuUeIndex,
        slot_tx: SlotPoint,
        slot_ack: SlotPoint,
        max_nof_harq_retxs: u8,
    ) -> Option<HarqRef> {
        let epoch = self.next_epoch;
        let harq_disabled = self.harq_disabled;
        let table = self.ues.get_mut(ue_index)?;
        let Some(h_id) = table.free_harq_ids.pop() else {
            debug!("{} HARQ alloc for ue={} failed: no free processes", D::NAME, ue_index);
            return None;
        };
        table.last_tx_slot = Some(slot_tx);

        let h = &mut table.harqs[h_id.as_usize()];
        debug_assert_eq!(h.state, HarqState::Empty);
        h.state = HarqState::WaitingAck;
        h.slot_tx = slot_tx;
        h.slot_ack = slot_ack;
        h.ndi = !h.ndi;
        h.nof_retxs = 0;
        h.max_nof_harq_retxs = max_nof_harq_retxs;
        h.ack_on_timeout = harq_disabled;
        h.retxs_cancelled = false;
        h.epoch = epoch;
        D::reset_feedback(&mut h.extra);
        self.next_epoch += 1;

        let r = HarqRef::new(ue_index, h_id);
        self.arm_timeout(r, slot_ack + self.ack_wait_in_slots as i32);
        trace!(
            "{} HARQ {} new tx: slot_tx={}, slot_ack={}, max_retxs={}",
            D::NAME,
            r,
            slot_tx,
            slot_ack,
            max_nof_harq_retxs
        );
        Some(r)
    }

    /// Force a process back to `Empty`, unlinking it from every list
    pub fn dealloc_harq(&mut self, r: HarqRef) -> bool {
        match self.ues.record(r) {
            Some(h) if h.state != HarqState::Empty => {}
            _ => return false,
        }
        self.pending_retxs.remove(&mut self.ues, r);
        self.disarm_timeout(r);

        let Some(table) = self.ues.get_mut(r.ue_index) else {
            return false;
        };
        let h = &mut table.harqs[r.h_id.as_usize()];
        h.state = HarqState::Empty;
        h.retxs_cancelled = false;
        table.free_harq_ids.push(r.h_id);
        true
    }

    /// Apply a positive or negative outcome to a process waiting for feedback
    pub fn handle_ack(&mut self, r: HarqRef, ack: bool) -> bool {
        match self.ues.record(r) {
            Some(h) if h.state == HarqState::WaitingAck => {}
            Some(h) => {
                warn!(
                    "{} HARQ {} rnti={}: feedback received in state {:?}",
                    D::NAME,
                    r,
                    h.rnti,
                    h.state
                );
                return false;
            }
            None => {
                warn!("{} HARQ {}: feedback for unknown process", D::NAME, r);
                return false;
            }
        }

        if self.harq_disabled {
            self.flush_harq_disabled(r, ack);
        } else if ack {
            trace!("{} HARQ {} acked", D::NAME, r);
            self.dealloc_harq(r);
        } else {
            self.nack_or_discard(r);
        }
        true
    }

    /// Empty a HARQ-disabled process, keeping a snapshot for delayed feedback
    fn flush_harq_disabled(&mut self, r: HarqRef, ack: bool) {
        let h = self.ues.linked_record(r);
        let snapshot = NtnHarqSnapshot {
            ue_index: r.ue_index,
            h_id: r.h_id,
            rnti: h.rnti,
            slot_tx: h.slot_tx,
            slot_ack: h.slot_ack,
            tbs_bytes: D::tbs_bytes(&h.extra).unwrap_or(0),
        };
        self.ntn_history.save(snapshot);
        trace!("{} HARQ {} flushed with HARQ disabled (ack={})", D::NAME, r, ack);
        self.dealloc_harq(r);
    }

    /// Queue a process for retransmission, or discard it when no retx is left
    fn nack_or_discard(&mut self, r: HarqRef) {
        if self.harq_disabled {
            self.flush_harq_disabled(r, false);
            return;
        }
        let h = self.ues.linked_record(r);
        if h.retxs_cancelled {
            debug!("{} HARQ {} discarded: retransmissions cancelled", D::NAME, r);
            self.dealloc_harq(r);
            return;
        }
        if h.nof_retxs >= h.max_nof_harq_retxs {
            info!(
                "{} HARQ {} rnti={} discarded after {} retransmissions",
                D::NAME,
                r,
                h.rnti,
                h.nof_retxs
            );
            self.dealloc_harq(r);
            return;
        }

        let reference = self.last_slot_ind.unwrap_or(h.slot_ack);
        self.disarm_timeout(r);
        let seq = self.next_pending_seq;
        self.next_pending_seq += 1;
        let h = self.ues.linked_record_mut(r);
        h.state = HarqState::PendingRetx;
        h.pending_seq = seq;
        self.pending_retxs.push_back(&mut self.ues, r);
        self.arm_timeout(r, reference + self.harq_retx_timeout as i32);
        trace!("{} HARQ {} pending retx", D::NAME, r);
    }

    /// Retransmit a process pending retransmission
    pub fn handle_new_retx(&mut self, r: HarqRef, slot_tx: SlotPoint, slot_ack: SlotPoint) -> bool {
        match self.ues.record(r) {
            Some(h) if h.state == HarqState::PendingRetx && h.nof_retxs < h.max_nof_harq_retxs => {}
            Some(h) => {
                warn!(
                    "{} HARQ {}: retx requested in state {:?} with {}/{} retxs",
                    D::NAME,
                    r,
                    h.state,
                    h.nof_retxs,
                    h.max_nof_harq_retxs
                );
                return false;
            }
            None => return false,
        }

        self.pending_retxs.remove(&mut self.ues, r);
        self.disarm_timeout(r);

        let harq_disabled = self.harq_disabled;
        let h = self.ues.linked_record_mut(r);
        h.state = HarqState::WaitingAck;
        h.slot_tx = slot_tx;
        h.slot_ack = slot_ack;
        h.nof_retxs += 1;
        h.ack_on_timeout = harq_disabled;
        D::reset_feedback(&mut h.extra);
        let nof_retxs = h.nof_retxs;

        self.arm_timeout(r, slot_ack + self.ack_wait_in_slots as i32);
        trace!(
            "{} HARQ {} retx #{}: slot_tx={}, slot_ack={}",
            D::NAME,
            r,
            nof_retxs,
            slot_tx,
            slot_ack
        );
        true
    }

    /// Move a process waiting for feedback straight to retransmission
    pub fn set_pending_retx(&mut self, r: HarqRef) -> bool {
        match self.ues.record(r).map(|h| h.state) {
            Some(HarqState::WaitingAck) => {
                self.nack_or_discard(r);
                true
            }
            Some(HarqState::PendingRetx) => true,
            _ => false,
        }
    }

    /// Stop retransmitting a process. A process waiting for feedback keeps
    /// waiting, but a negative outcome then empties it.
    pub fn cancel_retxs(&mut self, r: HarqRef) -> bool {
        match self.ues.record(r).map(|h| h.state) {
            Some(HarqState::PendingRetx) => {
                debug!("{} HARQ {} retxs cancelled while pending", D::NAME, r);
                self.dealloc_harq(r)
            }
            Some(HarqState::WaitingAck) => {
                self.ues.linked_record_mut(r).retxs_cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Advance to a new slot and resolve the timeouts due in it
    pub fn slot_indication(&mut self, sl: SlotPoint, notifier: &mut dyn HarqTimeoutNotifier) {
        self.last_slot_ind = Some(sl);

        let bucket = self.bucket_index(sl);
        let expired: Vec<HarqRef> = self.timeout_wheel[bucket]
            .iter(&self.ues)
            .filter(|r| self.ues.linked_record(*r).slot_timeout == sl)
            .collect();
        for r in expired {
            self.handle_harq_timeout(r, notifier);
        }

        self.ntn_history.purge(sl);
    }

    fn handle_harq_timeout(&mut self, r: HarqRef, notifier: &mut dyn HarqTimeoutNotifier) {
        let h = self.ues.linked_record(r);
        match h.state {
            HarqState::WaitingAck => {
                let ack = h.ack_on_timeout;
                if !self.harq_disabled {
                    warn!(
                        "{} HARQ {} rnti={}: no feedback for slot_ack={} (ack_on_timeout={})",
                        D::NAME,
                        r,
                        h.rnti,
                        h.slot_ack,
                        ack
                    );
                }
                notifier.on_harq_timeout(r.ue_index, D::IS_DL, ack);
                self.handle_ack(r, ack);
            }
            HarqState::PendingRetx => {
                warn!(
                    "{} HARQ {} rnti={}: discarded after waiting {} slots for a retx",
                    D::NAME,
                    r,
                    h.rnti,
                    self.harq_retx_timeout
                );
                self.dealloc_harq(r);
            }
            HarqState::Empty => {
                debug_assert!(false, "Empty {} HARQ {} found in the timeout wheel", D::NAME, r);
            }
        }
    }

    /// First process of a UE pending retransmission, oldest feedback slot first
    pub fn find_pending_retx(&self, ue_index: DuUeIndex) -> Option<HarqRef> {
        let table = self.ues.get(ue_index)?;
        table
            .harqs
            .iter()
            .filter(|h| h.state == HarqState::PendingRetx)
            .reduce(|best, h| if h.slot_ack < best.slot_ack { h } else { best })
            .map(|h| HarqRef::new(ue_index, h.h_id))
    }

    /// TBS of a flushed HARQ-disabled transmission with the given feedback slot
    pub fn ntn_tbs(&self, ue_index: DuUeIndex, slot_ack: SlotPoint) -> Option<u32> {
        self.ntn_history.find(ue_index, slot_ack).map(|e| e.tbs_bytes)
    }

    fn bucket_index(&self, sl: SlotPoint) -> usize {
        sl.count() as usize % self.timeout_wheel.len()
    }

    fn arm_timeout(&mut self, r: HarqRef, timeout: SlotPoint) {
        if let Some(now) = self.last_slot_ind {
            let distance = timeout - now;
            assert!(
                distance > 0 && (distance as usize) < self.timeout_wheel.len(),
                "{} HARQ {} timeout at {} is outside the wheel horizon of {} slots from {}",
                D::NAME,
                r,
                timeout,
                self.timeout_wheel.len(),
                now
            );
        }
        self.ues.linked_record_mut(r).slot_timeout = timeout;
        let bucket = self.bucket_index(timeout);
        self.timeout_wheel[bucket].push_back(&mut self.ues, r);
    }

    fn disarm_timeout(&mut self, r: HarqRef) {
        let bucket = self.bucket_index(self.ues.linked_record(r).slot_timeout);
        self.timeout_wheel[bucket].remove(&mut self.ues, r);
    }
}

impl CellHarqRepository<Dl> {
    /// Take a free DL process for a PDSCH at `pdsch_slot` acked `k1` slots later
    pub fn alloc_dl_harq(
        &mut self,
        ue_index: DuUeIndex,
        pdsch_slot: SlotPoint,
        k1: u32,
        max_nof_harq_retxs: u8,
        harq_bit_idx: u8,
    ) -> Option<HarqRef> {
        let r = self.alloc_harq(ue_index, pdsch_slot, pdsch_slot + k1 as i32, max_nof_harq_retxs)?;
        self.ues.linked_record_mut(r).extra.harq_bit_idx = harq_bit_idx;
        Some(r)
    }

    pub fn handle_dl_new_retx(&mut self, r: HarqRef, pdsch_slot: SlotPoint, k1: u32, harq_bit_idx: u8) -> bool {
        if !self.handle_new_retx(r, pdsch_slot, pdsch_slot + k1 as i32) {
            return false;
        }
        self.ues.linked_record_mut(r).extra.harq_bit_idx = harq_bit_idx;
        true
    }

    /// Register one more PUCCH occasion carrying this process's ACK bit
    pub fn increment_pucch_counter(&mut self, r: HarqRef) -> bool {
        match self.ues.record_mut(r) {
            Some(h) if h.state == HarqState::WaitingAck => {
                h.extra.pucch_ack_to_receive = h.extra.pucch_ack_to_receive.saturating_add(1);
                true
            }
            _ => false,
        }
    }

    /// Feed one decoded HARQ-ACK bit into a DL process
    pub fn handle_dl_ack_info(
        &mut self,
        r: HarqRef,
        ack: HarqAckStatus,
        pucch_snr: Option<f32>,
    ) -> HarqStatusUpdate {
        let now = self.last_slot_ind;
        let Some(h) = self.ues.record_mut(r) else {
            warn!("DL HARQ {}: HARQ-ACK for unknown process", r);
            return HarqStatusUpdate::Error;
        };
        if h.state != HarqState::WaitingAck {
            warn!(
                "DL HARQ {} rnti={}: HARQ-ACK={:?} received in state {:?}",
                r, h.rnti, ack, h.state
            );
            return HarqStatusUpdate::Error;
        }

        h.extra.combine_ack(ack, pucch_snr);

        if h.extra.pucch_ack_to_receive > 1 {
            // More PUCCHs carry this bit; wait for them, but not for long
            h.extra.pucch_ack_to_receive -= 1;
            h.ack_on_timeout = h.extra.chosen_ack == HarqAckStatus::Ack;
            let short_timeout = now.unwrap_or(h.slot_ack) + SHORT_ACK_TIMEOUT_DTX as i32;
            if short_timeout < h.slot_timeout {
                self.disarm_timeout(r);
                self.arm_timeout(r, short_timeout);
            }
            return HarqStatusUpdate::NoUpdate;
        }

        h.extra.pucch_ack_to_receive = 0;
        let acked = h.extra.chosen_ack == HarqAckStatus::Ack;
        self.handle_ack(r, acked);
        if acked {
            HarqStatusUpdate::Acked
        } else {
            HarqStatusUpdate::Nacked
        }
    }

    pub fn save_dl_grant_params(&mut self, r: HarqRef, ctx: &DlHarqAllocContext, grant: &PdschGrant) -> bool {
        match self.ues.record_mut(r) {
            Some(h) if h.state == HarqState::WaitingAck => {
                if h.nof_retxs > 0 {
                    if let Some(prev) = &h.extra.grant {
                        if prev.tbs_bytes != grant.tbs_bytes {
                            warn!(
                                "DL HARQ {}: retx TBS {} differs from first TBS {}",
                                r, grant.tbs_bytes, prev.tbs_bytes
                            );
                        }
                    }
                }
                h.extra.grant = Some(DlHarqGrantParams::new(ctx, grant));
                true
            }
            _ => false,
        }
    }

    /// DL process waiting for the ACK bit `harq_bit_idx` of the UCI at `uci_slot`
    pub fn find_dl_harq_waiting_ack(
        &self,
        ue_index: DuUeIndex,
        uci_slot: SlotPoint,
        harq_bit_idx: u8,
    ) -> Option<HarqRef> {
        self.ues
            .get(ue_index)?
            .harqs
            .iter()
            .find(|h| {
                h.state == HarqState::WaitingAck
                    && h.slot_ack == uci_slot
                    && h.extra.harq_bit_idx == harq_bit_idx
            })
            .map(|h| HarqRef::new(ue_index, h.h_id))
    }

    /// NACK every DL process of a UE whose UCI at `uci_slot` could not be scheduled.
    /// Returns the number of processes affected.
    pub fn uci_sched_failed(&mut self, ue_index: DuUeIndex, uci_slot: SlotPoint) -> usize {
        let Some(table) = self.ues.get(ue_index) else {
            return 0;
        };
        let affected: Vec<(HarqRef, u8)> = table
            .harqs
            .iter()
            .filter(|h| h.state == HarqState::WaitingAck && h.slot_ack == uci_slot)
            .map(|h| (HarqRef::new(ue_index, h.h_id), h.extra.pucch_ack_to_receive.max(1)))
            .collect();
        for (r, nof_nacks) in &affected {
            for _ in 0..*nof_nacks {
                self.handle_dl_ack_info(*r, HarqAckStatus::Nack, None);
            }
        }
        if !affected.is_empty() {
            debug!(
                "DL HARQ ue={}: UCI at {} not scheduled, {} processes NACKed",
                ue_index,
                uci_slot,
                affected.len()
            );
        }
        affected.len()
    }
}

impl CellHarqRepository<Ul> {
    /// Apply a PUSCH CRC indication to a UL process
    pub fn handle_ul_crc_info(&mut self, r: HarqRef, ok: bool) -> UlCrcOutcome {
        let tbs_bytes = match self.ues.record(r) {
            Some(h) if h.state == HarqState::WaitingAck => Ul::tbs_bytes(&h.extra).unwrap_or(0),
            Some(h) => {
                warn!("UL HARQ {} rnti={}: CRC received in state {:?}", r, h.rnti, h.state);
                return UlCrcOutcome::Error;
            }
            None => {
                warn!("UL HARQ {}: CRC for unknown process", r);
                return UlCrcOutcome::Error;
            }
        };
        self.handle_ack(r, ok);
        if ok {
            UlCrcOutcome::Acked { tbs_bytes }
        } else {
            UlCrcOutcome::Nacked
        }
    }

    pub fn save_ul_grant_params(&mut self, r: HarqRef, ctx: &UlHarqAllocContext, grant: &PuschGrant) -> bool {
        match self.ues.record_mut(r) {
            Some(h) if h.state == HarqState::WaitingAck => {
                h.extra.grant = Some(UlHarqGrantParams::new(ctx, grant));
                true
            }
            _ => false,
        }
    }

    /// UL process whose PUSCH is transmitted at `pusch_slot`
    pub fn find_ul_harq_waiting_ack(&self, ue_index: DuUeIndex, pusch_slot: SlotPoint) -> Option<HarqRef> {
        self.ues
            .get(ue_index)?
            .harqs
            .iter()
            .find(|h| h.state == HarqState::WaitingAck && h.slot_tx == pusch_slot)
            .map(|h| HarqRef::new(ue_index, h.h_id))
    }

    /// Bytes of a UE's UL transport blocks still waiting for CRC
    pub fn total_bytes_waiting_ack(&self, ue_index: DuUeIndex) -> u32 {
        let Some(table) = self.ues.get(ue_index) else {
            return 0;
        };
        let in_flight: u32 = table
            .harqs
            .iter()
            .filter(|h| h.state == HarqState::WaitingAck)
            .filter_map(|h| Ul::tbs_bytes(&h.extra))
            .sum();
        let flushed = match (self.harq_disabled, self.last_slot_ind) {
            (true, Some(now)) => self.ntn_history.bytes_waiting_feedback(ue_index, now),
            _ => 0,
        };
        in_flight + flushed
    }
}
