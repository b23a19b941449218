//! Cell HARQ manager
//!
//! Composes the DL and UL repositories of a cell, creates the per-UE HARQ
//! entities and ticks both repositories once per slot.

use super::config::HarqConfig;
use super::handle::HarqHandle;
use super::process::{Dl, HarqDirection, Ul};
use super::repository::{CellHarqRepository, DlHarqRepository, UlHarqRepository};
use super::ue_entity::UeHarqEntity;
use super::{HarqError, HarqRef};
use crate::LayerError;
use common::{DuUeIndex, Rnti, SlotPoint};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, trace};

/// Receives the HARQ processes that left `WaitingAck` because their feedback
/// deadline expired.
///
/// [`CellHarqManager::slot_indication`] delivers the events of a slot once
/// both directions have been resolved, so implementations may use handles and
/// UE entities of the cell, or drop them.
pub trait HarqTimeoutNotifier {
    fn on_harq_timeout(&mut self, ue_index: DuUeIndex, is_dl: bool, ack: bool);
}

/// Notifier that ignores every timeout
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHarqTimeoutNotifier;

impl HarqTimeoutNotifier for NoopHarqTimeoutNotifier {
    fn on_harq_timeout(&mut self, _ue_index: DuUeIndex, _is_dl: bool, _ack: bool) {}
}

/// Timeouts of one slot, held until the repositories are released
#[derive(Debug, Default)]
struct ExpiredHarqs {
    events: Vec<(DuUeIndex, bool, bool)>,
}

impl HarqTimeoutNotifier for ExpiredHarqs {
    fn on_harq_timeout(&mut self, ue_index: DuUeIndex, is_dl: bool, ack: bool) {
        self.events.push((ue_index, is_dl, ack));
    }
}

/// HARQ processes of one cell, both directions
pub struct CellHarqManager {
    config: HarqConfig,
    dl: Rc<RefCell<DlHarqRepository>>,
    ul: Rc<RefCell<UlHarqRepository>>,
    timeout_notifier: Box<dyn HarqTimeoutNotifier>,
}

impl CellHarqManager {
    /// Create a manager for a cell
    pub fn new(config: HarqConfig, timeout_notifier: Box<dyn HarqTimeoutNotifier>) -> Result<Self, LayerError> {
        config.validate()?;
        info!(
            "Creating cell HARQ manager: max_ues={}, max_harqs_per_ue={}, max_ack_wait={} slots, ntn_cs_koffset={}",
            config.max_ues,
            config.max_harqs_per_ue,
            config.max_ack_wait_in_slots,
            config.ntn_cs_koffset
        );
        let dl = Rc::new(RefCell::new(CellHarqRepository::<Dl>::new(&config)));
        let ul = Rc::new(RefCell::new(CellHarqRepository::<Ul>::new(&config)));
        Ok(Self {
            config,
            dl,
            ul,
            timeout_notifier,
        })
    }

    pub fn config(&self) -> &HarqConfig {
        &self.config
    }

    /// Last slot the manager was ticked with
    pub fn last_slot(&self) -> Option<SlotPoint> {
        self.dl.borrow().last_slot()
    }

    /// Advance both directions to a new slot, resolving the timeouts due in it.
    /// Must be called once per slot, before any other call for that slot.
    pub fn slot_indication(&mut self, sl: SlotPoint) {
        trace!("HARQ slot indication {}", sl);
        let mut expired = ExpiredHarqs::default();
        self.dl.borrow_mut().slot_indication(sl, &mut expired);
        self.ul.borrow_mut().slot_indication(sl, &mut expired);
        for (ue_index, is_dl, ack) in expired.events {
            self.timeout_notifier.on_harq_timeout(ue_index, is_dl, ack);
        }
    }

    /// Reserve the HARQ processes of a new UE in both directions
    pub fn add_ue(
        &mut self,
        ue_index: DuUeIndex,
        rnti: Rnti,
        nof_dl_harqs: usize,
        nof_ul_harqs: usize,
    ) -> Result<UeHarqEntity, HarqError> {
        if self.contains(ue_index) {
            return Err(HarqError::UeAlreadyExists(ue_index));
        }
        self.dl
            .borrow_mut()
            .reserve_ue_harqs(ue_index, rnti, nof_dl_harqs)?;
        if let Err(e) = self
            .ul
            .borrow_mut()
            .reserve_ue_harqs(ue_index, rnti, nof_ul_harqs)
        {
            self.dl.borrow_mut().destroy_ue(ue_index);
            return Err(e);
        }
        debug!(
            "HARQ entity created for ue={} rnti={}: {} DL / {} UL processes",
            ue_index, rnti, nof_dl_harqs, nof_ul_harqs
        );
        Ok(UeHarqEntity::new(
            ue_index,
            rnti,
            Rc::clone(&self.dl),
            Rc::clone(&self.ul),
        ))
    }

    /// Whether a UE has HARQ processes in this cell
    pub fn contains(&self, ue_index: DuUeIndex) -> bool {
        self.dl.borrow().contains(ue_index)
    }

    /// DL processes pending retransmission, in the order they were NACKed
    pub fn pending_dl_retxs(&self) -> PendingRetxs<Dl> {
        PendingRetxs {
            repo: Rc::clone(&self.dl),
        }
    }

    /// UL processes pending retransmission, in the order they were NACKed
    pub fn pending_ul_retxs(&self) -> PendingRetxs<Ul> {
        PendingRetxs {
            repo: Rc::clone(&self.ul),
        }
    }

    pub fn dl_repository(&self) -> &Rc<RefCell<DlHarqRepository>> {
        &self.dl
    }

    pub fn ul_repository(&self) -> &Rc<RefCell<UlHarqRepository>> {
        &self.ul
    }
}

/// Cross-UE list of processes pending retransmission.
///
/// Iterating walks the live list lazily; each call to [`PendingRetxs::iter`]
/// starts again from the oldest entry.
pub struct PendingRetxs<D: HarqDirection> {
    repo: Rc<RefCell<CellHarqRepository<D>>>,
}

impl<D: HarqDirection> PendingRetxs<D> {
    pub fn len(&self) -> usize {
        self.repo.borrow().nof_pending_retxs()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn front(&self) -> Option<HarqHandle<D>> {
        self.iter().next()
    }

    pub fn iter(&self) -> PendingRetxIter<D> {
        let end_seq = self.repo.borrow().pending_seq_end();
        PendingRetxIter {
            repo: Rc::clone(&self.repo),
            last: None,
            end_seq,
            done: false,
        }
    }
}

impl<'a, D: HarqDirection> IntoIterator for &'a PendingRetxs<D> {
    type Item = HarqHandle<D>;
    type IntoIter = PendingRetxIter<D>;

    fn into_iter(self) -> PendingRetxIter<D> {
        self.iter()
    }
}

/// Iterator over pending retransmissions.
///
/// The successor is looked up only when asked for, so any pending process,
/// the yielded one included, may be retransmitted, cancelled or released
/// during iteration. Processes NACKed after the iterator was created are
/// left for the next pass.
pub struct PendingRetxIter<D: HarqDirection> {
    repo: Rc<RefCell<CellHarqRepository<D>>>,
    /// Last yielded process and its queue position
    last: Option<(HarqRef, u64)>,
    end_seq: u64,
    done: bool,
}

impl<D: HarqDirection> Iterator for PendingRetxIter<D> {
    type Item = HarqHandle<D>;

    fn next(&mut self) -> Option<HarqHandle<D>> {
        if self.done {
            return None;
        }
        let found = self.repo.borrow().pending_retx_after(self.last, self.end_seq);
        let Some((current, seq)) = found else {
            self.done = true;
            return None;
        };
        self.last = Some((current, seq));
        HarqHandle::bind(&self.repo, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::harq::{
        DlHarqAllocContext, DlHarqProcessHandle, HarqAckStatus, HarqState, HarqStatusUpdate,
        PdschGrant, PuschGrant, UlCrcOutcome, UlHarqAllocContext, NTN_HISTORY_GRACE_SLOTS,
        SHORT_ACK_TIMEOUT_DTX,
    };
    use common::HarqId;

    type TimeoutEvent = (DuUeIndex, bool, bool);

    #[derive(Clone, Default)]
    struct TimeoutRecorder {
        events: Rc<RefCell<Vec<TimeoutEvent>>>,
    }

    impl HarqTimeoutNotifier for TimeoutRecorder {
        fn on_harq_timeout(&mut self, ue_index: DuUeIndex, is_dl: bool, ack: bool) {
            self.events.borrow_mut().push((ue_index, is_dl, ack));
        }
    }

    struct TestCell {
        mgr: CellHarqManager,
        events: Rc<RefCell<Vec<TimeoutEvent>>>,
        now: SlotPoint,
    }

    impl TestCell {
        fn new(config: HarqConfig, start: SlotPoint) -> Self {
            let recorder = TimeoutRecorder::default();
            let events = Rc::clone(&recorder.events);
            let mut mgr = CellHarqManager::new(config, Box::new(recorder)).unwrap();
            mgr.slot_indication(start);
            Self {
                mgr,
                events,
                now: start,
            }
        }

        fn tick(&mut self) {
            self.now += 1;
            self.mgr.slot_indication(self.now);
        }

        fn run(&mut self, nof_slots: u32) {
            for _ in 0..nof_slots {
                self.tick();
            }
        }

        fn add_ue(&mut self, ue: u16) -> UeHarqEntity {
            self.mgr
                .add_ue(DuUeIndex(ue), Rnti(0x4601 + ue), 16, 16)
                .unwrap()
        }

        fn events(&self) -> Vec<TimeoutEvent> {
            self.events.borrow().clone()
        }
    }

    fn test_config() -> HarqConfig {
        HarqConfig {
            max_ues: 8,
            max_ack_wait_in_slots: 16,
            ..Default::default()
        }
    }

    fn start_slot() -> SlotPoint {
        SlotPoint::new(0, 100, 0)
    }

    fn pdsch(tbs_bytes: u32) -> PdschGrant {
        PdschGrant {
            tbs_bytes,
            mcs: 10,
            nof_layers: 1,
            ..Default::default()
        }
    }

    fn pusch(tbs_bytes: u32) -> PuschGrant {
        PuschGrant {
            tbs_bytes,
            mcs: 8,
            nof_layers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_ue_has_only_empty_processes() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        assert!(cell.mgr.contains(DuUeIndex(0)));
        assert_eq!(ue.nof_dl_harqs(), 16);
        assert_eq!(ue.nof_empty_dl_harqs(), 16);
        assert_eq!(ue.nof_empty_ul_harqs(), 16);

        for h in 0..16 {
            assert!(ue.dl_harq(HarqId(h)).is_none());
            assert!(ue.ul_harq(HarqId(h)).is_none());
        }
        assert!(ue.find_pending_dl_retx().is_none());
        assert!(ue.find_pending_ul_retx().is_none());
        assert!(ue.find_dl_harq_waiting_ack(cell.now + 4, 0).is_none());
        assert!(ue.find_ul_harq_waiting_ack(cell.now + 4).is_none());
        assert!(cell.mgr.pending_dl_retxs().is_empty());
    }

    #[test]
    fn test_dl_timeout_after_max_ack_wait() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(2);
        let h = ue.alloc_dl_harq(cell.now, 4, 0, 0).unwrap();
        assert_eq!(h.uci_slot(), Some(cell.now + 4));
        assert_eq!(h.pdsch_slot(), Some(cell.now));
        assert!(h.is_waiting_ack());

        // Feedback slot plus the ACK wait, minus one
        cell.run(4 + 16 - 1);
        assert!(h.is_waiting_ack());
        assert!(cell.events().is_empty());

        cell.tick();
        assert!(h.is_empty());
        assert_eq!(cell.events(), vec![(DuUeIndex(2), true, false)]);
        assert_eq!(ue.nof_empty_dl_harqs(), 16);
    }

    #[test]
    fn test_dl_timeout_with_retxs_left_requeues() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let h = ue.alloc_dl_harq(cell.now, 4, 2, 0).unwrap();

        cell.run(20);
        assert!(h.has_pending_retx());
        assert_eq!(cell.events(), vec![(DuUeIndex(0), true, false)]);
        assert_eq!(cell.mgr.pending_dl_retxs().front(), Some(h.clone()));

        // Nobody retransmits it: dropped once the retx timeout elapses, silently
        cell.run(cell.mgr.config().dl_harq_retx_timeout);
        assert!(h.is_empty());
        assert!(cell.mgr.pending_dl_retxs().is_empty());
        assert_eq!(cell.events().len(), 1);
    }

    #[test]
    fn test_ack_empties_process() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let h = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        assert!(h.save_grant_params(&DlHarqAllocContext::default(), &pdsch(1200)));
        assert_eq!(h.grant_params().map(|g| g.tbs_bytes), Some(1200));

        cell.run(4);
        assert_eq!(h.dl_ack_info(HarqAckStatus::Ack, Some(12.0)), HarqStatusUpdate::Acked);
        assert!(h.is_empty());
        assert_eq!(ue.nof_empty_dl_harqs(), 16);

        // Late duplicate of the same report
        assert_eq!(h.dl_ack_info(HarqAckStatus::Ack, None), HarqStatusUpdate::Error);
        cell.run(30);
        assert!(cell.events().is_empty());
    }

    #[test]
    fn test_nack_then_retx_keeps_ndi() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let h = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        let ndi = h.ndi().unwrap();

        cell.run(4);
        assert_eq!(h.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
        assert!(h.has_pending_retx());
        assert_eq!(cell.mgr.pending_dl_retxs().len(), 1);

        cell.tick();
        assert!(h.new_retx(cell.now, 5, 1));
        assert!(h.is_waiting_ack());
        assert_eq!(h.nof_retxs(), Some(1));
        assert_eq!(h.ndi(), Some(ndi));
        assert_eq!(h.uci_slot(), Some(cell.now + 5));
        assert_eq!(h.harq_bit_idx(), Some(1));
        assert!(cell.mgr.pending_dl_retxs().is_empty());

        // A second retx request while waiting for feedback is refused
        assert!(!h.new_retx(cell.now, 5, 1));

        cell.run(5);
        assert_eq!(h.dl_ack_info(HarqAckStatus::Ack, None), HarqStatusUpdate::Acked);

        // The next new transmission reuses the id and toggles NDI
        let h2 = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        assert_eq!(h2.id(), h.id());
        assert_eq!(h2.ndi(), Some(!ndi));
        assert_eq!(h2.nof_retxs(), Some(0));
        assert!(h.is_empty());
        assert_ne!(h, h2);
    }

    #[test]
    fn test_retxs_exhausted_after_max() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let max_retxs = 3;
        let h = ue.alloc_dl_harq(cell.now, 4, max_retxs, 0).unwrap();

        for n in 0..max_retxs {
            cell.run(4);
            assert_eq!(h.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
            assert!(h.has_pending_retx(), "requeued after nack {}", n + 1);
            assert!(h.new_retx(cell.now, 4, 0));
        }
        assert_eq!(h.nof_retxs(), Some(max_retxs));
        assert!(h.is_last_retx());

        cell.run(4);
        assert_eq!(h.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
        assert!(h.is_empty());
        assert!(cell.mgr.pending_dl_retxs().is_empty());
        assert_eq!(ue.nof_empty_dl_harqs(), 16);
    }

    fn two_pucch_outcome(first: HarqAckStatus, second: HarqAckStatus) -> (HarqStatusUpdate, HarqState) {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let h = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        assert!(h.increment_pucch_counter());
        assert!(h.increment_pucch_counter());
        assert_eq!(h.pucch_ack_to_receive(), Some(2));

        cell.run(4);
        assert_eq!(h.dl_ack_info(first, Some(3.0)), HarqStatusUpdate::NoUpdate);
        let outcome = h.dl_ack_info(second, Some(6.0));
        (outcome, h.state())
    }

    #[test]
    fn test_two_pucch_ack_wins_in_either_order() {
        use HarqAckStatus::*;
        assert_eq!(two_pucch_outcome(Ack, Nack), (HarqStatusUpdate::Acked, HarqState::Empty));
        assert_eq!(two_pucch_outcome(Nack, Ack), (HarqStatusUpdate::Acked, HarqState::Empty));
        assert_eq!(two_pucch_outcome(Dtx, Ack), (HarqStatusUpdate::Acked, HarqState::Empty));
    }

    #[test]
    fn test_two_pucch_without_ack_is_nacked() {
        use HarqAckStatus::*;
        assert_eq!(
            two_pucch_outcome(Nack, Nack),
            (HarqStatusUpdate::Nacked, HarqState::PendingRetx)
        );
        assert_eq!(
            two_pucch_outcome(Dtx, Dtx),
            (HarqStatusUpdate::Nacked, HarqState::PendingRetx)
        );
    }

    #[test]
    fn test_missing_second_pucch_resolves_on_short_timeout() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(1);
        let nacked = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        let acked = ue.alloc_dl_harq(cell.now, 4, 4, 1).unwrap();
        for h in [&nacked, &acked] {
            h.increment_pucch_counter();
            h.increment_pucch_counter();
        }

        cell.run(4);
        assert_eq!(nacked.dl_ack_info(HarqAckStatus::Dtx, None), HarqStatusUpdate::NoUpdate);
        assert_eq!(acked.dl_ack_info(HarqAckStatus::Ack, Some(8.0)), HarqStatusUpdate::NoUpdate);
        assert_eq!(nacked.timeout_slot(), Some(cell.now + SHORT_ACK_TIMEOUT_DTX as i32));

        cell.run(SHORT_ACK_TIMEOUT_DTX - 1);
        assert!(cell.events().is_empty());
        cell.tick();
        assert!(nacked.has_pending_retx());
        assert!(acked.is_empty());
        assert_eq!(
            cell.events(),
            vec![(DuUeIndex(1), true, false), (DuUeIndex(1), true, true)]
        );
    }

    #[test]
    fn test_pending_retxs_are_fifo_across_ues() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue_a = cell.add_ue(5);
        let ue_b = cell.add_ue(1);
        let ha = ue_a.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        let hb = ue_b.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();

        cell.run(4);
        ha.dl_ack_info(HarqAckStatus::Nack, None);
        cell.tick();
        hb.dl_ack_info(HarqAckStatus::Nack, None);

        let pending = cell.mgr.pending_dl_retxs();
        let order: Vec<DuUeIndex> = pending.iter().map(|h| h.ue_index()).collect();
        assert_eq!(order, vec![DuUeIndex(5), DuUeIndex(1)]);
        // Restartable
        let again: Vec<DuUeIndex> = (&pending).into_iter().map(|h| h.ue_index()).collect();
        assert_eq!(again, order);

        // Retransmitting while iterating
        let mut served = 0;
        for h in &pending {
            assert!(h.new_retx(cell.now, 4, 0));
            served += 1;
        }
        assert_eq!(served, 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_retxs_continue_past_removed_entries() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let mut ues: Vec<Option<UeHarqEntity>> = (0..4).map(|i| Some(cell.add_ue(i))).collect();
        let hs: Vec<DlHarqProcessHandle> = ues
            .iter()
            .flatten()
            .map(|ue| ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap())
            .collect();
        cell.run(4);
        for h in &hs {
            assert_eq!(h.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
        }
        let pending = cell.mgr.pending_dl_retxs();

        // Successor cancelled while the first entry is being served
        let mut yielded = Vec::new();
        for h in &pending {
            if h.ue_index() == DuUeIndex(0) {
                assert!(hs[1].cancel_retxs());
            }
            yielded.push(h.ue_index());
        }
        assert_eq!(yielded, vec![DuUeIndex(0), DuUeIndex(2), DuUeIndex(3)]);

        // Served entry retransmitted and its successor's UE released
        let mut yielded = Vec::new();
        for h in &pending {
            if h.ue_index() == DuUeIndex(0) {
                assert!(h.new_retx(cell.now, 4, 1));
                ues[2] = None;
            }
            yielded.push(h.ue_index());
        }
        assert_eq!(yielded, vec![DuUeIndex(0), DuUeIndex(3)]);

        // Entries NACKed during a pass wait for the next one
        let mut yielded = Vec::new();
        for h in &pending {
            assert_eq!(hs[0].dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
            yielded.push(h.ue_index());
        }
        assert_eq!(yielded, vec![DuUeIndex(3)]);
        let order: Vec<DuUeIndex> = pending.iter().map(|h| h.ue_index()).collect();
        assert_eq!(order, vec![DuUeIndex(3), DuUeIndex(0)]);
    }

    #[test]
    fn test_cancel_retxs() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);

        let waiting = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        assert!(waiting.cancel_retxs());
        assert!(waiting.is_waiting_ack());
        assert!(waiting.retxs_cancelled());
        cell.run(4);
        assert_eq!(waiting.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
        assert!(waiting.is_empty());

        let pending = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        assert!(!pending.retxs_cancelled());
        cell.run(4);
        pending.dl_ack_info(HarqAckStatus::Nack, None);
        assert!(pending.has_pending_retx());
        assert!(pending.cancel_retxs());
        assert!(pending.is_empty());
        assert!(cell.mgr.pending_dl_retxs().is_empty());
        assert!(!pending.cancel_retxs());
    }

    #[test]
    fn test_stale_reports_after_ue_release() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let dl = ue.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        let ul = ue.alloc_ul_harq(cell.now + 4, 4).unwrap();
        drop(ue);
        assert!(!cell.mgr.contains(DuUeIndex(0)));

        cell.run(4);
        assert_eq!(dl.dl_ack_info(HarqAckStatus::Ack, None), HarqStatusUpdate::Error);
        assert_eq!(ul.ul_crc_info(true), UlCrcOutcome::Error);
        assert!(dl.is_empty());

        // Same UE index reused by a new UE; the new processes get the same ids
        let other = cell.add_ue(3);
        let reused = cell.add_ue(0);
        let dl_new = reused.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        let ul_new = reused.alloc_ul_harq(cell.now + 4, 4).unwrap();
        let dl_other = other.alloc_dl_harq(cell.now, 4, 4, 0).unwrap();
        assert_eq!(dl_new.id(), dl.id());
        assert_eq!(ul_new.id(), ul.id());

        assert_eq!(dl.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Error);
        assert_eq!(ul.ul_crc_info(false), UlCrcOutcome::Error);
        assert!(!dl.reset());
        assert!(!dl.set_pending_retx());
        assert!(dl_new.is_waiting_ack());
        assert!(ul_new.is_waiting_ack());
        assert!(dl_other.is_waiting_ack());
        assert_eq!(dl_new.rnti(), Some(Rnti(0x4601)));
        assert_eq!(dl.rnti(), None);

        // Only the new DL process of UE 0 times out, not the released one
        cell.run(4 + 16);
        let events = cell.events();
        assert_eq!(
            events.iter().filter(|(ue, is_dl, _)| *ue == DuUeIndex(0) && *is_dl).count(),
            1
        );
    }

    #[test]
    fn test_timeout_across_sfn_wrap() {
        for numerology in [0u8, 1] {
            let last_frame = SlotPoint::new(numerology, 1023, 0);
            let start = last_frame + (last_frame.nof_slots_per_frame() as i32 - 3);
            let mut cell = TestCell::new(test_config(), start);
            let ue = cell.add_ue(0);
            let h = ue.alloc_dl_harq(cell.now, 4, 0, 0).unwrap();
            let uci_slot = h.uci_slot().unwrap();
            assert_eq!(uci_slot.sfn(), 0);
            assert!(uci_slot > cell.now);

            cell.run(19);
            assert!(h.is_waiting_ack());
            cell.tick();
            assert!(h.is_empty());
            assert_eq!(cell.events(), vec![(DuUeIndex(0), true, false)]);
        }
    }

    #[test]
    fn test_ul_crc_flow() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(4);
        let pusch_slot = cell.now + 4;
        let h = ue.alloc_ul_harq(pusch_slot, 2).unwrap();
        assert!(h.save_grant_params(&UlHarqAllocContext::default(), &pusch(300)));
        assert_eq!(ue.total_ul_bytes_waiting_ack(), 300);
        assert_eq!(ue.find_ul_harq_waiting_ack(pusch_slot), Some(h.clone()));
        assert_eq!(ue.last_ul_tx_slot(), Some(pusch_slot));

        cell.run(4);
        assert_eq!(h.ul_crc_info(false), UlCrcOutcome::Nacked);
        assert_eq!(ue.find_pending_ul_retx(), Some(h.clone()));
        assert_eq!(cell.mgr.pending_ul_retxs().len(), 1);
        assert_eq!(ue.total_ul_bytes_waiting_ack(), 0);

        let retx_slot = cell.now + 4;
        assert!(h.new_retx(retx_slot));
        assert_eq!(h.pusch_slot(), Some(retx_slot));
        assert_eq!(h.grant_params().map(|g| g.tbs_bytes), Some(300));
        cell.run(4);
        assert_eq!(h.ul_crc_info(true), UlCrcOutcome::Acked { tbs_bytes: 300 });
        assert!(h.is_empty());
        assert_eq!(ue.nof_empty_ul_harqs(), 16);
    }

    #[test]
    fn test_uci_sched_failed_nacks_waiting_processes() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let uci_slot = cell.now + 4;
        let h0 = ue.alloc_dl_harq(cell.now, 4, 1, 0).unwrap();
        let h1 = ue.alloc_dl_harq(cell.now, 4, 1, 1).unwrap();
        let other_slot = ue.alloc_dl_harq(cell.now, 6, 1, 0).unwrap();
        h1.increment_pucch_counter();
        h1.increment_pucch_counter();

        assert_eq!(ue.find_dl_harq_waiting_ack(uci_slot, 1), Some(h1.clone()));
        assert_eq!(ue.find_dl_harq_waiting_ack(uci_slot, 2), None);

        cell.run(4);
        assert_eq!(ue.uci_sched_failed(uci_slot), 2);
        assert!(h0.has_pending_retx());
        assert!(h1.has_pending_retx());
        assert!(other_slot.is_waiting_ack());
        assert_eq!(ue.uci_sched_failed(uci_slot), 0);
    }

    #[test]
    fn test_find_pending_retx_prefers_oldest_feedback() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let ue = cell.add_ue(0);
        let late = ue.alloc_dl_harq(cell.now, 6, 2, 0).unwrap();
        let early = ue.alloc_dl_harq(cell.now, 2, 2, 0).unwrap();

        cell.run(6);
        late.dl_ack_info(HarqAckStatus::Nack, None);
        early.dl_ack_info(HarqAckStatus::Nack, None);
        assert_eq!(ue.find_pending_dl_retx(), Some(early));
        assert_eq!(cell.mgr.pending_dl_retxs().front(), Some(late));
    }

    #[test]
    fn test_ntn_flush_and_history() {
        let config = HarqConfig {
            ntn_cs_koffset: 40,
            dl_harq_disabled: true,
            ul_harq_disabled: true,
            ..test_config()
        };
        let mut cell = TestCell::new(config, start_slot());
        let ue = cell.add_ue(0);

        let pusch_slot = cell.now;
        let ul = ue.alloc_ul_harq(pusch_slot, 0).unwrap();
        ul.save_grant_params(&UlHarqAllocContext::default(), &pusch(500));
        let dl = ue.alloc_dl_harq(cell.now, 4, 0, 0).unwrap();
        dl.save_grant_params(&DlHarqAllocContext::default(), &pdsch(800));

        cell.tick();
        assert!(ul.is_empty());
        assert_eq!(cell.events(), vec![(DuUeIndex(0), false, true)]);
        assert_eq!(ue.nof_empty_ul_harqs(), 16);
        assert_eq!(ue.total_ul_bytes_waiting_ack(), 500);
        assert_eq!(ue.ntn_ul_tbs(pusch_slot), Some(500));

        cell.run(4);
        assert!(dl.is_empty());
        assert_eq!(cell.events().last(), Some(&(DuUeIndex(0), true, true)));
        assert_eq!(ue.ntn_dl_tbs(pusch_slot + 4), Some(800));

        // Delayed feedback window ends at pusch_slot + koffset
        while cell.now < pusch_slot + 40 {
            cell.tick();
        }
        assert_eq!(ue.total_ul_bytes_waiting_ack(), 500);
        cell.tick();
        assert_eq!(ue.total_ul_bytes_waiting_ack(), 0);
        assert_eq!(ue.ntn_ul_tbs(pusch_slot), Some(500));

        while cell.now < pusch_slot + 40 + NTN_HISTORY_GRACE_SLOTS as i32 + 1 {
            cell.tick();
        }
        assert_eq!(ue.ntn_ul_tbs(pusch_slot), None);
    }

    #[test]
    fn test_ntn_reports_never_queue_retxs() {
        let config = HarqConfig {
            ntn_cs_koffset: 40,
            dl_harq_disabled: true,
            ul_harq_disabled: true,
            ..test_config()
        };
        let mut cell = TestCell::new(config, start_slot());
        let ue = cell.add_ue(0);

        let pusch_slot = cell.now;
        let ul = ue.alloc_ul_harq(pusch_slot, 4).unwrap();
        ul.save_grant_params(&UlHarqAllocContext::default(), &pusch(300));
        let dl = ue.alloc_dl_harq(cell.now, 0, 4, 0).unwrap();
        dl.save_grant_params(&DlHarqAllocContext::default(), &pdsch(700));

        assert_eq!(ul.ul_crc_info(false), UlCrcOutcome::Nacked);
        assert_eq!(dl.dl_ack_info(HarqAckStatus::Nack, None), HarqStatusUpdate::Nacked);
        assert!(ul.is_empty());
        assert!(dl.is_empty());
        assert!(cell.mgr.pending_ul_retxs().is_empty());
        assert!(cell.mgr.pending_dl_retxs().is_empty());
        assert_eq!(ue.ntn_ul_tbs(pusch_slot), Some(300));
        assert_eq!(ue.ntn_dl_tbs(cell.now), Some(700));
        assert_eq!(ue.total_ul_bytes_waiting_ack(), 300);

        let forced = ue.alloc_ul_harq(pusch_slot + 2, 4).unwrap();
        assert!(forced.set_pending_retx());
        assert!(forced.is_empty());
        assert!(cell.mgr.pending_ul_retxs().is_empty());

        cell.run(20);
        assert!(cell.events().is_empty());
        assert!(cell.mgr.pending_ul_retxs().is_empty());
        assert!(cell.mgr.pending_dl_retxs().is_empty());
        assert_eq!(ue.nof_empty_ul_harqs(), 16);
        assert_eq!(ue.nof_empty_dl_harqs(), 16);
    }

    #[test]
    fn test_notifier_may_release_ue_entity() {
        struct ReleaseOnTimeout {
            ue: Rc<RefCell<Option<UeHarqEntity>>>,
            empty_dl_at_release: Rc<RefCell<Vec<usize>>>,
        }

        impl HarqTimeoutNotifier for ReleaseOnTimeout {
            fn on_harq_timeout(&mut self, _ue_index: DuUeIndex, _is_dl: bool, _ack: bool) {
                if let Some(ue) = self.ue.borrow_mut().take() {
                    self.empty_dl_at_release.borrow_mut().push(ue.nof_empty_dl_harqs());
                }
            }
        }

        let holder: Rc<RefCell<Option<UeHarqEntity>>> = Rc::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let notifier = ReleaseOnTimeout {
            ue: Rc::clone(&holder),
            empty_dl_at_release: Rc::clone(&seen),
        };
        let mut now = start_slot();
        let mut mgr = CellHarqManager::new(test_config(), Box::new(notifier)).unwrap();
        mgr.slot_indication(now);

        let ue = mgr.add_ue(DuUeIndex(3), Rnti(0x4604), 16, 16).unwrap();
        ue.alloc_dl_harq(now, 4, 0, 0).unwrap();
        *holder.borrow_mut() = Some(ue);

        for _ in 0..(4 + 16) {
            now += 1;
            mgr.slot_indication(now);
        }
        assert_eq!(*seen.borrow(), vec![16]);
        assert!(holder.borrow().is_none());
        assert!(!mgr.contains(DuUeIndex(3)));
    }

    #[test]
    fn test_add_ue_errors() {
        let mut cell = TestCell::new(test_config(), start_slot());
        let _ue = cell.add_ue(0);
        assert_eq!(
            cell.mgr.add_ue(DuUeIndex(0), Rnti(0x4700), 8, 8).unwrap_err(),
            HarqError::UeAlreadyExists(DuUeIndex(0))
        );
        assert!(matches!(
            cell.mgr.add_ue(DuUeIndex(8), Rnti(0x4700), 8, 8),
            Err(HarqError::UeIndexOutOfRange { .. })
        ));
        assert!(matches!(
            cell.mgr.add_ue(DuUeIndex(1), Rnti(0x4701), 8, 0),
            Err(HarqError::InvalidHarqCount { requested: 0, .. })
        ));
        assert!(!cell.mgr.contains(DuUeIndex(1)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HarqConfig {
            max_harqs_per_ue: 0,
            ..Default::default()
        };
        assert!(CellHarqManager::new(config, Box::new(NoopHarqTimeoutNotifier)).is_err());
    }
}
