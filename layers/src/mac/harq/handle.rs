//! HARQ process handles
//!
//! A handle names a process by `(ue, h_id)` plus the epoch of the transmission
//! it was obtained for. Every call looks the record up again and checks that
//! epoch, so a handle kept past the life of its transmission reads as empty
//! and cannot alter a process that has since been reused.
//!
//! Handles are meant to live for the slot in which they were obtained.

use super::grant::{DlHarqAllocContext, DlHarqGrantParams, PdschGrant, PuschGrant, UlHarqAllocContext, UlHarqGrantParams};
use super::process::{Dl, HarqDirection, HarqProcess, Ul};
use super::repository::CellHarqRepository;
use super::{HarqAckStatus, HarqRef, HarqState, HarqStatusUpdate, UlCrcOutcome};
use common::{DuUeIndex, HarqId, Rnti, SlotPoint};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Handle to a DL HARQ process
pub type DlHarqProcessHandle = HarqHandle<Dl>;
/// Handle to a UL HARQ process
pub type UlHarqProcessHandle = HarqHandle<Ul>;

/// Non-owning view of one HARQ process
pub struct HarqHandle<D: HarqDirection> {
    repo: Rc<RefCell<CellHarqRepository<D>>>,
    harq_ref: HarqRef,
    epoch: u64,
}

impl<D: HarqDirection> Clone for HarqHandle<D> {
    fn clone(&self) -> Self {
        Self {
            repo: Rc::clone(&self.repo),
            harq_ref: self.harq_ref,
            epoch: self.epoch,
        }
    }
}

impl<D: HarqDirection> fmt::Debug for HarqHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarqHandle")
            .field("dir", &D::NAME)
            .field("ue_index", &self.harq_ref.ue_index)
            .field("h_id", &self.harq_ref.h_id)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl<D: HarqDirection> PartialEq for HarqHandle<D> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.repo, &other.repo) && self.harq_ref == other.harq_ref && self.epoch == other.epoch
    }
}

impl<D: HarqDirection> HarqHandle<D> {
    /// Bind a handle to the transmission currently held by a non-empty record
    pub(crate) fn bind(repo: &Rc<RefCell<CellHarqRepository<D>>>, harq_ref: HarqRef) -> Option<Self> {
        let epoch = {
            let r = repo.borrow();
            let h = r.harq(harq_ref)?;
            if h.state() == HarqState::Empty {
                return None;
            }
            h.epoch
        };
        Some(Self {
            repo: Rc::clone(repo),
            harq_ref,
            epoch,
        })
    }

    fn read<R>(&self, f: impl FnOnce(&HarqProcess<D::Extra>) -> R) -> Option<R> {
        let repo = self.repo.borrow();
        repo.harq_in_epoch(self.harq_ref, self.epoch).map(f)
    }

    /// Run a mutation only if the handle still refers to a live transmission
    fn modify<R>(&self, stale: R, f: impl FnOnce(&mut CellHarqRepository<D>, HarqRef) -> R) -> R {
        let mut repo = self.repo.borrow_mut();
        if !repo.is_current(self.harq_ref, self.epoch) {
            return stale;
        }
        f(&mut *repo, self.harq_ref)
    }

    pub fn harq_ref(&self) -> HarqRef {
        self.harq_ref
    }

    pub fn ue_index(&self) -> DuUeIndex {
        self.harq_ref.ue_index
    }

    pub fn id(&self) -> HarqId {
        self.harq_ref.h_id
    }

    pub fn rnti(&self) -> Option<Rnti> {
        self.read(|h| h.rnti())
    }

    /// Current state; `Empty` once the transmission behind the handle is gone
    pub fn state(&self) -> HarqState {
        self.read(|h| h.state()).unwrap_or(HarqState::Empty)
    }

    pub fn is_empty(&self) -> bool {
        self.state() == HarqState::Empty
    }

    pub fn is_waiting_ack(&self) -> bool {
        self.state() == HarqState::WaitingAck
    }

    pub fn has_pending_retx(&self) -> bool {
        self.state() == HarqState::PendingRetx
    }

    pub fn ndi(&self) -> Option<bool> {
        self.read(|h| h.ndi())
    }

    pub fn nof_retxs(&self) -> Option<u8> {
        self.read(|h| h.nof_retxs())
    }

    pub fn max_nof_retxs(&self) -> Option<u8> {
        self.read(|h| h.max_nof_harq_retxs())
    }

    pub fn is_last_retx(&self) -> bool {
        self.read(|h| h.is_last_retx()).unwrap_or(false)
    }

    pub fn tx_slot(&self) -> Option<SlotPoint> {
        self.read(|h| h.slot_tx())
    }

    pub fn ack_slot(&self) -> Option<SlotPoint> {
        self.read(|h| h.slot_ack())
    }

    pub fn timeout_slot(&self) -> Option<SlotPoint> {
        self.read(|h| h.slot_timeout())
    }

    pub fn retxs_cancelled(&self) -> bool {
        self.read(|h| h.retxs_cancelled()).unwrap_or(false)
    }

    /// Force the process into pending retransmission (or discard it if no retx is left)
    pub fn set_pending_retx(&self) -> bool {
        self.modify(false, |repo, r| repo.set_pending_retx(r))
    }

    pub fn cancel_retxs(&self) -> bool {
        self.modify(false, |repo, r| repo.cancel_retxs(r))
    }

    /// Free the process regardless of its state
    pub fn reset(&self) -> bool {
        self.modify(false, |repo, r| repo.dealloc_harq(r))
    }
}

impl HarqHandle<Dl> {
    /// Retransmit on a PDSCH at `pdsch_slot` with the ACK expected `k1` slots later
    pub fn new_retx(&self, pdsch_slot: SlotPoint, k1: u32, harq_bit_idx: u8) -> bool {
        self.modify(false, |repo, r| repo.handle_dl_new_retx(r, pdsch_slot, k1, harq_bit_idx))
    }

    pub fn increment_pucch_counter(&self) -> bool {
        self.modify(false, |repo, r| repo.increment_pucch_counter(r))
    }

    /// Feed a decoded HARQ-ACK bit for this process
    pub fn dl_ack_info(&self, ack: HarqAckStatus, pucch_snr: Option<f32>) -> HarqStatusUpdate {
        self.modify(HarqStatusUpdate::Error, |repo, r| repo.handle_dl_ack_info(r, ack, pucch_snr))
    }

    pub fn save_grant_params(&self, ctx: &DlHarqAllocContext, grant: &PdschGrant) -> bool {
        self.modify(false, |repo, r| repo.save_dl_grant_params(r, ctx, grant))
    }

    pub fn grant_params(&self) -> Option<DlHarqGrantParams> {
        self.read(|h| h.extra().grant.clone()).flatten()
    }

    pub fn harq_bit_idx(&self) -> Option<u8> {
        self.read(|h| h.extra().harq_bit_idx)
    }

    pub fn pdsch_slot(&self) -> Option<SlotPoint> {
        self.tx_slot()
    }

    pub fn uci_slot(&self) -> Option<SlotPoint> {
        self.ack_slot()
    }

    pub fn last_pucch_snr(&self) -> Option<f32> {
        self.read(|h| h.extra().last_pucch_snr).flatten()
    }

    pub fn pucch_ack_to_receive(&self) -> Option<u8> {
        self.read(|h| h.extra().pucch_ack_to_receive)
    }
}

impl HarqHandle<Ul> {
    /// Retransmit on a PUSCH at `pusch_slot`
    pub fn new_retx(&self, pusch_slot: SlotPoint) -> bool {
        self.modify(false, |repo, r| repo.handle_new_retx(r, pusch_slot, pusch_slot))
    }

    /// Feed the CRC result of the PUSCH carrying this process
    pub fn ul_crc_info(&self, ok: bool) -> UlCrcOutcome {
        self.modify(UlCrcOutcome::Error, |repo, r| repo.handle_ul_crc_info(r, ok))
    }

    pub fn save_grant_params(&self, ctx: &UlHarqAllocContext, grant: &PuschGrant) -> bool {
        self.modify(false, |repo, r| repo.save_ul_grant_params(r, ctx, grant))
    }

    pub fn grant_params(&self) -> Option<UlHarqGrantParams> {
        self.read(|h| h.extra().grant.clone()).flatten()
    }

    pub fn pusch_slot(&self) -> Option<SlotPoint> {
        self.tx_slot()
    }
}
