//! UE HARQ entity
//!
//! The per-UE face of the cell repositories. Created by
//! [`CellHarqManager::add_ue`](super::CellHarqManager::add_ue); dropping it
//! empties and releases every HARQ process of the UE in both directions.

use super::handle::{DlHarqProcessHandle, HarqHandle, UlHarqProcessHandle};
use super::process::{Dl, Ul};
use super::repository::{DlHarqRepository, UeHarqTable, UlHarqRepository};
use super::HarqRef;
use common::{DuUeIndex, HarqId, Rnti, SlotPoint};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// HARQ processes of one UE, both directions
pub struct UeHarqEntity {
    ue_index: DuUeIndex,
    rnti: Rnti,
    dl: Rc<RefCell<DlHarqRepository>>,
    ul: Rc<RefCell<UlHarqRepository>>,
    released: bool,
}

impl fmt::Debug for UeHarqEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UeHarqEntity")
            .field("ue_index", &self.ue_index)
            .field("rnti", &self.rnti)
            .field("released", &self.released)
            .finish()
    }
}

impl UeHarqEntity {
    pub(crate) fn new(
        ue_index: DuUeIndex,
        rnti: Rnti,
        dl: Rc<RefCell<DlHarqRepository>>,
        ul: Rc<RefCell<UlHarqRepository>>,
    ) -> Self {
        Self {
            ue_index,
            rnti,
            dl,
            ul,
            released: false,
        }
    }

    pub fn ue_index(&self) -> DuUeIndex {
        self.ue_index
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Empty and release every HARQ process of the UE. Idempotent.
    pub fn reset(&mut self) {
        if self.released {
            return;
        }
        self.dl.borrow_mut().destroy_ue(self.ue_index);
        self.ul.borrow_mut().destroy_ue(self.ue_index);
        self.released = true;
        debug!("HARQ entity of ue={} rnti={} released", self.ue_index, self.rnti);
    }

    pub fn nof_dl_harqs(&self) -> usize {
        self.dl_table(|t| t.nof_harqs()).unwrap_or(0)
    }

    pub fn nof_ul_harqs(&self) -> usize {
        self.ul_table(|t| t.nof_harqs()).unwrap_or(0)
    }

    pub fn nof_empty_dl_harqs(&self) -> usize {
        self.dl_table(|t| t.nof_empty_harqs()).unwrap_or(0)
    }

    pub fn nof_empty_ul_harqs(&self) -> usize {
        self.ul_table(|t| t.nof_empty_harqs()).unwrap_or(0)
    }

    /// PDSCH slot of the most recent new DL transmission
    pub fn last_dl_tx_slot(&self) -> Option<SlotPoint> {
        self.dl_table(|t| t.last_tx_slot()).flatten()
    }

    /// PUSCH slot of the most recent new UL transmission
    pub fn last_ul_tx_slot(&self) -> Option<SlotPoint> {
        self.ul_table(|t| t.last_tx_slot()).flatten()
    }

    /// Start a new DL transmission on a free process
    pub fn alloc_dl_harq(
        &self,
        pdsch_slot: SlotPoint,
        k1: u32,
        max_harq_retxs: u8,
        harq_bit_idx: u8,
    ) -> Option<DlHarqProcessHandle> {
        if self.released {
            return None;
        }
        let r = self.dl.borrow_mut().alloc_dl_harq(
            self.ue_index,
            pdsch_slot,
            k1,
            max_harq_retxs,
            harq_bit_idx,
        )?;
        HarqHandle::bind(&self.dl, r)
    }

    /// Start a new UL transmission on a free process
    pub fn alloc_ul_harq(&self, pusch_slot: SlotPoint, max_harq_retxs: u8) -> Option<UlHarqProcessHandle> {
        if self.released {
            return None;
        }
        let r = self
            .ul
            .borrow_mut()
            .alloc_harq(self.ue_index, pusch_slot, pusch_slot, max_harq_retxs)?;
        HarqHandle::bind(&self.ul, r)
    }

    /// Handle to a busy DL process; `None` if the process is empty
    pub fn dl_harq(&self, h_id: HarqId) -> Option<DlHarqProcessHandle> {
        if self.released {
            return None;
        }
        HarqHandle::bind(&self.dl, HarqRef::new(self.ue_index, h_id))
    }

    /// Handle to a busy UL process; `None` if the process is empty
    pub fn ul_harq(&self, h_id: HarqId) -> Option<UlHarqProcessHandle> {
        if self.released {
            return None;
        }
        HarqHandle::bind(&self.ul, HarqRef::new(self.ue_index, h_id))
    }

    pub fn find_pending_dl_retx(&self) -> Option<DlHarqProcessHandle> {
        if self.released {
            return None;
        }
        let r = self.dl.borrow().find_pending_retx(self.ue_index)?;
        HarqHandle::bind(&self.dl, r)
    }

    pub fn find_pending_ul_retx(&self) -> Option<UlHarqProcessHandle> {
        if self.released {
            return None;
        }
        let r = self.ul.borrow().find_pending_retx(self.ue_index)?;
        HarqHandle::bind(&self.ul, r)
    }

    /// DL process whose HARQ-ACK is carried in bit `harq_bit_idx` of the UCI at `uci_slot`
    pub fn find_dl_harq_waiting_ack(&self, uci_slot: SlotPoint, harq_bit_idx: u8) -> Option<DlHarqProcessHandle> {
        if self.released {
            return None;
        }
        let r = self
            .dl
            .borrow()
            .find_dl_harq_waiting_ack(self.ue_index, uci_slot, harq_bit_idx)?;
        HarqHandle::bind(&self.dl, r)
    }

    /// UL process whose PUSCH is scheduled at `pusch_slot`
    pub fn find_ul_harq_waiting_ack(&self, pusch_slot: SlotPoint) -> Option<UlHarqProcessHandle> {
        if self.released {
            return None;
        }
        let r = self
            .ul
            .borrow()
            .find_ul_harq_waiting_ack(self.ue_index, pusch_slot)?;
        HarqHandle::bind(&self.ul, r)
    }

    /// NACK the DL processes whose UCI at `uci_slot` could not be scheduled.
    /// Returns how many processes were affected.
    pub fn uci_sched_failed(&self, uci_slot: SlotPoint) -> usize {
        if self.released {
            return 0;
        }
        self.dl.borrow_mut().uci_sched_failed(self.ue_index, uci_slot)
    }

    /// UL bytes granted but not yet confirmed by a CRC
    pub fn total_ul_bytes_waiting_ack(&self) -> u32 {
        if self.released {
            return 0;
        }
        self.ul.borrow().total_bytes_waiting_ack(self.ue_index)
    }

    /// TBS of a flushed HARQ-disabled DL transmission acked at `uci_slot`
    pub fn ntn_dl_tbs(&self, uci_slot: SlotPoint) -> Option<u32> {
        if self.released {
            return None;
        }
        self.dl.borrow().ntn_tbs(self.ue_index, uci_slot)
    }

    /// TBS of a flushed HARQ-disabled UL transmission at `pusch_slot`
    pub fn ntn_ul_tbs(&self, pusch_slot: SlotPoint) -> Option<u32> {
        if self.released {
            return None;
        }
        self.ul.borrow().ntn_tbs(self.ue_index, pusch_slot)
    }

    fn dl_table<R>(&self, f: impl FnOnce(&UeHarqTable<Dl>) -> R) -> Option<R> {
        if self.released {
            return None;
        }
        self.dl.borrow().ue(self.ue_index).map(f)
    }

    fn ul_table<R>(&self, f: impl FnOnce(&UeHarqTable<Ul>) -> R) -> Option<R> {
        if self.released {
            return None;
        }
        self.ul.borrow().ue(self.ue_index).map(f)
    }
}

impl Drop for UeHarqEntity {
    fn drop(&mut self) {
        self.reset();
    }
}
