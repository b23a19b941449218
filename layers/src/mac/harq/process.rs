//! HARQ process record
//!
//! One record per HARQ id, per UE, per direction. Records are created when a
//! UE table is reserved and live until the UE is destroyed; between
//! transmissions they sit `Empty` and keep their NDI so the next new
//! transmission can toggle it.

use super::grant::{DlHarqGrantParams, UlHarqGrantParams};
use super::list::{ListKind, ListLinks};
use super::{HarqAckStatus, HarqState};
use common::{DuUeIndex, HarqId, Rnti, SlotPoint};
use std::fmt;

/// Direction-specific part of the HARQ machinery
pub trait HarqDirection: fmt::Debug + 'static {
    /// True for downlink
    const IS_DL: bool;
    /// Short name used in logs
    const NAME: &'static str;
    /// Payload kept on top of the common record fields
    type Extra: Default + Clone + fmt::Debug;

    /// Clear feedback bookkeeping before a (re)transmission
    fn reset_feedback(extra: &mut Self::Extra);

    /// Transport block size of the last saved grant
    fn tbs_bytes(extra: &Self::Extra) -> Option<u32>;
}

/// Downlink marker
#[derive(Debug, Clone, Copy)]
pub enum Dl {}

/// Uplink marker
#[derive(Debug, Clone, Copy)]
pub enum Ul {}

/// DL process payload: PUCCH feedback tracking and last grant
#[derive(Debug, Clone, Default)]
pub struct DlHarqExtra {
    /// PUCCH occasions still expected to carry this process's ACK bit
    pub pucch_ack_to_receive: u8,
    /// Strongest HARQ-ACK value reported so far
    pub chosen_ack: HarqAckStatus,
    /// SNR of the PUCCH that produced `chosen_ack`
    pub last_pucch_snr: Option<f32>,
    /// Bit position of this process in the UCI HARQ-ACK codebook
    pub harq_bit_idx: u8,
    pub grant: Option<DlHarqGrantParams>,
}

impl DlHarqExtra {
    /// Merge one more report into `chosen_ack`. Stronger values win
    /// (ack > nack > dtx); for equal values the higher SNR is kept.
    pub(crate) fn combine_ack(&mut self, ack: HarqAckStatus, pucch_snr: Option<f32>) {
        use std::cmp::Ordering;

        match ack.strength().cmp(&self.chosen_ack.strength()) {
            Ordering::Greater => {
                self.chosen_ack = ack;
                self.last_pucch_snr = pucch_snr;
            }
            Ordering::Equal => {
                if let Some(snr) = pucch_snr {
                    if self.last_pucch_snr.map_or(true, |prev| snr > prev) {
                        self.last_pucch_snr = Some(snr);
                    }
                }
            }
            Ordering::Less => {}
        }
    }
}

/// UL process payload
#[derive(Debug, Clone, Default)]
pub struct UlHarqExtra {
    pub grant: Option<UlHarqGrantParams>,
}

impl HarqDirection for Dl {
    const IS_DL: bool = true;
    const NAME: &'static str = "DL";
    type Extra = DlHarqExtra;

    fn reset_feedback(extra: &mut DlHarqExtra) {
        extra.pucch_ack_to_receive = 0;
        extra.chosen_ack = HarqAckStatus::Dtx;
        extra.last_pucch_snr = None;
    }

    fn tbs_bytes(extra: &DlHarqExtra) -> Option<u32> {
        extra.grant.as_ref().map(|g| g.tbs_bytes)
    }
}

impl HarqDirection for Ul {
    const IS_DL: bool = false;
    const NAME: &'static str = "UL";
    type Extra = UlHarqExtra;

    fn reset_feedback(_extra: &mut UlHarqExtra) {}

    fn tbs_bytes(extra: &UlHarqExtra) -> Option<u32> {
        extra.grant.as_ref().map(|g| g.tbs_bytes)
    }
}

/// State of one HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess<E> {
    pub(crate) ue_index: DuUeIndex,
    pub(crate) rnti: Rnti,
    pub(crate) h_id: HarqId,
    pub(crate) state: HarqState,
    pub(crate) slot_tx: SlotPoint,
    pub(crate) slot_ack: SlotPoint,
    pub(crate) slot_timeout: SlotPoint,
    pub(crate) ndi: bool,
    pub(crate) nof_retxs: u8,
    pub(crate) max_nof_harq_retxs: u8,
    pub(crate) ack_on_timeout: bool,
    pub(crate) retxs_cancelled: bool,
    /// Stamp of the new transmission currently occupying the record
    pub(crate) epoch: u64,
    /// Queue position in the pending-retx list, increasing with every NACK
    pub(crate) pending_seq: u64,
    pub(crate) pending_link: ListLinks,
    pub(crate) timeout_link: ListLinks,
    pub(crate) extra: E,
}

impl<E: Default> HarqProcess<E> {
    pub(crate) fn new(ue_index: DuUeIndex, rnti: Rnti, h_id: HarqId) -> Self {
        Self {
            ue_index,
            rnti,
            h_id,
            state: HarqState::Empty,
            slot_tx: SlotPoint::default(),
            slot_ack: SlotPoint::default(),
            slot_timeout: SlotPoint::default(),
            ndi: false,
            nof_retxs: 0,
            max_nof_harq_retxs: 0,
            ack_on_timeout: false,
            retxs_cancelled: false,
            epoch: 0,
            pending_seq: 0,
            pending_link: ListLinks::default(),
            timeout_link: ListLinks::default(),
            extra: E::default(),
        }
    }
}

impl<E> HarqProcess<E> {
    pub fn ue_index(&self) -> DuUeIndex {
        self.ue_index
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn id(&self) -> HarqId {
        self.h_id
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    pub fn slot_tx(&self) -> SlotPoint {
        self.slot_tx
    }

    pub fn slot_ack(&self) -> SlotPoint {
        self.slot_ack
    }

    pub fn slot_timeout(&self) -> SlotPoint {
        self.slot_timeout
    }

    pub fn ndi(&self) -> bool {
        self.ndi
    }

    pub fn nof_retxs(&self) -> u8 {
        self.nof_retxs
    }

    pub fn max_nof_harq_retxs(&self) -> u8 {
        self.max_nof_harq_retxs
    }

    pub fn ack_on_timeout(&self) -> bool {
        self.ack_on_timeout
    }

    pub fn retxs_cancelled(&self) -> bool {
        self.retxs_cancelled
    }

    pub fn extra(&self) -> &E {
        &self.extra
    }

    /// Whether the current transmission is the last one allowed
    pub fn is_last_retx(&self) -> bool {
        self.nof_retxs >= self.max_nof_harq_retxs
    }

    pub(crate) fn links(&self, kind: ListKind) -> &ListLinks {
        match kind {
            ListKind::PendingRetx => &self.pending_link,
            ListKind::Timeout => &self.timeout_link,
        }
    }

    pub(crate) fn links_mut(&mut self, kind: ListKind) -> &mut ListLinks {
        match kind {
            ListKind::PendingRetx => &mut self.pending_link,
            ListKind::Timeout => &mut self.timeout_link,
        }
    }
}
