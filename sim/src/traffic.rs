//! Slot-driven HARQ traffic simulation
//!
//! Plays the scheduler around a [`CellHarqManager`]: every slot it ticks the
//! manager, delivers the HARQ-ACK and CRC reports due in that slot, serves the
//! pending retransmissions in FIFO order and then allocates new transmissions.
//! Feedback is drawn from a seeded RNG so runs are reproducible.

use crate::config::SimConfig;
use common::{DuUeIndex, Lcid, McsTable, RanSliceId, Rnti, SlotPoint};
use layers::mac::harq::{
    CellHarqManager, DciDlFormat, DciUlFormat, DlHarqAllocContext, DlHarqProcessHandle,
    HarqAckStatus, HarqStatusUpdate, HarqTimeoutNotifier, LcSchedInfo, PdschGrant, PuschGrant,
    UeHarqEntity, UlCrcOutcome, UlHarqAllocContext, VrbInterval,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, info, trace};

/// First C-RNTI handed out by the simulator
const FIRST_RNTI: u16 = 0x4601;

/// Counters of a simulation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    pub slots: u64,
    pub dl_new_txs: u64,
    pub dl_retxs: u64,
    pub dl_acked: u64,
    pub dl_nacked: u64,
    pub dl_acked_bytes: u64,
    pub dl_alloc_failures: u64,
    pub ul_new_txs: u64,
    pub ul_retxs: u64,
    pub ul_crc_ok: u64,
    pub ul_crc_ko: u64,
    pub ul_acked_bytes: u64,
    pub ul_alloc_failures: u64,
    pub uci_sched_failures: u64,
    pub stale_reports: u64,
    pub ue_releases: u64,
    pub timeouts: TimeoutStats,
    pub pending_dl_retxs: usize,
    pub pending_ul_retxs: usize,
}

/// Timeout notifications received from the HARQ manager
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimeoutStats {
    pub dl_ack: u64,
    pub dl_nack: u64,
    pub ul_ack: u64,
    pub ul_nack: u64,
}

/// Notifier sharing its counters with the simulation
#[derive(Debug, Clone, Default)]
struct TimeoutCounter {
    stats: Rc<RefCell<TimeoutStats>>,
}

impl HarqTimeoutNotifier for TimeoutCounter {
    fn on_harq_timeout(&mut self, ue_index: DuUeIndex, is_dl: bool, ack: bool) {
        trace!("HARQ timeout: ue={} dl={} ack={}", ue_index, is_dl, ack);
        let mut stats = self.stats.borrow_mut();
        match (is_dl, ack) {
            (true, true) => stats.dl_ack += 1,
            (true, false) => stats.dl_nack += 1,
            (false, true) => stats.ul_ack += 1,
            (false, false) => stats.ul_nack += 1,
        }
    }
}

/// Report expected from the simulated PHY
#[derive(Debug, Clone, Copy)]
enum Feedback {
    /// One decoded HARQ-ACK bit on a PUCCH
    DlAck {
        ue_index: DuUeIndex,
        rnti: Rnti,
        uci_slot: SlotPoint,
        harq_bit_idx: u8,
    },
    /// The UCI of a slot could not be scheduled
    UciDropped {
        ue_index: DuUeIndex,
        rnti: Rnti,
        uci_slot: SlotPoint,
    },
    /// CRC indication of a PUSCH
    UlCrc {
        ue_index: DuUeIndex,
        rnti: Rnti,
        pusch_slot: SlotPoint,
    },
}

impl Feedback {
    fn owner(&self) -> (DuUeIndex, Rnti) {
        match *self {
            Feedback::DlAck { ue_index, rnti, .. }
            | Feedback::UciDropped { ue_index, rnti, .. }
            | Feedback::UlCrc { ue_index, rnti, .. } => (ue_index, rnti),
        }
    }
}

/// Cell simulation state
pub struct TrafficSim {
    config: SimConfig,
    harq: CellHarqManager,
    ues: BTreeMap<DuUeIndex, UeHarqEntity>,
    feedback: Vec<(SlotPoint, Feedback)>,
    timeouts: Rc<RefCell<TimeoutStats>>,
    rng: StdRng,
    now: SlotPoint,
    next_rnti: u16,
    rr_offset: usize,
    /// HARQ-ACK bits already used in the current slot, per UE
    dl_bits: HashMap<DuUeIndex, u8>,
    /// UEs holding a PUSCH grant for the current slot
    ul_granted: HashSet<DuUeIndex>,
    stats: SimStats,
}

impl TrafficSim {
    /// Create the cell and register its initial UEs
    pub fn new(config: SimConfig, seed: u64) -> anyhow::Result<Self> {
        let numerology = config.scs()?.numerology();
        let timeouts = Rc::new(RefCell::new(TimeoutStats::default()));
        let notifier = TimeoutCounter {
            stats: Rc::clone(&timeouts),
        };
        let mut harq = CellHarqManager::new(config.harq.clone(), Box::new(notifier))?;

        let now = SlotPoint::new(numerology, 0, 0);
        harq.slot_indication(now);

        let mut sim = Self {
            config,
            harq,
            ues: BTreeMap::new(),
            feedback: Vec::new(),
            timeouts,
            rng: StdRng::seed_from_u64(seed),
            now,
            next_rnti: FIRST_RNTI,
            rr_offset: 0,
            dl_bits: HashMap::new(),
            ul_granted: HashSet::new(),
            stats: SimStats::default(),
        };
        for i in 0..sim.config.traffic.nof_ues {
            sim.add_ue(DuUeIndex(i))?;
        }
        info!(
            "HARQ simulation ready: {} UEs, numerology {}, start slot {}",
            sim.ues.len(),
            numerology,
            now
        );
        Ok(sim)
    }

    pub fn now(&self) -> SlotPoint {
        self.now
    }

    pub fn nof_ues(&self) -> usize {
        self.ues.len()
    }

    fn allocate_rnti(&mut self) -> Rnti {
        let rnti = Rnti::new(self.next_rnti);
        let next = Rnti::new(self.next_rnti.wrapping_add(1));
        self.next_rnti = if next.is_crnti() { next.value() } else { FIRST_RNTI };
        rnti
    }

    fn add_ue(&mut self, ue_index: DuUeIndex) -> anyhow::Result<()> {
        let rnti = self.allocate_rnti();
        let entity = self.harq.add_ue(
            ue_index,
            rnti,
            self.config.traffic.nof_dl_harqs,
            self.config.traffic.nof_ul_harqs,
        )?;
        debug!("UE {} added with rnti={}", ue_index, rnti);
        self.ues.insert(ue_index, entity);
        Ok(())
    }

    /// Run one slot
    pub fn step(&mut self) -> anyhow::Result<()> {
        self.now += 1;
        self.stats.slots += 1;
        self.harq.slot_indication(self.now);
        self.dl_bits.clear();
        self.ul_granted.clear();

        self.deliver_feedback();
        let dl_budget = self.serve_dl_retxs(self.config.cell.max_dl_grants_per_slot);
        let ul_budget = self.serve_ul_retxs(self.config.cell.max_ul_grants_per_slot);
        self.new_transmissions(dl_budget, ul_budget);
        self.churn()?;

        if self.now.slot_index() == 0 && self.now.sfn() % 100 == 0 {
            debug!(
                "slot {}: {} DL / {} UL retxs pending",
                self.now,
                self.harq.pending_dl_retxs().len(),
                self.harq.pending_ul_retxs().len()
            );
        }
        Ok(())
    }

    fn next_harq_bit(&mut self, ue_index: DuUeIndex) -> u8 {
        let bit = self.dl_bits.entry(ue_index).or_insert(0);
        let current = *bit;
        *bit += 1;
        current
    }

    fn deliver_feedback(&mut self) {
        let now = self.now;
        let (due, later): (Vec<_>, Vec<_>) = self.feedback.drain(..).partition(|(slot, _)| *slot == now);
        self.feedback = later;

        for (_, report) in due {
            let (ue_index, rnti) = report.owner();
            // The UE may have been released, or its index reused, since the grant
            let owner_alive = self.ues.get(&ue_index).is_some_and(|ue| ue.rnti() == rnti);
            let delivered = owner_alive && self.apply_feedback(ue_index, report);
            if !delivered {
                trace!("Dropping stale report {:?}", report);
                self.stats.stale_reports += 1;
            }
        }
    }

    /// Returns false if no process was waiting for the report
    fn apply_feedback(&mut self, ue_index: DuUeIndex, report: Feedback) -> bool {
        let Some(ue) = self.ues.get(&ue_index) else {
            return false;
        };
        match report {
            Feedback::DlAck {
                uci_slot,
                harq_bit_idx,
                ..
            } => {
                let Some(h) = ue.find_dl_harq_waiting_ack(uci_slot, harq_bit_idx) else {
                    return false;
                };
                let ack = if self.rng.gen_bool(self.config.traffic.ack_prob) {
                    HarqAckStatus::Ack
                } else {
                    HarqAckStatus::Nack
                };
                let snr = self.rng.gen_range(-5.0f32..25.0);
                let tbs = h.grant_params().map(|g| g.tbs_bytes).unwrap_or(0);
                match h.dl_ack_info(ack, Some(snr)) {
                    HarqStatusUpdate::Acked => {
                        self.stats.dl_acked += 1;
                        self.stats.dl_acked_bytes += u64::from(tbs);
                    }
                    HarqStatusUpdate::Nacked => self.stats.dl_nacked += 1,
                    HarqStatusUpdate::NoUpdate => {}
                    HarqStatusUpdate::Error => return false,
                }
                true
            }
            Feedback::UciDropped { uci_slot, .. } => {
                let nof_nacked = ue.uci_sched_failed(uci_slot);
                self.stats.uci_sched_failures += 1;
                self.stats.dl_nacked += nof_nacked as u64;
                nof_nacked > 0
            }
            Feedback::UlCrc { pusch_slot, .. } => {
                let Some(h) = ue.find_ul_harq_waiting_ack(pusch_slot) else {
                    return false;
                };
                let ok = self.rng.gen_bool(self.config.traffic.crc_ok_prob);
                match h.ul_crc_info(ok) {
                    UlCrcOutcome::Acked { tbs_bytes } => {
                        self.stats.ul_crc_ok += 1;
                        self.stats.ul_acked_bytes += u64::from(tbs_bytes);
                    }
                    UlCrcOutcome::Nacked => self.stats.ul_crc_ko += 1,
                    UlCrcOutcome::Error => return false,
                }
                true
            }
        }
    }

    /// Queue the HARQ-ACK reports of a DL transmission
    fn schedule_dl_feedback(&mut self, h: &DlHarqProcessHandle, rnti: Rnti) {
        let (Some(uci_slot), Some(harq_bit_idx)) = (h.uci_slot(), h.harq_bit_idx()) else {
            return;
        };
        let ue_index = h.ue_index();
        let traffic = &self.config.traffic;

        if self.rng.gen_bool(traffic.uci_drop_prob) {
            self.feedback.push((
                uci_slot,
                Feedback::UciDropped {
                    ue_index,
                    rnti,
                    uci_slot,
                },
            ));
            return;
        }

        let nof_pucchs = if self.rng.gen_bool(traffic.dual_pucch_prob) {
            h.increment_pucch_counter();
            h.increment_pucch_counter();
            2
        } else {
            1
        };
        for _ in 0..nof_pucchs {
            // A missing report is left to the HARQ timeout
            if self.rng.gen_bool(traffic.dtx_prob) {
                continue;
            }
            self.feedback.push((
                uci_slot,
                Feedback::DlAck {
                    ue_index,
                    rnti,
                    uci_slot,
                    harq_bit_idx,
                },
            ));
        }
    }

    fn schedule_ul_feedback(&mut self, ue_index: DuUeIndex, rnti: Rnti, pusch_slot: SlotPoint) {
        if self.rng.gen_bool(self.config.traffic.dtx_prob) {
            return;
        }
        self.feedback.push((
            pusch_slot,
            Feedback::UlCrc {
                ue_index,
                rnti,
                pusch_slot,
            },
        ));
    }

    /// Retransmit pending DL processes, oldest NACK first. Returns the grants left.
    fn serve_dl_retxs(&mut self, mut budget: usize) -> usize {
        let k1 = self.config.traffic.k1;
        let pending = self.harq.pending_dl_retxs();
        for h in &pending {
            if budget == 0 {
                break;
            }
            let ue_index = h.ue_index();
            let Some(rnti) = self.ues.get(&ue_index).map(|ue| ue.rnti()) else {
                continue;
            };
            let bit = self.next_harq_bit(ue_index);
            if h.new_retx(self.now, k1, bit) {
                self.stats.dl_retxs += 1;
                budget -= 1;
                self.schedule_dl_feedback(&h, rnti);
            }
        }
        budget
    }

    /// Retransmit pending UL processes, one PUSCH per UE. Returns the grants left.
    fn serve_ul_retxs(&mut self, mut budget: usize) -> usize {
        let pusch_slot = self.now + self.config.traffic.k2 as i32;
        let pending = self.harq.pending_ul_retxs();
        for h in &pending {
            if budget == 0 {
                break;
            }
            let ue_index = h.ue_index();
            if self.ul_granted.contains(&ue_index) {
                continue;
            }
            let Some(rnti) = self.ues.get(&ue_index).map(|ue| ue.rnti()) else {
                continue;
            };
            if h.new_retx(pusch_slot) {
                self.stats.ul_retxs += 1;
                budget -= 1;
                self.ul_granted.insert(ue_index);
                self.schedule_ul_feedback(ue_index, rnti, pusch_slot);
            }
        }
        budget
    }

    fn random_tbs(&mut self) -> u32 {
        let t = &self.config.traffic;
        self.rng.gen_range(t.min_tbs_bytes..=t.max_tbs_bytes)
    }

    fn random_mcs_table(&mut self) -> McsTable {
        match self.rng.gen_range(0..3) {
            0 => McsTable::Qam64,
            1 => McsTable::Qam256,
            _ => McsTable::Qam64LowSe,
        }
    }

    /// Allocate new DL and UL transmissions, visiting UEs round-robin
    fn new_transmissions(&mut self, mut dl_budget: usize, mut ul_budget: usize) {
        let ue_indexes: Vec<DuUeIndex> = self.ues.keys().copied().collect();
        if ue_indexes.is_empty() {
            return;
        }
        self.rr_offset = (self.rr_offset + 1) % ue_indexes.len();
        let k1 = self.config.traffic.k1;
        let max_retxs = self.config.traffic.max_harq_retxs;
        let pusch_slot = self.now + self.config.traffic.k2 as i32;

        for i in 0..ue_indexes.len() {
            if dl_budget == 0 && ul_budget == 0 {
                break;
            }
            let ue_index = ue_indexes[(self.rr_offset + i) % ue_indexes.len()];

            if dl_budget > 0 && self.rng.gen_bool(self.config.traffic.dl_traffic_prob) {
                let bit = self.next_harq_bit(ue_index);
                let allocated = self
                    .ues
                    .get(&ue_index)
                    .and_then(|ue| ue.alloc_dl_harq(self.now, k1, max_retxs, bit).map(|h| (h, ue.rnti())));
                match allocated {
                    Some((h, rnti)) => {
                        let tbs_bytes = self.random_tbs();
                        let ctx = DlHarqAllocContext {
                            dci_format: DciDlFormat::F1_1,
                            olla_mcs: Some(self.rng.gen_range(0..28)),
                            slice_id: Some(RanSliceId(0)),
                            is_fallback: false,
                        };
                        let grant = PdschGrant {
                            rbs: VrbInterval::new(0, 52),
                            mcs_table: self.random_mcs_table(),
                            mcs: self.rng.gen_range(0..28),
                            tbs_bytes,
                            nof_layers: 1,
                            lc_sched_info: vec![LcSchedInfo {
                                lcid: Lcid::MIN_DRB,
                                sched_bytes: tbs_bytes,
                            }],
                        };
                        h.save_grant_params(&ctx, &grant);
                        self.stats.dl_new_txs += 1;
                        dl_budget -= 1;
                        self.schedule_dl_feedback(&h, rnti);
                    }
                    None => self.stats.dl_alloc_failures += 1,
                }
            }

            if ul_budget > 0
                && !self.ul_granted.contains(&ue_index)
                && self.rng.gen_bool(self.config.traffic.ul_traffic_prob)
            {
                let allocated = self
                    .ues
                    .get(&ue_index)
                    .and_then(|ue| ue.alloc_ul_harq(pusch_slot, max_retxs).map(|h| (h, ue.rnti())));
                match allocated {
                    Some((h, rnti)) => {
                        let ctx = UlHarqAllocContext {
                            dci_format: DciUlFormat::F0_1,
                            olla_mcs: None,
                            slice_id: Some(RanSliceId(0)),
                        };
                        let grant = PuschGrant {
                            rbs: VrbInterval::new(0, 24),
                            mcs_table: McsTable::Qam64,
                            mcs: self.rng.gen_range(0..28),
                            tbs_bytes: self.random_tbs(),
                            nof_layers: 1,
                        };
                        h.save_grant_params(&ctx, &grant);
                        self.stats.ul_new_txs += 1;
                        ul_budget -= 1;
                        self.ul_granted.insert(ue_index);
                        self.schedule_ul_feedback(ue_index, rnti, pusch_slot);
                    }
                    None => self.stats.ul_alloc_failures += 1,
                }
            }
        }
    }

    /// Release one random UE and register a new one in its place
    fn churn(&mut self) -> anyhow::Result<()> {
        if self.ues.is_empty() || !self.rng.gen_bool(self.config.traffic.ue_churn_prob) {
            return Ok(());
        }
        let pick = self.rng.gen_range(0..self.ues.len());
        let Some(ue_index) = self.ues.keys().nth(pick).copied() else {
            return Ok(());
        };
        if let Some(ue) = self.ues.remove(&ue_index) {
            debug!(
                "Releasing UE {} rnti={} with {} UL bytes in flight",
                ue_index,
                ue.rnti(),
                ue.total_ul_bytes_waiting_ack()
            );
        }
        self.stats.ue_releases += 1;
        self.add_ue(ue_index)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> SimStats {
        let mut stats = self.stats.clone();
        stats.timeouts = *self.timeouts.borrow();
        stats.pending_dl_retxs = self.harq.pending_dl_retxs().len();
        stats.pending_ul_retxs = self.harq.pending_ul_retxs().len();
        stats
    }
}
