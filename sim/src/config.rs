//! Simulator configuration
//!
//! Loaded from a YAML file (or TOML, picked by the file extension). Every
//! section and field has a default, so an empty file is a valid configuration.

use common::SubcarrierSpacing;
use layers::mac::harq::{HarqConfig, MAX_FEEDBACK_DELAY_SLOTS};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level simulator configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimConfig {
    /// Cell configuration
    #[serde(default)]
    pub cell: CellConfig,
    /// HARQ configuration handed to the cell HARQ manager
    #[serde(default)]
    pub harq: HarqConfig,
    /// Traffic and channel model
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    /// Common subcarrier spacing in kHz
    #[serde(default = "default_common_scs")]
    pub common_scs: u32,
    /// PDSCH grants (new and retx) per slot
    #[serde(default = "default_grants_per_slot")]
    pub max_dl_grants_per_slot: usize,
    /// PUSCH grants (new and retx) per slot
    #[serde(default = "default_grants_per_slot")]
    pub max_ul_grants_per_slot: usize,
}

fn default_common_scs() -> u32 {
    30
}

fn default_grants_per_slot() -> usize {
    4
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            common_scs: default_common_scs(),
            max_dl_grants_per_slot: default_grants_per_slot(),
            max_ul_grants_per_slot: default_grants_per_slot(),
        }
    }
}

/// UE population, timing and feedback model
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    #[serde(default = "default_nof_ues")]
    pub nof_ues: u16,
    #[serde(default = "default_nof_harqs")]
    pub nof_dl_harqs: usize,
    #[serde(default = "default_nof_harqs")]
    pub nof_ul_harqs: usize,
    /// PDSCH to HARQ-ACK delay in slots
    #[serde(default = "default_k1")]
    pub k1: u32,
    /// PDCCH to PUSCH delay in slots
    #[serde(default = "default_k2")]
    pub k2: u32,
    #[serde(default = "default_max_harq_retxs")]
    pub max_harq_retxs: u8,
    /// Probability that a UE with a free process gets a new DL transmission in a slot
    #[serde(default = "default_dl_traffic_prob")]
    pub dl_traffic_prob: f64,
    /// Probability that a UE with a free process gets a new UL transmission in a slot
    #[serde(default = "default_ul_traffic_prob")]
    pub ul_traffic_prob: f64,
    /// Probability that a decoded HARQ-ACK bit is an ACK
    #[serde(default = "default_ack_prob")]
    pub ack_prob: f64,
    /// Probability that an expected report never arrives
    #[serde(default = "default_dtx_prob")]
    pub dtx_prob: f64,
    /// Probability that a PUSCH passes CRC
    #[serde(default = "default_crc_ok_prob")]
    pub crc_ok_prob: f64,
    /// Probability that a DL HARQ-ACK bit is carried by two PUCCHs
    #[serde(default = "default_dual_pucch_prob")]
    pub dual_pucch_prob: f64,
    /// Probability that the UCI of a slot cannot be scheduled
    #[serde(default = "default_uci_drop_prob")]
    pub uci_drop_prob: f64,
    /// Per-slot probability that one UE is released and replaced
    #[serde(default = "default_ue_churn_prob")]
    pub ue_churn_prob: f64,
    #[serde(default = "default_min_tbs_bytes")]
    pub min_tbs_bytes: u32,
    #[serde(default = "default_max_tbs_bytes")]
    pub max_tbs_bytes: u32,
}

fn default_nof_ues() -> u16 {
    8
}

fn default_nof_harqs() -> usize {
    16
}

fn default_k1() -> u32 {
    4
}

fn default_k2() -> u32 {
    4
}

fn default_max_harq_retxs() -> u8 {
    4
}

fn default_dl_traffic_prob() -> f64 {
    0.6
}

fn default_ul_traffic_prob() -> f64 {
    0.4
}

fn default_ack_prob() -> f64 {
    0.9
}

fn default_dtx_prob() -> f64 {
    0.02
}

fn default_crc_ok_prob() -> f64 {
    0.9
}

fn default_dual_pucch_prob() -> f64 {
    0.1
}

fn default_uci_drop_prob() -> f64 {
    0.01
}

fn default_ue_churn_prob() -> f64 {
    0.002
}

fn default_min_tbs_bytes() -> u32 {
    32
}

fn default_max_tbs_bytes() -> u32 {
    4096
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            nof_ues: default_nof_ues(),
            nof_dl_harqs: default_nof_harqs(),
            nof_ul_harqs: default_nof_harqs(),
            k1: default_k1(),
            k2: default_k2(),
            max_harq_retxs: default_max_harq_retxs(),
            dl_traffic_prob: default_dl_traffic_prob(),
            ul_traffic_prob: default_ul_traffic_prob(),
            ack_prob: default_ack_prob(),
            dtx_prob: default_dtx_prob(),
            crc_ok_prob: default_crc_ok_prob(),
            dual_pucch_prob: default_dual_pucch_prob(),
            uci_drop_prob: default_uci_drop_prob(),
            ue_churn_prob: default_ue_churn_prob(),
            min_tbs_bytes: default_min_tbs_bytes(),
            max_tbs_bytes: default_max_tbs_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// All layers log level
    #[serde(default = "default_log_level")]
    pub all_level: String,
    /// MAC layer log level
    #[serde(default = "default_log_level")]
    pub mac_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            all_level: default_log_level(),
            mac_level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Filter directive for `tracing_subscriber::EnvFilter`
    pub fn filter_directive(&self) -> String {
        format!("{},layers::mac={}", self.all_level, self.mac_level)
    }
}

impl SimConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SimConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SimConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load a YAML or TOML file depending on its extension
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config = match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_file(path)?,
            Some("yml") | Some("yaml") => Self::from_yaml_file(path)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unsupported configuration file extension {:?}: {}",
                    other,
                    path
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Subcarrier spacing of the cell
    pub fn scs(&self) -> anyhow::Result<SubcarrierSpacing> {
        SubcarrierSpacing::from_u32(self.cell.common_scs)
            .ok_or_else(|| anyhow::anyhow!("Invalid subcarrier spacing: {} kHz", self.cell.common_scs))
    }

    /// Check cross-section constraints not covered by the HARQ configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scs()?;
        self.harq.validate()?;

        let t = &self.traffic;
        if t.nof_ues == 0 || t.nof_ues > self.harq.max_ues {
            return Err(anyhow::anyhow!(
                "nof_ues={} outside 1..={}",
                t.nof_ues,
                self.harq.max_ues
            ));
        }
        for (name, k) in [("k1", t.k1), ("k2", t.k2)] {
            if k == 0 || k > MAX_FEEDBACK_DELAY_SLOTS {
                return Err(anyhow::anyhow!(
                    "{}={} outside 1..={}",
                    name,
                    k,
                    MAX_FEEDBACK_DELAY_SLOTS
                ));
            }
        }
        let probabilities = [
            ("dl_traffic_prob", t.dl_traffic_prob),
            ("ul_traffic_prob", t.ul_traffic_prob),
            ("ack_prob", t.ack_prob),
            ("dtx_prob", t.dtx_prob),
            ("crc_ok_prob", t.crc_ok_prob),
            ("dual_pucch_prob", t.dual_pucch_prob),
            ("uci_drop_prob", t.uci_drop_prob),
            ("ue_churn_prob", t.ue_churn_prob),
        ];
        for (name, p) in probabilities {
            if !(0.0..=1.0).contains(&p) {
                return Err(anyhow::anyhow!("{}={} is not a probability", name, p));
            }
        }
        if t.min_tbs_bytes == 0 || t.min_tbs_bytes > t.max_tbs_bytes {
            return Err(anyhow::anyhow!(
                "Invalid TBS range {}..={}",
                t.min_tbs_bytes,
                t.max_tbs_bytes
            ));
        }
        if self.cell.max_dl_grants_per_slot == 0 && self.cell.max_ul_grants_per_slot == 0 {
            return Err(anyhow::anyhow!("No DL or UL grants per slot configured"));
        }
        Ok(())
    }
}
