//! HARQ configuration
//!
//! Fixed at manager construction. Deserializable so it can sit inside the
//! application's YAML/TOML configuration.

use super::{
    HARQ_DISABLED_FLUSH_SLOTS, MAX_FEEDBACK_DELAY_SLOTS, MAX_NOF_HARQS, MAX_TIMEOUT_WHEEL_SIZE,
    SHORT_ACK_TIMEOUT_DTX,
};
use crate::LayerError;
use common::next_power_of_2;
use serde::{Deserialize, Serialize};

/// Cell-wide HARQ configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HarqConfig {
    /// Maximum number of UEs in the cell
    #[serde(default = "default_max_ues")]
    pub max_ues: u16,
    /// Maximum number of HARQ processes per UE and direction
    #[serde(default = "default_max_harqs_per_ue")]
    pub max_harqs_per_ue: u8,
    /// Slots a DL process may stay pending retransmission before it is discarded
    #[serde(default = "default_harq_retx_timeout")]
    pub dl_harq_retx_timeout: u32,
    /// Slots a UL process may stay pending retransmission before it is discarded
    #[serde(default = "default_harq_retx_timeout")]
    pub ul_harq_retx_timeout: u32,
    /// Slots after the expected feedback slot before a missing ACK is assumed
    #[serde(default = "default_max_ack_wait_in_slots")]
    pub max_ack_wait_in_slots: u32,
    /// NTN cell-specific K_offset, in slots
    #[serde(default)]
    pub ntn_cs_koffset: u32,
    /// DL HARQ feedback disabled (NTN)
    #[serde(default)]
    pub dl_harq_disabled: bool,
    /// UL HARQ feedback disabled (NTN)
    #[serde(default)]
    pub ul_harq_disabled: bool,
}

fn default_max_ues() -> u16 {
    1024
}

fn default_max_harqs_per_ue() -> u8 {
    16
}

fn default_harq_retx_timeout() -> u32 {
    100
}

fn default_max_ack_wait_in_slots() -> u32 {
    256
}

impl Default for HarqConfig {
    fn default() -> Self {
        Self {
            max_ues: default_max_ues(),
            max_harqs_per_ue: default_max_harqs_per_ue(),
            dl_harq_retx_timeout: default_harq_retx_timeout(),
            ul_harq_retx_timeout: default_harq_retx_timeout(),
            max_ack_wait_in_slots: default_max_ack_wait_in_slots(),
            ntn_cs_koffset: 0,
            dl_harq_disabled: false,
            ul_harq_disabled: false,
        }
    }
}

impl HarqConfig {
    /// Check the configuration against the limits of the HARQ repositories
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.max_ues == 0 {
            return Err(LayerError::InvalidConfiguration(
                "max_ues must be at least 1".into(),
            ));
        }
        let max_harqs = self.max_harqs_per_ue as usize;
        if max_harqs == 0 || max_harqs > MAX_NOF_HARQS {
            return Err(LayerError::InvalidConfiguration(format!(
                "max_harqs_per_ue={} outside 1..={}",
                self.max_harqs_per_ue, MAX_NOF_HARQS
            )));
        }
        if self.max_ack_wait_in_slots == 0 {
            return Err(LayerError::InvalidConfiguration(
                "max_ack_wait_in_slots must be at least 1".into(),
            ));
        }
        if self.dl_harq_retx_timeout == 0 || self.ul_harq_retx_timeout == 0 {
            return Err(LayerError::InvalidConfiguration(
                "HARQ retx timeouts must be at least 1 slot".into(),
            ));
        }
        for is_dl in [true, false] {
            let horizon = self.timeout_horizon(is_dl);
            if horizon as usize >= MAX_TIMEOUT_WHEEL_SIZE {
                return Err(LayerError::InvalidConfiguration(format!(
                    "{} HARQ timeout horizon of {} slots exceeds the wheel limit of {} slots",
                    if is_dl { "DL" } else { "UL" },
                    horizon,
                    MAX_TIMEOUT_WHEEL_SIZE
                )));
            }
        }
        Ok(())
    }

    /// Whether HARQ feedback is disabled for a direction
    pub fn harq_disabled(&self, is_dl: bool) -> bool {
        if is_dl {
            self.dl_harq_disabled
        } else {
            self.ul_harq_disabled
        }
    }

    /// Retx-pending timeout for a direction
    pub fn harq_retx_timeout(&self, is_dl: bool) -> u32 {
        if is_dl {
            self.dl_harq_retx_timeout
        } else {
            self.ul_harq_retx_timeout
        }
    }

    /// Slots between the feedback slot and the ACK-wait timeout
    pub fn ack_wait_in_slots(&self, is_dl: bool) -> u32 {
        if self.harq_disabled(is_dl) {
            HARQ_DISABLED_FLUSH_SLOTS
        } else {
            self.max_ack_wait_in_slots + self.ntn_cs_koffset
        }
    }

    /// Furthest distance from the current slot at which a timeout may be armed
    pub fn timeout_horizon(&self, is_dl: bool) -> u32 {
        let wait = self
            .ack_wait_in_slots(is_dl)
            .max(self.harq_retx_timeout(is_dl))
            .max(SHORT_ACK_TIMEOUT_DTX);
        wait + MAX_FEEDBACK_DELAY_SLOTS
    }

    /// Number of buckets of the timeout wheel for a direction
    pub fn timeout_wheel_size(&self, is_dl: bool) -> usize {
        next_power_of_2(self.timeout_horizon(is_dl) + 1) as usize
    }
}
