//! Pod State Record: the in-memory, persisted view of the last-known pod state.
//!
//! Field layout for the two wire-decoded response frames (`handle_status_response`,
//! `handle_information_response`) is firmware-defined and was not available to this crate (see
//! `DESIGN.md`); the layouts below are a plausible reconstruction sufficient to drive the
//! Command Layer's post-checks and this module's own tests.

use serde::{Deserialize, Serialize};

/// Fixed-point insulin amount, hundredths of a unit (1 U = 100).
pub type Hundredths = u32;

/// Same scale as [`Hundredths`], but signed so `-1` can carry the user-cancel sentinel.
pub type EnactedAmount = i32;

/// Fixed-point hour duration, tenths of an hour (1 h = 10).
pub type EnactedTenths = i32;

/// Sentinel written into an enacted-amount/duration field after a cancel.
pub const CANCELLED: i32 = -1;

pub const BASAL_SCHEDULE_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Progress {
    Inactive,
    PairingSuccess,
    Purged,
    ReadyForInjection,
    PrimingCompleted,
    BasalScheduleSet,
    Running,
    RunningLow,
    ErrorShuttingDown,
    AlertExpiredShuttingDown,
    Inactive2,
}

impl Progress {
    fn from_wire(value: u8) -> Self {
        match value {
            0 => Progress::Inactive,
            1 => Progress::PairingSuccess,
            2 => Progress::Purged,
            3 => Progress::ReadyForInjection,
            4 => Progress::PrimingCompleted,
            5 => Progress::BasalScheduleSet,
            6 => Progress::Running,
            7 => Progress::RunningLow,
            8 => Progress::ErrorShuttingDown,
            9 => Progress::AlertExpiredShuttingDown,
            _ => Progress::Inactive2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusState {
    NotRunning,
    Extended,
    Immediate,
}

impl BolusState {
    fn from_wire(value: u8) -> Self {
        match value {
            1 => BolusState::Extended,
            2 => BolusState::Immediate,
            _ => BolusState::NotRunning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasalState {
    NotRunning,
    TempBasal,
    Program,
}

impl BasalState {
    fn from_wire(value: u8) -> Self {
        match value {
            1 => BasalState::TempBasal,
            2 => BasalState::Program,
            _ => BasalState::NotRunning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRecord {
    // Identity
    pub lot: u32,
    pub tid: u32,
    pub address: Option<u32>,

    // Session
    pub msg_sequence: u8,
    pub packet_sequence: u8,
    pub last_nonce: u32,
    pub nonce_seed: u16,

    // Progress / sub-state
    pub progress: Progress,
    pub bolus_state: BolusState,
    pub basal_state: BasalState,

    // Enacted intents
    pub last_enacted_bolus_amount: EnactedAmount,
    pub last_enacted_bolus_start: Option<u64>,
    pub last_enacted_temp_basal_amount: EnactedAmount,
    pub last_enacted_temp_basal_start: Option<u64>,
    pub last_enacted_temp_basal_duration: EnactedTenths,

    // Configuration
    pub maximum_bolus: Hundredths,
    pub maximum_temp_basal: Hundredths,
    pub reservoir: Hundredths,
    pub utc_offset_minutes: i32,
    pub basal_schedule: [Hundredths; BASAL_SCHEDULE_LEN],

    // Status
    pub faulted: bool,
    pub alert_states: u16,
    pub last_updated: Option<u64>,
}

impl PodRecord {
    pub fn new(lot: u32, tid: u32) -> Self {
        Self {
            lot,
            tid,
            address: None,
            msg_sequence: 0,
            packet_sequence: 0,
            last_nonce: 0,
            nonce_seed: 0,
            progress: Progress::Inactive,
            bolus_state: BolusState::NotRunning,
            basal_state: BasalState::NotRunning,
            last_enacted_bolus_amount: CANCELLED,
            last_enacted_bolus_start: None,
            last_enacted_temp_basal_amount: CANCELLED,
            last_enacted_temp_basal_start: None,
            last_enacted_temp_basal_duration: CANCELLED,
            maximum_bolus: 3000,
            maximum_temp_basal: 3000,
            reservoir: 5000,
            utc_offset_minutes: 0,
            basal_schedule: [0; BASAL_SCHEDULE_LEN],
            faulted: false,
            alert_states: 0,
            last_updated: None,
        }
    }

    /// `true` while the pod's progress sits in the paired-and-running range, i.e. past pairing
    /// and not yet torn down.
    pub fn is_active(&self) -> bool {
        self.progress >= Progress::PairingSuccess && self.progress <= Progress::AlertExpiredShuttingDown
    }

    /// Decodes a `0x1d` status sub-frame: `[progress, bolus_state, basal_state,
    /// reservoir_pulses: u16 BE, alert_states: u16 BE]`. Shorter frames update only the
    /// fields their bytes cover.
    pub fn handle_status_response(&mut self, payload: &[u8]) {
        if let Some(&b) = payload.first() {
            self.progress = Progress::from_wire(b);
        }
        if let Some(&b) = payload.get(1) {
            self.bolus_state = BolusState::from_wire(b);
        }
        if let Some(&b) = payload.get(2) {
            self.basal_state = BasalState::from_wire(b);
        }
        if payload.len() >= 5 {
            let pulses = u16::from_be_bytes([payload[3], payload[4]]);
            self.reservoir = pulses as u32 * crate::wire::PULSE_HUNDREDTHS;
        }
        if payload.len() >= 7 {
            self.alert_states = u16::from_be_bytes([payload[5], payload[6]]);
        }
        self.last_updated = Some(now_unix());
    }

    /// Decodes a `0x02` information/fault sub-frame. A non-empty payload whose first byte is
    /// `0x01` denotes a pod fault; anything else is informational and does not change
    /// `faulted`.
    pub fn handle_information_response(&mut self, payload: &[u8]) {
        if payload.first() == Some(&0x01) {
            self.faulted = true;
        }
    }
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_active_range() {
        let mut pod = PodRecord::new(1, 2);
        pod.progress = Progress::Inactive;
        assert!(!pod.is_active());
        pod.progress = Progress::Running;
        assert!(pod.is_active());
        pod.progress = Progress::Inactive2;
        assert!(!pod.is_active());
    }

    #[test]
    fn handle_status_response_decodes_fields() {
        let mut pod = PodRecord::new(1, 2);
        // progress=Running(6), bolus=Immediate(2), basal=TempBasal(1), reservoir=100 pulses,
        // alert mask 0x0003
        let payload = [6u8, 2, 1, 0x00, 0x64, 0x00, 0x03];
        pod.handle_status_response(&payload);
        assert_eq!(pod.progress, Progress::Running);
        assert_eq!(pod.bolus_state, BolusState::Immediate);
        assert_eq!(pod.basal_state, BasalState::TempBasal);
        assert_eq!(pod.reservoir, 500);
        assert_eq!(pod.alert_states, 0x0003);
        assert!(pod.last_updated.is_some());
    }

    #[test]
    fn handle_information_response_sets_fault() {
        let mut pod = PodRecord::new(1, 2);
        pod.handle_information_response(&[0x01, 0xAA]);
        assert!(pod.faulted);
    }
}
