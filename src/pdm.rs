//! The PDM core: nonce generator, pod record and radio/storage collaborators bound together.
//!
//! This module only defines the struct and its constructor; the Transaction Engine
//! ([`crate::engine`]) and Command Layer ([`crate::command`]) are `impl Pdm` blocks in their
//! own modules, mirroring the component breakdown in `SPEC_FULL.md` §2.

use std::time::Duration;

use crate::config::PdmConfig;
use crate::nonce::Nonce;
use crate::pod::PodRecord;
use crate::radio::Radio;
use crate::storage::PodStorage;

pub struct Pdm {
    pub(crate) nonce: Nonce,
    pub(crate) pod: PodRecord,
    pub(crate) radio: Box<dyn Radio>,
    pub(crate) storage: Box<dyn PodStorage>,
    pub(crate) resync_sleep_before: Duration,
    pub(crate) resync_sleep_after: Duration,
}

impl Pdm {
    pub fn new(pod: PodRecord, radio: Box<dyn Radio>, storage: Box<dyn PodStorage>, config: &PdmConfig) -> Self {
        let seek_nonce = if pod.last_nonce != 0 { Some(pod.last_nonce) } else { None };
        let nonce = Nonce::new(pod.lot, pod.tid, pod.nonce_seed, seek_nonce);
        Self {
            nonce,
            pod,
            radio,
            storage,
            resync_sleep_before: Duration::from_secs(config.resync_sleep_before_secs),
            resync_sleep_after: Duration::from_secs(config.resync_sleep_after_secs),
        }
    }

    pub fn pod(&self) -> &PodRecord {
        &self.pod
    }
}
