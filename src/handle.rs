//! Mutual Exclusion & Lifecycle Wrapper.
//!
//! `PdmHandle` is the outward-facing façade: every public operation runs inside a process-wide
//! critical section and gets the same exit-path treatment — radio disconnect, pod record
//! persistence, and error normalisation — regardless of how the operation ended.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::{OmnipyError, PdmBusyError, PdmError};
use crate::pdm::Pdm;
use crate::pod::{Hundredths, PodRecord, BASAL_SCHEDULE_LEN};

#[derive(Clone)]
pub struct PdmHandle {
    inner: Arc<Mutex<Pdm>>,
}

impl PdmHandle {
    pub fn new(pdm: Pdm) -> Self {
        Self { inner: Arc::new(Mutex::new(pdm)) }
    }

    /// Runs `body` under the process-wide lock, then unconditionally disconnects the radio and
    /// persists the pod record before re-raising whatever `body` produced. A failed save
    /// shadows the original result, matching `finally`-clause exception precedence.
    async fn run<F, T>(&self, body: F) -> Result<T, OmnipyError>
    where
        F: for<'a> FnOnce(&'a mut Pdm) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, OmnipyError>> + 'a>>,
    {
        let mut guard = self.inner.try_lock().map_err(|_| PdmBusyError)?;

        let result = body(&mut *guard).await;

        guard.radio.disconnect().await;
        guard.pod.msg_sequence = guard.radio.message_sequence();
        guard.pod.packet_sequence = guard.radio.packet_sequence();
        guard.pod.last_nonce = guard.nonce.last_nonce();
        guard.pod.nonce_seed = guard.nonce.seed();

        if let Err(e) = guard.storage.save(&guard.pod).await {
            error!(error = %e, "failed to persist pod record");
            return Err(PdmError::wrap("Pod status was not saved", e).into());
        }

        // Every error surfacing from `body` is already a typed `OmnipyError` — the catch-all
        // "Unexpected error" wrapping happens where an untyped failure is first observed
        // (radio/storage I/O in `engine::send`), not here.
        result
    }

    pub async fn update_pod_status(&self, update_type: u8) -> Result<(), OmnipyError> {
        self.run(|pdm| Box::pin(async move { pdm.update_pod_status(update_type).await })).await
    }

    pub async fn acknowledge_alerts(&self, alert_mask: u8) -> Result<(), OmnipyError> {
        self.run(|pdm| Box::pin(async move { pdm.acknowledge_alerts(alert_mask).await })).await
    }

    pub async fn bolus(&self, amount: Hundredths, beep: bool) -> Result<(), OmnipyError> {
        self.run(|pdm| Box::pin(async move { pdm.bolus(amount, beep).await })).await
    }

    pub async fn cancel_bolus(&self, beep: bool) -> Result<(), OmnipyError> {
        self.run(|pdm| Box::pin(async move { pdm.cancel_bolus(beep).await })).await
    }

    pub async fn cancel_temp_basal(&self, beep: bool) -> Result<(), OmnipyError> {
        self.run(|pdm| Box::pin(async move { pdm.cancel_temp_basal(beep).await })).await
    }

    pub async fn set_temp_basal(&self, rate: Hundredths, hours: crate::pod::EnactedTenths, confidence_reminder: bool) -> Result<(), OmnipyError> {
        self.run(move |pdm| Box::pin(async move { pdm.set_temp_basal(rate, hours, confidence_reminder).await })).await
    }

    pub async fn set_basal_schedule(&self, schedule: [Hundredths; BASAL_SCHEDULE_LEN]) -> Result<(), OmnipyError> {
        self.run(move |pdm| Box::pin(async move { pdm.set_basal_schedule(schedule).await })).await
    }

    pub async fn deactivate_pod(&self) -> Result<(), OmnipyError> {
        self.run(|pdm| Box::pin(async move { pdm.deactivate_pod().await })).await
    }

    /// `true` if a bolus is currently in flight, or if the lock itself is contended — a busy
    /// pod and a busy lock are indistinguishable to the caller.
    pub async fn is_busy(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut guard) => guard.is_bolus_running().await.unwrap_or(true),
            Err(_) => {
                warn!("pdm lock contended, reporting busy");
                true
            }
        }
    }

    pub async fn pod_snapshot(&self) -> Result<PodRecord, PdmBusyError> {
        let guard = self.inner.try_lock().map_err(|_| PdmBusyError)?;
        Ok(guard.pod().clone())
    }
}
