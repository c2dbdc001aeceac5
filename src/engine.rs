//! Transaction Engine: the single entry point that ships a composed message through the
//! [`crate::radio::Radio`] collaborator, classifies the response, and applies the bounded
//! retry/resync policies.
//!
//! The bad-nonce retry and the interim resync's nested recovery are both specified as (bounded
//! or, for nested resync, effectively unbounded) recursion; Rust async functions can't recurse
//! into themselves without heap-boxing the future, so both are re-expressed here as explicit
//! loops with counters. The bad-nonce loop is a mechanical transliteration with no behavioural
//! difference. The nested-resync loop is the one place this module's bound is an acknowledged
//! behaviour change from the original: past `MAX_RESYNC_DEPTH` nested cycles, a further desync
//! surfaces where the original would keep recursing (see the Design Note in `SPEC_FULL.md` §9).

use tracing::{debug, warn};

use crate::error::{OmnipyError, PdmError, TransmissionOutOfSyncError};
use crate::message::{Message, MessageType};
use crate::nonce::FAKE_NONCE;
use crate::pdm::Pdm;
use crate::radio::RadioError;

const MAX_NONCE_RETRIES: u8 = 3;

/// Upper bound on how many nested interim-resync cycles (sleep, status probe, sleep) a single
/// out-of-sync recovery will run if the probe itself keeps desyncing. The original source lets
/// this recurse without an explicit bound (Python recursion, not tail-call-eliminated); this is
/// the loop-with-counter rendering of that recursion, per the Design Note in `SPEC_FULL.md` §9.
const MAX_RESYNC_DEPTH: u8 = 3;

impl Pdm {
    /// Ships `message`, applying nonce stamping, out-of-sync resync and bad-nonce renegotiation
    /// as needed. On return, `message.sequence` and `self.nonce` reflect the exchange that
    /// actually succeeded (possibly a renegotiated replay of the original).
    pub(crate) async fn send(
        &mut self,
        message: &mut Message,
        with_nonce: bool,
        stay_connected: bool,
        request_tag: &str,
    ) -> Result<(), OmnipyError> {
        self.send_inner(message, with_nonce, stay_connected, request_tag, true, 0).await
    }

    async fn send_inner(
        &mut self,
        message: &mut Message,
        with_nonce: bool,
        requested_stay_connected: bool,
        request_tag: &str,
        mut resync_allowed: bool,
        mut nonce_retry: u8,
    ) -> Result<(), OmnipyError> {
        let mut with_nonce = with_nonce;
        loop {
            let mut stay_connected = requested_stay_connected;
            if with_nonce {
                let n = self.nonce.next();
                if n == FAKE_NONCE {
                    stay_connected = true;
                }
                message.set_nonce(n);
            }

            let response = match self.radio.send_request_get_response(message, stay_connected).await {
                Ok(response) => response,
                Err(RadioError::OutOfSync(_)) => {
                    if resync_allowed {
                        warn!(request_tag, "transmission out of sync, running interim resync");
                        self.interim_resync(0).await?;
                        resync_allowed = false;
                        continue;
                    }
                    return Err(TransmissionOutOfSyncError.into());
                }
                Err(e) => return Err(PdmError::unexpected(e).into()),
            };

            let mut bad_nonce = None;
            for (ctype, payload) in response.contents() {
                match ctype {
                    0x1d => self.pod.handle_status_response(payload),
                    0x02 => self.pod.handle_information_response(payload),
                    0x06 if payload.first() == Some(&0x14) => {
                        if payload.len() >= 3 {
                            bad_nonce = Some(u16::from_be_bytes([payload[1], payload[2]]));
                        }
                    }
                    _ => {}
                }
            }

            if let Some(sync_word) = bad_nonce {
                if nonce_retry > MAX_NONCE_RETRIES {
                    return Err(PdmError::new("Nonce re-negotiation failed").into());
                }
                debug!(request_tag, nonce_retry, "bad nonce, renegotiating");
                self.nonce.sync(sync_word, message.sequence);
                self.radio.set_message_sequence(message.sequence);
                nonce_retry += 1;
                // The pod's renegotiated reply is always nonce-bearing, regardless of whether
                // the rejected attempt was (e.g. the interim-resync status probe, which is sent
                // without a nonce but must still be retried with one after a bad-nonce response).
                with_nonce = true;
                continue;
            }

            return Ok(());
        }
    }

    /// Sleep, send a bare status probe, sleep again. If the probe itself desyncs, this recurses
    /// into another nested resync cycle (sleep, probe, sleep) before retrying the probe once
    /// more, bounded by `MAX_RESYNC_DEPTH` nested cycles — the loop-with-counter rendering of the
    /// original's unbounded recursive `_interim_resync`/`_sendMessage` mutual recursion.
    async fn interim_resync(&mut self, depth: u8) -> Result<(), OmnipyError> {
        tokio::time::sleep(self.resync_sleep_before).await;

        let address = self.pod.address.unwrap_or(0);
        let mut probe = Message::new(MessageType::Pdm, address, self.radio.message_sequence());
        probe.add_command(0x0e, vec![0]);

        match self.send_inner(&mut probe, false, true, "STATUS REQ 0", false, 0).await {
            Ok(()) => {}
            Err(OmnipyError::OutOfSync(_)) if depth < MAX_RESYNC_DEPTH => {
                warn!(depth, "interim resync probe itself out of sync, nesting another resync cycle");
                Box::pin(self.interim_resync(depth + 1)).await?;
                self.send_inner(&mut probe, false, true, "STATUS REQ 0", false, 0).await?;
            }
            Err(e) => return Err(e),
        }

        tokio::time::sleep(self.resync_sleep_after).await;
        Ok(())
    }
}
