//! Exercises the Transaction Engine's retry and resync policies end to end, through the public
//! Command Layer surface rather than the `pub(crate)` `send` entry point directly.

use pdm_core::config::PdmConfig;
use pdm_core::message::{Message, MessageType};
use pdm_core::pod::{BolusState, PodRecord, Progress};
use pdm_core::radio::MockRadio;
use pdm_core::storage::PodStorage;
use pdm_core::Pdm;

struct NullStore;

#[async_trait::async_trait]
impl PodStorage for NullStore {
    async fn save(&self, _record: &PodRecord) -> std::io::Result<()> {
        Ok(())
    }
    async fn load(&self) -> std::io::Result<PodRecord> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no pod"))
    }
}

fn fast_config() -> PdmConfig {
    let mut config = PdmConfig::default();
    config.resync_sleep_before_secs = 0;
    config.resync_sleep_after_secs = 0;
    config
}

fn running_pod() -> PodRecord {
    let mut pod = PodRecord::new(111, 222);
    pod.address = Some(0xCAFEBABE);
    pod.progress = Progress::Running;
    pod.maximum_bolus = 3000;
    pod.reservoir = 5000;
    pod.bolus_state = BolusState::NotRunning;
    pod
}

fn status_frame(progress: u8, bolus: u8, basal: u8) -> Message {
    let mut msg = Message::new(MessageType::Pod, 0xCAFEBABE, 0);
    msg.add_command(0x1d, vec![progress, bolus, basal, 0x03, 0xE8, 0x00, 0x00]);
    msg
}

fn bad_nonce_frame(sync_word: u16) -> Message {
    let mut msg = Message::new(MessageType::Pod, 0xCAFEBABE, 0);
    let mut payload = vec![0x14];
    payload.extend_from_slice(&sync_word.to_be_bytes());
    msg.add_command(0x06, payload);
    msg
}

#[tokio::test]
async fn bad_nonce_triggers_exactly_one_renegotiated_replay() {
    let mut radio = MockRadio::new(0, 0);
    radio.queue_response(bad_nonce_frame(0xABCD));
    radio.queue_response(status_frame(6, 2, 0));
    let sent = radio.sent_handle();

    let mut pdm = Pdm::new(running_pod(), Box::new(radio), Box::new(NullStore), &fast_config());
    pdm.bolus(200, false).await.unwrap();

    assert_eq!(pdm.pod().bolus_state, BolusState::Immediate);
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 2, "one rejected attempt, one renegotiated replay");
    assert_eq!(sent[0].sequence, sent[1].sequence, "replay reuses the rejected message's sequence");
    assert_ne!(sent[0].nonce, sent[1].nonce, "the replay carries a freshly renegotiated nonce");
}

#[tokio::test]
async fn four_consecutive_bad_nonces_fail_with_renegotiation_error() {
    let mut radio = MockRadio::new(0, 0);
    for _ in 0..5 {
        radio.queue_response(bad_nonce_frame(0xABCD));
    }
    let mut pdm = Pdm::new(running_pod(), Box::new(radio), Box::new(NullStore), &fast_config());

    let err = pdm.bolus(200, false).await.unwrap_err();
    assert!(err.to_string().contains("Nonce re-negotiation failed"));
}

#[tokio::test]
async fn out_of_sync_runs_one_interim_resync_then_succeeds() {
    let mut radio = MockRadio::new(0, 0);
    radio.queue_out_of_sync();
    radio.queue_response(status_frame(6, 0, 0)); // interim resync status probe
    radio.queue_response(status_frame(6, 2, 0)); // replayed bolus succeeds
    let sent = radio.sent_handle();

    let mut pdm = Pdm::new(running_pod(), Box::new(radio), Box::new(NullStore), &fast_config());
    pdm.bolus(200, false).await.unwrap();

    assert_eq!(pdm.pod().bolus_state, BolusState::Immediate);
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 3, "original send, interim status probe, one replay");
    assert_eq!(sent[1].commands[0].cmd_type, 0x0e);
    assert_eq!(sent[1].commands[0].body, vec![0]);
}

#[tokio::test]
async fn second_out_of_sync_surfaces_after_one_resync_attempt() {
    let mut radio = MockRadio::new(0, 0);
    radio.queue_out_of_sync();
    radio.queue_response(status_frame(6, 0, 0)); // interim resync probe succeeds
    radio.queue_out_of_sync(); // the replay itself is still out of sync

    let mut pdm = Pdm::new(running_pod(), Box::new(radio), Box::new(NullStore), &fast_config());
    let err = pdm.bolus(200, false).await.unwrap_err();
    assert!(err.is_out_of_sync());
}

#[tokio::test]
async fn interim_resync_probe_desync_recovers_via_nested_resync() {
    let mut radio = MockRadio::new(0, 0);
    radio.queue_out_of_sync(); // original send desyncs
    radio.queue_out_of_sync(); // the interim-resync probe itself desyncs once
    radio.queue_response(status_frame(6, 0, 0)); // nested resync's probe succeeds
    radio.queue_response(status_frame(6, 0, 0)); // probe retried after the nested resync, succeeds
    radio.queue_response(status_frame(6, 2, 0)); // replayed bolus succeeds
    let sent = radio.sent_handle();

    let mut pdm = Pdm::new(running_pod(), Box::new(radio), Box::new(NullStore), &fast_config());
    pdm.bolus(200, false).await.unwrap();

    assert_eq!(pdm.pod().bolus_state, BolusState::Immediate);
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 5, "original send, desynced probe, nested probe, retried probe, replay");
}

#[tokio::test]
async fn guard_failure_issues_no_radio_traffic() {
    let mut pod = running_pod();
    pod.progress = Progress::Inactive; // not yet running
    let radio = MockRadio::new(0, 0);
    let sent = radio.sent_handle();

    let mut pdm = Pdm::new(pod, Box::new(radio), Box::new(NullStore), &fast_config());
    let err = pdm.bolus(200, false).await.unwrap_err();
    assert!(err.to_string().contains("not yet running"));
    assert!(sent.lock().unwrap().is_empty());
}
