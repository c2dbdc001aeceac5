//! Radio collaborator: the RF transceiver / link-layer contract the Transaction Engine drives.
//!
//! `TcpRadio` is a concrete, length-prefixed JSON framing over `tokio::net::TcpStream`, in the
//! style of the teacher's TCP client/server binaries. `MockRadio` is an in-memory, scriptable
//! test double used by this crate's own test suite.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::TransmissionOutOfSyncError;
use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error(transparent)]
    OutOfSync(#[from] TransmissionOutOfSyncError),
    #[error("radio I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("radio framing error: {0}")]
    Framing(#[from] serde_json::Error),
}

/// The RF link the Transaction Engine consumes. Implementations own the raw frame-sequence
/// counters; the PDM core only ever reads/rewinds `message_sequence`.
#[async_trait]
pub trait Radio: Send {
    async fn send_request_get_response(
        &mut self,
        message: &Message,
        stay_connected: bool,
    ) -> Result<Message, RadioError>;

    async fn disconnect(&mut self);

    fn message_sequence(&self) -> u8;
    fn set_message_sequence(&mut self, sequence: u8);
    fn packet_sequence(&self) -> u8;
}

/// Length-prefixed JSON framing over a TCP connection to the pod (or a fake-pod responder such
/// as `pod-sim`). Reconnects lazily on the next send after a `stay_connected = false` hop.
pub struct TcpRadio {
    addr: String,
    stream: Option<TcpStream>,
    message_sequence: u8,
    packet_sequence: u8,
}

impl TcpRadio {
    pub fn new(addr: impl Into<String>, message_sequence: u8, packet_sequence: u8) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            message_sequence,
            packet_sequence,
        }
    }

    async fn ensure_connected(&mut self) -> std::io::Result<()> {
        if self.stream.is_none() {
            debug!(addr = %self.addr, "radio connecting");
            self.stream = Some(TcpStream::connect(&self.addr).await?);
        }
        Ok(())
    }

    async fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<(), RadioError> {
        let payload = serde_json::to_vec(message)?;
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(&payload).await?;
        Ok(())
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Message, RadioError> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RadioError::from(TransmissionOutOfSyncError)
            } else {
                RadioError::from(e)
            }
        })?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        let message: Message = serde_json::from_slice(&payload)?;
        Ok(message)
    }
}

#[async_trait]
impl Radio for TcpRadio {
    async fn send_request_get_response(
        &mut self,
        message: &Message,
        stay_connected: bool,
    ) -> Result<Message, RadioError> {
        self.ensure_connected().await?;
        let stream = self.stream.as_mut().expect("connected above");

        if let Err(e) = Self::write_frame(stream, message).await {
            warn!(error = %e, "radio send failed, link considered out of sync");
            self.stream = None;
            return Err(TransmissionOutOfSyncError.into());
        }

        let response = match Self::read_frame(stream).await {
            Ok(r) => r,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };

        self.message_sequence = message.sequence.wrapping_add(1) % 16;
        self.packet_sequence = self.packet_sequence.wrapping_add(1) % 32;

        if !stay_connected {
            self.stream = None;
        }

        Ok(response)
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(addr = %self.addr, "radio disconnecting");
        }
    }

    fn message_sequence(&self) -> u8 {
        self.message_sequence
    }

    fn set_message_sequence(&mut self, sequence: u8) {
        self.message_sequence = sequence;
    }

    fn packet_sequence(&self) -> u8 {
        self.packet_sequence
    }
}

/// A scripted response queued for [`MockRadio`].
pub enum ScriptedResponse {
    Message(Message),
    OutOfSync,
}

/// An in-memory, deterministic radio test double: pops the next scripted response (or fault)
/// off a queue on every send, and records every message it was asked to send for assertions.
pub struct MockRadio {
    responses: std::collections::VecDeque<ScriptedResponse>,
    sent: Arc<Mutex<Vec<Message>>>,
    pub connected: bool,
    message_sequence: u8,
    packet_sequence: u8,
}

impl MockRadio {
    pub fn new(message_sequence: u8, packet_sequence: u8) -> Self {
        Self {
            responses: std::collections::VecDeque::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
            connected: false,
            message_sequence,
            packet_sequence,
        }
    }

    pub fn queue_response(&mut self, message: Message) {
        self.responses.push_back(ScriptedResponse::Message(message));
    }

    pub fn queue_out_of_sync(&mut self) {
        self.responses.push_back(ScriptedResponse::OutOfSync);
    }

    /// A cheaply-clonable handle onto the messages sent so far, usable for assertions after the
    /// radio has been boxed and moved into a `Pdm`.
    pub fn sent_handle(&self) -> Arc<Mutex<Vec<Message>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn send_request_get_response(
        &mut self,
        message: &Message,
        stay_connected: bool,
    ) -> Result<Message, RadioError> {
        self.connected = true;
        self.sent.lock().unwrap().push(message.clone());

        let scripted = self
            .responses
            .pop_front()
            .unwrap_or_else(|| ScriptedResponse::Message(Message::new(crate::message::MessageType::Pod, message.address, message.sequence)));

        match scripted {
            ScriptedResponse::OutOfSync => Err(TransmissionOutOfSyncError.into()),
            ScriptedResponse::Message(response) => {
                self.message_sequence = message.sequence.wrapping_add(1) % 16;
                self.packet_sequence = self.packet_sequence.wrapping_add(1) % 32;
                self.connected = stay_connected;
                Ok(response)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn message_sequence(&self) -> u8 {
        self.message_sequence
    }

    fn set_message_sequence(&mut self, sequence: u8) {
        self.message_sequence = sequence;
    }

    fn packet_sequence(&self) -> u8 {
        self.packet_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[tokio::test]
    async fn mock_radio_returns_queued_response() {
        let mut radio = MockRadio::new(0, 0);
        let mut response = Message::new(MessageType::Pod, 1, 0);
        response.add_command(0x1d, vec![6, 2, 1]);
        radio.queue_response(response);

        let request = Message::new(MessageType::Pdm, 1, 0);
        let got = radio.send_request_get_response(&request, false).await.unwrap();
        assert_eq!(got.commands[0].cmd_type, 0x1d);
        assert_eq!(radio.sent_handle().lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mock_radio_surfaces_out_of_sync() {
        let mut radio = MockRadio::new(0, 0);
        radio.queue_out_of_sync();
        let request = Message::new(MessageType::Pdm, 1, 0);
        let err = radio.send_request_get_response(&request, false).await;
        assert!(matches!(err, Err(RadioError::OutOfSync(_))));
    }
}
