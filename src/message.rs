//! Message Builder: the PDM-pod wire envelope.
//!
//! One struct serves both directions — an outbound request built by the Command Layer and the
//! inbound response the Transaction Engine classifies — mirroring the Python source's single
//! `Message` class used for both.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Pdm,
    Pod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCommand {
    pub cmd_type: u8,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub address: u32,
    pub sequence: u8,
    pub nonce: Option<u32>,
    pub commands: Vec<WireCommand>,
}

impl Message {
    pub fn new(message_type: MessageType, address: u32, sequence: u8) -> Self {
        Self {
            message_type,
            address,
            sequence,
            nonce: None,
            commands: Vec::new(),
        }
    }

    pub fn add_command(&mut self, cmd_type: u8, body: Vec<u8>) -> &mut Self {
        self.commands.push(WireCommand { cmd_type, body });
        self
    }

    /// Stamps `nonce` into the first four bytes of the first command's body — the reserved
    /// prefix the Command Layer writes as `\x00\x00\x00\x00` when assembling a nonce-bearing
    /// command.
    pub fn set_nonce(&mut self, nonce: u32) {
        self.nonce = Some(nonce);
        if let Some(first) = self.commands.first_mut() {
            if first.body.len() >= 4 {
                first.body[0..4].copy_from_slice(&nonce.to_be_bytes());
            }
        }
    }

    /// The `(ctype, payload)` sub-frames carried by this message, in wire order.
    pub fn contents(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.commands.iter().map(|c| (c.cmd_type, c.body.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nonce_stamps_first_command_prefix() {
        let mut msg = Message::new(MessageType::Pdm, 1, 0);
        msg.add_command(0x1a, vec![0, 0, 0, 0, 0xAA]);
        msg.set_nonce(0xDEAD_BEEF);
        assert_eq!(msg.commands[0].body[0..4], [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(msg.commands[0].body[4], 0xAA);
        assert_eq!(msg.nonce, Some(0xDEAD_BEEF));
    }

    #[test]
    fn contents_iterates_in_order() {
        let mut msg = Message::new(MessageType::Pod, 1, 0);
        msg.add_command(0x1d, vec![1, 2, 3]);
        msg.add_command(0x02, vec![0x01]);
        let collected: Vec<(u8, &[u8])> = msg.contents().collect();
        assert_eq!(collected[0].0, 0x1d);
        assert_eq!(collected[1].0, 0x02);
    }
}
