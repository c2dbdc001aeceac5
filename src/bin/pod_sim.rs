//! A fake pod: accepts the same length-prefixed JSON framing `TcpRadio` speaks, interprets the
//! handful of wire commands the Command Layer issues, and answers with a plausible `0x1d`
//! status sub-frame. Grounded on the teacher's `simulator.rs` TCP accept-loop shape, re-pointed
//! at the PDM wire protocol instead of the satellite `Command`/`CommandResponse` pair.

use std::sync::Arc;

use pdm_core::message::{Message, MessageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 8282;

#[derive(Clone)]
struct PodSimState {
    progress: u8,
    bolus_state: u8,
    basal_state: u8,
    reservoir_pulses: u16,
    alert_states: u16,
}

impl Default for PodSimState {
    fn default() -> Self {
        Self {
            progress: 6, // Running
            bolus_state: 0,
            basal_state: 0,
            reservoir_pulses: 1000, // 50.00U
            alert_states: 0,
        }
    }
}

impl PodSimState {
    fn apply(&mut self, request: &Message) {
        for cmd in &request.commands {
            match cmd.cmd_type {
                0x1a => {
                    if let Some(&subtype) = cmd.body.get(4) {
                        match subtype {
                            0x00 => self.basal_state = 2, // Program
                            0x01 => self.basal_state = 1, // TempBasal
                            0x02 => self.bolus_state = 2, // Immediate
                            _ => {}
                        }
                    }
                }
                0x1f => {
                    if let Some(&flags) = cmd.body.get(4) {
                        if flags & 0x04 != 0 {
                            self.bolus_state = 0;
                        }
                        if flags & 0x02 != 0 {
                            self.basal_state = 0;
                        }
                        if flags & 0x01 != 0 {
                            self.basal_state = 0;
                        }
                    }
                }
                0x11 => {
                    self.alert_states = 0;
                }
                0x1c => {
                    self.progress = 10; // Inactive2
                }
                _ => {}
            }
        }
    }

    fn status_frame(&self, request: &Message) -> Message {
        let mut response = Message::new(MessageType::Pod, request.address, request.sequence);
        let mut payload = vec![self.progress, self.bolus_state, self.basal_state];
        payload.extend_from_slice(&self.reservoir_pulses.to_be_bytes());
        payload.extend_from_slice(&self.alert_states.to_be_bytes());
        response.add_command(0x1d, payload);
        response
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "pod-sim listening");

    let state = Arc::new(Mutex::new(PodSimState::default()));

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "pdm connected");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                warn!(%peer, error = %e, "connection ended");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<Mutex<PodSimState>>) -> std::io::Result<()> {
    loop {
        let request = match read_frame(&mut stream).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!(error = %e, "failed to read frame");
                return Err(e);
            }
        };

        let response = {
            let mut guard = state.lock().await;
            guard.apply(&request);
            guard.status_frame(&request)
        };

        write_frame(&mut stream, &response).await?;
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(message))
}

async fn write_frame(stream: &mut TcpStream, message: &Message) -> std::io::Result<()> {
    let payload = serde_json::to_vec(message).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    Ok(())
}
