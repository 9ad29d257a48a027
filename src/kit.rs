//! Kit process handle.
//!
//! The rendering engine runs as a separate process per document. The
//! broker owns exactly one handle: a writer thread feeding framed
//! messages to the kit's stdin and a reader thread that turns the kit's
//! stdout frames into [`BrokerEvent`]s on the broker poll. Frames are
//! length-prefixed (`[u32 LE length][payload]`) because tile responses
//! carry binary PNG data after the header line.
//!
//! ```text
//! broker ──send_text/send_raw──► writer thread ──frame──► kit stdin
//! broker poll ◄─KitMessage/KitExited── reader thread ◄── kit stdout
//! ```
//!
//! A loopback transport replaces the child process in tests: everything
//! the broker sends lands unframed on a channel the test holds.

use crate::broker::events::BrokerEvent;
use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Frames above this size indicate a framing bug, not a real tile.
const MAX_FRAME_SIZE: u32 = 48 * 1024 * 1024;

/// Grace period between `exit` and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(600);

#[derive(Debug)]
enum Transport {
    Child {
        child: Child,
        writer_tx: mpsc::Sender<Vec<u8>>,
    },
    /// Test transport: outbound payloads are captured verbatim.
    Loopback { tx: mpsc::Sender<Vec<u8>> },
}

/// Handle to the document's rendering process.
#[derive(Debug)]
pub struct KitProcess {
    transport: Transport,
    pid: Option<u32>,
}

impl KitProcess {
    /// Spawn the kit and wire its stdout into the broker poll.
    ///
    /// `events` receives one [`BrokerEvent::KitMessage`] per stdout frame
    /// and a single [`BrokerEvent::KitExited`] when the pipe closes.
    pub fn spawn(command: &[String], events: mpsc::Sender<BrokerEvent>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("kit command must not be empty")?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning kit process '{program}'"))?;

        let pid = child.id();
        let stdin = child.stdin.take().context("kit stdin unavailable")?;
        let stdout = child.stdout.take().context("kit stdout unavailable")?;

        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>();
        thread::Builder::new()
            .name(format!("kit-writer-{pid}"))
            .spawn(move || writer_loop(stdin, &writer_rx))
            .context("spawning kit writer thread")?;

        thread::Builder::new()
            .name(format!("kit-reader-{pid}"))
            .spawn(move || reader_loop(stdout, &events))
            .context("spawning kit reader thread")?;

        log::info!("[kit] spawned {program} (pid {pid})");
        Ok(Self {
            transport: Transport::Child { child, writer_tx },
            pid: Some(pid),
        })
    }

    /// Loopback transport for tests: returns the handle and the receiver
    /// holding every payload the broker sends.
    pub fn loopback() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                transport: Transport::Loopback { tx },
                pid: None,
            },
            rx,
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a text message for the kit. Returns false when the transport
    /// is gone.
    pub fn send_text(&self, message: &str) -> bool {
        log::trace!("[kit] → {}", crate::protocol::abbreviate(message, 120));
        self.send_raw(message.as_bytes().to_vec())
    }

    /// Queue a raw payload for the kit.
    pub fn send_raw(&self, payload: Vec<u8>) -> bool {
        let tx = match &self.transport {
            Transport::Child { writer_tx, .. } => writer_tx,
            Transport::Loopback { tx } => tx,
        };
        if tx.send(payload).is_err() {
            log::warn!("[kit] no transport to kit process");
            return false;
        }
        true
    }

    /// Whether the child is still running. Loopback kits are always
    /// alive.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.transport {
            Transport::Child { child, .. } => matches!(child.try_wait(), Ok(None)),
            Transport::Loopback { .. } => true,
        }
    }

    /// Ask the kit to exit on its own.
    pub fn stop(&self) {
        let _ = self.send_text("exit");
    }

    /// Graceful terminate: `exit`, a short grace period, then SIGKILL.
    pub fn terminate(&mut self) {
        self.stop();
        let Transport::Child { child, .. } = &mut self.transport else {
            return;
        };
        let deadline = std::time::Instant::now() + TERMINATE_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("[kit] exited with {status}");
                    return;
                }
                Ok(None) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(50));
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[kit] wait failed: {e}");
                    break;
                }
            }
        }
        log::warn!("[kit] did not exit in time, killing pid {:?}", self.pid);
        if let Err(e) = child.kill() {
            log::warn!("[kit] kill failed: {e}");
        }
        let _ = child.wait();
    }
}

/// Encode one frame: 4-byte LE length then the payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read one frame; `Ok(None)` on clean EOF.
pub fn read_frame(reader: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let length = u32::from_le_bytes(header);
    if length == 0 || length > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid kit frame length {length}"),
        ));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn writer_loop(mut stdin: impl Write, rx: &mpsc::Receiver<Vec<u8>>) {
    while let Ok(payload) = rx.recv() {
        let frame = encode_frame(&payload);
        if stdin.write_all(&frame).and_then(|()| stdin.flush()).is_err() {
            log::debug!("[kit] stdin closed, writer exiting");
            return;
        }
    }
}

fn reader_loop(mut stdout: impl Read, events: &mpsc::Sender<BrokerEvent>) {
    loop {
        match read_frame(&mut stdout) {
            Ok(Some(payload)) => {
                if events.send(BrokerEvent::KitMessage(payload)).is_err() {
                    return; // broker gone
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[kit] read error: {e}");
                break;
            }
        }
    }
    let _ = events.send(BrokerEvent::KitExited);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(b"tile: part=0"));
        stream.extend_from_slice(&encode_frame(&[0x00, 0xff, 0x10]));
        let mut cursor = std::io::Cursor::new(stream);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"tile: part=0");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), vec![0x00, 0xff, 0x10]);
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut cursor = std::io::Cursor::new(vec![0u8; 4]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut cursor = std::io::Cursor::new((MAX_FRAME_SIZE + 1).to_le_bytes().to_vec());
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut frame = encode_frame(b"full payload");
        frame.truncate(frame.len() - 3);
        let mut cursor = std::io::Cursor::new(frame);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_loopback_captures_sends() {
        let (kit, rx) = KitProcess::loopback();
        assert!(kit.send_text("session s1 dockey 1"));
        assert!(kit.send_text("tile nviewid=0 part=0"));
        assert_eq!(rx.recv().unwrap(), b"session s1 dockey 1");
        assert_eq!(rx.recv().unwrap(), b"tile nviewid=0 part=0");
    }

    #[test]
    #[cfg(unix)]
    fn test_spawn_cat_echoes_frames() {
        let (events_tx, events_rx) = mpsc::channel();
        let mut kit =
            KitProcess::spawn(&["cat".to_string()], events_tx).expect("cat should spawn");
        assert!(kit.is_alive());
        assert!(kit.send_text("status"));

        // cat echoes our frame back byte-for-byte; the reader decodes it.
        match events_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            BrokerEvent::KitMessage(payload) => assert_eq!(payload, b"status"),
            other => panic!("expected KitMessage, got {other:?}"),
        }

        kit.terminate();
        assert!(!kit.is_alive());
    }
}
