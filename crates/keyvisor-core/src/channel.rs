// Keyvisor IPC Channel
// Length-framed one-way delivery of classified key events

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::event::KeyAction;

/// Payload layout: code (2) + action (1) + seq (8) + timestamp_us (8).
/// All integers big-endian; each frame is prefixed with a u32 length.
const PAYLOAD_SIZE: usize = 19;

/// Write attempts before a stalled peer is treated as fatal. The daemon
/// cannot buffer unboundedly: an unread Show event is input the user
/// believes was already processed downstream.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Errors on the IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("channel write failed after {attempts} attempts: {source}")]
    Fatal {
        attempts: u32,
        source: std::io::Error,
    },

    #[error("channel read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// The unit sent to the unprivileged consumer: one Show-classified
/// keystroke with enough ordering information to reconstruct the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub code: u16,
    pub action: KeyAction,
    pub seq: u64,
    pub timestamp_us: u64,
}

/// Encode one event as a length-prefixed frame.
pub fn encode_frame(event: &ClassifiedEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + PAYLOAD_SIZE);
    buf.extend_from_slice(&(PAYLOAD_SIZE as u32).to_be_bytes());
    buf.extend_from_slice(&event.code.to_be_bytes());
    buf.push(event.action.to_wire());
    buf.extend_from_slice(&event.seq.to_be_bytes());
    buf.extend_from_slice(&event.timestamp_us.to_be_bytes());
    buf
}

/// Decode one frame from the beginning of `bytes`, returning the event and
/// the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(ClassifiedEvent, usize), ChannelError> {
    if bytes.len() < 4 {
        return Err(ChannelError::Malformed(format!(
            "need 4 length bytes, got {}",
            bytes.len()
        )));
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len != PAYLOAD_SIZE {
        return Err(ChannelError::Malformed(format!(
            "unexpected payload length {len}"
        )));
    }
    if bytes.len() < 4 + len {
        return Err(ChannelError::Malformed(format!(
            "truncated payload: declared {len}, got {}",
            bytes.len() - 4
        )));
    }

    let p = &bytes[4..4 + len];
    let code = u16::from_be_bytes([p[0], p[1]]);
    let action = KeyAction::from_wire(p[2])
        .ok_or_else(|| ChannelError::Malformed(format!("unknown action byte {}", p[2])))?;
    let seq = u64::from_be_bytes(p[3..11].try_into().unwrap());
    let timestamp_us = u64::from_be_bytes(p[11..19].try_into().unwrap());
    Ok((
        ClassifiedEvent {
            code,
            action,
            seq,
            timestamp_us,
        },
        4 + len,
    ))
}

/// Read one frame from a blocking reader (the consumer side).
pub fn read_frame(reader: &mut impl Read) -> Result<ClassifiedEvent, ChannelError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len != PAYLOAD_SIZE {
        return Err(ChannelError::Malformed(format!(
            "unexpected payload length {len}"
        )));
    }
    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&header);
    reader.read_exact(&mut frame[4..])?;
    decode_frame(&frame).map(|(event, _)| event)
}

/// Where the dispatch loop delivers Show-classified events. The real
/// implementation is [`KbdChannel`]; tests substitute an in-memory sink.
pub trait EventSink: Send {
    fn send(&mut self, code: u16, action: KeyAction) -> Result<(), ChannelError>;
}

/// Unix-socket channel to the unprivileged consumer. Stamps each event
/// with a monotonic sequence number so the receiver can verify ordering.
pub struct KbdChannel {
    stream: UnixStream,
    seq: u64,
}

impl KbdChannel {
    /// Connect to the consumer's socket and apply `timeout` to both
    /// directions.
    pub fn connect(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| ChannelError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        let mut channel = Self { stream, seq: 0 };
        channel.set_timeout(timeout)?;
        Ok(channel)
    }

    /// Bound how long a stalled peer can delay the dispatch loop.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn timestamp_us() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Write one frame, retrying a stalled peer. A timed-out write may have
/// pushed part of the frame already; the retry resumes at the first unsent
/// byte, never resending the prefix, or the length-framed stream would
/// desync for good.
fn write_frame(writer: &mut impl Write, frame: &[u8]) -> Result<(), ChannelError> {
    let mut written = 0usize;
    let mut last_err: Option<std::io::Error> = None;

    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let step: std::io::Result<()> = loop {
            if written == frame.len() {
                break writer.flush();
            }
            match writer.write(&frame[written..]) {
                Ok(0) => {
                    break Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "peer accepts no more bytes",
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        match step {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!(
                    "channel write attempt {attempt} stopped after {written} of {} bytes: {e}",
                    frame.len()
                );
                last_err = Some(e);
            }
        }
    }
    Err(ChannelError::Fatal {
        attempts: MAX_WRITE_ATTEMPTS,
        source: last_err.unwrap_or_else(|| std::io::Error::other("write failed")),
    })
}

impl EventSink for KbdChannel {
    fn send(&mut self, code: u16, action: KeyAction) -> Result<(), ChannelError> {
        let event = ClassifiedEvent {
            code,
            action,
            seq: self.seq,
            timestamp_us: Self::timestamp_us(),
        };
        let frame = encode_frame(&event);
        write_frame(&mut self.stream, &frame)?;
        self.seq += 1;
        Ok(())
    }
}
