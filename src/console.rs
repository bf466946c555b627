//! Console and telemetry stream from the robot
//!
//! One TCP connection to the robot's auxiliary port carries length-prefixed
//! frames:
//!
//! ```text
//! [size u16][tag u8][data]      size = 1 + len(data), 0 < size <= 32768
//! ```
//!
//! A bare zero size word is a keepalive and carries no frame.
//!
//! [`FrameDecoder`] reassembles frames from arbitrary read boundaries;
//! [`ConsoleMessage`] gives each frame a type. [`ConsoleChannel`] owns the
//! connection, reconnects with backoff, and turns messages into events.

use crate::codec::ByteReader;
use crate::error::{CodecError, DsError, Result};
use crate::events::StationEvents;
use crate::network::Backoff;
use crate::types::{LogEntry, PowerData, VersionInfo};
use byteorder::{BigEndian, ByteOrder};
use regex::Regex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub const MAX_FRAME_SIZE: usize = 32768;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 4096;

pub mod console_tag {
    pub const DISABLE_FAULTS: u8 = 0x04;
    pub const RAIL_FAULTS: u8 = 0x05;
    pub const VERSION: u8 = 0x0A;
    pub const ERROR: u8 = 0x0B;
    pub const STDOUT: u8 = 0x0C;
}

/// One complete frame, tag split from the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Accumulates bytes and yields whole frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed
    ///
    /// Zero size words are consumed silently. An oversized size field
    /// leaves the stream unsynchronized; callers must drop the connection.
    pub fn next_frame(&mut self) -> std::result::Result<Option<RawFrame>, CodecError> {
        let size = loop {
            if self.buf.len() < 2 {
                return Ok(None);
            }
            let size = BigEndian::read_u16(&self.buf[..2]) as usize;
            if size != 0 {
                break size;
            }
            trace!("Console keepalive");
            self.buf.drain(..2);
        };
        if size > MAX_FRAME_SIZE {
            return Err(CodecError::invalid("console frame size", size as u32));
        }
        if self.buf.len() < 2 + size {
            return Ok(None);
        }

        let frame = RawFrame {
            tag: self.buf[2],
            payload: self.buf[3..2 + size].to_vec(),
        };
        self.buf.drain(..2 + size);
        Ok(Some(frame))
    }
}

/// Decoded console frame
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleMessage {
    Stdout {
        timestamp: f32,
        sequence: u16,
        text: String,
    },
    Error {
        timestamp: f32,
        sequence: u16,
        occurrences: u16,
        code: i32,
        is_error: bool,
        details: String,
        location: String,
        call_stack: String,
    },
    Version(VersionInfo),
    DisableFaults {
        comms: u16,
        brownout_12v: u16,
    },
    RailFaults {
        v6: u16,
        v5: u16,
        v3_3: u16,
    },
}

fn lossy_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn read_prefixed(reader: &mut ByteReader<'_>) -> std::result::Result<String, CodecError> {
    let len = reader.u16()? as usize;
    Ok(lossy_trimmed(reader.take(len)?))
}

fn push_prefixed(data: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    data.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    data.extend_from_slice(bytes);
}

impl ConsoleMessage {
    pub fn decode(frame: &RawFrame) -> std::result::Result<Self, CodecError> {
        let mut reader = ByteReader::new(&frame.payload);
        match frame.tag {
            console_tag::STDOUT => Ok(ConsoleMessage::Stdout {
                timestamp: reader.f32()?,
                sequence: reader.u16()?,
                text: lossy_trimmed(reader.rest()),
            }),
            console_tag::ERROR => {
                let timestamp = reader.f32()?;
                let sequence = reader.u16()?;
                let occurrences = reader.u16()?;
                let code = reader.i32()?;
                let flags = reader.u8()?;
                Ok(ConsoleMessage::Error {
                    timestamp,
                    sequence,
                    occurrences,
                    code,
                    is_error: flags & 0x01 != 0,
                    details: read_prefixed(&mut reader)?,
                    location: read_prefixed(&mut reader)?,
                    call_stack: read_prefixed(&mut reader)?,
                })
            }
            console_tag::VERSION => Ok(ConsoleMessage::Version(VersionInfo {
                image_version: read_prefixed(&mut reader)?,
                wpilib_version: read_prefixed(&mut reader)?,
                rio_version: read_prefixed(&mut reader)?,
            })),
            console_tag::DISABLE_FAULTS => Ok(ConsoleMessage::DisableFaults {
                comms: reader.u16()?,
                brownout_12v: reader.u16()?,
            }),
            console_tag::RAIL_FAULTS => Ok(ConsoleMessage::RailFaults {
                v6: reader.u16()?,
                v5: reader.u16()?,
                v3_3: reader.u16()?,
            }),
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    /// Full frame including the size prefix; used by the simulator
    pub fn encode(&self) -> Vec<u8> {
        let (tag, mut data) = match self {
            ConsoleMessage::Stdout { timestamp, sequence, text } => {
                let mut data = Vec::with_capacity(6 + text.len());
                data.extend_from_slice(&timestamp.to_be_bytes());
                data.extend_from_slice(&sequence.to_be_bytes());
                data.extend_from_slice(text.as_bytes());
                (console_tag::STDOUT, data)
            }
            ConsoleMessage::Error {
                timestamp,
                sequence,
                occurrences,
                code,
                is_error,
                details,
                location,
                call_stack,
            } => {
                let mut data = Vec::with_capacity(19 + details.len() + location.len() + call_stack.len());
                data.extend_from_slice(&timestamp.to_be_bytes());
                data.extend_from_slice(&sequence.to_be_bytes());
                data.extend_from_slice(&occurrences.to_be_bytes());
                data.extend_from_slice(&code.to_be_bytes());
                data.push(u8::from(*is_error));
                push_prefixed(&mut data, details);
                push_prefixed(&mut data, location);
                push_prefixed(&mut data, call_stack);
                (console_tag::ERROR, data)
            }
            ConsoleMessage::Version(info) => {
                let mut data = Vec::new();
                push_prefixed(&mut data, &info.image_version);
                push_prefixed(&mut data, &info.wpilib_version);
                push_prefixed(&mut data, &info.rio_version);
                (console_tag::VERSION, data)
            }
            ConsoleMessage::DisableFaults { comms, brownout_12v } => {
                let mut data = Vec::with_capacity(4);
                data.extend_from_slice(&comms.to_be_bytes());
                data.extend_from_slice(&brownout_12v.to_be_bytes());
                (console_tag::DISABLE_FAULTS, data)
            }
            ConsoleMessage::RailFaults { v6, v5, v3_3 } => {
                let mut data = Vec::with_capacity(6);
                for counter in [v6, v5, v3_3] {
                    data.extend_from_slice(&counter.to_be_bytes());
                }
                (console_tag::RAIL_FAULTS, data)
            }
        };

        data.truncate(MAX_FRAME_SIZE - 1);
        let mut frame = Vec::with_capacity(3 + data.len());
        frame.extend_from_slice(&((data.len() + 1) as u16).to_be_bytes());
        frame.push(tag);
        frame.append(&mut data);
        frame
    }
}

/// Flags stdout lines that read like warnings
#[derive(Debug, Clone)]
pub struct WarningClassifier {
    pattern: Regex,
}

impl WarningClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"(?i)\bwarn(ing)?\b")?,
        })
    }

    pub fn is_warning(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Log entry for a console message, if it carries text
    pub fn to_log_entry(&self, message: &ConsoleMessage, elapsed: f64) -> Option<LogEntry> {
        let entry = match message {
            ConsoleMessage::Stdout { sequence, text, .. } => LogEntry {
                timestamp: elapsed,
                message: text.clone(),
                is_error: false,
                is_warning: self.is_warning(text),
                sequence: *sequence,
            },
            ConsoleMessage::Error {
                sequence,
                is_error,
                details,
                location,
                call_stack,
                ..
            } => {
                let mut text = details.clone();
                if !location.is_empty() {
                    text = format!("{} @ {}", text, location);
                }
                if !call_stack.is_empty() {
                    text = format!("{}\n{}", text, call_stack);
                }
                LogEntry {
                    timestamp: elapsed,
                    message: text,
                    is_error: *is_error,
                    is_warning: !*is_error,
                    sequence: *sequence,
                }
            }
            _ => return None,
        };
        (!entry.message.is_empty()).then_some(entry)
    }
}

/// Per-connection accumulated state
struct Session {
    started: Instant,
    power: PowerData,
}

/// Reconnecting reader for the robot console port
pub struct ConsoleChannel {
    addr: SocketAddr,
    events: Arc<StationEvents>,
    classifier: WarningClassifier,
    backoff: Backoff,
}

impl ConsoleChannel {
    pub fn new(addr: SocketAddr, events: Arc<StationEvents>) -> Result<Self> {
        Ok(Self {
            addr,
            events,
            classifier: WarningClassifier::new()?,
            backoff: Backoff::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Console channel targeting {}", self.addr);

        loop {
            let connect = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr));
            let connected = tokio::select! {
                result = connect => result,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match connected {
                Ok(Ok(stream)) => {
                    info!("Connected to robot console at {}", self.addr);
                    self.backoff.reset();
                    match self.read_stream(stream, &mut shutdown).await {
                        Ok(true) => break,
                        Ok(false) => info!("Robot console closed the connection"),
                        Err(e) => warn!("Console stream dropped: {}", e),
                    }
                }
                Ok(Err(e)) => trace!("Console connect to {} failed: {}", self.addr, e),
                Err(_) => trace!("Console connect to {} timed out", self.addr),
            }

            let delay = self.backoff.next_delay();
            debug!("Console reconnect in {} ms", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Console channel stopped");
    }

    /// Read until EOF, error, or shutdown; `Ok(true)` means shutdown
    async fn read_stream(&self, mut stream: TcpStream, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let mut session = Session {
            started: Instant::now(),
            power: PowerData::default(),
        };
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(false);
                    }
                    decoder.push(&buf[..n]);
                    while let Some(frame) = decoder.next_frame().map_err(DsError::Codec)? {
                        self.dispatch(&frame, &mut session);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: &RawFrame, session: &mut Session) {
        let message = match ConsoleMessage::decode(frame) {
            Ok(message) => message,
            Err(CodecError::UnknownTag(tag)) => {
                debug!("Skipping console tag 0x{:02X} ({} bytes)", tag, frame.payload.len());
                return;
            }
            Err(e) => {
                warn!("Malformed console frame 0x{:02X}: {}", frame.tag, e);
                return;
            }
        };

        match &message {
            ConsoleMessage::Stdout { .. } | ConsoleMessage::Error { .. } => {
                let elapsed = session.started.elapsed().as_secs_f64();
                if let Some(entry) = self.classifier.to_log_entry(&message, elapsed) {
                    self.events.push_log(entry);
                }
            }
            ConsoleMessage::Version(info) => {
                if self.events.version() != *info {
                    info!(
                        "Robot versions: image={}, wpilib={}, rio={}",
                        info.image_version, info.wpilib_version, info.rio_version
                    );
                    self.events.publish_version(info);
                }
            }
            ConsoleMessage::DisableFaults { comms, brownout_12v } => {
                session.power.disable_count_comms = *comms;
                session.power.disable_count_12v = *brownout_12v;
                self.events.publish_power(&session.power);
            }
            ConsoleMessage::RailFaults { v6, v5, v3_3 } => {
                session.power.rail_faults_6v = *v6;
                session.power.rail_faults_5v = *v5;
                session.power.rail_faults_3v3 = *v3_3;
                self.events.publish_power(&session.power);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn stdout(text: &str, sequence: u16) -> ConsoleMessage {
        ConsoleMessage::Stdout {
            timestamp: 1.5,
            sequence,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_frame_split_across_reads() {
        let bytes = stdout("hello robot", 4).encode();
        let mut decoder = FrameDecoder::new();

        decoder.push(&bytes[..5]);
        assert_eq!(decoder.next_frame(), Ok(None));

        decoder.push(&bytes[5..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(ConsoleMessage::decode(&frame).unwrap(), stdout("hello robot", 4));
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut bytes = stdout("a", 1).encode();
        bytes.extend(ConsoleMessage::DisableFaults { comms: 2, brownout_12v: 3 }.encode());
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        assert_eq!(decoder.next_frame().unwrap().unwrap().tag, console_tag::STDOUT);
        assert_eq!(decoder.next_frame().unwrap().unwrap().tag, console_tag::DISABLE_FAULTS);
        assert_eq!(decoder.next_frame(), Ok(None));
    }

    #[test]
    fn test_zero_size_words_are_keepalives() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x00, 0x00]);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 0);

        decoder.push(&[0x00, 0x00, 0x00, 0x00]);
        decoder.push(&ConsoleMessage::Stdout { timestamp: 1.0, sequence: 2, text: "hi".to_string() }.encode());
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.tag, console_tag::STDOUT);
        assert_eq!(decoder.next_frame(), Ok(None));
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut oversized = FrameDecoder::new();
        oversized.push(&[0x80, 0x01]);
        assert_eq!(
            oversized.next_frame(),
            Err(CodecError::InvalidField { field: "console frame size", value: 32769 })
        );
    }

    #[test]
    fn test_error_frame_layout() {
        let message = ConsoleMessage::Error {
            timestamp: 2.0,
            sequence: 9,
            occurrences: 1,
            code: -44,
            is_error: false,
            details: "Joystick 2 missing".to_string(),
            location: "Robot.java:12".to_string(),
            call_stack: String::new(),
        };
        let bytes = message.encode();
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(ConsoleMessage::decode(&frame).unwrap(), message);

        let classifier = WarningClassifier::new().unwrap();
        let entry = classifier.to_log_entry(&message, 0.5).unwrap();
        assert_eq!(entry.message, "Joystick 2 missing @ Robot.java:12");
        assert!(entry.is_warning);
        assert!(!entry.is_error);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let frame = RawFrame {
            tag: console_tag::RAIL_FAULTS,
            payload: vec![0, 1, 0, 2],
        };
        assert!(matches!(ConsoleMessage::decode(&frame), Err(CodecError::TooShort { .. })));

        let unknown = RawFrame { tag: 0x00, payload: vec![1, 2, 3] };
        assert_eq!(ConsoleMessage::decode(&unknown), Err(CodecError::UnknownTag(0x00)));
    }

    #[test]
    fn test_warning_words() {
        let classifier = WarningClassifier::new().unwrap();
        assert!(classifier.is_warning("WARNING: loop overrun"));
        assert!(classifier.is_warning("warn: low battery"));
        assert!(!classifier.is_warning("forewarned is forearmed"));
        assert!(!classifier.is_warning("all good"));
    }

    #[tokio::test]
    async fn test_channel_publishes_events_from_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(StationEvents::default());
        let mut console = events.subscribe_console();

        let channel = ConsoleChannel::new(addr, events.clone()).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(channel.run(stop_rx));

        let (mut robot, _) = listener.accept().await.unwrap();
        let version = VersionInfo {
            image_version: "2024_v2.1".to_string(),
            wpilib_version: "2024.3.2".to_string(),
            rio_version: "9.0".to_string(),
        };
        let mut bytes = ConsoleMessage::Version(version.clone()).encode();
        bytes.extend(ConsoleMessage::DisableFaults { comms: 1, brownout_12v: 2 }.encode());
        bytes.extend(ConsoleMessage::RailFaults { v6: 3, v5: 4, v3_3: 5 }.encode());
        // Unknown tag, skipped
        bytes.extend([0x00, 0x02, 0x00, 0xAA]);
        let line = stdout("Warning: brownout", 7).encode();

        // Split the stdout frame across two writes
        bytes.extend_from_slice(&line[..4]);
        robot.write_all(&bytes).await.unwrap();
        robot.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        robot.write_all(&line[4..]).await.unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(2), console.recv())
            .await
            .unwrap()
            .unwrap();
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(entry.message, "Warning: brownout");
        assert_eq!(entry.sequence, 7);
        assert!(entry.is_warning);
        assert_eq!(events.version(), version);
        assert_eq!(
            events.power(),
            PowerData {
                disable_count_comms: 1,
                disable_count_12v: 2,
                rail_faults_6v: 3,
                rail_faults_5v: 4,
                rail_faults_3v3: 5,
            }
        );
        assert_eq!(events.recent_logs().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_keeps_connection_through_keepalives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(StationEvents::default());
        let mut console = events.subscribe_console();

        let channel = ConsoleChannel::new(addr, events.clone()).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(channel.run(stop_rx));

        let (mut robot, _) = listener.accept().await.unwrap();
        robot.write_all(&[0x00, 0x00]).await.unwrap();
        robot.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        robot.write_all(&[0x00, 0x00]).await.unwrap();
        robot.write_all(&stdout("still here", 3).encode()).await.unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(2), console.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message, "still here");
        // No reconnect attempt
        assert!(tokio::time::timeout(Duration::from_millis(100), listener.accept()).await.is_err());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_reconnects_after_oversized_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(StationEvents::default());

        let channel = ConsoleChannel::new(addr, events.clone())
            .unwrap()
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(50)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(channel.run(stop_rx));

        let (mut first, _) = listener.accept().await.unwrap();
        first.write_all(&[0xFF, 0xFF]).await.unwrap();

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        second.write_all(&stdout("back", 1).encode()).await.unwrap();

        let mut waited = 0;
        while events.recent_logs().is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(events.recent_logs()[0].message, "back");
    }
}
