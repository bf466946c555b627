//! Control and status packet codec
//!
//! Pure encode/decode for the two UDP flows. Nothing in here touches a
//! socket; the transmitter and receiver own the I/O.
//!
//! Control packet (station -> robot):
//!
//! ```text
//! [seq u16][version u8][control u8][request u8][alliance u8][tags...]
//! ```
//!
//! Status packet (robot -> station):
//!
//! ```text
//! [seq u16][version u8][status u8][trace u8][volts u8][volts/256 u8][reserved u8][tags...]
//! ```
//!
//! Each tag is `[size u8][id u8][data]` where `size` counts the id byte and
//! the data but not itself. All multi-byte values are big-endian.

use crate::error::CodecError;
use crate::types::{Alliance, DiagnosticData, JoystickState, Mode};
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::trace;

pub const PROTOCOL_VERSION: u8 = 0x01;

/// Game data longer than this is truncated before encoding
pub const MAX_GAME_DATA_LEN: usize = 64;
pub const MAX_JOYSTICKS: usize = 6;
pub const MAX_AXES: usize = 12;
pub const MAX_BUTTONS: usize = 32;
pub const MAX_POVS: usize = 4;

const CONTROL_HEADER_LEN: usize = 6;
const STATUS_HEADER_LEN: usize = 8;

// Control byte
const CTRL_ESTOP: u8 = 0x80;
const CTRL_FMS_ATTACHED: u8 = 0x08;
const CTRL_ENABLED: u8 = 0x04;

// Request byte
const REQ_REBOOT: u8 = 0x08;
const REQ_RESTART_CODE: u8 = 0x04;

// Status byte
const STATUS_ESTOP: u8 = 0x80;
const STATUS_WATCHDOG: u8 = 0x40;
const STATUS_CODE_RUNNING: u8 = 0x20;
const STATUS_BROWNOUT: u8 = 0x10;
const STATUS_FMS_ATTACHED: u8 = 0x08;
const STATUS_ENABLED: u8 = 0x04;

/// Tag ids in the control packet
pub mod control_tag {
    pub const JOYSTICK: u8 = 0x0C;
    pub const GAME_DATA: u8 = 0x0E;
    pub const DATE_TIME: u8 = 0x0F;
}

/// Tag ids in the status packet extension section
pub mod status_tag {
    pub const DISK: u8 = 0x04;
    pub const CPU: u8 = 0x05;
    pub const RAM: u8 = 0x06;
    pub const CAN: u8 = 0x0E;
}

/// Bounds-checked big-endian cursor shared by the packet and frame decoders
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::TooShort {
                needed: self.pos + n,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, CodecError> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, CodecError> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }

    /// Next `[size][id][data]` entry, or None at the end of the buffer
    fn tag(&mut self) -> Result<Option<(u8, &'a [u8])>, CodecError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let size = self.u8()?;
        if size == 0 {
            return Err(CodecError::invalid("tag size", size));
        }
        let body = self.take(size as usize)?;
        Ok(Some((body[0], &body[1..])))
    }
}

fn push_tag(pkt: &mut Vec<u8>, id: u8, data: &[u8]) {
    // Callers bound data to 254 bytes
    pkt.push((data.len() + 1) as u8);
    pkt.push(id);
    pkt.extend_from_slice(data);
}

/// Truncate to at most `max` bytes without splitting a character
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Commanded state bits of the control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlags {
    pub estop: bool,
    pub fms_attached: bool,
    pub enabled: bool,
    pub mode: Mode,
}

impl ControlFlags {
    pub fn to_byte(self) -> u8 {
        let mut byte = self.mode.to_bits();
        if self.estop {
            byte |= CTRL_ESTOP;
        }
        if self.fms_attached {
            byte |= CTRL_FMS_ATTACHED;
        }
        if self.enabled {
            byte |= CTRL_ENABLED;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        let mode = Mode::from_bits(byte).ok_or_else(|| CodecError::invalid("control mode", byte))?;
        Ok(Self {
            estop: byte & CTRL_ESTOP != 0,
            fms_attached: byte & CTRL_FMS_ATTACHED != 0,
            enabled: byte & CTRL_ENABLED != 0,
            mode,
        })
    }
}

/// One-shot requests carried in the request byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Requests {
    pub reboot: bool,
    pub restart_code: bool,
}

impl Requests {
    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.reboot {
            byte |= REQ_REBOOT;
        }
        if self.restart_code {
            byte |= REQ_RESTART_CODE;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            reboot: byte & REQ_REBOOT != 0,
            restart_code: byte & REQ_RESTART_CODE != 0,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.reboot && !self.restart_code
    }
}

/// Wall-clock time sent to the robot once a second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTimeTag {
    pub micros: u32,
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    /// 1-based month; the wire carries it 0-based
    pub month: u8,
    pub year: u16,
}

impl DateTimeTag {
    pub fn from_datetime(now: &DateTime<Utc>) -> Self {
        Self {
            micros: now.timestamp_subsec_micros(),
            second: now.second() as u8,
            minute: now.minute() as u8,
            hour: now.hour() as u8,
            day: now.day() as u8,
            month: now.month() as u8,
            year: now.year().clamp(1900, 2155) as u16,
        }
    }

    fn encode(&self) -> [u8; 10] {
        let mut data = [0u8; 10];
        data[..4].copy_from_slice(&self.micros.to_be_bytes());
        data[4] = self.second;
        data[5] = self.minute;
        data[6] = self.hour;
        data[7] = self.day;
        data[8] = self.month.saturating_sub(1);
        data[9] = (self.year - 1900) as u8;
        data
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 10 {
            return Err(CodecError::invalid("date/time tag length", data.len() as u32));
        }
        let mut reader = ByteReader::new(data);
        let micros = reader.u32()?;
        let second = reader.u8()?;
        let minute = reader.u8()?;
        let hour = reader.u8()?;
        let day = reader.u8()?;
        let month = reader.u8()?;
        let year = reader.u8()?;
        if month > 11 {
            return Err(CodecError::invalid("date/time month", month));
        }
        Ok(Self {
            micros,
            second,
            minute,
            hour,
            day,
            month: month + 1,
            year: 1900 + year as u16,
        })
    }
}

fn axis_to_wire(value: f32) -> u8 {
    (value * 127.0).clamp(-128.0, 127.0) as i8 as u8
}

fn axis_from_wire(byte: u8) -> f32 {
    (byte as i8 as f32 / 127.0).clamp(-1.0, 1.0)
}

fn encode_joystick(js: &JoystickState) -> Vec<u8> {
    let axes = &js.axes[..js.axes.len().min(MAX_AXES)];
    let buttons = &js.buttons[..js.buttons.len().min(MAX_BUTTONS)];
    let povs = &js.povs[..js.povs.len().min(MAX_POVS)];

    let button_bytes = buttons.len().div_ceil(8);
    let mut data = Vec::with_capacity(3 + axes.len() + button_bytes + povs.len() * 2);

    data.push(axes.len() as u8);
    data.extend(axes.iter().map(|&a| axis_to_wire(a)));

    data.push(buttons.len() as u8);
    for chunk in buttons.chunks(8) {
        let mut byte = 0u8;
        for (bit, &pressed) in chunk.iter().enumerate() {
            if pressed {
                byte |= 1 << (7 - bit);
            }
        }
        data.push(byte);
    }

    data.push(povs.len() as u8);
    for &pov in povs {
        data.extend_from_slice(&pov.to_be_bytes());
    }
    data
}

fn decode_joystick(data: &[u8]) -> Result<JoystickState, CodecError> {
    let mut reader = ByteReader::new(data);

    let axis_count = reader.u8()? as usize;
    let axes = reader.take(axis_count)?.iter().map(|&b| axis_from_wire(b)).collect();

    let button_count = reader.u8()? as usize;
    let packed = reader.take(button_count.div_ceil(8))?;
    let buttons = (0..button_count)
        .map(|i| packed[i / 8] & (1 << (7 - i % 8)) != 0)
        .collect();

    let pov_count = reader.u8()? as usize;
    let mut povs = Vec::with_capacity(pov_count);
    for _ in 0..pov_count {
        povs.push(reader.i16()?);
    }

    if reader.remaining() != 0 {
        return Err(CodecError::invalid("joystick tag length", data.len() as u32));
    }
    Ok(JoystickState { axes, buttons, povs })
}

/// Station -> robot control packet
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlPacket {
    pub sequence: u16,
    pub control: ControlFlags,
    pub requests: Requests,
    pub alliance: Alliance,
    /// In slot order; gaps are empty joysticks
    pub joysticks: Vec<JoystickState>,
    pub game_data: String,
    pub date_time: Option<DateTimeTag>,
}

impl ControlPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(128);
        pkt.extend_from_slice(&self.sequence.to_be_bytes());
        pkt.push(PROTOCOL_VERSION);
        pkt.push(self.control.to_byte());
        pkt.push(self.requests.to_byte());
        pkt.push(self.alliance.to_byte());

        for js in self.joysticks.iter().take(MAX_JOYSTICKS) {
            push_tag(&mut pkt, control_tag::JOYSTICK, &encode_joystick(js));
        }

        let game_data = truncate_utf8(&self.game_data, MAX_GAME_DATA_LEN);
        if !game_data.is_empty() {
            push_tag(&mut pkt, control_tag::GAME_DATA, game_data.as_bytes());
        }

        if let Some(date_time) = &self.date_time {
            push_tag(&mut pkt, control_tag::DATE_TIME, &date_time.encode());
        }

        pkt
    }

    /// Robot-side decode, used by the simulator and round-trip checks
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < CONTROL_HEADER_LEN {
            return Err(CodecError::TooShort { needed: CONTROL_HEADER_LEN, actual: data.len() });
        }
        let mut reader = ByteReader::new(data);
        let sequence = reader.u16()?;
        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::invalid("protocol version", version));
        }
        let control = ControlFlags::from_byte(reader.u8()?)?;
        let requests = Requests::from_byte(reader.u8()?);
        let alliance_byte = reader.u8()?;
        let alliance = Alliance::from_byte(alliance_byte)
            .ok_or_else(|| CodecError::invalid("alliance station", alliance_byte))?;

        let mut packet = ControlPacket {
            sequence,
            control,
            requests,
            alliance,
            ..Default::default()
        };

        while let Some((id, tag_data)) = reader.tag()? {
            match id {
                control_tag::JOYSTICK => packet.joysticks.push(decode_joystick(tag_data)?),
                control_tag::GAME_DATA => {
                    packet.game_data = String::from_utf8(tag_data.to_vec())
                        .map_err(|_| CodecError::invalid("game data", tag_data.len() as u32))?;
                }
                control_tag::DATE_TIME => packet.date_time = Some(DateTimeTag::decode(tag_data)?),
                other => return Err(CodecError::UnknownTag(other)),
            }
        }

        Ok(packet)
    }
}

/// Robot-reported bits of the status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub estopped: bool,
    pub watchdog_expired: bool,
    pub code_running: bool,
    pub brownout: bool,
    pub fms_attached: bool,
    pub enabled: bool,
    pub mode: Mode,
}

impl StatusFlags {
    pub fn to_byte(self) -> u8 {
        let mut byte = self.mode.to_bits();
        for (set, bit) in [
            (self.estopped, STATUS_ESTOP),
            (self.watchdog_expired, STATUS_WATCHDOG),
            (self.code_running, STATUS_CODE_RUNNING),
            (self.brownout, STATUS_BROWNOUT),
            (self.fms_attached, STATUS_FMS_ATTACHED),
            (self.enabled, STATUS_ENABLED),
        ] {
            if set {
                byte |= bit;
            }
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        let mode = Mode::from_bits(byte).ok_or_else(|| CodecError::invalid("status mode", byte))?;
        Ok(Self {
            estopped: byte & STATUS_ESTOP != 0,
            watchdog_expired: byte & STATUS_WATCHDOG != 0,
            code_running: byte & STATUS_CODE_RUNNING != 0,
            brownout: byte & STATUS_BROWNOUT != 0,
            fms_attached: byte & STATUS_FMS_ATTACHED != 0,
            enabled: byte & STATUS_ENABLED != 0,
            mode,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CanMetrics {
    /// Bus utilization, 0..1
    pub utilization: f32,
    pub bus_off: u32,
    pub tx_full: u32,
    pub rx_error: u32,
    pub tx_error: u32,
}

/// Optional telemetry appended to a status packet
#[derive(Debug, Clone, PartialEq)]
pub enum StatusExtension {
    Disk { free: u32, total: u32 },
    /// Per-core usage in percent
    Cpu(Vec<f32>),
    Ram { free: u32, total: u32 },
    Can(CanMetrics),
}

fn decode_usage(field: &'static str, data: &[u8]) -> Result<(u32, u32), CodecError> {
    if data.len() != 8 {
        return Err(CodecError::invalid(field, data.len() as u32));
    }
    let mut reader = ByteReader::new(data);
    let free = reader.u32()?;
    let total = reader.u32()?;
    if total == 0 || free > total {
        return Err(CodecError::invalid(field, total));
    }
    Ok((free, total))
}

impl StatusExtension {
    fn decode(id: u8, data: &[u8]) -> Result<Self, CodecError> {
        match id {
            status_tag::DISK => {
                let (free, total) = decode_usage("disk usage", data)?;
                Ok(StatusExtension::Disk { free, total })
            }
            status_tag::RAM => {
                let (free, total) = decode_usage("ram usage", data)?;
                Ok(StatusExtension::Ram { free, total })
            }
            status_tag::CPU => {
                let mut reader = ByteReader::new(data);
                let count = reader.u8()? as usize;
                if count == 0 || data.len() != 1 + count * 4 {
                    return Err(CodecError::invalid("cpu count", count as u32));
                }
                let mut cores = Vec::with_capacity(count);
                for _ in 0..count {
                    let percent = reader.f32()?;
                    if !(0.0..=100.0).contains(&percent) {
                        return Err(CodecError::invalid("cpu usage", percent.to_bits()));
                    }
                    cores.push(percent);
                }
                Ok(StatusExtension::Cpu(cores))
            }
            status_tag::CAN => {
                if data.len() != 20 {
                    return Err(CodecError::invalid("can metrics length", data.len() as u32));
                }
                let mut reader = ByteReader::new(data);
                let utilization = reader.f32()?;
                if !(0.0..=1.0).contains(&utilization) {
                    return Err(CodecError::invalid("can utilization", utilization.to_bits()));
                }
                Ok(StatusExtension::Can(CanMetrics {
                    utilization,
                    bus_off: reader.u32()?,
                    tx_full: reader.u32()?,
                    rx_error: reader.u32()?,
                    tx_error: reader.u32()?,
                }))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    fn encode(&self, pkt: &mut Vec<u8>) {
        match self {
            StatusExtension::Disk { free, total } | StatusExtension::Ram { free, total } => {
                let id = if matches!(self, StatusExtension::Disk { .. }) {
                    status_tag::DISK
                } else {
                    status_tag::RAM
                };
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&free.to_be_bytes());
                data[4..].copy_from_slice(&total.to_be_bytes());
                push_tag(pkt, id, &data);
            }
            StatusExtension::Cpu(cores) => {
                let cores = &cores[..cores.len().min(63)];
                let mut data = Vec::with_capacity(1 + cores.len() * 4);
                data.push(cores.len() as u8);
                for core in cores {
                    data.extend_from_slice(&core.to_be_bytes());
                }
                push_tag(pkt, status_tag::CPU, &data);
            }
            StatusExtension::Can(can) => {
                let mut data = Vec::with_capacity(20);
                data.extend_from_slice(&can.utilization.to_be_bytes());
                for counter in [can.bus_off, can.tx_full, can.rx_error, can.tx_error] {
                    data.extend_from_slice(&counter.to_be_bytes());
                }
                push_tag(pkt, status_tag::CAN, &data);
            }
        }
    }
}

/// Robot -> station status packet
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusPacket {
    pub sequence: u16,
    pub status: StatusFlags,
    /// Opaque trace flags, passed through untouched
    pub trace: u8,
    pub battery_voltage: f64,
    pub extensions: Vec<StatusExtension>,
}

impl StatusPacket {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < STATUS_HEADER_LEN {
            return Err(CodecError::TooShort { needed: STATUS_HEADER_LEN, actual: data.len() });
        }
        let mut reader = ByteReader::new(data);
        let sequence = reader.u16()?;
        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::invalid("protocol version", version));
        }
        let status = StatusFlags::from_byte(reader.u8()?)?;
        let trace = reader.u8()?;
        let volts = reader.u8()?;
        let fraction = reader.u8()?;
        let _reserved = reader.u8()?;

        let mut extensions = Vec::new();
        while let Some((id, tag_data)) = reader.tag()? {
            // Newer controller images add tags; the size prefix lets us step over them
            match StatusExtension::decode(id, tag_data) {
                Ok(extension) => extensions.push(extension),
                Err(CodecError::UnknownTag(id)) => trace!("Skipping status tag 0x{:02x}", id),
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            sequence,
            status,
            trace,
            battery_voltage: volts as f64 + fraction as f64 / 256.0,
            extensions,
        })
    }

    /// Robot-side encode, used by the simulator and tests
    pub fn encode(&self) -> Vec<u8> {
        let voltage = self.battery_voltage.clamp(0.0, 255.0);
        let volts = voltage.floor();
        let fraction = ((voltage - volts) * 256.0).floor().min(255.0);

        let mut pkt = Vec::with_capacity(64);
        pkt.extend_from_slice(&self.sequence.to_be_bytes());
        pkt.push(PROTOCOL_VERSION);
        pkt.push(self.status.to_byte());
        pkt.push(self.trace);
        pkt.push(volts as u8);
        pkt.push(fraction as u8);
        pkt.push(0);
        for extension in &self.extensions {
            extension.encode(&mut pkt);
        }
        pkt
    }

    /// Fold the extension section into the station's diagnostics
    pub fn apply_diagnostics(&self, diag: &mut DiagnosticData) {
        for extension in &self.extensions {
            match extension {
                StatusExtension::Disk { free, total } => {
                    diag.disk_usage = 1.0 - *free as f64 / *total as f64;
                }
                StatusExtension::Ram { free, total } => {
                    diag.ram_usage = 1.0 - *free as f64 / *total as f64;
                }
                StatusExtension::Cpu(cores) if !cores.is_empty() => {
                    let mean = cores.iter().map(|&c| c as f64).sum::<f64>() / cores.len() as f64;
                    diag.cpu_usage = mean / 100.0;
                }
                StatusExtension::Cpu(_) => {}
                StatusExtension::Can(can) => {
                    diag.can_utilization = can.utilization as f64;
                    diag.can_bus_off = can.bus_off;
                    diag.can_tx_full = can.tx_full;
                    diag.can_rx_error = can.rx_error;
                    diag.can_tx_error = can.tx_error;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_control() -> ControlPacket {
        ControlPacket {
            sequence: 0x1234,
            control: ControlFlags {
                estop: false,
                fms_attached: false,
                enabled: true,
                mode: Mode::Autonomous,
            },
            requests: Requests { reboot: true, restart_code: false },
            alliance: Alliance::Blue3,
            joysticks: vec![JoystickState {
                axes: vec![0.0, 1.0, -1.0],
                buttons: vec![true, false, false, false, false, false, false, false, true],
                povs: vec![90],
            }],
            game_data: "LRL".to_string(),
            date_time: None,
        }
    }

    #[test]
    fn test_control_header_layout() {
        let pkt = sample_control().encode();
        assert_eq!(&pkt[..6], &[0x12, 0x34, PROTOCOL_VERSION, 0x06, 0x08, 5]);

        // Joystick tag: size, id, 3 axes, 9 buttons in 2 bytes, 1 pov
        let js = &pkt[6..];
        assert_eq!(js[0], 1 + 1 + 3 + 1 + 2 + 1 + 2);
        assert_eq!(js[1], control_tag::JOYSTICK);
        assert_eq!(&js[2..6], &[3, 0, 127, 0x81]);
        assert_eq!(&js[6..9], &[9, 0x80, 0x80]);
        assert_eq!(&js[9..12], &[1, 0x00, 90]);
    }

    #[test]
    fn test_control_round_trip() {
        let original = sample_control();
        let decoded = ControlPacket::decode(&original.encode()).unwrap();

        assert_eq!(decoded.control, original.control);
        assert_eq!(decoded.requests, original.requests);
        assert_eq!(decoded.alliance, original.alliance);
        assert_eq!(decoded.game_data, "LRL");
        assert_eq!(decoded.joysticks[0].buttons, original.joysticks[0].buttons);
        assert_eq!(decoded.joysticks[0].povs, vec![90]);
        assert!((decoded.joysticks[0].axes[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_date_time_tag_round_trip() {
        let mut packet = ControlPacket::default();
        let now = DateTime::parse_from_rfc3339("2024-03-09T17:04:05.250Z")
            .unwrap()
            .with_timezone(&Utc);
        packet.date_time = Some(DateTimeTag::from_datetime(&now));

        let decoded = ControlPacket::decode(&packet.encode()).unwrap();
        let tag = decoded.date_time.unwrap();
        assert_eq!((tag.year, tag.month, tag.day), (2024, 3, 9));
        assert_eq!((tag.hour, tag.minute, tag.second), (17, 4, 5));
        assert_eq!(tag.micros, 250_000);
    }

    #[test]
    fn test_game_data_truncated_on_char_boundary() {
        let mut packet = ControlPacket::default();
        packet.game_data = "é".repeat(40); // 80 bytes
        let decoded = ControlPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.game_data.len(), 64);
        assert_eq!(decoded.game_data, "é".repeat(32));
    }

    #[test]
    fn test_empty_game_data_emits_no_tag() {
        let pkt = ControlPacket::default().encode();
        assert_eq!(pkt.len(), CONTROL_HEADER_LEN);
    }

    #[test]
    fn test_control_decode_errors() {
        assert!(matches!(
            ControlPacket::decode(&[0, 1, 1]),
            Err(CodecError::TooShort { .. })
        ));

        let mut bad_alliance = ControlPacket::default().encode();
        bad_alliance[5] = 9;
        assert_eq!(
            ControlPacket::decode(&bad_alliance),
            Err(CodecError::InvalidField { field: "alliance station", value: 9 })
        );

        let mut unknown = ControlPacket::default().encode();
        unknown.extend_from_slice(&[2, 0x42, 0]);
        assert_eq!(ControlPacket::decode(&unknown), Err(CodecError::UnknownTag(0x42)));

        let mut overrun = ControlPacket::default().encode();
        overrun.extend_from_slice(&[10, control_tag::GAME_DATA, b'x']);
        assert!(matches!(ControlPacket::decode(&overrun), Err(CodecError::TooShort { .. })));
    }

    #[test]
    fn test_status_decode_battery_and_flags() {
        let data = [0x00, 0x07, PROTOCOL_VERSION, 0x20 | 0x10 | 0x04 | 0x02, 0x31, 12, 128, 0];
        let status = StatusPacket::decode(&data).unwrap();

        assert_eq!(status.sequence, 7);
        assert!(status.status.code_running);
        assert!(status.status.brownout);
        assert!(status.status.enabled);
        assert!(!status.status.estopped);
        assert_eq!(status.status.mode, Mode::Autonomous);
        assert_eq!(status.trace, 0x31);
        assert!((status.battery_voltage - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_status_extensions_fill_diagnostics() {
        let packet = StatusPacket {
            sequence: 1,
            battery_voltage: 12.0,
            extensions: vec![
                StatusExtension::Disk { free: 250, total: 1000 },
                StatusExtension::Ram { free: 500, total: 1000 },
                StatusExtension::Cpu(vec![20.0, 40.0]),
                StatusExtension::Can(CanMetrics {
                    utilization: 0.5,
                    bus_off: 1,
                    tx_full: 2,
                    rx_error: 3,
                    tx_error: 4,
                }),
            ],
            ..Default::default()
        };

        let decoded = StatusPacket::decode(&packet.encode()).unwrap();
        let mut diag = DiagnosticData::default();
        decoded.apply_diagnostics(&mut diag);

        assert!((diag.disk_usage - 0.75).abs() < 1e-9);
        assert!((diag.ram_usage - 0.5).abs() < 1e-9);
        assert!((diag.cpu_usage - 0.3).abs() < 1e-6);
        assert!((diag.can_utilization - 0.5).abs() < 1e-9);
        assert_eq!(
            (diag.can_bus_off, diag.can_tx_full, diag.can_rx_error, diag.can_tx_error),
            (1, 2, 3, 4)
        );
    }

    #[test]
    fn test_unknown_status_tags_are_skipped() {
        let mut data = StatusPacket { sequence: 9, battery_voltage: 12.0, ..Default::default() }.encode();
        data.extend_from_slice(&[9, 0x01, 0, 0, 0, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&[3, 0x77, 1, 2]);
        data.extend_from_slice(&[9, status_tag::RAM, 0, 0, 0, 50, 0, 0, 0, 100]);

        let decoded = StatusPacket::decode(&data).unwrap();
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.extensions, vec![StatusExtension::Ram { free: 50, total: 100 }]);
    }

    #[test]
    fn test_status_decode_errors() {
        assert_eq!(
            StatusPacket::decode(&[0, 1, 1, 0]),
            Err(CodecError::TooShort { needed: STATUS_HEADER_LEN, actual: 4 })
        );

        let invalid_mode = [0, 1, PROTOCOL_VERSION, 0x03, 0, 12, 0, 0];
        assert_eq!(
            StatusPacket::decode(&invalid_mode),
            Err(CodecError::InvalidField { field: "status mode", value: 3 })
        );

        assert_eq!(StatusExtension::decode(0x77, &[1, 2]), Err(CodecError::UnknownTag(0x77)));

        let mut zero_total = StatusPacket::default().encode();
        zero_total.extend_from_slice(&[9, status_tag::DISK, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            StatusPacket::decode(&zero_total),
            Err(CodecError::InvalidField { field: "disk usage", value: 0 })
        );

        let mut truncated = StatusPacket::default().encode();
        truncated.extend_from_slice(&[21, status_tag::CAN, 0, 0]);
        assert!(matches!(StatusPacket::decode(&truncated), Err(CodecError::TooShort { .. })));
    }
}
