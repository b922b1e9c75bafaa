//! ZKTeco packet codec.
//!
//! A TCP frame is an 8-byte prefix (`50 50 82 7d`, payload length as u16 LE,
//! two zero bytes) followed by an 8-byte header (command, checksum, session
//! id, reply id; all u16 LE) and the command data.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use super::{DeviceLog, DeviceUser};
use crate::error::DeviceError;

pub mod cmd {
    pub const CONNECT: u16 = 1000;
    pub const EXIT: u16 = 1001;
    pub const AUTH: u16 = 1102;
    pub const PREPARE_DATA: u16 = 1500;
    pub const DATA: u16 = 1501;
    pub const FREE_DATA: u16 = 1502;
    pub const DATA_WRRQ: u16 = 1503;
    pub const DATA_RDY: u16 = 1504;
    pub const GET_FREE_SIZES: u16 = 50;
    pub const REG_EVENT: u16 = 500;

    pub const ACK_OK: u16 = 2000;
    pub const ACK_ERROR: u16 = 2001;
    pub const ACK_DATA: u16 = 2002;
    pub const ACK_UNAUTH: u16 = 2005;
}

/// Buffered-read request bodies.
pub mod request {
    pub const ATTENDANCE_LOGS: &[u8] = &[0x01, 0x0d, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    pub const USERS: &[u8] = &[0x01, 0x09, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
}

pub const TCP_PREFIX: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];
pub const TCP_HEADER_LEN: usize = 16;
/// Largest data chunk the device sends per `DATA_RDY` request.
pub const MAX_CHUNK: usize = 65472;
pub const USER_RECORD_LEN: usize = 72;
pub const ATTENDANCE_RECORD_LEN: usize = 40;

const USHRT_MAX: u32 = 65535;

fn u16_at(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn u32_at(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// One's-complement style checksum over little-endian u16 words.
pub fn checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for word in buf.chunks(2) {
        let value = match word {
            [lo, hi] => u32::from(u16::from_le_bytes([*lo, *hi])),
            [last] => u32::from(*last),
            _ => 0,
        };
        sum = (sum + value) % USHRT_MAX;
    }
    (USHRT_MAX - sum - 1) as u16
}

/// Build a TCP frame. The reply id on the wire is `reply_id + 1`.
pub fn encode_tcp_packet(command: u16, session_id: u16, reply_id: u16, data: &[u8]) -> Vec<u8> {
    let next_reply = reply_id.wrapping_add(1) % (USHRT_MAX as u16);

    let mut inner = Vec::with_capacity(8 + data.len());
    inner.extend_from_slice(&command.to_le_bytes());
    inner.extend_from_slice(&[0, 0]);
    inner.extend_from_slice(&session_id.to_le_bytes());
    inner.extend_from_slice(&next_reply.to_le_bytes());
    inner.extend_from_slice(data);
    let sum = checksum(&inner);
    inner[2..4].copy_from_slice(&sum.to_le_bytes());

    let mut frame = Vec::with_capacity(8 + inner.len());
    frame.extend_from_slice(&TCP_PREFIX);
    frame.extend_from_slice(&(inner.len() as u16).to_le_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&inner);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: u16,
    pub checksum: u16,
    pub session_id: u16,
    pub reply_id: u16,
    /// Length of everything after the 8-byte prefix.
    pub payload_len: u16,
}

/// Decode the 16-byte TCP header at the start of `frame`.
///
/// # Errors
/// Returns a protocol error when the frame is too short or the prefix is
/// wrong.
pub fn decode_tcp_header(frame: &[u8]) -> Result<PacketHeader, DeviceError> {
    if frame.len() < TCP_HEADER_LEN {
        return Err(DeviceError::Protocol(format!(
            "short frame: {} bytes",
            frame.len()
        )));
    }
    if frame[0..4] != TCP_PREFIX {
        return Err(DeviceError::Protocol("bad frame prefix".into()));
    }
    let field = |at| u16_at(frame, at).unwrap_or(0);
    Ok(PacketHeader {
        payload_len: field(4),
        command: field(8),
        checksum: field(10),
        session_id: field(12),
        reply_id: field(14),
    })
}

/// Whether a frame is an unsolicited real-time attendance event.
pub fn is_realtime_event(frame: &[u8]) -> bool {
    let inner = strip_tcp_prefix(frame);
    matches!(
        (u16_at(inner, 0), u16_at(inner, 4)),
        (Some(cmd::REG_EVENT), Some(1))
    )
}

pub fn strip_tcp_prefix(frame: &[u8]) -> &[u8] {
    if frame.len() >= 8 && frame[0..4] == TCP_PREFIX {
        &frame[8..]
    } else {
        frame
    }
}

/// Null-terminated ASCII field.
pub fn ascii_field(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

/// Decode a 72-byte user record.
pub fn decode_user(record: &[u8]) -> Option<DeviceUser> {
    if record.len() < USER_RECORD_LEN {
        return None;
    }
    Some(DeviceUser {
        device_user_id: ascii_field(&record[48..57]),
        device_name: ascii_field(&record[11..35]),
    })
}

/// Decode a 40-byte attendance record.
pub fn decode_attendance(record: &[u8]) -> Option<DeviceLog> {
    if record.len() < ATTENDANCE_RECORD_LEN {
        return None;
    }
    Some(DeviceLog {
        device_user_id: ascii_field(&record[2..11]),
        verify_type: record[11],
        punch_type: record[12],
        timestamp: decode_time(u32_at(record, 27)?),
    })
}

/// Decode a packed device time. Seconds since 2000 in a 31-day-month
/// calendar; a day past the end of its month is clamped to the last day.
pub fn decode_time(mut packed: u32) -> NaiveDateTime {
    let second = packed % 60;
    packed /= 60;
    let minute = packed % 60;
    packed /= 60;
    let hour = packed % 24;
    packed /= 24;
    let day = packed % 31 + 1;
    packed /= 31;
    let month = packed % 12 + 1;
    packed /= 12;
    let year = i32::try_from(packed).unwrap_or(0) + 2000;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| {
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            let last = last_day_of_month(first)?;
            NaiveDate::from_ymd_opt(year, month, day.min(last))
        })
        .unwrap_or_default();
    date.and_hms_opt(hour, minute, second)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN))
}

fn last_day_of_month(first: NaiveDate) -> Option<u32> {
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
    };
    Some(next.pred_opt()?.day())
}

/// Reply code name for error messages.
pub fn command_name(code: u16) -> &'static str {
    match code {
        2000 => "ACK_OK",
        2001 => "ACK_ERROR",
        2002 => "ACK_DATA",
        2003 => "ACK_RETRY",
        2004 => "ACK_REPEAT",
        2005 => "ACK_UNAUTH",
        0xFFFF => "ACK_UNKNOWN",
        0xFFFD => "ACK_ERROR_CMD",
        0xFFFC => "ACK_ERROR_INIT",
        0xFFFB => "ACK_ERROR_DATA",
        _ => "UNKNOWN",
    }
}

/// Size field of a `PREPARE_DATA` reply body.
pub fn prepare_data_size(body: &[u8]) -> Option<usize> {
    u32_at(body, 1).map(|n| n as usize)
}

/// Split a buffered-read reply into fixed-size records, skipping the
/// 4-byte length prefix.
pub fn records(data: &[u8], record_len: usize) -> impl Iterator<Item = &[u8]> {
    data.get(4..)
        .unwrap_or_default()
        .chunks_exact(record_len)
}
