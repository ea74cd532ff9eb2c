// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire framing for the control surface.
//!
//! Requests: `[MAGIC0, MAGIC1, VERSION, op, payload...]`.
//! Responses: `[MAGIC0, MAGIC1, VERSION, op | 0x80, status, payload...]`.
//! Integers are little-endian.

use crate::error::{Error, Result};

pub const MAGIC0: u8 = b'C';
pub const MAGIC1: u8 = b'M';
pub const VERSION: u8 = 1;

pub const OP_IOCTL: u8 = 1;
pub const OP_WRITE: u8 = 2;
pub const OP_USAGE: u8 = 3;

pub const STATUS_OK: u8 = 0;
pub const STATUS_INVALID: u8 = 1;
pub const STATUS_MALFORMED: u8 = 2;
pub const STATUS_IO_ERROR: u8 = 3;
pub const STATUS_UNSUPPORTED: u8 = 4;
pub const STATUS_NOT_FOUND: u8 = 5;

/// Largest text command carried by `OP_WRITE`.
pub const MAX_WRITE_LEN: usize = 512;

const HEADER_LEN: usize = 4;
const IOCTL_LEN: usize = HEADER_LEN + 4 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    Ioctl { cmd: u32, pid: u32, addr: u64 },
    Write { text: &'a [u8] },
    Usage,
}

impl Request<'_> {
    pub fn op(&self) -> u8 {
        match self {
            Self::Ioctl { .. } => OP_IOCTL,
            Self::Write { .. } => OP_WRITE,
            Self::Usage => OP_USAGE,
        }
    }
}

/// Decodes a request frame, or returns the status to answer with.
pub fn decode_request(frame: &[u8]) -> core::result::Result<Request<'_>, u8> {
    if frame.len() < HEADER_LEN || frame[0] != MAGIC0 || frame[1] != MAGIC1 || frame[2] != VERSION {
        return Err(STATUS_MALFORMED);
    }
    match frame[3] {
        OP_IOCTL => {
            if frame.len() != IOCTL_LEN {
                return Err(STATUS_MALFORMED);
            }
            let cmd = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            let pid = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
            let mut addr = [0u8; 8];
            addr.copy_from_slice(&frame[12..20]);
            Ok(Request::Ioctl { cmd, pid, addr: u64::from_le_bytes(addr) })
        }
        OP_WRITE => {
            if frame.len() < HEADER_LEN + 2 {
                return Err(STATUS_MALFORMED);
            }
            let len = u16::from_le_bytes([frame[4], frame[5]]) as usize;
            if len > MAX_WRITE_LEN || frame.len() != HEADER_LEN + 2 + len {
                return Err(STATUS_MALFORMED);
            }
            Ok(Request::Write { text: &frame[6..] })
        }
        OP_USAGE => {
            if frame.len() != HEADER_LEN {
                Err(STATUS_MALFORMED)
            } else {
                Ok(Request::Usage)
            }
        }
        _ => Err(STATUS_UNSUPPORTED),
    }
}

/// Maps a library error onto a wire status.
pub fn status_for(err: &Error) -> u8 {
    match err {
        Error::Store { .. } | Error::Io(_) | Error::Migration(_) => STATUS_IO_ERROR,
        _ => STATUS_INVALID,
    }
}

fn header(op: u8, status: u8, extra: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + extra);
    out.extend_from_slice(&[MAGIC0, MAGIC1, VERSION, op | 0x80, status]);
    out
}

pub fn encode_status_response(op: u8, status: u8) -> Vec<u8> {
    header(op, status, 0)
}

pub fn encode_usage_response(text: &str) -> Vec<u8> {
    let mut out = header(OP_USAGE, STATUS_OK, 2 + text.len());
    out.extend_from_slice(&(text.len() as u16).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out
}

pub fn encode_write_response(status: u8, consumed: u32) -> Vec<u8> {
    let mut out = header(OP_WRITE, status, 4);
    out.extend_from_slice(&consumed.to_le_bytes());
    out
}

pub fn encode_ioctl_request(cmd: u32, pid: u32, addr: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(IOCTL_LEN);
    out.extend_from_slice(&[MAGIC0, MAGIC1, VERSION, OP_IOCTL]);
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&addr.to_le_bytes());
    out
}

pub fn encode_write_request(text: &[u8]) -> Result<Vec<u8>> {
    if text.len() > MAX_WRITE_LEN {
        return Err(Error::InvalidCommand(format!("command of {} bytes too long", text.len())));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + 2 + text.len());
    out.extend_from_slice(&[MAGIC0, MAGIC1, VERSION, OP_WRITE]);
    out.extend_from_slice(&(text.len() as u16).to_le_bytes());
    out.extend_from_slice(text);
    Ok(out)
}

pub fn encode_usage_request() -> Vec<u8> {
    vec![MAGIC0, MAGIC1, VERSION, OP_USAGE]
}

/// Returns the status of a response to `expected_op`.
pub fn decode_status_response(expected_op: u8, frame: &[u8]) -> Result<u8> {
    if frame.len() < 5
        || frame[0] != MAGIC0
        || frame[1] != MAGIC1
        || frame[2] != VERSION
        || frame[3] != (expected_op | 0x80)
    {
        return Err(Error::InvalidCommand("corrupted response".into()));
    }
    Ok(frame[4])
}

pub fn decode_usage_response(frame: &[u8]) -> Result<String> {
    let status = decode_status_response(OP_USAGE, frame)?;
    if status != STATUS_OK || frame.len() < 7 {
        return Err(Error::InvalidCommand(format!("usage status {status}")));
    }
    let len = u16::from_le_bytes([frame[5], frame[6]]) as usize;
    let text = frame
        .get(7..7 + len)
        .filter(|_| frame.len() == 7 + len)
        .ok_or_else(|| Error::InvalidCommand("corrupted usage response".into()))?;
    String::from_utf8(text.to_vec()).map_err(|_| Error::InvalidCommand("usage not utf-8".into()))
}

/// Returns `(status, consumed)` of a write response.
pub fn decode_write_response(frame: &[u8]) -> Result<(u8, u32)> {
    let status = decode_status_response(OP_WRITE, frame)?;
    if frame.len() != 9 {
        return Err(Error::InvalidCommand("corrupted write response".into()));
    }
    Ok((status, u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ioctl() {
        let frame = encode_ioctl_request(2, 77, 0x7fff_0000_1000);
        assert_eq!(
            decode_request(&frame),
            Ok(Request::Ioctl { cmd: 2, pid: 77, addr: 0x7fff_0000_1000 })
        );
    }

    #[test]
    fn rejects_bad_frames() {
        assert_eq!(decode_request(b"CM"), Err(STATUS_MALFORMED));
        assert_eq!(decode_request(b"XM\x01\x03"), Err(STATUS_MALFORMED));
        assert_eq!(decode_request(b"CM\x01\x09"), Err(STATUS_UNSUPPORTED));
        assert_eq!(decode_request(b"CM\x01\x03\x00"), Err(STATUS_MALFORMED));
        // Declared length disagrees with the payload.
        assert_eq!(decode_request(b"CM\x01\x02\x05\x00abc"), Err(STATUS_MALFORMED));
    }

    #[test]
    fn write_length_is_bounded() {
        assert!(encode_write_request(&[b'1'; MAX_WRITE_LEN + 1]).is_err());
        let mut frame = vec![MAGIC0, MAGIC1, VERSION, OP_WRITE];
        frame.extend_from_slice(&((MAX_WRITE_LEN + 1) as u16).to_le_bytes());
        frame.extend(std::iter::repeat(b'1').take(MAX_WRITE_LEN + 1));
        assert_eq!(decode_request(&frame), Err(STATUS_MALFORMED));
    }

    #[test]
    fn usage_response_carries_text() {
        let frame = encode_usage_response("hello\n");
        assert_eq!(&frame[..5], &[MAGIC0, MAGIC1, VERSION, OP_USAGE | 0x80, STATUS_OK]);
        assert_eq!(decode_usage_response(&frame).unwrap(), "hello\n");
        assert!(decode_usage_response(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn write_response_carries_consumed() {
        let frame = encode_write_response(STATUS_OK, 15);
        assert_eq!(decode_write_response(&frame).unwrap(), (STATUS_OK, 15));
        assert!(decode_status_response(OP_USAGE, &frame).is_err());
    }
}
