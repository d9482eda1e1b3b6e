// Copyright 2020-2026 Simserve developers.
// This file is part of Simserve.

// Simserve is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Simserve is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Simserve.  If not, see <http://www.gnu.org/licenses/>.

//! Wire framing for the request channel. All integers are big-endian.
//!
//! ```text
//! handshake:  [i64 node_id]
//! request:    [i32 seqno][i32 len][len payload bytes]
//! ack:        [i32 seqno][i8 ok][i32 msg_len][msg_len utf8 bytes]
//! ```
//!
//! `ok` is 1 for success, in which case `msg_len` is zero; 0 for a
//! failure carrying the server-side failure message.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Upper bound on request payloads and failure messages.
pub const MAX_PAYLOAD: usize = 1 << 20;

pub fn write_handshake<W: Write>(writer: &mut W, node_id: i64) -> io::Result<()> {
    writer.write_i64::<BigEndian>(node_id)
}

pub fn read_handshake<R: Read>(reader: &mut R) -> io::Result<i64> {
    reader.read_i64::<BigEndian>()
}

pub fn write_request<W: Write>(writer: &mut W, seqno: i32, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("request payload of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_i32::<BigEndian>(seqno)?;
    writer.write_i32::<BigEndian>(payload.len() as i32)?;
    writer.write_all(payload)
}

pub fn read_request<R: Read>(reader: &mut R) -> io::Result<(i32, Vec<u8>)> {
    let seqno = reader.read_i32::<BigEndian>()?;
    let len = reader.read_i32::<BigEndian>()?;
    if len < 0 || len as usize > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request length {len} out of range"),
        ));
    }
    let mut payload = vec![0; len as usize];
    reader.read_exact(&mut payload)?;
    Ok((seqno, payload))
}

/// Writes an acknowledgment; `failure` carries the server-side failure
/// message when the request was performed and failed.
pub fn write_ack<W: Write>(writer: &mut W, seqno: i32, failure: Option<&str>) -> io::Result<()> {
    writer.write_i32::<BigEndian>(seqno)?;
    match failure {
        None => {
            writer.write_i8(1)?;
            writer.write_i32::<BigEndian>(0)
        }
        Some(message) => {
            let bytes = message.as_bytes();
            let len = bytes.len().min(MAX_PAYLOAD);
            writer.write_i8(0)?;
            writer.write_i32::<BigEndian>(len as i32)?;
            writer.write_all(&bytes[..len])
        }
    }
}

pub fn read_ack<R: Read>(reader: &mut R) -> io::Result<(i32, Option<String>)> {
    let seqno = reader.read_i32::<BigEndian>()?;
    let ok = reader.read_i8()?;
    let len = reader.read_i32::<BigEndian>()?;
    if len < 0 || len as usize > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("ack message length {len} out of range"),
        ));
    }
    match ok {
        1 if len == 0 => Ok((seqno, None)),
        0 => {
            let mut bytes = vec![0; len as usize];
            reader.read_exact(&mut bytes)?;
            Ok((seqno, Some(String::from_utf8_lossy(&bytes).into_owned())))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed ack: ok={ok}, msg_len={len}"),
        )),
    }
}
