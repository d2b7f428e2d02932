/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! SNCP framing.
//!
//! Every frame starts with a fixed 60 byte big-endian header:
//!
//! ```text
//! seqid:i64 | header_len:u16 (=60) | service_id:u128 | service_version:i32 |
//! action_id:u128 | caller:6 bytes | body_len:i32 | retcode:i32
//! ```
//!
//! followed by `body_len` bytes of opaque payload. The caller address is
//! four IPv4 octets and a port. A first octet of zero means no address.

use std::cmp;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub const HEADER_SIZE: usize = 60;

pub const RETCODE_ILLEGAL_SERVICE: i32 = 1 << 1;
pub const RETCODE_ILLEGAL_VERSION: i32 = 1 << 2;
pub const RETCODE_ILLEGAL_ACTION: i32 = 1 << 3;
pub const RETCODE_THROW_EXCEPTION: i32 = 1 << 4;

pub const DEFAULT_MAX_BODY: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("header length tag {0} does not match 60")]
    HeaderLength(u16),

    #[error("request carries non-zero return code {0}")]
    NonZeroRetcode(i32),

    #[error("negative body length {0}")]
    NegativeBodyLength(i32),

    #[error("body length {len} exceeds maximum {max}")]
    BodyTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub seqid: i64,
    pub service_id: u128,
    pub service_version: i32,
    pub action_id: u128,
    pub caller: Option<SocketAddrV4>,
    pub body_len: i32,
    pub retcode: i32,
}

impl Header {
    /// Heartbeat frames have zero ids and no body.
    pub fn ping() -> Self {
        Self::default()
    }

    pub fn is_ping(&self) -> bool {
        self.seqid == 0 && self.service_id == 0 && self.action_id == 0 && self.body_len == 0
    }

    /// Response header for `req`. The response echoes the request's
    /// routing fields so the peer can correlate it. The body length is
    /// filled in by [`encode_frame`].
    pub fn response_to(req: &Header, retcode: i32) -> Self {
        Self {
            seqid: req.seqid,
            service_id: req.service_id,
            service_version: req.service_version,
            action_id: req.action_id,
            caller: None,
            body_len: 0,
            retcode,
        }
    }

    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0..8].copy_from_slice(&self.seqid.to_be_bytes());
        out[8..10].copy_from_slice(&(HEADER_SIZE as u16).to_be_bytes());
        out[10..26].copy_from_slice(&self.service_id.to_be_bytes());
        out[26..30].copy_from_slice(&self.service_version.to_be_bytes());
        out[30..46].copy_from_slice(&self.action_id.to_be_bytes());

        match &self.caller {
            Some(addr) => {
                out[46..50].copy_from_slice(&addr.ip().octets());
                out[50..52].copy_from_slice(&addr.port().to_be_bytes());
            }
            None => out[46..52].fill(0),
        }

        out[52..56].copy_from_slice(&self.body_len.to_be_bytes());
        out[56..60].copy_from_slice(&self.retcode.to_be_bytes());
    }

    /// Decodes a header, checking only the length tag. Return code and
    /// body length rules depend on the direction and are left to
    /// [`FrameReader`].
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let header_len = u16::from_be_bytes([buf[8], buf[9]]);

        if header_len as usize != HEADER_SIZE {
            return Err(FrameError::HeaderLength(header_len));
        }

        let caller = if buf[46] == 0 {
            None
        } else {
            Some(SocketAddrV4::new(
                Ipv4Addr::new(buf[46], buf[47], buf[48], buf[49]),
                u16::from_be_bytes([buf[50], buf[51]]),
            ))
        };

        Ok(Self {
            seqid: i64::from_be_bytes(array(&buf[0..8])),
            service_id: u128::from_be_bytes(array(&buf[10..26])),
            service_version: i32::from_be_bytes(array(&buf[26..30])),
            action_id: u128::from_be_bytes(array(&buf[30..46])),
            caller,
            body_len: i32::from_be_bytes(array(&buf[52..56])),
            retcode: i32::from_be_bytes(array(&buf[56..60])),
        })
    }
}

fn array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(src);

    out
}

/// Length field for a body of `len` bytes.
pub fn body_len(len: usize) -> Result<i32, FrameError> {
    i32::try_from(len).map_err(|_| FrameError::BodyTooLarge {
        len,
        max: i32::MAX as usize,
    })
}

/// Appends a complete frame. The header's body length is taken from `body`.
/// Nothing is appended if the body does not fit the length field.
pub fn encode_frame(header: &Header, body: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    let mut h = *header;
    h.body_len = body_len(body.len())?;

    let mut buf = [0; HEADER_SIZE];
    h.encode(&mut buf);

    out.reserve(HEADER_SIZE + body.len());
    out.extend_from_slice(&buf);
    out.extend_from_slice(body);

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Incoming requests. The return code must be zero.
    Request,

    /// Incoming responses. The return code is passed through.
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More input is needed. The value is the number of bytes still
    /// missing from the current section.
    NeedMore(usize),
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Route,
    Body,
    End,
}

/// Incremental frame decoder. Input may arrive in pieces of any size. Both
/// the header and the body are accumulated across calls.
pub struct FrameReader {
    mode: Mode,
    max_body: usize,
    state: ReadState,
    header_buf: [u8; HEADER_SIZE],
    header_pos: usize,
    header: Header,
    body: Vec<u8>,
}

impl FrameReader {
    pub fn new(mode: Mode, max_body: usize) -> Self {
        Self {
            mode,
            max_body,
            state: ReadState::Route,
            header_buf: [0; HEADER_SIZE],
            header_pos: 0,
            header: Header::default(),
            body: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReadState::Route && self.header_pos == 0
    }

    /// Consumes input and returns how many bytes were used along with the
    /// progress made. Once `Complete` is returned, no more input is
    /// consumed until the frame is taken.
    pub fn read(&mut self, src: &[u8]) -> Result<(usize, Progress), FrameError> {
        let mut pos = 0;

        if self.state == ReadState::Route {
            let size = cmp::min(HEADER_SIZE - self.header_pos, src.len());

            self.header_buf[self.header_pos..(self.header_pos + size)]
                .copy_from_slice(&src[..size]);
            self.header_pos += size;
            pos += size;

            if self.header_pos < HEADER_SIZE {
                return Ok((pos, Progress::NeedMore(HEADER_SIZE - self.header_pos)));
            }

            let header = Header::decode(&self.header_buf)?;

            if self.mode == Mode::Request && header.retcode != 0 {
                return Err(FrameError::NonZeroRetcode(header.retcode));
            }

            if header.body_len < 0 {
                return Err(FrameError::NegativeBodyLength(header.body_len));
            }

            let body_len = header.body_len as usize;

            if body_len > self.max_body {
                return Err(FrameError::BodyTooLarge {
                    len: body_len,
                    max: self.max_body,
                });
            }

            self.header = header;
            self.body.clear();
            self.body.reserve(body_len);
            self.state = ReadState::Body;
        }

        if self.state == ReadState::Body {
            let body_len = self.header.body_len as usize;

            let size = cmp::min(body_len - self.body.len(), src.len() - pos);

            self.body.extend_from_slice(&src[pos..(pos + size)]);
            pos += size;

            let remaining = body_len - self.body.len();

            if remaining > 0 {
                return Ok((pos, Progress::NeedMore(remaining)));
            }

            self.state = ReadState::End;
        }

        Ok((pos, Progress::Complete))
    }

    /// Returns the completed frame and resets for the next one.
    pub fn take_frame(&mut self) -> Option<Frame> {
        if self.state != ReadState::End {
            return None;
        }

        let frame = Frame {
            header: self.header,
            body: mem::take(&mut self.body),
        };

        self.recycle();

        Some(frame)
    }

    pub fn recycle(&mut self) {
        self.state = ReadState::Route;
        self.header_pos = 0;
        self.header = Header::default();
        self.body.clear();
    }
}
