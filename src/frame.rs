// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use thiserror::Error;
use crate::crc::crc16;
use crate::protocol::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Chunk does not fit into a single 1024-byte block
    #[error("invalid chunk size: {len} bytes (max 1024)")]
    InvalidChunkSize { len: usize },
}

/// One wire frame: start byte, sequence number, complement, padded block, CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap up to 1024 bytes of `content` into a frame with sequence number `seq`.
    ///
    /// Content of 128 bytes or less goes into a 128-byte block behind `SOH`,
    /// anything longer into a 1024-byte block behind `STX`. Padding is zero.
    pub fn build(content: &[u8], seq: u8) -> Result<Self, FrameError> {
        let (start, block_len) = match content.len() {
            len if len <= BLOCK_128 => (Control::Soh, BLOCK_128),
            len if len <= BLOCK_1024 => (Control::Stx, BLOCK_1024),
            len => return Err(FrameError::InvalidChunkSize { len }),
        };

        let mut bytes = Vec::with_capacity(FRAME_PREFIX_LEN + block_len + FRAME_SUFFIX_LEN);
        bytes.extend_from_slice(&[start.byte(), seq, 0xFF - seq]);
        bytes.extend_from_slice(content);
        bytes.resize(FRAME_PREFIX_LEN + block_len, 0);

        let crc = crc16(&bytes[FRAME_PREFIX_LEN..]);
        bytes.extend_from_slice(&crc.to_be_bytes());

        Ok(Frame { bytes })
    }

    pub fn start(&self) -> u8 {
        self.bytes[0]
    }

    pub fn seq(&self) -> u8 {
        self.bytes[1]
    }

    pub fn seq_complement(&self) -> u8 {
        self.bytes[2]
    }

    /// Padded data block
    pub fn block(&self) -> &[u8] {
        &self.bytes[FRAME_PREFIX_LEN..self.bytes.len() - FRAME_SUFFIX_LEN]
    }

    pub fn crc(&self) -> u16 {
        let n = self.bytes.len();
        u16::from_be_bytes([self.bytes[n - 2], self.bytes[n - 1]])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
