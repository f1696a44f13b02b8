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

//! Bitwise CRC-16, MSB first

use crate::protocol::CRC_POLYNOMIAL;

/// CRC-16 over `data` with the XMODEM polynomial and a zero initial value
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with(data, CRC_POLYNOMIAL, 0)
}

/// CRC-16 over `data` with an arbitrary generator polynomial.
///
/// `initial` lets a caller continue a checksum across several buffers.
pub fn crc16_with(data: &[u8], polynomial: u16, initial: u16) -> u16 {
    data.iter()
        .fold(initial, |crc, &byte| crc16_byte(byte, crc, polynomial))
}

fn crc16_byte(byte: u8, crc: u16, polynomial: u16) -> u16 {
    // running CRC lives in the upper 16 bits of a 24-bit register
    let poly = (polynomial as u32) << 8;
    let mut combined = (crc as u32) ^ ((byte as u32) << 8);

    for _ in 0..16 {
        combined = if combined & 0x80_0000 != 0 {
            (combined << 1) ^ poly
        } else {
            combined << 1
        };
        combined &= 0xFF_FFFF;
    }

    ((combined >> 8) & 0xFFFF) as u16
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crc::{CRC_16_XMODEM, Crc};

    const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_crc16_matches_reference() {
        let samples: [&[u8]; 4] = [
            b"A",
            b"Test data",
            &[0u8; 128],
            &[0xFFu8; 1024],
        ];
        for data in samples {
            assert_eq!(crc16(data), XMODEM.checksum(data), "data len {}", data.len());
        }

        let counting: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(crc16(&counting), XMODEM.checksum(&counting));
    }

    #[test]
    fn test_crc16_chains_across_buffers() {
        let data = b"header then payload";
        let (head, tail) = data.split_at(6);
        let chained = crc16_with(tail, CRC_POLYNOMIAL, crc16(head));
        assert_eq!(chained, crc16(data));
    }

    #[test]
    fn test_crc16_is_deterministic_for_other_polynomials() {
        let data = b"firmware";
        for poly in [0x1021, 0x8005, 0x3D65] {
            for init in [0x0000, 0xFFFF, 0x1D0F] {
                assert_eq!(crc16_with(data, poly, init), crc16_with(data, poly, init));
            }
        }
        assert_ne!(crc16_with(data, 0x8005, 0), crc16_with(data, 0x1021, 0));
    }
}
