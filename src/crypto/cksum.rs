/* This file is part of cryptobak.
 *
 * cryptobak is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * cryptobak is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with cryptobak.  If not, see <http://www.gnu.org/licenses/>.
 */

//! POSIX `cksum(1)`-compatible checksum, used as the end-to-end file
//! integrity check (spec §4.4, §8). This is CRC-32/BZIP2 under the hood
//! (polynomial 0x04c11db7, non-reflected, initial value zero), with the
//! byte length of the input folded in least-significant-byte-first before
//! the final one's-complement. No crate in reach implements this exact
//! variant, so it's hand-rolled here the way the teacher hand-rolls its own
//! non-standard digest in `hashes.rs`.

const POLY: u32 = 0x04c1_1db7;

fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut crc = (byte as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            bit += 1;
        }
        table[byte] = crc;
        byte += 1;
    }
    table
}

fn step(table: &[u32; 256], crc: u32, byte: u8) -> u32 {
    table[(((crc >> 24) ^ u32::from(byte)) & 0xff) as usize] ^ (crc << 8)
}

/// Computes the POSIX `cksum` value of `data`, matching the real Unix
/// utility byte for byte.
pub fn cksum(data: &[u8]) -> u32 {
    let table = build_table();
    let mut crc = data.iter().fold(0u32, |crc, &byte| step(&table, crc, byte));

    let mut len = data.len() as u64;
    while len != 0 {
        crc = step(&table, crc, (len & 0xff) as u8);
        len >>= 8;
    }

    !crc
}
