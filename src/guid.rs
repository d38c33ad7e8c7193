// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! 128-bit identifiers, used to key codec tools and to name firmware
//! volumes.
//!
//! Identifiers are stored in their 16-byte binary layout (one
//! little-endian `u32`, two little-endian `u16`s, eight bytes) so that
//! registry lookup and memoization compare the binary value, never the
//! text form. Two differently-formatted spellings of the same GUID
//! always collide.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid([u8; 16]);

impl Guid {
    /// Builds a GUID from its four canonical fields.
    pub const fn new(a: u32, b: u16, c: u16, d: [u8; 8]) -> Self {
        let ab = a.to_le_bytes();
        let bb = b.to_le_bytes();
        let cb = c.to_le_bytes();
        Guid([
            ab[0], ab[1], ab[2], ab[3], bb[0], bb[1], cb[0], cb[1], d[0],
            d[1], d[2], d[3], d[4], d[5], d[6], d[7],
        ])
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// General-purpose compressor (TianoCompress).
pub const TIANO_COMPRESS: Guid = Guid::new(
    0xA31280AD,
    0x481E,
    0x41B6,
    [0x95, 0xE8, 0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79],
);

/// High-ratio compressor (LzmaCompress).
pub const LZMA_COMPRESS: Guid = Guid::new(
    0xEE4E5898,
    0x3914,
    0x4259,
    [0x9D, 0x6E, 0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF],
);

/// x86-specific compressor variant (LzmaF86Compress).
pub const LZMA_F86_COMPRESS: Guid = Guid::new(
    0xD42AE6BD,
    0x1352,
    0x4BFB,
    [0x90, 0x9A, 0xCA, 0x72, 0xA6, 0xEA, 0xE8, 0x89],
);

/// Checksum generator (GenCrc32); also the type GUID of the built-in
/// checksum section encoder.
pub const CRC32_CHECKSUM: Guid = Guid::new(
    0xFC1BCDB0,
    0x7D31,
    0x49AA,
    [0x93, 0x6A, 0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83],
);

#[derive(Debug, Error)]
#[error("`{0}` is not a valid GUID")]
pub struct GuidParseError(String);

impl FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || GuidParseError(s.to_string());

        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 {
            return Err(err());
        }
        let (p0, p1, p2, p3, p4) =
            (parts[0], parts[1], parts[2], parts[3], parts[4]);
        if p0.len() != 8
            || p1.len() != 4
            || p2.len() != 4
            || p3.len() != 4
            || p4.len() != 12
            || !s.bytes().all(|b| b == b'-' || b.is_ascii_hexdigit())
        {
            return Err(err());
        }

        let a = u32::from_str_radix(p0, 16).map_err(|_| err())?;
        let b = u16::from_str_radix(p1, 16).map_err(|_| err())?;
        let c = u16::from_str_radix(p2, 16).map_err(|_| err())?;
        let d_hi = u16::from_str_radix(p3, 16).map_err(|_| err())?;

        let mut d = [0u8; 8];
        d[0] = (d_hi >> 8) as u8;
        d[1] = d_hi as u8;
        for (i, out) in d[2..].iter_mut().enumerate() {
            *out = u8::from_str_radix(&p4[i * 2..i * 2 + 2], 16)
                .map_err(|_| err())?;
        }

        Ok(Guid::new(a, b, c, d))
    }
}

impl TryFrom<String> for Guid {
    type Error = GuidParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Guid> for String {
    fn from(g: Guid) -> Self {
        g.to_string()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        let a = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let g2 = u16::from_le_bytes([b[4], b[5]]);
        let g3 = u16::from_le_bytes([b[6], b[7]]);
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-\
             {:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            a,
            g2,
            g3,
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
