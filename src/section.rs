// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GUID-defined section encoding.
//!
//! A section is the smallest unit of content inside a firmware file: a
//! 4-byte common header (24-bit little-endian total length plus a type
//! byte) followed by type-specific data. A GUID-defined section wraps
//! an arbitrary payload with the identifier of the codec needed to
//! decode it; encoding dispatches to that codec through the tool
//! registry. When no codec GUID is given, a built-in checksum encoder
//! wraps the payload without spawning anything.

use std::ffi::OsString;
use std::fs;

use crc::{Crc, CRC_32_ISO_HDLC};
use log::debug;

use crate::error::{BuildError, BuildResult};
use crate::guid::{self, Guid};
use crate::tool::ToolError;
use crate::BuildContext;

/// Raw (opaque payload) leaf section type.
pub const SECTION_RAW: u8 = 0x19;
/// GUID-defined encapsulation section type.
pub const SECTION_GUID_DEFINED: u8 = 0x02;

/// The payload must be run through the named codec before use.
pub const ATTR_PROCESSING_REQUIRED: u16 = 0x01;
/// The section carries a valid authentication status.
pub const ATTR_AUTH_STATUS_VALID: u16 = 0x02;

/// Common header length: 3-byte size + 1-byte type.
const COMMON_HEADER_LEN: usize = 4;
/// GUID-defined header length: common header + 16-byte GUID +
/// data offset `u16` + attributes `u16`.
const GUID_HEADER_LEN: usize = 24;

/// Largest representable section, limited by the 24-bit size field.
pub const MAX_SECTION_SIZE: usize = 0xFF_FFFF;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn common_header(total: usize, section_type: u8) -> BuildResult<[u8; 4]> {
    if total > MAX_SECTION_SIZE {
        return Err(BuildError::SectionTooLarge { size: total });
    }
    let size = (total as u32).to_le_bytes();
    Ok([size[0], size[1], size[2], section_type])
}

/// Wraps `payload` in a raw leaf section header.
pub fn raw_section(payload: &[u8]) -> BuildResult<Vec<u8>> {
    let total = COMMON_HEADER_LEN + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&common_header(total, SECTION_RAW)?);
    out.extend_from_slice(payload);
    Ok(out)
}

fn guid_defined_section(
    type_guid: &Guid,
    attributes: u16,
    prefix: &[u8],
    payload: &[u8],
) -> BuildResult<Vec<u8>> {
    let data_offset = GUID_HEADER_LEN + prefix.len();
    let total = data_offset + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&common_header(total, SECTION_GUID_DEFINED)?);
    out.extend_from_slice(type_guid.as_bytes());
    out.extend_from_slice(&(data_offset as u16).to_le_bytes());
    out.extend_from_slice(&attributes.to_le_bytes());
    out.extend_from_slice(prefix);
    out.extend_from_slice(payload);
    Ok(out)
}

/// The built-in fallback encoder: a checksum section over `payload`,
/// produced without any external tool. The stored CRC establishes the
/// authentication status, so that attribute bit is always set.
pub fn checksum_section(
    payload: &[u8],
    attributes: u16,
) -> BuildResult<Vec<u8>> {
    let sum = CRC32.checksum(payload);
    guid_defined_section(
        &guid::CRC32_CHECKSUM,
        attributes | ATTR_AUTH_STATUS_VALID,
        &sum.to_le_bytes(),
        payload,
    )
}

/// Encapsulates `payload` in a self-describing section.
///
/// With no `type_guid` the built-in checksum encoder is used. With one,
/// the codec is resolved through the registry (`ToolNotFound` if
/// absent, before any temporary file is created), the payload is
/// wrapped in a neutral section by the section-wrapper tool, run
/// through the codec in encode mode, and the codec output wrapped in
/// the final GUID-defined header with the requested attribute bits.
/// Exactly two external processes per call. Temporary files live in a
/// scoped directory and are removed on every exit path.
pub fn encode(
    ctx: &BuildContext<'_>,
    payload: &[u8],
    type_guid: Option<&Guid>,
    process_required: bool,
    auth_status_valid: bool,
    alignment: Option<u64>,
) -> BuildResult<Vec<u8>> {
    let mut attributes = 0u16;
    if process_required {
        attributes |= ATTR_PROCESSING_REQUIRED;
    }
    if auth_status_valid {
        attributes |= ATTR_AUTH_STATUS_VALID;
    }

    let type_guid = match type_guid {
        None => return checksum_section(payload, attributes),
        Some(g) => g,
    };
    let entry = ctx
        .registry
        .lookup(type_guid)
        .ok_or(BuildError::ToolNotFound(*type_guid))?
        .clone();

    let dir = tempfile::tempdir()?;
    let raw_path = dir.path().join("payload.raw");
    let wrapped_path = dir.path().join("payload.sec");
    let encoded_path = dir.path().join("payload.enc");
    fs::write(&raw_path, payload)?;

    // The codec consumes section-shaped input, not raw bytes.
    let mut wrap_args: Vec<OsString> = Vec::new();
    wrap_args.push("-s".into());
    wrap_args.push("EFI_SECTION_RAW".into());
    if let Some(align) = alignment {
        wrap_args.push("--align".into());
        wrap_args.push(align.to_string().into());
    }
    wrap_args.push("-o".into());
    wrap_args.push(wrapped_path.clone().into_os_string());
    wrap_args.push(raw_path.into_os_string());
    ctx.runner
        .run(&ctx.section_tool, &wrap_args)
        .map_err(|source| BuildError::CodecFailed {
            guid: *type_guid,
            source,
        })?;

    let codec_args: Vec<OsString> = vec![
        "-e".into(),
        "-o".into(),
        encoded_path.clone().into_os_string(),
        wrapped_path.into_os_string(),
    ];
    ctx.runner
        .run(&entry.command, &codec_args)
        .map_err(|source| match source {
            ToolError::NotFound(_) => BuildError::ToolNotFound(*type_guid),
            source => BuildError::CodecFailed {
                guid: *type_guid,
                source,
            },
        })?;

    let encoded = fs::read(&encoded_path)?;
    debug!(
        "section {}: {:#x} bytes -> {:#x} encoded",
        entry.short_name,
        payload.len(),
        encoded.len()
    );
    guid_defined_section(type_guid, attributes, &[], &encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolRegistry;
    use crate::tool::ToolRunner;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test runner: the wrap tool copies its input behind a raw
    /// header, the codec reverses its input bytes. Never spawns.
    struct FakeRunner {
        wrap_tool: String,
        calls: AtomicUsize,
    }

    impl FakeRunner {
        fn new(wrap_tool: &str) -> Self {
            Self {
                wrap_tool: wrap_tool.to_string(),
                calls: AtomicUsize::new(0),
            }
        }

        fn io_paths(args: &[OsString]) -> (PathBuf, PathBuf) {
            let out_at = args
                .iter()
                .position(|a| a == "-o")
                .expect("no -o argument");
            let output = PathBuf::from(args[out_at + 1].clone());
            let input = PathBuf::from(args.last().unwrap().clone());
            (input, output)
        }
    }

    impl ToolRunner for FakeRunner {
        fn run(
            &self,
            command: &str,
            args: &[OsString],
        ) -> Result<(), ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (input, output) = Self::io_paths(args);
            let data = std::fs::read(&input).unwrap();
            let transformed = if command == self.wrap_tool {
                raw_section(&data).unwrap()
            } else {
                data.iter().rev().copied().collect()
            };
            std::fs::write(&output, transformed).unwrap();
            Ok(())
        }
    }

    struct PanicRunner;

    impl ToolRunner for PanicRunner {
        fn run(&self, _: &str, _: &[OsString]) -> Result<(), ToolError> {
            panic!("no tool should run");
        }
    }

    fn test_ctx<'a>(
        registry: &'a ToolRegistry,
        runner: &'a dyn ToolRunner,
    ) -> BuildContext<'a> {
        BuildContext::new(registry, runner, "build")
    }

    #[test]
    fn checksum_section_layout() {
        let payload = [0xAAu8, 0xBB, 0xCC];
        let sec = checksum_section(&payload, 0).unwrap();

        let total = GUID_HEADER_LEN + 4 + payload.len();
        assert_eq!(sec.len(), total);
        // common header: 24-bit size, GUID-defined type
        assert_eq!(&sec[..4], &[total as u8, 0, 0, SECTION_GUID_DEFINED]);
        assert_eq!(&sec[4..20], crate::guid::CRC32_CHECKSUM.as_bytes());
        // data offset skips the stored checksum
        assert_eq!(
            u16::from_le_bytes([sec[20], sec[21]]),
            (GUID_HEADER_LEN + 4) as u16
        );
        assert_eq!(
            u16::from_le_bytes([sec[22], sec[23]]),
            ATTR_AUTH_STATUS_VALID
        );
        let stored = u32::from_le_bytes([sec[24], sec[25], sec[26], sec[27]]);
        assert_eq!(stored, CRC32.checksum(&payload));
        assert_eq!(&sec[28..], &payload);
    }

    #[test]
    fn no_guid_means_no_tool_invocation() {
        let registry = ToolRegistry::default_table();
        let runner = PanicRunner;
        let ctx = test_ctx(&registry, &runner);

        let sec = encode(&ctx, b"payload", None, false, true, None).unwrap();
        assert_eq!(sec[3], SECTION_GUID_DEFINED);
    }

    #[test]
    fn unknown_guid_fails_before_any_side_effect() {
        let registry = ToolRegistry::default_table();
        let runner = PanicRunner;
        let ctx = test_ctx(&registry, &runner);

        let unknown: Guid =
            "12345678-1234-1234-1234-123456789ABC".parse().unwrap();
        match encode(&ctx, b"payload", Some(&unknown), true, false, None) {
            Err(BuildError::ToolNotFound(g)) => assert_eq!(g, unknown),
            other => panic!("expected ToolNotFound, got {:?}", other),
        }
    }

    #[test]
    fn guided_encode_runs_exactly_two_tools() {
        let registry = ToolRegistry::default_table();
        let runner = FakeRunner::new("GenSec");
        let ctx = test_ctx(&registry, &runner);

        let payload = b"firmware bits".to_vec();
        let sec = encode(
            &ctx,
            &payload,
            Some(&guid::LZMA_COMPRESS),
            true,
            false,
            None,
        )
        .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);

        // final wrap: GUID-defined header around the codec output,
        // which is the reversed neutral-wrapped payload
        assert_eq!(&sec[4..20], guid::LZMA_COMPRESS.as_bytes());
        assert_eq!(
            u16::from_le_bytes([sec[22], sec[23]]),
            ATTR_PROCESSING_REQUIRED
        );
        let expected: Vec<u8> = raw_section(&payload)
            .unwrap()
            .iter()
            .rev()
            .copied()
            .collect();
        assert_eq!(&sec[GUID_HEADER_LEN..], &expected[..]);
    }

    #[test]
    fn oversized_section_is_rejected() {
        match common_header(MAX_SECTION_SIZE + 1, SECTION_RAW) {
            Err(BuildError::SectionTooLarge { size }) => {
                assert_eq!(size, MAX_SECTION_SIZE + 1)
            }
            other => panic!("expected SectionTooLarge, got {:?}", other),
        }
    }
}
