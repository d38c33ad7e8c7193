// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for image composition.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::guid::Guid;
use crate::tool::ToolError;

/// Composition result type.
pub type BuildResult<T> = Result<T, BuildError>;

/// Everything that can stop an image build.
///
/// Geometry and overflow violations are fatal to the whole image: the
/// composer either produces a complete, internally consistent image or
/// produces none. Every variant names the offending region, volume, or
/// section and carries the numeric mismatch so the layout can be fixed
/// without re-running under tracing.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The section GUID has no registry entry, or the entry's command
    /// could not be found when it was first needed.
    #[error("no usable codec for section GUID {0}")]
    ToolNotFound(Guid),

    /// A codec (or the neutral section wrapper feeding it) failed.
    #[error("codec for section GUID {guid} failed: {source}")]
    CodecFailed {
        guid: Guid,
        #[source]
        source: ToolError,
    },

    /// The external volume encoder failed.
    #[error("volume `{name}`: encoder failed: {source}")]
    VolumeEncodeFailed {
        name: String,
        #[source]
        source: ToolError,
    },

    /// A region references a volume name absent from the layout.
    #[error(
        "volume `{name}` is not described in the layout{}",
        suggestion_text(.suggestion)
    )]
    VolumeNotDescribed {
        name: String,
        suggestion: Option<String>,
    },

    /// The block-size grid cannot host the region: either no grid entry
    /// covers its offset, or its size is not a whole number of blocks.
    #[error(
        "region `{region}` at offset {offset:#x}: {}",
        block_fit_text(.size, .block_size)
    )]
    NoFittingBlockSize {
        region: String,
        offset: u64,
        size: u64,
        block_size: Option<u64>,
    },

    /// The composer-computed load address violates the volume's
    /// declared alignment.
    #[error(
        "volume `{name}`: load address {load_address:#x} violates required \
         alignment {required_alignment:#x}"
    )]
    MisalignedVolume {
        name: String,
        load_address: u64,
        required_alignment: u64,
    },

    /// A volume declares an alignment that is not a power of two.
    #[error("volume `{name}`: alignment {alignment:#x} is not a power of two")]
    BadAlignment { name: String, alignment: u64 },

    /// Content produced for a region exceeds its declared size. Never
    /// silently truncated.
    #[error(
        "region `{region}`: content is {actual:#x} bytes but the region is \
         declared {declared:#x}"
    )]
    RegionOverflow {
        region: String,
        actual: u64,
        declared: u64,
    },

    /// A region starts before the previous region's declared extent
    /// ends.
    #[error(
        "region `{region}` at {offset:#x} overlaps the previous region \
         (which extends to {cursor:#x})"
    )]
    RegionOverlap {
        region: String,
        offset: u64,
        cursor: u64,
    },

    /// A region extends past the end of the flash device.
    #[error(
        "region `{region}` ends at {end:#x}, beyond the {device_size:#x}-byte \
         device"
    )]
    RegionOutOfBounds {
        region: String,
        end: u64,
        device_size: u64,
    },

    /// A section grew past the 24-bit size field of its header.
    #[error("section of {size:#x} bytes exceeds the 24-bit section size limit")]
    SectionTooLarge { size: usize },

    /// An input file named by the layout could not be read.
    #[error("could not read `{path}`: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O on a build product.
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn suggestion_text(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean `{}`?)", s),
        None => String::new(),
    }
}

fn block_fit_text(size: &u64, block_size: &Option<u64>) -> String {
    match block_size {
        Some(b) => format!(
            "size {:#x} is not a whole number of {:#x}-byte blocks",
            size, b
        ),
        None => format!(
            "no block-size grid entry covers this offset (size {:#x})",
            size
        ),
    }
}
