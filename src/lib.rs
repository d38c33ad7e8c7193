// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash-device image composition.
//!
//! Given a declarative flash layout — regions stacked at fixed offsets,
//! firmware volumes built from ordered file lists, files optionally
//! encapsulated in GUID-defined sections — `flashpack` assembles the
//! final flat binary images, invoking the external volume encoder and
//! codec tools and validating every offset, size, and alignment along
//! the way.
//!
//! The pipeline runs composer → volume builder → section encoder →
//! tool registry; each layer returns a completed byte blob that its
//! caller embeds in the next-larger container.

pub mod compose;
pub mod error;
pub mod guid;
pub mod layout;
pub mod registry;
pub mod section;
pub mod tool;
pub mod volume;

use std::path::PathBuf;

pub use error::{BuildError, BuildResult};
pub use guid::Guid;

/// Default contents of the address-info side file written next to each
/// volume manifest.
const DEFAULT_ADDRESS_TEMPLATE: &str = "\
[options]
EFI_BOOT_DRIVER_BASE_ADDRESS = 0x0
EFI_RUNTIME_DRIVER_BASE_ADDRESS = 0x0
";

/// Everything one build run shares: the codec registry, the external
/// tool seam, output locations, and the volume memoization cache.
///
/// Passed explicitly into every build call, never held in process-wide
/// globals, so several builds can run in one process without
/// cross-contamination.
pub struct BuildContext<'a> {
    pub registry: &'a registry::ToolRegistry,
    pub runner: &'a dyn tool::ToolRunner,
    /// Directory receiving manifests, staged blobs, volumes, and
    /// device images.
    pub out_dir: PathBuf,
    /// Command wrapping a raw payload in a neutral section (codecs
    /// consume section-shaped input).
    pub section_tool: String,
    /// Command encoding one firmware volume from a generation
    /// manifest.
    pub volume_tool: String,
    /// Template for the per-volume address-info side file.
    pub address_template: String,
    /// File-encode fan-out; 1 disables parallel encoding.
    pub jobs: usize,
    /// Pass `-v` to the volume encoder.
    pub verbose: bool,
    pub(crate) volumes: volume::VolumeCache,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        registry: &'a registry::ToolRegistry,
        runner: &'a dyn tool::ToolRunner,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            runner,
            out_dir: out_dir.into(),
            section_tool: "GenSec".to_string(),
            volume_tool: "GenFv".to_string(),
            address_template: DEFAULT_ADDRESS_TEMPLATE.to_string(),
            jobs: 1,
            verbose: false,
            volumes: volume::VolumeCache::new(),
        }
    }
}
