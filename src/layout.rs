// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parsed flash layout description.
//!
//! A layout names one or more flash devices, each a flat image composed
//! of fixed-offset regions, plus a table of firmware volumes those
//! regions may reference. The structures here are shaped data only;
//! geometry validation happens in the composer.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::guid::Guid;

/// Which bit value represents erased flash; padding uses the matching
/// fill byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum ErasePolarity {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "0")]
    Zero,
}

impl ErasePolarity {
    pub fn fill_byte(self) -> u8 {
        match self {
            ErasePolarity::One => 0xFF,
            ErasePolarity::Zero => 0x00,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErasePolarity::One => "1",
            ErasePolarity::Zero => "0",
        }
    }
}

/// One run of equally-sized blocks in a device's block-size grid.
#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BlockRun {
    pub size: u64,
    pub count: u64,
}

/// One file included in a firmware volume, optionally encapsulated in a
/// GUID-defined section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileSpec {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub section_guid: Option<Guid>,
    #[serde(default)]
    pub process_required: bool,
    #[serde(default)]
    pub auth_status_valid: bool,
    #[serde(default)]
    pub alignment: Option<u64>,
}

/// A named firmware volume: an ordered file list plus the metadata the
/// volume encoder needs.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Volume {
    #[serde(default)]
    pub base_address: Option<u64>,
    #[serde(default)]
    pub block: Vec<BlockRun>,
    #[serde(default)]
    pub alignment: Option<u64>,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
    /// Files dispatched ahead of all regular files, in declared order.
    #[serde(default)]
    pub apriori: Vec<FileSpec>,
    #[serde(default, rename = "file")]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub name_guid: Option<Guid>,
    #[serde(default)]
    pub boot_driver_base_address: Option<u64>,
    #[serde(default)]
    pub runtime_driver_base_address: Option<u64>,
    /// Boot-strap (VTF) file supplied out-of-band; listed after the
    /// regular files.
    #[serde(default)]
    pub vtf: Option<PathBuf>,
}

/// What fills a region.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RegionKind {
    /// A firmware volume, built on demand and memoized by name.
    Volume { volume: String },
    /// Raw input files, concatenated.
    File { files: Vec<PathBuf> },
    /// Literal bytes supplied inline.
    Data { data: Vec<u8> },
    /// Nothing; the whole region is erase-polarity fill.
    Empty,
}

/// A fixed-offset, fixed-size slice of a flash device.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Region {
    #[serde(default)]
    pub name: Option<String>,
    pub offset: u64,
    pub size: u64,
    #[serde(flatten)]
    pub kind: RegionKind,
}

impl Region {
    pub fn label(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("region@{:#x}", self.offset),
        }
    }
}

/// One flash device: a flat image of `size` bytes at `base_address`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Device {
    pub name: String,
    pub base_address: u64,
    pub size: u64,
    pub erase_polarity: ErasePolarity,
    #[serde(default)]
    pub block: Vec<BlockRun>,
    #[serde(default, rename = "region")]
    pub regions: Vec<Region>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawLayout {
    name: String,
    #[serde(default, rename = "device")]
    devices: Vec<Device>,
    #[serde(default, rename = "volume")]
    volumes: IndexMap<String, Volume>,
}

/// A fully-loaded layout description.
#[derive(Clone, Debug)]
pub struct FlashLayout {
    pub name: String,
    pub devices: Vec<Device>,
    pub volumes: IndexMap<String, Volume>,
    /// Hash of the layout file contents, for change detection.
    pub buildhash: u64,
    pub path: PathBuf,
}

impl FlashLayout {
    /// Loads a layout from a TOML file. Relative input paths in the
    /// description are rebased against the file's directory, so the
    /// build does not depend on the working directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path).with_context(|| {
            format!("could not read layout {}", path.display())
        })?;
        let text = std::str::from_utf8(&contents).with_context(|| {
            format!("layout {} is not valid UTF-8", path.display())
        })?;
        let raw: RawLayout = toml::from_str(text).with_context(|| {
            format!("could not parse layout {}", path.display())
        })?;

        let mut hasher = DefaultHasher::new();
        hasher.write(&contents);
        let buildhash = hasher.finish();

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut layout = FlashLayout {
            name: raw.name,
            devices: raw.devices,
            volumes: raw.volumes,
            buildhash,
            path: path.to_owned(),
        };
        layout.rebase_paths(base);
        Ok(layout)
    }

    fn rebase_paths(&mut self, base: &Path) {
        fn rebase(p: &mut PathBuf, base: &Path) {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
        for volume in self.volumes.values_mut() {
            for spec in
                volume.apriori.iter_mut().chain(volume.files.iter_mut())
            {
                rebase(&mut spec.path, base);
            }
            if let Some(vtf) = volume.vtf.as_mut() {
                rebase(vtf, base);
            }
        }
        for device in &mut self.devices {
            for region in &mut device.regions {
                if let RegionKind::File { files } = &mut region.kind {
                    for f in files {
                        rebase(f, base);
                    }
                }
            }
        }
    }

    /// Suggests a close volume name, for unknown-name diagnostics.
    pub fn volume_name_suggestion(&self, name: &str) -> Option<String> {
        // Suggest only for very small differences; a high cutoff gives
        // inaccurate suggestions for short queries.
        const MAX_DISTANCE: usize = 3;

        self.volumes
            .keys()
            .filter_map(|s| {
                let distance = strsim::damerau_levenshtein(name, s);
                if distance <= MAX_DISTANCE {
                    Some((distance, s))
                } else {
                    None
                }
            })
            .min()
            .map(|(_, s)| s.clone())
    }
}
