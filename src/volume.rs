// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware volume building.
//!
//! A volume is encoded by an external tool from a generation manifest:
//! an `[options]` block (geometry), an `[attributes]` block, and a
//! `[files]` block listing one path per included file. Apriori files
//! are listed strictly before regular files, each group in declared
//! order — the list order determines dispatch priority inside the
//! produced volume. Volumes are built at most once per run, memoized
//! by case-insensitive name.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::error::{BuildError, BuildResult};
use crate::layout::{ErasePolarity, FileSpec, Volume};
use crate::section;
use crate::BuildContext;

/// Placement chosen by the composer for one volume.
#[derive(Copy, Clone, Debug)]
pub struct VolumePlacement {
    pub base_address: Option<u64>,
    pub block_size: u64,
    pub block_count: u64,
    pub erase_polarity: ErasePolarity,
}

/// Volume-name → built-image-path memoization. Shared state of one
/// build run; a per-name lock serializes concurrent requests so each
/// volume is encoded exactly once.
#[derive(Default)]
pub struct VolumeCache {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<PathBuf>>>>>,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Option<PathBuf>>> {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(key.to_string()).or_default().clone()
    }
}

/// Builds `volume`, or returns the path built earlier in this run.
pub fn build(
    ctx: &BuildContext<'_>,
    name: &str,
    volume: &Volume,
    placement: VolumePlacement,
) -> BuildResult<PathBuf> {
    let slot = ctx.volumes.slot(&name.to_lowercase());
    let mut guard = slot.lock().unwrap();
    if let Some(path) = guard.as_ref() {
        debug!("volume {}: already built at {}", name, path.display());
        return Ok(path.clone());
    }
    let path = build_uncached(ctx, name, volume, placement)?;
    *guard = Some(path.clone());
    Ok(path)
}

fn build_uncached(
    ctx: &BuildContext<'_>,
    name: &str,
    volume: &Volume,
    placement: VolumePlacement,
) -> BuildResult<PathBuf> {
    let staging = ctx.out_dir.join(name);
    fs::create_dir_all(&staging)?;

    // Reduce every file to a byte blob. Apriori files keep their
    // declared lead over regular files no matter how encoding is
    // scheduled.
    let specs: Vec<&FileSpec> =
        volume.apriori.iter().chain(volume.files.iter()).collect();
    let blobs = encode_files(ctx, &specs)?;

    let mut staged = Vec::with_capacity(specs.len());
    for (index, (spec, blob)) in specs.iter().zip(&blobs).enumerate() {
        let path = staging.join(format!("{:03}.{}.sec", index, spec.name));
        fs::write(&path, blob)?;
        staged.push(path);
    }

    let manifest = manifest_text(volume, &placement, &staged);
    let manifest_path = ctx.out_dir.join(format!("{}.fv.inf", name));
    if write_if_changed(&manifest_path, &manifest)? {
        debug!("volume {}: wrote {}", name, manifest_path.display());
    } else {
        debug!("volume {}: manifest unchanged", name);
    }

    // Address-info side channel, from the run-wide template, so the
    // manifest's base-address resolution matches the composer's offset
    // bookkeeping.
    let addr_path = ctx.out_dir.join(format!("{}.addr.inf", name));
    write_if_changed(&addr_path, &ctx.address_template)?;

    let out_path = ctx.out_dir.join(format!("{}.fv", name));
    let mut args: Vec<OsString> = vec![
        "-i".into(),
        manifest_path.into_os_string(),
        "-a".into(),
        addr_path.into_os_string(),
        "-o".into(),
        out_path.clone().into_os_string(),
    ];
    if ctx.verbose {
        args.push("-v".into());
    }
    ctx.runner
        .run(&ctx.volume_tool, &args)
        .map_err(|source| BuildError::VolumeEncodeFailed {
            name: name.to_string(),
            source,
        })?;

    // Read the result back; region composition embeds these bytes
    // verbatim.
    let image = fs::read(&out_path).map_err(|source| BuildError::Input {
        path: out_path.clone(),
        source,
    })?;
    info!("volume {}: {:#x} bytes", name, image.len());
    Ok(out_path)
}

/// Reduces one file to its blob: raw bytes, or a GUID-defined section
/// when the file asks for encapsulation.
fn encode_file(ctx: &BuildContext<'_>, spec: &FileSpec) -> BuildResult<Vec<u8>> {
    let payload = fs::read(&spec.path).map_err(|source| BuildError::Input {
        path: spec.path.clone(),
        source,
    })?;
    match &spec.section_guid {
        Some(guid) => section::encode(
            ctx,
            &payload,
            Some(guid),
            spec.process_required,
            spec.auth_status_valid,
            spec.alignment,
        ),
        None => Ok(payload),
    }
}

/// Encodes all files, fanning out across threads when the context asks
/// for it. Results land in order-indexed slots and are returned in
/// declared order, never completion order.
fn encode_files(
    ctx: &BuildContext<'_>,
    specs: &[&FileSpec],
) -> BuildResult<Vec<Vec<u8>>> {
    if ctx.jobs <= 1 || specs.len() <= 1 {
        return specs.iter().map(|&spec| encode_file(ctx, spec)).collect();
    }
    let results: Vec<BuildResult<Vec<u8>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = specs
            .iter()
            .map(|&spec| scope.spawn(move || encode_file(ctx, spec)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("file encoder thread panicked"))
            .collect()
    });
    results.into_iter().collect()
}

fn manifest_text(
    volume: &Volume,
    placement: &VolumePlacement,
    staged: &[PathBuf],
) -> String {
    let mut out = String::new();

    writeln!(out, "[options]").unwrap();
    if let Some(base) = placement.base_address.or(volume.base_address) {
        writeln!(out, "EFI_BASE_ADDRESS = {:#x}", base).unwrap();
    }
    if volume.block.is_empty() {
        writeln!(out, "EFI_BLOCK_SIZE = {:#x}", placement.block_size).unwrap();
        writeln!(out, "EFI_NUM_BLOCKS = {:#x}", placement.block_count)
            .unwrap();
    } else {
        for run in &volume.block {
            writeln!(out, "EFI_BLOCK_SIZE = {:#x}", run.size).unwrap();
            writeln!(out, "EFI_NUM_BLOCKS = {:#x}", run.count).unwrap();
        }
    }
    if let Some(addr) = volume.boot_driver_base_address {
        writeln!(out, "EFI_BOOT_DRIVER_BASE_ADDRESS = {:#x}", addr).unwrap();
    }
    if let Some(addr) = volume.runtime_driver_base_address {
        writeln!(out, "EFI_RUNTIME_DRIVER_BASE_ADDRESS = {:#x}", addr)
            .unwrap();
    }

    writeln!(out, "[attributes]").unwrap();
    writeln!(out, "EFI_ERASE_POLARITY = {}", placement.erase_polarity.as_str())
        .unwrap();
    for (key, value) in &volume.attributes {
        writeln!(out, "{} = {}", key, value).unwrap();
    }
    if let Some(align) = volume.alignment {
        writeln!(out, "EFI_FVB2_ALIGNMENT_{} = TRUE", align_suffix(align))
            .unwrap();
    }
    if let Some(guid) = &volume.name_guid {
        writeln!(out, "EFI_FVNAME_GUID = {}", guid).unwrap();
    }

    writeln!(out, "[files]").unwrap();
    for path in staged {
        writeln!(out, "EFI_FILE_NAME = {}", path.display()).unwrap();
    }
    if let Some(vtf) = &volume.vtf {
        writeln!(out, "EFI_FILE_NAME = {}", vtf.display()).unwrap();
    }
    out
}

/// Renders an alignment in the unit the attribute key expects
/// (`64K`, `1M`, ...).
fn align_suffix(align: u64) -> String {
    const K: u64 = 1 << 10;
    const M: u64 = 1 << 20;
    const G: u64 = 1 << 30;
    if align >= G && align % G == 0 {
        format!("{}G", align / G)
    } else if align >= M && align % M == 0 {
        format!("{}M", align / M)
    } else if align >= K && align % K == 0 {
        format!("{}K", align / K)
    } else {
        align.to_string()
    }
}

/// Writes `contents` to `path` only if it differs from what is already
/// there, to avoid spurious rebuilds downstream.
fn write_if_changed(path: &Path, contents: &str) -> io::Result<bool> {
    if let Ok(prev) = fs::read(path) {
        if prev == contents.as_bytes() {
            return Ok(false);
        }
    }
    fs::write(path, contents)?;
    Ok(true)
}
