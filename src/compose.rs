// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash-device image composition.
//!
//! Regions are processed in ascending-offset order into a single flat
//! buffer pre-filled with the erase-polarity byte. Every region is
//! validated against its declared size; the write cursor advances by
//! the declared size, not by the bytes actually written, so later
//! regions always land at their declared absolute offsets. Any
//! geometry or overflow violation aborts the whole image — a device
//! either gets a complete, internally consistent image file or none.

use std::fs;
use std::path::PathBuf;

use log::{debug, info};

use crate::error::{BuildError, BuildResult};
use crate::layout::{BlockRun, Device, FlashLayout, Region, RegionKind};
use crate::volume::{self, VolumePlacement};
use crate::BuildContext;

/// Composes every device in the layout, returning the written image
/// paths in layout order.
pub fn compose_layout(
    ctx: &BuildContext<'_>,
    layout: &FlashLayout,
) -> BuildResult<Vec<PathBuf>> {
    let mut images = Vec::with_capacity(layout.devices.len());
    for device in &layout.devices {
        images.push(compose_device(ctx, layout, device)?);
    }
    Ok(images)
}

/// Composes one device and writes its image file.
pub fn compose_device(
    ctx: &BuildContext<'_>,
    layout: &FlashLayout,
    device: &Device,
) -> BuildResult<PathBuf> {
    let image = compose_image(ctx, layout, device)?;
    fs::create_dir_all(&ctx.out_dir)?;
    let out = ctx.out_dir.join(format!("{}.fd", device.name));
    fs::write(&out, &image)?;
    info!(
        "device {}: {:#x} bytes -> {}",
        device.name,
        image.len(),
        out.display()
    );
    Ok(out)
}

/// Composes one device into memory. Nothing is written until every
/// region has validated.
pub fn compose_image(
    ctx: &BuildContext<'_>,
    layout: &FlashLayout,
    device: &Device,
) -> BuildResult<Vec<u8>> {
    let fill = device.erase_polarity.fill_byte();
    let device_size = usize::try_from(device.size)
        .expect("device size exceeds host address space");
    let mut image = vec![fill; device_size];

    let mut regions: Vec<&Region> = device.regions.iter().collect();
    regions.sort_by_key(|r| r.offset);

    let mut cursor: u64 = 0;
    for region in regions {
        let label = region.label();
        if region.offset < cursor {
            return Err(BuildError::RegionOverlap {
                region: label,
                offset: region.offset,
                cursor,
            });
        }
        let end = region
            .offset
            .checked_add(region.size)
            .filter(|&end| end <= device.size)
            .ok_or_else(|| BuildError::RegionOutOfBounds {
                region: label.clone(),
                end: region.offset.saturating_add(region.size),
                device_size: device.size,
            })?;

        let content = match &region.kind {
            RegionKind::Volume { volume } => {
                compose_volume_region(ctx, layout, device, region, volume)?
            }
            RegionKind::File { files } => {
                let mut buf = Vec::new();
                for path in files {
                    let data = fs::read(path).map_err(|source| {
                        BuildError::Input {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    buf.extend_from_slice(&data);
                }
                buf
            }
            RegionKind::Data { data } => data.clone(),
            RegionKind::Empty => Vec::new(),
        };

        if content.len() as u64 > region.size {
            return Err(BuildError::RegionOverflow {
                region: label,
                actual: content.len() as u64,
                declared: region.size,
            });
        }
        debug!(
            "{}: {:#x} bytes at {:#010x} + {:#x}",
            label,
            content.len(),
            region.offset,
            region.size
        );
        let start = region.offset as usize;
        image[start..start + content.len()].copy_from_slice(&content);

        // Advance by the declared size, not the bytes written; the
        // remainder keeps the erase-polarity fill.
        cursor = end;
    }
    Ok(image)
}

fn compose_volume_region(
    ctx: &BuildContext<'_>,
    layout: &FlashLayout,
    device: &Device,
    region: &Region,
    volume_name: &str,
) -> BuildResult<Vec<u8>> {
    let volume = layout.volumes.get(volume_name).ok_or_else(|| {
        BuildError::VolumeNotDescribed {
            name: volume_name.to_string(),
            suggestion: layout.volume_name_suggestion(volume_name),
        }
    })?;

    let block_size = select_block_size(&device.block, region.offset)
        .ok_or_else(|| BuildError::NoFittingBlockSize {
            region: region.label(),
            offset: region.offset,
            size: region.size,
            block_size: None,
        })?;
    if region.size == 0 || region.size % block_size != 0 {
        return Err(BuildError::NoFittingBlockSize {
            region: region.label(),
            offset: region.offset,
            size: region.size,
            block_size: Some(block_size),
        });
    }

    let load_address = device.base_address + region.offset;
    if let Some(alignment) = volume.alignment {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(BuildError::BadAlignment {
                name: volume_name.to_string(),
                alignment,
            });
        }
        // Validated before any external tool is invoked.
        if load_address % alignment != 0 {
            return Err(BuildError::MisalignedVolume {
                name: volume_name.to_string(),
                load_address,
                required_alignment: alignment,
            });
        }
    }

    let placement = VolumePlacement {
        base_address: Some(load_address),
        block_size,
        block_count: region.size / block_size,
        erase_polarity: device.erase_polarity,
    };
    let path = volume::build(ctx, volume_name, volume, placement)?;
    fs::read(&path).map_err(|source| BuildError::Input { path, source })
}

/// Picks the block size for a region: the first grid entry whose
/// cumulative offset range covers `offset`.
fn select_block_size(blocks: &[BlockRun], offset: u64) -> Option<u64> {
    let mut cum = 0u64;
    for run in blocks {
        let end = cum.checked_add(run.size.checked_mul(run.count)?)?;
        if offset < end {
            return Some(run.size);
        }
        cum = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ErasePolarity, FileSpec, Volume};
    use crate::registry::ToolRegistry;
    use crate::tool::{ToolError, ToolRunner};
    use indexmap::IndexMap;
    use std::ffi::OsString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEncoder {
        calls: AtomicUsize,
        image: Vec<u8>,
    }

    impl FakeEncoder {
        fn new(image: &[u8]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                image: image.to_vec(),
            }
        }
    }

    impl ToolRunner for FakeEncoder {
        fn run(
            &self,
            _command: &str,
            args: &[OsString],
        ) -> Result<(), ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let out_at =
                args.iter().position(|a| a == "-o").expect("no -o argument");
            let out = PathBuf::from(args[out_at + 1].clone());
            std::fs::write(out, &self.image).unwrap();
            Ok(())
        }
    }

    fn empty_layout() -> FlashLayout {
        FlashLayout {
            name: "test".to_string(),
            devices: Vec::new(),
            volumes: IndexMap::new(),
            buildhash: 0,
            path: PathBuf::from("test.toml"),
        }
    }

    fn device(
        erase_polarity: ErasePolarity,
        size: u64,
        regions: Vec<Region>,
    ) -> Device {
        Device {
            name: "flash".to_string(),
            base_address: 0xFF00_0000,
            size,
            erase_polarity,
            block: vec![BlockRun {
                size: 0x1000,
                count: 0x1000,
            }],
            regions,
        }
    }

    fn region(offset: u64, size: u64, kind: RegionKind) -> Region {
        Region {
            name: None,
            offset,
            size,
            kind,
        }
    }

    fn ctx_with<'a>(
        registry: &'a ToolRegistry,
        runner: &'a dyn ToolRunner,
        out_dir: PathBuf,
    ) -> BuildContext<'a> {
        BuildContext::new(registry, runner, out_dir)
    }

    #[test]
    fn empty_region_fills_with_erase_polarity() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let dev =
            device(ErasePolarity::One, 16, vec![region(0, 16, RegionKind::Empty)]);
        let image = compose_image(&ctx, &empty_layout(), &dev).unwrap();
        assert_eq!(image, vec![0xFF; 16]);
    }

    #[test]
    fn data_region_pads_with_zero_polarity() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let dev = device(
            ErasePolarity::Zero,
            4,
            vec![region(
                0,
                4,
                RegionKind::Data {
                    data: vec![0x01, 0x02],
                },
            )],
        );
        let image = compose_image(&ctx, &empty_layout(), &dev).unwrap();
        assert_eq!(image, vec![0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn data_overflow_is_fatal_not_truncated() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let dev = device(
            ErasePolarity::Zero,
            16,
            vec![region(
                0,
                2,
                RegionKind::Data {
                    data: vec![1, 2, 3],
                },
            )],
        );
        match compose_image(&ctx, &empty_layout(), &dev) {
            Err(BuildError::RegionOverflow {
                actual, declared, ..
            }) => {
                assert_eq!((actual, declared), (3, 2));
            }
            other => panic!("expected RegionOverflow, got {:?}", other),
        }
    }

    #[test]
    fn cursor_advances_by_declared_size() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        // a short data region followed by a gap, then more data
        let dev = device(
            ErasePolarity::One,
            8,
            vec![
                region(0, 4, RegionKind::Data { data: vec![0xAB] }),
                region(6, 2, RegionKind::Data { data: vec![0xCD] }),
            ],
        );
        let image = compose_image(&ctx, &empty_layout(), &dev).unwrap();
        assert_eq!(
            image,
            [0xAB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xCD, 0xFF]
        );
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let dev = device(
            ErasePolarity::One,
            16,
            vec![
                region(0, 8, RegionKind::Empty),
                region(4, 4, RegionKind::Empty),
            ],
        );
        assert!(matches!(
            compose_image(&ctx, &empty_layout(), &dev),
            Err(BuildError::RegionOverlap { .. })
        ));
    }

    #[test]
    fn unknown_volume_gets_a_suggestion() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let mut layout = empty_layout();
        layout.volumes.insert("fvmain".to_string(), Volume::default());

        let dev = device(
            ErasePolarity::One,
            0x2000,
            vec![region(
                0,
                0x1000,
                RegionKind::Volume {
                    volume: "fvmian".to_string(),
                },
            )],
        );
        match compose_image(&ctx, &layout, &dev) {
            Err(BuildError::VolumeNotDescribed { name, suggestion }) => {
                assert_eq!(name, "fvmian");
                assert_eq!(suggestion.as_deref(), Some("fvmain"));
            }
            other => panic!("expected VolumeNotDescribed, got {:?}", other),
        }
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn misalignment_is_caught_before_any_tool_runs() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let mut layout = empty_layout();
        layout.volumes.insert(
            "fvmain".to_string(),
            Volume {
                alignment: Some(0x10000),
                ..Volume::default()
            },
        );

        // device base 0xFF000000 + offset 0x1000 is not 64KiB-aligned
        let dev = device(
            ErasePolarity::One,
            0x10000,
            vec![region(
                0x1000,
                0x1000,
                RegionKind::Volume {
                    volume: "fvmain".to_string(),
                },
            )],
        );
        match compose_image(&ctx, &layout, &dev) {
            Err(BuildError::MisalignedVolume {
                load_address,
                required_alignment,
                ..
            }) => {
                assert_eq!(load_address, 0xFF00_1000);
                assert_eq!(required_alignment, 0x10000);
            }
            other => panic!("expected MisalignedVolume, got {:?}", other),
        }
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn volume_region_embeds_the_built_image() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("core.bin");
        std::fs::write(&input, b"core").unwrap();

        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"FV!");
        let ctx = ctx_with(&registry, &runner, dir.path().join("out"));

        let mut layout = empty_layout();
        layout.volumes.insert(
            "fvmain".to_string(),
            Volume {
                files: vec![FileSpec {
                    name: "core".to_string(),
                    path: input,
                    ..FileSpec::default()
                }],
                ..Volume::default()
            },
        );

        let dev = device(
            ErasePolarity::One,
            0x2000,
            vec![region(
                0,
                0x1000,
                RegionKind::Volume {
                    volume: "fvmain".to_string(),
                },
            )],
        );
        let image = compose_image(&ctx, &layout, &dev).unwrap();
        assert_eq!(&image[..3], b"FV!");
        assert!(image[3..0x1000].iter().all(|&b| b == 0xFF));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn volume_region_overflow_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::default_table();
        // encoder output larger than the declared region
        let runner = FakeEncoder::new(&[0u8; 0x2000]);
        let ctx = ctx_with(&registry, &runner, dir.path().join("out"));

        let mut layout = empty_layout();
        layout.volumes.insert("fvmain".to_string(), Volume::default());

        let dev = device(
            ErasePolarity::One,
            0x2000,
            vec![region(
                0,
                0x1000,
                RegionKind::Volume {
                    volume: "fvmain".to_string(),
                },
            )],
        );
        assert!(matches!(
            compose_image(&ctx, &layout, &dev),
            Err(BuildError::RegionOverflow { .. })
        ));
    }

    #[test]
    fn block_size_comes_from_the_covering_grid_entry() {
        let blocks = [
            BlockRun {
                size: 0x1000,
                count: 4,
            },
            BlockRun {
                size: 0x8000,
                count: 2,
            },
        ];
        assert_eq!(select_block_size(&blocks, 0), Some(0x1000));
        assert_eq!(select_block_size(&blocks, 0x3FFF), Some(0x1000));
        assert_eq!(select_block_size(&blocks, 0x4000), Some(0x8000));
        assert_eq!(select_block_size(&blocks, 0x13FFF), Some(0x8000));
        assert_eq!(select_block_size(&blocks, 0x14000), None);
        assert_eq!(select_block_size(&[], 0), None);
    }

    #[test]
    fn region_not_a_whole_number_of_blocks() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let mut layout = empty_layout();
        layout.volumes.insert("fvmain".to_string(), Volume::default());

        let dev = device(
            ErasePolarity::One,
            0x2000,
            vec![region(
                0,
                0x1800,
                RegionKind::Volume {
                    volume: "fvmain".to_string(),
                },
            )],
        );
        match compose_image(&ctx, &layout, &dev) {
            Err(BuildError::NoFittingBlockSize {
                block_size, size, ..
            }) => {
                assert_eq!(block_size, Some(0x1000));
                assert_eq!(size, 0x1800);
            }
            other => panic!("expected NoFittingBlockSize, got {:?}", other),
        }
    }

    #[test]
    fn region_past_device_end_is_rejected() {
        let registry = ToolRegistry::default_table();
        let runner = FakeEncoder::new(b"");
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(&registry, &runner, dir.path().to_owned());

        let dev = device(
            ErasePolarity::One,
            8,
            vec![region(4, 8, RegionKind::Empty)],
        );
        assert!(matches!(
            compose_image(&ctx, &empty_layout(), &dev),
            Err(BuildError::RegionOutOfBounds { .. })
        ));
    }
}
