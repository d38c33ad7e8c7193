// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The codec tool registry: a table mapping a section GUID to the
//! external command that encodes (and decodes) that section kind.
//!
//! The table is loaded from a line-oriented configuration file of
//! `guid short-name command` triples, or falls back to a built-in
//! default set. Loading fails softly: a malformed line is skipped with
//! a warning, and a command that cannot be found on the search path is
//! only an error once a section actually needs it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::guid::{self, Guid};
use crate::tool;

/// One codec registration.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub guid: Guid,
    pub short_name: String,
    pub command: String,
}

/// GUID-to-command table. Lookup is exact-match on the 16-byte
/// identifier, not on GUID text.
pub struct ToolRegistry {
    entries: IndexMap<Guid, ToolEntry>,
}

impl ToolRegistry {
    /// The built-in table: the standard compression and checksum
    /// codecs.
    pub fn default_table() -> Self {
        let defaults = [
            (guid::TIANO_COMPRESS, "TIANO", "TianoCompress"),
            (guid::LZMA_COMPRESS, "LZMA", "LzmaCompress"),
            (guid::LZMA_F86_COMPRESS, "LZMAF86", "LzmaF86Compress"),
            (guid::CRC32_CHECKSUM, "CRC32", "GenCrc32"),
        ];
        let entries = defaults
            .iter()
            .map(|&(g, short_name, command)| {
                (
                    g,
                    ToolEntry {
                        guid: g,
                        short_name: short_name.to_string(),
                        command: command.to_string(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Loads the registry from `config_path`, falling back to the
    /// built-in defaults when no file is supplied or the named file
    /// does not exist.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(p) => p,
            None => return Ok(Self::default_table()),
        };
        if !path.exists() {
            info!(
                "codec registry {} not found; using built-in defaults",
                path.display()
            );
            return Ok(Self::default_table());
        }
        let text = fs::read_to_string(path).with_context(|| {
            format!("could not read codec registry {}", path.display())
        })?;
        Ok(Self::parse(&text, path))
    }

    fn parse(text: &str, origin: &Path) -> Self {
        let mut entries = IndexMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let guid_text = words.next();
            let short_name = words.next();
            // The command is the remainder of the line, so wrapper
            // invocations like `python3 Brotli.py` stay expressible.
            let command = words.collect::<Vec<_>>().join(" ");

            let (guid_text, short_name) = match (guid_text, short_name) {
                (Some(g), Some(s)) if !command.is_empty() => (g, s),
                _ => {
                    warn!(
                        "{}:{}: skipping malformed registry line \
                         (want `guid short-name command`)",
                        origin.display(),
                        lineno + 1
                    );
                    continue;
                }
            };
            let guid = match guid_text.parse::<Guid>() {
                Ok(g) => g,
                Err(e) => {
                    warn!(
                        "{}:{}: skipping malformed registry line: {}",
                        origin.display(),
                        lineno + 1,
                        e
                    );
                    continue;
                }
            };
            entries.insert(
                guid,
                ToolEntry {
                    guid,
                    short_name: short_name.to_string(),
                    command,
                },
            );
        }
        Self { entries }
    }

    /// Checks every command against the search path. Unresolved entries
    /// are reported and kept; resolution failure only becomes fatal
    /// when a section actually needs the codec. Returns the number of
    /// unresolved entries.
    pub fn verify(&self) -> usize {
        let mut missing = 0;
        for entry in self.entries.values() {
            match tool::resolve_command(&entry.command) {
                Some(path) => {
                    debug!("codec {}: {}", entry.short_name, path.display())
                }
                None => {
                    warn!(
                        "codec {} ({}): command `{}` is not resolvable",
                        entry.short_name, entry.guid, entry.command
                    );
                    missing += 1;
                }
            }
        }
        missing
    }

    pub fn lookup(&self, guid: &Guid) -> Option<&ToolEntry> {
        self.entries.get(guid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_given() {
        let reg = ToolRegistry::load(None).unwrap();
        assert_eq!(reg.len(), 4);
        assert_eq!(
            reg.lookup(&guid::CRC32_CHECKSUM).unwrap().command,
            "GenCrc32"
        );
    }

    #[test]
    fn defaults_when_file_absent() {
        let reg =
            ToolRegistry::load(Some(Path::new("/no/such/registry.conf")))
                .unwrap();
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let text = "\
# comment

EE4E5898-3914-4259-9D6E-DC7BD79403CF LZMA LzmaCompress
this-is-not-a-guid NOPE nope
FC1BCDB0-7D31-49AA-936A-A4600D9DD083 CRC32
3D532050-5CDA-4FD0-879E-0F7F630D5AFB BROTLI python3 Brotli.py --quality 9
";
        let reg = ToolRegistry::parse(text, Path::new("test.conf"));
        // the bad-guid line and the missing-command line both drop out
        assert_eq!(reg.len(), 2);
        let brotli: Guid =
            "3D532050-5CDA-4FD0-879E-0F7F630D5AFB".parse().unwrap();
        assert_eq!(
            reg.lookup(&brotli).unwrap().command,
            "python3 Brotli.py --quality 9"
        );
    }

    #[test]
    fn lookup_is_exact_on_binary_guid() {
        let reg = ToolRegistry::default_table();
        let respelled: Guid =
            "ee4e5898-3914-4259-9d6e-dc7bd79403cf".parse().unwrap();
        assert_eq!(reg.lookup(&respelled).unwrap().short_name, "LZMA");

        let unknown: Guid =
            "00000000-0000-0000-0000-000000000000".parse().unwrap();
        assert!(reg.lookup(&unknown).is_none());
    }

    #[test]
    fn config_file_replaces_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("tools.conf");
        std::fs::write(
            &conf,
            "A31280AD-481E-41B6-95E8-127F4C984779 TIANO /opt/tiano/compress\n",
        )
        .unwrap();

        let reg = ToolRegistry::load(Some(&conf)).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.lookup(&guid::TIANO_COMPRESS).unwrap().command,
            "/opt/tiano/compress"
        );
        assert!(reg.lookup(&guid::LZMA_COMPRESS).is_none());
    }
}
