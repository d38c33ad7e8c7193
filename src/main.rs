// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::debug;
use structopt::StructOpt;

use flashpack::compose;
use flashpack::layout::FlashLayout;
use flashpack::registry::ToolRegistry;
use flashpack::tool::ProcessRunner;
use flashpack::BuildContext;

#[derive(Debug, StructOpt)]
#[structopt(
    max_term_width = 80,
    about = "composes flash device images from a declarative layout"
)]
enum Flashpack {
    /// Composes every flash device image described by a layout file.
    Compose {
        /// Request verbosity from tools we shell out to.
        #[structopt(short)]
        verbose: bool,
        /// Number of parallel file-encode workers.
        #[structopt(short, long, default_value = "1")]
        jobs: usize,
        /// Directory where build products are placed.
        #[structopt(long, default_value = "build")]
        out_dir: PathBuf,
        /// Codec registry configuration file; built-in defaults are
        /// used when absent.
        #[structopt(long)]
        tool_config: Option<PathBuf>,
        /// Path to the flash layout description, in TOML.
        cfg: PathBuf,
    },

    /// Loads the codec tool registry, verifies each command against
    /// the search path, and prints the table.
    Tools {
        /// Codec registry configuration file.
        #[structopt(long)]
        tool_config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    match Flashpack::from_args() {
        Flashpack::Compose {
            verbose,
            jobs,
            out_dir,
            tool_config,
            cfg,
        } => {
            let layout = FlashLayout::from_file(&cfg)?;
            debug!("layout {}: hash {:x}", layout.name, layout.buildhash);

            let registry = ToolRegistry::load(tool_config.as_deref())?;
            registry.verify();

            let runner = ProcessRunner;
            let mut ctx = BuildContext::new(&registry, &runner, out_dir);
            ctx.jobs = jobs.max(1);
            ctx.verbose = verbose;

            let images = compose::compose_layout(&ctx, &layout)
                .with_context(|| format!("could not compose {}", layout.name))?;
            for image in images {
                println!("wrote {}", image.display());
            }
        }
        Flashpack::Tools { tool_config } => {
            let registry = ToolRegistry::load(tool_config.as_deref())?;
            let missing = registry.verify();
            for entry in registry.iter() {
                println!(
                    "{} {:<8} {}",
                    entry.guid, entry.short_name, entry.command
                );
            }
            if missing > 0 {
                println!(
                    "{} of {} codec commands are not currently resolvable",
                    missing,
                    registry.len()
                );
            }
        }
    }

    Ok(())
}
