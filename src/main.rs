// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use std::{env, io};

use argh::FromArgs;
use camino::{Utf8Path, Utf8PathBuf};
use snafu::{ResultExt, Whatever};
use vsweep::{
    config::SweepConfig,
    prelude::*,
    verilator::VerilatorRuntime,
};

/// Sweep one input of a Verilated model and print each input/output pair
#[derive(FromArgs)]
struct VsweepCommand {
    /// configuration file to use instead of searching for vsweep.toml
    #[argh(option, short = 'c')]
    config: Option<Utf8PathBuf>,

    /// directory for build artifacts, overriding the configuration
    #[argh(option)]
    artifacts: Option<Utf8PathBuf>,

    /// always invoke verilator, even if the artifacts are up to date
    #[argh(switch)]
    force_rebuild: bool,

    /// arguments for the Verilator runtime, e.g. +verilator+seed+7
    #[argh(positional, greedy)]
    command_args: Vec<String>,
}

fn load_config(explicit: Option<Utf8PathBuf>) -> Result<SweepConfig, Whatever> {
    if let Some(path) = explicit {
        return SweepConfig::load(&path);
    }

    let current_directory = Utf8PathBuf::from_path_buf(
        env::current_dir()
            .whatever_context("Failed to determine current directory")?,
    )
    .map_err(|_| "?")
    .whatever_context("Failed to parse current directory as UTF-8")?;

    SweepConfig::discover(&current_directory)
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let log = env::var("RUST_LOG").is_ok();
    if log {
        env_logger::init();
    }

    let command: VsweepCommand = argh::from_env();

    let mut config = load_config(command.config)?;
    if let Some(artifacts) = command.artifacts {
        config.artifact_directory = artifacts;
    }
    config.force_verilator_rebuild |= command.force_rebuild;

    let source_files = config.source_files()?;
    let top_source = config.top_source(&source_files)?;
    let source_paths = source_files
        .iter()
        .map(Utf8PathBuf::as_path)
        .collect::<Vec<_>>();
    let include_paths = config
        .include_directories
        .iter()
        .map(Utf8PathBuf::as_path)
        .collect::<Vec<&Utf8Path>>();

    let mut runtime = VerilatorRuntime::new(
        &config.artifact_directory,
        &source_paths,
        &include_paths,
        config.runtime_options(command.command_args, log),
    )?;

    let mut model = VerilatedSweepModel::new(
        &mut runtime,
        &config.top,
        top_source.as_str(),
        config.input.clone(),
        config.output.clone(),
    )?;

    let driver = SweepDriver::new(
        config.input.port.as_str(),
        config.output.port.as_str(),
        config.precision,
    );
    driver
        .run(&mut model, &config.sweep, &mut io::stdout().lock())
        .whatever_context("Sweep failed")?;

    Ok(())
}
