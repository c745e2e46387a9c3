// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Loading `vsweep.toml`.
//!
//! Every field is optional. Without a file at all, the harness sweeps the
//! `real` input `x` of module `top` in `top.sv` from 0 to 9 and prints the
//! `real` output `y`.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{OptionExt, ResultExt, Whatever, whatever};
use vsweep_verilator::VerilatorRuntimeOptions;

use crate::{
    fixed::{FixedFormat, Rounding},
    model::{SignalBinding, SignalFormat},
    sweep::{MAX_PRECISION, Sweep},
};

pub const CONFIG_FILE_NAME: &str = "vsweep.toml";

/// Walks up from `start` looking for a [`CONFIG_FILE_NAME`].
pub fn search_for_config(mut start: Utf8PathBuf) -> Option<Utf8PathBuf> {
    loop {
        if start.join(CONFIG_FILE_NAME).is_file() {
            return Some(start.join(CONFIG_FILE_NAME));
        }
        if !start.pop() {
            return None;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// The name of the top module.
    pub top: String,

    /// Source files, possibly glob patterns.
    pub sources: Vec<String>,

    /// The file that defines [`SweepConfig::top`]. Defaults to the first
    /// source file.
    pub top_source: Option<Utf8PathBuf>,

    pub include_directories: Vec<Utf8PathBuf>,

    pub input: SignalBinding,
    pub output: SignalBinding,

    pub sweep: Sweep,

    /// Digits after the decimal point in the printed values.
    pub precision: usize,

    pub artifact_directory: Utf8PathBuf,
    pub verilator_executable: String,
    pub verilator_optimization: Option<usize>,
    pub force_verilator_rebuild: bool,
    pub ignored_warnings: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            top: "top".into(),
            sources: vec!["top.sv".into()],
            top_source: None,
            include_directories: vec![],
            input: SignalBinding::real("x"),
            output: SignalBinding::real("y"),
            sweep: Sweep::default(),
            precision: 3,
            artifact_directory: "artifacts".into(),
            verilator_executable: "verilator".into(),
            verilator_optimization: None,
            force_verilator_rebuild: false,
            ignored_warnings: vec![],
        }
    }
}

fn lookup<'a>(value: &'a toml::Value, path: &[&str]) -> Option<&'a toml::Value> {
    path.iter().try_fold(value, |value, key| value.get(*key))
}

fn read_string(
    value: &toml::Value,
    path: &[&str],
) -> Result<Option<String>, Whatever> {
    lookup(value, path)
        .map(|found| {
            found
                .as_str()
                .map(str::to_string)
                .whatever_context(format!("`{}` must be a string", path.join(".")))
        })
        .transpose()
}

fn read_strings(
    value: &toml::Value,
    path: &[&str],
) -> Result<Option<Vec<String>>, Whatever> {
    let Some(found) = lookup(value, path) else {
        return Ok(None);
    };
    let Some(array) = found.as_array() else {
        whatever!("`{}` must be an array of strings", path.join("."));
    };
    array
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).whatever_context(format!(
                "`{}` must be an array of strings",
                path.join(".")
            ))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Accepts both `1` and `1.0`, since TOML distinguishes them.
fn read_number(
    value: &toml::Value,
    path: &[&str],
) -> Result<Option<f64>, Whatever> {
    lookup(value, path)
        .map(|found| {
            found
                .as_float()
                .or_else(|| found.as_integer().map(|integer| integer as f64))
                .whatever_context(format!("`{}` must be a number", path.join(".")))
        })
        .transpose()
}

fn read_unsigned(
    value: &toml::Value,
    path: &[&str],
) -> Result<Option<usize>, Whatever> {
    lookup(value, path)
        .map(|found| {
            found
                .as_integer()
                .and_then(|integer| usize::try_from(integer).ok())
                .whatever_context(format!(
                    "`{}` must be a non-negative integer",
                    path.join(".")
                ))
        })
        .transpose()
}

fn read_bool(
    value: &toml::Value,
    path: &[&str],
) -> Result<Option<bool>, Whatever> {
    lookup(value, path)
        .map(|found| {
            found.as_bool().whatever_context(format!(
                "`{}` must be a boolean",
                path.join(".")
            ))
        })
        .transpose()
}

/// A format is either the string `"real"` or a table
/// `{ width, point, signed = true, rounding = "round" }`.
fn read_signal_format(
    value: &toml::Value,
    path: &[&str],
) -> Result<Option<SignalFormat>, Whatever> {
    let Some(found) = lookup(value, path) else {
        return Ok(None);
    };
    let name = path.join(".");

    if let Some(kind) = found.as_str() {
        if kind == "real" {
            return Ok(Some(SignalFormat::Real));
        }
        whatever!("`{}` must be \"real\" or a fixed-point table, got \"{}\"", name, kind);
    }

    if !found.is_table() {
        whatever!("`{}` must be \"real\" or a fixed-point table", name);
    }
    let Some(width) = read_unsigned(found, &["width"])? else {
        whatever!("`{}.width` is required for a fixed-point format", name);
    };
    let point = match lookup(found, &["point"]) {
        Some(point) => point
            .as_integer()
            .and_then(|point| i32::try_from(point).ok())
            .whatever_context(format!("`{}.point` must be an integer", name))?,
        None => 0,
    };
    let signed = read_bool(found, &["signed"])?.unwrap_or(true);
    let rounding = match read_string(found, &["rounding"])? {
        Some(rounding) => Rounding::from_name(&rounding).whatever_context(
            format!(
                "`{}.rounding` must be one of \"round\", \"floor\" or \"ceil\"",
                name
            ),
        )?,
        None => Rounding::default(),
    };

    let Ok(width) = u32::try_from(width) else {
        whatever!("`{}.width` is too large", name);
    };
    let format = FixedFormat::new(width, point, signed, rounding)
        .whatever_context(format!("`{}` is not a valid fixed-point format", name))?;
    Ok(Some(SignalFormat::Fixed(format)))
}

fn read_binding(
    value: &toml::Value,
    key: &str,
    default: SignalBinding,
) -> Result<SignalBinding, Whatever> {
    Ok(SignalBinding {
        port: read_string(value, &["ports", key, "name"])?
            .unwrap_or(default.port),
        format: read_signal_format(value, &["ports", key, "format"])?
            .unwrap_or(default.format),
    })
}

impl SweepConfig {
    /// Parses the contents of a `vsweep.toml`. Relative paths are left as
    /// they are; see [`SweepConfig::load`].
    pub fn from_toml_str(contents: &str) -> Result<Self, Whatever> {
        let value: toml::Value = contents
            .parse()
            .whatever_context("Failed to parse configuration as TOML")?;
        let defaults = Self::default();

        let sweep = Sweep::new(
            read_number(&value, &["sweep", "start"])?
                .unwrap_or(defaults.sweep.start()),
            read_number(&value, &["sweep", "stop"])?
                .unwrap_or(defaults.sweep.stop()),
            read_number(&value, &["sweep", "step"])?
                .unwrap_or(defaults.sweep.step()),
        )
        .whatever_context("Invalid [sweep] section")?;

        let sources = read_strings(&value, &["model", "sources"])?
            .unwrap_or(defaults.sources);
        if sources.is_empty() {
            whatever!("`model.sources` must list at least one file");
        }

        let precision = read_unsigned(&value, &["sweep", "precision"])?
            .unwrap_or(defaults.precision);
        if precision > MAX_PRECISION {
            whatever!(
                "`sweep.precision` must be at most {}, got {}",
                MAX_PRECISION,
                precision
            );
        }

        Ok(Self {
            top: read_string(&value, &["model", "top"])?.unwrap_or(defaults.top),
            sources,
            top_source: read_string(&value, &["model", "top_source"])?
                .map(Utf8PathBuf::from),
            include_directories: read_strings(
                &value,
                &["model", "include_directories"],
            )?
            .map(|directories| {
                directories.into_iter().map(Utf8PathBuf::from).collect()
            })
            .unwrap_or(defaults.include_directories),
            input: read_binding(&value, "input", defaults.input)?,
            output: read_binding(&value, "output", defaults.output)?,
            sweep,
            precision,
            artifact_directory: read_string(&value, &["verilator", "artifacts"])?
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.artifact_directory),
            verilator_executable: read_string(
                &value,
                &["verilator", "executable"],
            )?
            .unwrap_or(defaults.verilator_executable),
            verilator_optimization: read_unsigned(
                &value,
                &["verilator", "optimization"],
            )?,
            force_verilator_rebuild: read_bool(
                &value,
                &["verilator", "force_rebuild"],
            )?
            .unwrap_or(defaults.force_verilator_rebuild),
            ignored_warnings: read_strings(
                &value,
                &["verilator", "ignored_warnings"],
            )?
            .unwrap_or(defaults.ignored_warnings),
        })
    }

    /// Reads the configuration file at `path`. Relative paths inside it are
    /// taken relative to the directory containing the file.
    pub fn load(path: &Utf8Path) -> Result<Self, Whatever> {
        let contents = fs::read_to_string(path).whatever_context(format!(
            "Failed to read configuration file at {path}"
        ))?;
        let mut config = Self::from_toml_str(&contents)
            .whatever_context(format!("Invalid configuration file at {path}"))?;
        if let Some(root) = path.parent() {
            config.rebase(root);
        }
        Ok(config)
    }

    /// Loads the nearest [`CONFIG_FILE_NAME`] at or above `start`, or the
    /// defaults if there is none.
    pub fn discover(start: &Utf8Path) -> Result<Self, Whatever> {
        match search_for_config(start.to_path_buf()) {
            Some(path) => {
                log::info!("Using configuration file {}", path);
                Self::load(&path)
            }
            None => {
                log::info!(
                    "No {} found, using the default configuration",
                    CONFIG_FILE_NAME
                );
                Ok(Self::default())
            }
        }
    }

    /// Makes every relative path in the configuration relative to `root`
    /// instead.
    pub fn rebase(&mut self, root: &Utf8Path) {
        if root.as_str().is_empty() {
            return;
        }
        let rebase = |path: &Utf8Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            }
        };

        self.sources = self
            .sources
            .iter()
            .map(|pattern| rebase(Utf8Path::new(pattern)).into_string())
            .collect();
        self.top_source = self.top_source.as_deref().map(rebase);
        self.include_directories = self
            .include_directories
            .iter()
            .map(|directory| rebase(directory.as_path()))
            .collect();
        self.artifact_directory = rebase(self.artifact_directory.as_path());
    }

    /// Expands the glob patterns in [`SweepConfig::sources`]. A pattern that
    /// matches nothing is kept as a literal path, so that a missing file is
    /// reported by name when the runtime validates it.
    pub fn source_files(&self) -> Result<Vec<Utf8PathBuf>, Whatever> {
        let mut source_files = vec![];
        for pattern in &self.sources {
            let mut matched = false;
            for entry in glob::glob(pattern).whatever_context(format!(
                "Invalid source file pattern {pattern}"
            ))? {
                let path = entry.whatever_context(format!(
                    "Failed to read a match of source file pattern {pattern}"
                ))?;
                let path = Utf8PathBuf::from_path_buf(path)
                    .map_err(|_| "?")
                    .whatever_context("Source file path is not UTF-8")?;
                if !source_files.contains(&path) {
                    source_files.push(path);
                }
                matched = true;
            }
            if !matched {
                source_files.push(Utf8PathBuf::from(pattern));
            }
        }
        Ok(source_files)
    }

    /// The file defining the top module: [`SweepConfig::top_source`] if set,
    /// otherwise the first of `source_files`.
    pub fn top_source(
        &self,
        source_files: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, Whatever> {
        match &self.top_source {
            Some(top_source) => Ok(top_source.clone()),
            None => source_files
                .first()
                .cloned()
                .whatever_context("No source files were configured"),
        }
    }

    /// Options for the Verilator runtime. `command_args` are forwarded to
    /// `Verilated::commandArgs`.
    pub fn runtime_options(
        &self,
        command_args: Vec<String>,
        log: bool,
    ) -> VerilatorRuntimeOptions {
        VerilatorRuntimeOptions {
            verilator_executable: self.verilator_executable.clone().into(),
            verilator_optimization: self.verilator_optimization,
            force_verilator_rebuild: self.force_verilator_rebuild,
            ignored_warnings: self.ignored_warnings.clone(),
            command_args,
            log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[snafu::report]
    fn empty_file_gives_defaults() -> Result<(), Whatever> {
        assert_eq!(SweepConfig::from_toml_str("")?, SweepConfig::default());
        Ok(())
    }

    #[test]
    #[snafu::report]
    fn reads_every_section() -> Result<(), Whatever> {
        let config = SweepConfig::from_toml_str(
            r#"
            [model]
            top = "filter"
            sources = ["rtl/*.sv", "pkg.sv"]
            top_source = "rtl/filter.sv"
            include_directories = ["rtl/include"]

            [ports.input]
            name = "vin"
            format = { width = 16, point = 8, rounding = "floor" }

            [ports.output]
            name = "vout"

            [sweep]
            start = -1
            stop = 1.0
            step = 0.5
            precision = 4

            [verilator]
            executable = "/opt/verilator/bin/verilator"
            optimization = 3
            force_rebuild = true
            ignored_warnings = ["WIDTH"]
            artifacts = "build"
            "#,
        )?;

        assert_eq!(config.top, "filter");
        assert_eq!(config.sources, ["rtl/*.sv", "pkg.sv"]);
        assert_eq!(config.top_source, Some("rtl/filter.sv".into()));
        assert_eq!(config.include_directories, [Utf8PathBuf::from("rtl/include")]);
        assert_eq!(config.input.port, "vin");
        assert_eq!(
            config.input.format,
            SignalFormat::Fixed(
                FixedFormat::new(16, 8, true, Rounding::Floor).unwrap()
            )
        );
        assert_eq!(config.output, SignalBinding::real("vout"));
        assert_eq!(config.sweep, Sweep::new(-1.0, 1.0, 0.5).unwrap());
        assert_eq!(config.precision, 4);
        assert_eq!(config.verilator_executable, "/opt/verilator/bin/verilator");
        assert_eq!(config.verilator_optimization, Some(3));
        assert!(config.force_verilator_rebuild);
        assert_eq!(config.ignored_warnings, ["WIDTH"]);
        assert_eq!(config.artifact_directory, "build");
        Ok(())
    }

    #[test]
    fn rejects_values_that_cannot_be_printed_or_encoded() {
        assert!(SweepConfig::from_toml_str("[sweep]\nprecision = 17").is_ok());
        assert!(
            SweepConfig::from_toml_str("[sweep]\nprecision = 100000").is_err()
        );
        assert!(
            SweepConfig::from_toml_str(
                "[sweep]\nstart = 0\nstop = 1\nstep = 1e-300"
            )
            .is_err()
        );
        assert!(
            SweepConfig::from_toml_str(
                "[ports.output]\nformat = { width = 8, point = -2147483648 }"
            )
            .is_err()
        );
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(SweepConfig::from_toml_str("[sweep]\nstep = 0").is_err());
        assert!(SweepConfig::from_toml_str("[sweep]\nstart = \"zero\"").is_err());
        assert!(SweepConfig::from_toml_str("[model]\nsources = []").is_err());
        assert!(
            SweepConfig::from_toml_str("[ports.input]\nformat = \"integer\"")
                .is_err()
        );
        assert!(
            SweepConfig::from_toml_str(
                "[ports.input]\nformat = { width = 0, point = 0 }"
            )
            .is_err()
        );
        assert!(
            SweepConfig::from_toml_str(
                "[ports.input]\nformat = { width = 8, rounding = \"up\" }"
            )
            .is_err()
        );
        assert!(SweepConfig::from_toml_str("not toml at all = = =").is_err());
    }

    #[test]
    fn rebase_only_touches_relative_paths() {
        let mut config = SweepConfig {
            sources: vec!["top.sv".into(), "/abs/other.sv".into()],
            top_source: Some("top.sv".into()),
            ..Default::default()
        };
        config.rebase(Utf8Path::new("project"));

        assert_eq!(config.sources, ["project/top.sv", "/abs/other.sv"]);
        assert_eq!(config.top_source, Some("project/top.sv".into()));
        assert_eq!(config.artifact_directory, "project/artifacts");
    }

    #[test]
    #[snafu::report]
    fn unmatched_sources_are_kept_literally() -> Result<(), Whatever> {
        let config = SweepConfig {
            sources: vec!["no/such/dir/*.sv".into(), "missing.sv".into()],
            ..Default::default()
        };
        let files = config.source_files()?;
        assert_eq!(
            files,
            [
                Utf8PathBuf::from("no/such/dir/*.sv"),
                Utf8PathBuf::from("missing.sv")
            ]
        );
        assert_eq!(config.top_source(&files)?, "no/such/dir/*.sv");
        Ok(())
    }

    #[test]
    #[snafu::report]
    fn globs_expand_to_matching_files() -> Result<(), Whatever> {
        let config = SweepConfig {
            sources: vec![format!("{}/src/*.rs", env!("CARGO_MANIFEST_DIR"))],
            ..Default::default()
        };
        let files = config.source_files()?;
        assert!(files.iter().any(|file| file.ends_with("config.rs")));
        assert!(files.iter().all(|file| file.extension() == Some("rs")));
        Ok(())
    }
}
