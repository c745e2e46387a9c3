// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

// hardcoded knowledge:
// - output library is obj_dir/libV${top_module}_dyn.so
// - location of verilated.h
// - `real` ports are plain `double` members on the Verilated class

use std::{fmt::Write, fs, process::Command};

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{Whatever, prelude::*};

use crate::{PortDirection, PortType, VerilatorRuntimeOptions};

/// Produces the C++ source of the `extern "C"` shim for `top`. Every port
/// gets a reader; input and inout ports also get a setter.
fn generate_ffi(
    top: &str,
    ports: &[(&str, PortType, PortDirection)],
) -> Result<String, Whatever> {
    let mut buffer = String::new();
    writeln!(
        &mut buffer,
        r#"
#include "verilated.h"
#include "V{top}.h"

extern "C" {{
    void* ffi_new_V{top}() {{
        return new V{top}{{}};
    }}

    void ffi_V{top}_command_args(int argc, const char** argv) {{
        Verilated::commandArgs(argc, argv);
    }}

    void ffi_V{top}_eval(V{top}* top) {{
        top->eval();
    }}

    void ffi_delete_V{top}(V{top}* top) {{
        top->final();
        delete top;
    }}
"#
    )
    .whatever_context("Failed to format utility FFI")?;

    for (port, port_type, direction) in ports {
        let (input_type, return_type) = match *port_type {
            PortType::Real => ("double new_value".to_string(), "double".to_string()),
            PortType::Bits { msb, lsb } => {
                let width = port_type.width();
                if width > 64 {
                    whatever!(
                        "Port `{}` on top module `{}` was larger than 64 bits wide, which we don't support yet because weird C linkage things",
                        port,
                        top
                    );
                }
                let macro_prefix = match direction {
                    PortDirection::Input => "VL_IN",
                    PortDirection::Output => "VL_OUT",
                    PortDirection::Inout => "VL_INOUT",
                };
                let macro_suffix = if width <= 8 {
                    "8"
                } else if width <= 16 {
                    "16"
                } else if width <= 32 {
                    ""
                } else {
                    "64"
                };
                let type_macro = |name: &str| {
                    format!("{macro_prefix}{macro_suffix}({name}, {msb}, {lsb})")
                };
                (type_macro("new_value"), type_macro("/* return value */"))
            }
        };

        if matches!(direction, PortDirection::Input | PortDirection::Inout) {
            writeln!(
                &mut buffer,
                r#"
    void ffi_V{top}_pin_{port}(V{top}* top, {input_type}) {{
        top->{port} = new_value;
    }}
            "#
            )
            .whatever_context("Failed to format input port FFI")?;
        }

        writeln!(
            &mut buffer,
            r#"
    {return_type} ffi_V{top}_read_{port}(V{top}* top) {{
        return top->{port};
    }}
            "#
        )
        .whatever_context("Failed to format port reader FFI")?;
    }

    writeln!(&mut buffer, "}} // extern \"C\"")
        .whatever_context("Failed to format ending brace")?;

    Ok(buffer)
}

/// Writes the shim into `artifact_directory`, returning its path and whether
/// its contents differ from what was there before.
fn build_ffi(
    artifact_directory: &Utf8Path,
    top: &str,
    ports: &[(&str, PortType, PortDirection)],
) -> Result<(Utf8PathBuf, bool), Whatever> {
    let ffi_wrappers = artifact_directory.join("ffi.cpp");
    let buffer = generate_ffi(top, ports)?;

    let changed = fs::read_to_string(&ffi_wrappers)
        .map(|existing| existing != buffer)
        .unwrap_or(true);
    if changed {
        fs::write(&ffi_wrappers, buffer)
            .whatever_context("Failed to write FFI wrappers file")?;
    }

    Ok((ffi_wrappers, changed))
}

fn needs_rebuild(
    source_files: &[Utf8PathBuf],
    verilator_artifact_directory: &Utf8Path,
) -> Result<bool, Whatever> {
    if !verilator_artifact_directory.exists() {
        return Ok(true);
    }

    let Some(last_built) = fs::read_dir(verilator_artifact_directory)
        .whatever_context(format!(
            "{} exists but could not read it",
            verilator_artifact_directory
        ))?
        .flatten() // Remove failed
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .filter_map(|metadata| metadata.modified().ok())
        .max()
    else {
        return Ok(true);
    };

    for source_file in source_files {
        let last_edited = fs::metadata(source_file)
            .whatever_context(format!(
                "Failed to read file metadata for source file {}",
                source_file
            ))?
            .modified()
            .whatever_context(format!(
                "Failed to determine last-modified time for source file {}",
                source_file
            ))?;
        if last_edited > last_built {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Generates the FFI shim and, if anything changed since the last build,
/// invokes Verilator to compile `source_files` together with the shim into
/// a shared library. Returns the path of the library.
pub fn build_library(
    source_files: &[Utf8PathBuf],
    include_directories: &[Utf8PathBuf],
    top_module: &str,
    ports: &[(&str, PortType, PortDirection)],
    artifact_directory: &Utf8Path,
    options: &VerilatorRuntimeOptions,
) -> Result<Utf8PathBuf, Whatever> {
    let ffi_artifact_directory = artifact_directory.join("ffi");
    fs::create_dir_all(&ffi_artifact_directory).whatever_context(
        "Failed to create ffi subdirectory under artifacts directory",
    )?;
    let verilator_artifact_directory = artifact_directory.join("obj_dir");
    let library_name = format!("V{}_dyn", top_module);
    let library_path =
        verilator_artifact_directory.join(format!("lib{}.so", library_name));

    if options.log {
        log::info!("Generating FFI wrappers for {}", top_module);
    }
    let (_ffi_wrappers, ffi_changed) =
        build_ffi(&ffi_artifact_directory, top_module, ports)
            .whatever_context("Failed to build FFI wrappers")?;

    if !options.force_verilator_rebuild
        && !ffi_changed
        && library_path.is_file()
        && !needs_rebuild(source_files, &verilator_artifact_directory)
            .whatever_context("Failed to check if artifacts need rebuilding")?
    {
        if options.log {
            log::info!("Skipping verilator, artifacts are up to date");
        }
        return Ok(library_path);
    }

    // bug in verilator#5226 means the directory must be relative to -Mdir
    let ffi_wrappers = Utf8Path::new("../ffi/ffi.cpp");

    let mut verilator_command = Command::new(&options.verilator_executable);
    verilator_command
        .args(["--cc", "-sv", "--build", "-j", "0"])
        .args(["-CFLAGS", "-shared -fpic"])
        .args(["--lib-create", &library_name])
        .args(["--Mdir", verilator_artifact_directory.as_str()])
        .args(["--top-module", top_module]);
    if let Some(level) = options.verilator_optimization {
        if level > 3 {
            whatever!(
                "Verilator optimization level must be between 0 and 3, got {}",
                level
            );
        }
        verilator_command.arg(format!("-O{level}"));
    }
    for warning in &options.ignored_warnings {
        verilator_command.arg(format!("-Wno-{warning}"));
    }
    for include_directory in include_directories {
        verilator_command.arg(format!("-I{include_directory}"));
    }
    verilator_command.args(source_files).arg(ffi_wrappers);

    if options.log {
        log::info!("Invoking verilator: {:?}", verilator_command);
    }
    let verilator_output = verilator_command
        .output()
        .whatever_context("Invocation of verilator failed")?;

    if !verilator_output.status.success() {
        whatever!(
            "Invocation of verilator failed with nonzero exit code {}\n\n--- STDOUT ---\n{}\n\n--- STDERR ---\n{}",
            verilator_output.status,
            String::from_utf8(verilator_output.stdout).unwrap_or_default(),
            String::from_utf8(verilator_output.stderr).unwrap_or_default()
        );
    }

    Ok(library_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[snafu::report]
    fn real_ports_use_double() -> Result<(), Whatever> {
        let ffi = generate_ffi(
            "top",
            &[
                ("x", PortType::Real, PortDirection::Input),
                ("y", PortType::Real, PortDirection::Output),
            ],
        )?;

        assert!(ffi.contains("void ffi_Vtop_pin_x(Vtop* top, double new_value)"));
        assert!(ffi.contains("double ffi_Vtop_read_x(Vtop* top)"));
        assert!(ffi.contains("double ffi_Vtop_read_y(Vtop* top)"));
        assert!(!ffi.contains("ffi_Vtop_pin_y"));
        Ok(())
    }

    #[test]
    #[snafu::report]
    fn lifecycle_and_runtime_hooks_are_exported() -> Result<(), Whatever> {
        let ffi = generate_ffi("top", &[])?;

        assert!(ffi.contains("void* ffi_new_Vtop()"));
        assert!(ffi.contains("void ffi_delete_Vtop(Vtop* top)"));
        assert!(ffi.contains("void ffi_Vtop_eval(Vtop* top)"));
        assert!(ffi.contains("Verilated::commandArgs(argc, argv);"));
        assert!(ffi.trim_end().ends_with("} // extern \"C\""));
        Ok(())
    }

    #[test]
    #[snafu::report]
    fn bit_ports_use_verilator_macros() -> Result<(), Whatever> {
        let ffi = generate_ffi(
            "top",
            &[
                ("x", PortType::Bits { msb: 15, lsb: 0 }, PortDirection::Input),
                ("y", PortType::Bits { msb: 39, lsb: 0 }, PortDirection::Output),
            ],
        )?;

        assert!(ffi.contains("VL_IN16(new_value, 15, 0)"));
        assert!(ffi.contains("VL_IN16(/* return value */, 15, 0)"));
        assert!(ffi.contains("VL_OUT64(/* return value */, 39, 0)"));
        Ok(())
    }

    #[test]
    fn overly_wide_ports_are_rejected() {
        let result = generate_ffi(
            "top",
            &[("x", PortType::Bits { msb: 64, lsb: 0 }, PortDirection::Input)],
        );
        assert!(result.is_err());
    }
}
