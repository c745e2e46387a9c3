// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! This module implements the Verilator runtime for instantiating hardware
//! modules as dynamically loaded models.
//!
//! A model is built once per (top module, source file) pair: the runtime
//! generates a small C shim around the Verilated class, has `verilator`
//! compile everything into a shared library, and then resolves the shim's
//! symbols with [`libloading`].

use std::{
    collections::{HashMap, hash_map::Entry},
    env,
    ffi::{CString, OsString},
    fmt, fs,
    io::Write,
    os::fd::FromRawFd,
    sync::{LazyLock, Mutex},
    time::{Duration, Instant},
};

use build_library::build_library;
use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use dynamic::DynamicVerilatedModel;
use indicatif::ProgressBar;
use libloading::Library;
use owo_colors::OwoColorize;
use snafu::{OptionExt, ResultExt, Whatever, whatever};

mod build_library;
pub mod dynamic;

pub use dynamic::{
    AsDynamicVerilatedModel, DynamicVerilatedModelError, VerilatorValue,
};

/// Verilator-defined types for C FFI.
pub mod types {
    /// From the Verilator documentation: "Data representing 'bit' of 1-8 packed
    /// bits."
    pub type CData = u8;

    /// From the Verilator documentation: "Data representing 'bit' of 9-16
    /// packed bits"
    pub type SData = u16;

    /// From the Verilator documentation: "Data representing 'bit' of 17-32
    /// packed bits."
    pub type IData = u32;

    /// From the Verilator documentation: "Data representing 'bit' of 33-64
    /// packed bits."
    pub type QData = u64;

    /// A Verilog `real`, which Verilator stores as a C `double`.
    pub type Real = f64;
}

/// <https://www.digikey.com/en/maker/blogs/2024/verilog-ports-part-7-of-our-verilog-journey>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
    Inout,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => "input",
            PortDirection::Output => "output",
            PortDirection::Inout => "inout",
        }
        .fmt(f)
    }
}

/// How a port is laid out on the Verilated class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// A packed vector `[msb:lsb]`, held in the smallest of the [`types`]
    /// integers that fits it.
    Bits { msb: usize, lsb: usize },

    /// A `real` port.
    Real,
}

impl PortType {
    /// The number of bits the port carries. A `real` is 64 bits wide.
    pub fn width(&self) -> usize {
        match self {
            PortType::Bits { msb, lsb } => (msb + 1).saturating_sub(*lsb),
            PortType::Real => 64,
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Bits { msb, lsb } => write!(f, "[{msb}:{lsb}]"),
            PortType::Real => "real".fmt(f),
        }
    }
}

/// Optional configuration for creating a [`VerilatorRuntime`]. Usually, you can
/// just use [`VerilatorRuntimeOptions::default()`].
pub struct VerilatorRuntimeOptions {
    /// The name of the `verilator` executable, interpreted in some way by the
    /// OS/shell.
    pub verilator_executable: OsString,

    /// If `None`, there will be no optimization. If a value from `0` to `3`
    /// inclusive, the flag `-O<level>` will be passed. Enabling will slow
    /// compilation times.
    pub verilator_optimization: Option<usize>,

    /// Whether Verilator should always be invoked instead of only when the
    /// source files or generated shim change.
    pub force_verilator_rebuild: bool,

    /// A list of warnings to disable.
    pub ignored_warnings: Vec<String>,

    /// Arguments handed to `Verilated::commandArgs` when a model library is
    /// first loaded, after the program name. This is how `+verilator+...`
    /// plusargs reach the simulation runtime.
    pub command_args: Vec<String>,

    /// Whether to use the log crate.
    pub log: bool,
}

impl Default for VerilatorRuntimeOptions {
    fn default() -> Self {
        Self {
            verilator_executable: "verilator".into(),
            verilator_optimization: None,
            force_verilator_rebuild: false,
            ignored_warnings: vec![],
            command_args: vec![],
            log: false,
        }
    }
}

impl VerilatorRuntimeOptions {
    /// The same as the [`Default`] implementation except that the log crate is
    /// used.
    pub fn default_logging() -> Self {
        Self {
            log: true,
            ..Default::default()
        }
    }
}

/// Runtime for (System)Verilog code.
pub struct VerilatorRuntime {
    artifact_directory: Utf8PathBuf,
    source_files: Vec<Utf8PathBuf>,
    include_directories: Vec<Utf8PathBuf>,
    options: VerilatorRuntimeOptions,
    /// Mapping between hardware (top, path) and Verilator implementations
    libraries: HashMap<(String, String), Library>,
}

/* <Forgive me father for I have sinned> */

// TODO: make cross-platform
static STDERR: LazyLock<Mutex<fs::File>> =
    LazyLock::new(|| Mutex::new(unsafe { fs::File::from_raw_fd(2) }));

macro_rules! eprintln_nocapture {
    ($($contents:tt)*) => {{
        use snafu::ResultExt;

        match STDERR.lock() {
            Ok(mut stderr) => writeln!(&mut stderr, $($contents)*)
                .whatever_context("Failed to write to non-captured stderr"),
            Err(_) => snafu::whatever!("Non-captured stderr lock was poisoned"),
        }
    }};
}

#[derive(Default)]
struct ThreadLocalFileLock;

/// The file_guard handles locking across processes, but does not guarantee
/// locking between threads in one process.
static THREAD_LOCK: LazyLock<DashMap<Utf8PathBuf, Mutex<ThreadLocalFileLock>>> =
    LazyLock::new(DashMap::default);

/* </Forgive me father for I have sinned> */

impl VerilatorRuntime {
    /// Creates a new runtime for instantiating (System)Verilog modules as Rust
    /// objects.
    pub fn new(
        artifact_directory: &Utf8Path,
        source_files: &[&Utf8Path],
        include_directories: &[&Utf8Path],
        options: VerilatorRuntimeOptions,
    ) -> Result<Self, Whatever> {
        if options.log {
            log::info!("Validating source files");
        }
        for source_file in source_files {
            if !source_file.is_file() {
                whatever!(
                    "Source file {} does not exist or is not a file. Note that if it's a relative path, you must be in the correct directory",
                    source_file
                );
            }
        }

        Ok(Self {
            artifact_directory: artifact_directory.to_owned(),
            source_files: source_files
                .iter()
                .map(|path| path.to_path_buf())
                .collect(),
            include_directories: include_directories
                .iter()
                .map(|path| path.to_path_buf())
                .collect(),
            options,
            libraries: HashMap::new(),
        })
    }

    /// Constructs a new dynamic model. Uses lazy and incremental building for
    /// efficiency. You must guarantee the correctness of the suppplied
    /// information, namely, that `name` is precisely the name of the
    /// Verilog module, `source_path` is, when canonicalized
    /// using [`fs::canonicalize`], the relative/absolute path to the Verilog
    /// file defining the module `name`, and `ports` is a correct subset of
    /// the ports of the Verilog module.
    ///
    /// The model is destroyed when the returned value is dropped.
    pub fn create_dyn_model<'ctx>(
        &'ctx mut self,
        name: &str,
        source_path: &str,
        ports: &[(&str, PortType, PortDirection)],
    ) -> Result<DynamicVerilatedModel<'ctx>, Whatever> {
        let library = self
            .build_or_retrieve_library(name, source_path, ports)
            .whatever_context(
                "Failed to build or retrieve verilator dynamic library",
            )?;

        let new_main: extern "C" fn() -> *mut libc::c_void =
            *unsafe { library.get(format!("ffi_new_V{name}").as_bytes()) }
                .whatever_context(format!(
                    "Failed to load constructor for module {}",
                    name
                ))?;
        let delete_main =
            *unsafe { library.get(format!("ffi_delete_V{name}").as_bytes()) }
                .whatever_context(format!(
                    "Failed to load destructor for module {}",
                    name
                ))?;
        let eval_main =
            *unsafe { library.get(format!("ffi_V{name}_eval").as_bytes()) }
                .whatever_context(format!(
                    "Failed to load evalulator for module {}",
                    name
                ))?;

        let main = new_main();
        if main.is_null() {
            whatever!("Constructor for module {} returned a null model", name);
        }

        let ports = ports
            .iter()
            .copied()
            .map(|(port, port_type, direction)| {
                (port.to_string(), (port_type, direction))
            })
            .collect();

        Ok(DynamicVerilatedModel {
            ports,
            name: name.to_string(),
            main,
            delete_main,
            eval_main,
            library,
        })
    }

    /// Invokes verilator to build a dynamic library for the Verilog module
    /// named `name` defined in the file `source_path` and with signature
    /// `ports`.
    ///
    /// If the library is already cached for the given module name/source path
    /// pair, then it is returned immediately.
    ///
    /// It is required that the `ports` signature matches a subset of the ports
    /// defined on the Verilog module exactly.
    ///
    /// If `self.options.force_verilator_rebuild`, then the library will always
    /// be rebuilt. Otherwise, it is only rebuilt on (a conservative
    /// definition) of change:
    ///
    /// - Edits to Verilog source code
    /// - Changes to the requested port signature
    ///
    /// Then, the first time the library is loaded in this process, the
    /// configured command arguments are forwarded to `Verilated::commandArgs`.
    ///
    /// See [`build_library::build_library`] for more information.
    ///
    /// # Safety
    ///
    /// This function is thread-safe.
    fn build_or_retrieve_library(
        &mut self,
        name: &str,
        source_path: &str,
        ports: &[(&str, PortType, PortDirection)],
    ) -> Result<&Library, Whatever> {
        if name.chars().any(|c| c == '\\' || c == ' ') {
            whatever!("Escaped module names are not supported");
        }

        if self.options.log {
            log::info!("Validating model source file");
        }
        if !self.source_files.iter().any(|source_file| {
            match (
                source_file.canonicalize_utf8(),
                Utf8Path::new(source_path).canonicalize_utf8(),
            ) {
                (Ok(lhs), Ok(rhs)) => lhs == rhs,
                _ => false,
            }
        }) {
            whatever!(
                "Module `{}` requires source file {}, which was not provided to the runtime",
                name,
                source_path
            );
        }

        if let Some((port, _, _)) = ports
            .iter()
            .find(|(port, _, _)| port.chars().any(|c| c == '\\' || c == ' '))
        {
            whatever!(
                "Port `{}` on module {} is escaped, which is not supported",
                port,
                name
            );
        }
        for (port, port_type, _) in ports {
            if let PortType::Bits { msb, lsb } = port_type {
                if msb < lsb {
                    whatever!(
                        "Port {} on module {} was specified with the high bit less than the low bit",
                        port,
                        name
                    );
                }
                if msb + 1 - lsb > 64 {
                    whatever!(
                        "Port {} on module {} is greater than 64 bits",
                        port,
                        name
                    );
                }
            }
        }

        if let Entry::Vacant(entry) = self
            .libraries
            .entry((name.to_string(), source_path.to_string()))
        {
            let local_directory_name = format!(
                "{name}_{}",
                source_path.replace("_", "__").replace("/", "_")
            );
            let local_artifacts_directory =
                self.artifact_directory.join(&local_directory_name);

            if self.options.log {
                log::info!(
                    "Creating artifacts directory {}",
                    local_artifacts_directory
                );
            }
            fs::create_dir_all(&local_artifacts_directory).whatever_context(
                format!(
                    "Failed to create artifacts directory {}",
                    local_artifacts_directory,
                ),
            )?;

            eprintln_nocapture!(
                "{} waiting for file lock on build directory",
                "    Blocking".bold().cyan(),
            )?;

            // # Safety
            // build_library is not thread-safe, so we have to lock the
            // directory
            if self.options.log {
                log::info!("Acquiring file lock on artifact directory");
            }
            let file_lock = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(self.artifact_directory.join(format!("{local_directory_name}.lock")))
                .whatever_context(
                    "Failed to open file lock file for artifacts directory (this is not the actual lock itself, it is an I/O error)",
                )?;

            let _file_lock =
                file_guard::lock(&file_lock, file_guard::Lock::Exclusive, 0, 1)
                    .whatever_context(
                        "Failed to acquire file lock for artifacts directory",
                    )?;

            let thread_mutex = THREAD_LOCK
                .entry(local_artifacts_directory.clone())
                .or_default();
            let Ok(_thread_lock) = thread_mutex.lock() else {
                whatever!(
                    "Failed to acquire thread-local lock for artifacts directory"
                );
            };

            eprintln_nocapture!(
                "{} {} ({})",
                "   Compiling".bold().green(),
                name,
                source_path
            )?;
            let start = Instant::now();

            if self.options.log {
                log::info!("Building the dynamic library with verilator");
            }
            let spinner = ProgressBar::new_spinner()
                .with_message(format!("verilating {name}"));
            spinner.enable_steady_tick(Duration::from_millis(100));
            let library_path = build_library(
                &self.source_files,
                &self.include_directories,
                name,
                ports,
                &local_artifacts_directory,
                &self.options,
            );
            spinner.finish_and_clear();
            let library_path = library_path
                .whatever_context("Failed to build verilator dynamic library")?;

            if self.options.log {
                log::info!("Opening the dynamic library");
            }
            let library = unsafe { Library::new(library_path) }
                .whatever_context("Failed to load verilator dynamic library")?;

            forward_command_args(&library, name, &self.options)
                .whatever_context(format!(
                    "Failed to initialize the Verilator runtime for module {}",
                    name
                ))?;

            entry.insert(library);

            let duration = start.elapsed();
            eprintln_nocapture!(
                "{} `verilator-{}` profile target(s) in {}.{:02}s",
                "    Finished".bold().green(),
                self.options
                    .verilator_optimization
                    .map(|level| format!("O{level}"))
                    .unwrap_or("unoptimized".into()),
                duration.as_secs(),
                duration.subsec_millis() / 10
            )?;
        }

        self.libraries
            .get(&(name.to_string(), source_path.to_string()))
            .whatever_context(
                "Verilator library missing from cache right after insertion",
            )
    }
}

/// Hands the program name followed by `options.command_args` to the
/// library's copy of `Verilated::commandArgs`. Verilator copies the strings,
/// so they only need to live for the duration of the call.
fn forward_command_args(
    library: &Library,
    name: &str,
    options: &VerilatorRuntimeOptions,
) -> Result<(), Whatever> {
    let command_args: extern "C" fn(
        libc::c_int,
        *const *const libc::c_char,
    ) = *unsafe { library.get(format!("ffi_V{name}_command_args").as_bytes()) }
        .whatever_context("Failed to load Verilator command argument hook")?;

    let program = env::args().next().unwrap_or_else(|| name.to_string());
    let arguments = std::iter::once(program)
        .chain(options.command_args.iter().cloned())
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .whatever_context("Verilator arguments cannot contain NUL bytes")?;
    let pointers = arguments
        .iter()
        .map(|argument| argument.as_ptr())
        .collect::<Vec<_>>();
    let Ok(count) = libc::c_int::try_from(pointers.len()) else {
        whatever!("Too many arguments for the Verilator runtime");
    };

    if options.log {
        log::info!(
            "Forwarding {} argument(s) to Verilated::commandArgs",
            options.command_args.len()
        );
    }
    (command_args)(count, pointers.as_ptr());

    Ok(())
}
