// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use std::fs;

use camino::Utf8PathBuf;
use snafu::{ResultExt, Whatever};
use vsweep::{
    config::{CONFIG_FILE_NAME, SweepConfig, search_for_config},
    prelude::*,
};

/// A fresh, empty directory unique to `name` under the Cargo scratch space.
fn scratch(name: &str) -> Result<Utf8PathBuf, Whatever> {
    let directory =
        Utf8PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("config").join(name);
    let _ = fs::remove_dir_all(&directory);
    fs::create_dir_all(&directory)
        .whatever_context(format!("Failed to create {directory}"))?;
    Ok(directory)
}

fn write(path: &Utf8PathBuf, contents: &str) -> Result<(), Whatever> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .whatever_context(format!("Failed to create {parent}"))?;
    }
    fs::write(path, contents).whatever_context(format!("Failed to write {path}"))
}

#[test]
#[snafu::report]
fn search_walks_up_to_the_nearest_file() -> Result<(), Whatever> {
    let root = scratch("walk")?;
    let outer = root.join(CONFIG_FILE_NAME);
    let inner = root.join("project").join(CONFIG_FILE_NAME);
    let deep = root.join("project/rtl/deep");
    write(&outer, "")?;
    write(&inner, "")?;
    fs::create_dir_all(&deep).whatever_context("Failed to create tree")?;

    assert_eq!(search_for_config(deep), Some(inner));
    assert_eq!(search_for_config(root.join("elsewhere")), Some(outer.clone()));
    assert_eq!(search_for_config(root.clone()), Some(outer));
    Ok(())
}

#[test]
#[snafu::report]
fn load_rebases_relative_paths_onto_the_file() -> Result<(), Whatever> {
    let root = scratch("rebase")?;
    let project = root.join("project");
    write(
        &project.join(CONFIG_FILE_NAME),
        r#"
        [model]
        top = "filter"
        sources = ["rtl/*.sv", "/opt/ip/shared.sv"]
        include_directories = ["rtl/include"]

        [verilator]
        artifacts = "build"
        "#,
    )?;
    write(
        &project.join("rtl/filter.sv"),
        "module filter(input real x, output real y); endmodule\n",
    )?;
    let nested = project.join("rtl/deep");
    fs::create_dir_all(&nested).whatever_context("Failed to create tree")?;

    let config = SweepConfig::discover(&nested)?;

    assert_eq!(config.top, "filter");
    assert_eq!(
        config.sources,
        [project.join("rtl/*.sv").into_string(), "/opt/ip/shared.sv".into()]
    );
    assert_eq!(config.include_directories, [project.join("rtl/include")]);
    assert_eq!(config.artifact_directory, project.join("build"));

    let source_files = config.source_files()?;
    assert_eq!(
        source_files,
        [project.join("rtl/filter.sv"), "/opt/ip/shared.sv".into()]
    );
    assert_eq!(
        config.top_source(&source_files)?,
        project.join("rtl/filter.sv")
    );
    Ok(())
}

#[test]
#[snafu::report]
fn defaults_apply_without_a_file() -> Result<(), Whatever> {
    let root = scratch("absent")?;
    assert_eq!(search_for_config(root.clone()), None);

    let config = SweepConfig::discover(&root)?;
    assert_eq!(config, SweepConfig::default());
    assert_eq!(config.sources, ["top.sv"]);
    assert_eq!(config.input, SignalBinding::real("x"));
    assert_eq!(config.output, SignalBinding::real("y"));
    assert_eq!(config.sweep, Sweep::default());
    Ok(())
}
