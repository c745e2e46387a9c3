// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use std::{fmt, io};

use snafu::{ResultExt, Whatever};
use vsweep::{
    model::{FnModel, SweepModel, constant, identity},
    sweep::{Sample, Sweep, SweepDriver, SweepError},
};

fn run_to_string<M: SweepModel>(
    model: &mut M,
    sweep: &Sweep,
) -> Result<(Vec<Sample>, String), Whatever> {
    let mut output = vec![];
    let samples = SweepDriver::default()
        .run(model, sweep, &mut output)
        .whatever_context("sweep failed")?;
    let output =
        String::from_utf8(output).whatever_context("output is not UTF-8")?;
    Ok((samples, output))
}

#[test]
#[snafu::report]
fn identity_model_prints_matching_pairs() -> Result<(), Whatever> {
    let (samples, output) = run_to_string(&mut identity(), &Sweep::default())?;

    let expected = (0..10)
        .map(|i| format!("x={i}.000, y={i}.000\n"))
        .collect::<String>();
    assert_eq!(output, expected);
    assert_eq!(samples.len(), 10);
    assert!(samples.iter().all(|sample| sample.input == sample.output));
    Ok(())
}

#[test]
#[snafu::report]
fn constant_model_shares_one_output() -> Result<(), Whatever> {
    let (_, output) = run_to_string(&mut constant(2.5), &Sweep::default())?;

    let lines = output.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 10);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(*line, format!("x={i}.000, y=2.500"));
    }
    Ok(())
}

#[test]
#[snafu::report]
fn every_printed_input_is_the_step_index() -> Result<(), Whatever> {
    let mut model = FnModel::new(|x: f64| x * x - 3.0);
    let (samples, output) = run_to_string(&mut model, &Sweep::default())?;

    for (i, (line, sample)) in output.lines().zip(&samples).enumerate() {
        assert!(line.starts_with(&format!("x={i}.000, ")));
        assert_eq!(sample.output, (i * i) as f64 - 3.0);
    }
    assert_eq!(output.lines().last(), Some("x=9.000, y=78.000"));
    Ok(())
}

#[test]
#[snafu::report]
fn output_reflects_the_latest_input() -> Result<(), Whatever> {
    let mut calls = 0;
    let mut model = FnModel::new(|x: f64| {
        calls += 1;
        x + 0.5
    });
    let (samples, _) =
        run_to_string(&mut model, &Sweep::new(1.0, 2.0, 0.25).unwrap())?;
    drop(model);

    assert_eq!(calls, 4);
    assert_eq!(
        samples,
        [
            Sample { input: 1.0, output: 1.5 },
            Sample { input: 1.25, output: 1.75 },
            Sample { input: 1.5, output: 2.0 },
            Sample { input: 1.75, output: 2.25 },
        ]
    );
    Ok(())
}

#[derive(Debug)]
struct Unplugged;

impl fmt::Display for Unplugged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "output port is not connected".fmt(f)
    }
}

impl std::error::Error for Unplugged {}

/// Accepts inputs but can't produce an output past `limit`.
struct FailsAfter {
    input: f64,
    limit: f64,
}

impl SweepModel for FailsAfter {
    type Error = Unplugged;

    fn pin_input(&mut self, value: f64) -> Result<(), Self::Error> {
        self.input = value;
        Ok(())
    }

    fn eval(&mut self) {}

    fn read_input(&self) -> Result<f64, Self::Error> {
        Ok(self.input)
    }

    fn read_output(&self) -> Result<f64, Self::Error> {
        if self.input > self.limit {
            Err(Unplugged)
        } else {
            Ok(2.0 * self.input)
        }
    }
}

#[test]
fn model_errors_stop_the_sweep() {
    let mut model = FailsAfter {
        input: 0.0,
        limit: 2.0,
    };
    let mut output = vec![];
    let result =
        SweepDriver::default().run(&mut model, &Sweep::default(), &mut output);

    assert!(matches!(result, Err(SweepError::ReadOutput { index: 3, .. })));
    assert_eq!(
        String::from_utf8(output).unwrap(),
        "x=0.000, y=0.000\nx=1.000, y=2.000\nx=2.000, y=4.000\n"
    );
}

struct BrokenPipe;

impl io::Write for BrokenPipe {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::BrokenPipe.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn write_errors_are_reported() {
    let result = SweepDriver::default().run(
        &mut identity(),
        &Sweep::default(),
        &mut BrokenPipe,
    );
    assert!(matches!(result, Err(SweepError::Write { index: 0, .. })));
}

#[test]
#[snafu::report]
fn empty_sweep_prints_nothing() -> Result<(), Whatever> {
    let (samples, output) =
        run_to_string(&mut identity(), &Sweep::new(3.0, 3.0, 1.0).unwrap())?;
    assert!(samples.is_empty());
    assert!(output.is_empty());
    Ok(())
}
