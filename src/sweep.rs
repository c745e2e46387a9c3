// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Driving a model through a range of input values.

use std::{error::Error, io};

use snafu::{ResultExt, Snafu};

use crate::model::SweepModel;

type BoxedModelError = Box<dyn Error + Send + Sync>;

/// The most values a single sweep may have.
pub const MAX_STEPS: usize = 100_000_000;

/// The most digits printed after the decimal point. Seventeen significant
/// digits already round-trip any `f64`.
pub const MAX_PRECISION: usize = 17;

#[derive(Debug, Snafu)]
pub enum SweepError {
    #[snafu(display("Sweep bounds must be finite, got {start} to {stop}"))]
    NonFiniteBounds { start: f64, stop: f64 },
    #[snafu(display("Sweep step must be finite and positive, got {step}"))]
    InvalidStep { step: f64 },
    #[snafu(display(
        "Sweep would take about {count} steps, more than the limit of {}",
        MAX_STEPS
    ))]
    TooManySteps { count: f64 },
    #[snafu(display("Failed to set the input to {value} at sweep step {index}"))]
    PinInput {
        index: usize,
        value: f64,
        source: BoxedModelError,
    },
    #[snafu(display("Failed to read back the input at sweep step {index}"))]
    ReadInput {
        index: usize,
        source: BoxedModelError,
    },
    #[snafu(display("Failed to read the output at sweep step {index}"))]
    ReadOutput {
        index: usize,
        source: BoxedModelError,
    },
    #[snafu(display("Failed to write the result of sweep step {index}"))]
    Write { index: usize, source: io::Error },
}

/// The half-open range `start..stop` walked in increments of `step`.
///
/// Values are computed as `start + i * step` rather than by repeated
/// addition, so long sweeps with fractional steps don't drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sweep {
    start: f64,
    stop: f64,
    step: f64,
}

impl Default for Sweep {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 10.0,
            step: 1.0,
        }
    }
}

impl Sweep {
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self, SweepError> {
        if !start.is_finite() || !stop.is_finite() {
            return Err(SweepError::NonFiniteBounds { start, stop });
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(SweepError::InvalidStep { step });
        }
        // infinite when `stop - start` overflows
        let count = ((stop - start) / step).ceil();
        if count > MAX_STEPS as f64 {
            return Err(SweepError::TooManySteps { count });
        }
        Ok(Self { start, stop, step })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    fn value(&self, index: usize) -> f64 {
        self.start + index as f64 * self.step
    }

    /// The number of values in the sweep, at most [`MAX_STEPS`] plus one.
    pub fn len(&self) -> usize {
        if self.stop <= self.start {
            return 0;
        }
        // the estimate can be off by one either way in floating point
        let mut count = ((self.stop - self.start) / self.step).ceil() as usize;
        while count > 0 && self.value(count - 1) >= self.stop {
            count -= 1;
        }
        while self.value(count) < self.stop {
            let Some(next) = count.checked_add(1) else {
                break;
            };
            count = next;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(|index| self.value(index))
    }
}

/// One step of a sweep, with both signals read back from the model after
/// evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub input: f64,
    pub output: f64,
}

/// Applies a [`Sweep`] to a [`SweepModel`] and reports each step as a line
/// of the form `x=0.000, y=0.000`.
#[derive(Debug, Clone)]
pub struct SweepDriver {
    input_label: String,
    output_label: String,
    precision: usize,
}

impl Default for SweepDriver {
    fn default() -> Self {
        Self::new("x", "y", 3)
    }
}

impl SweepDriver {
    /// `precision` is capped at [`MAX_PRECISION`].
    pub fn new(
        input_label: impl Into<String>,
        output_label: impl Into<String>,
        precision: usize,
    ) -> Self {
        Self {
            input_label: input_label.into(),
            output_label: output_label.into(),
            precision: precision.min(MAX_PRECISION),
        }
    }

    pub fn format_sample(&self, sample: &Sample) -> String {
        format!(
            "{}={:.*}, {}={:.*}",
            self.input_label,
            self.precision,
            sample.input,
            self.output_label,
            self.precision,
            sample.output
        )
    }

    /// For each value of `sweep`: pins it, evaluates, reads both signals back
    /// and writes one line to `writer`. Stops at the first failure.
    pub fn run<M: SweepModel, W: io::Write>(
        &self,
        model: &mut M,
        sweep: &Sweep,
        writer: &mut W,
    ) -> Result<Vec<Sample>, SweepError> {
        let mut samples = vec![];
        for (index, value) in sweep.values().enumerate() {
            model
                .pin_input(value)
                .map_err(|error| SweepError::PinInput {
                    index,
                    value,
                    source: Box::new(error),
                })?;
            model.eval();

            let input = model.read_input().map_err(|error| {
                SweepError::ReadInput {
                    index,
                    source: Box::new(error),
                }
            })?;
            let output = model.read_output().map_err(|error| {
                SweepError::ReadOutput {
                    index,
                    source: Box::new(error),
                }
            })?;

            let sample = Sample { input, output };
            log::debug!("sweep step {index}: {sample:?}");
            writeln!(writer, "{}", self.format_sample(&sample))
                .context(WriteSnafu { index })?;
            samples.push(sample);
        }
        writer.flush().context(WriteSnafu {
            index: samples.len(),
        })?;

        Ok(samples)
    }
}
