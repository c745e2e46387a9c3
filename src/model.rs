// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The contract a sweep needs from a model, and the models that implement it.

use std::{convert::Infallible, error::Error};

use snafu::{ResultExt, Snafu, Whatever, whatever};
use vsweep_verilator::{
    AsDynamicVerilatedModel, DynamicVerilatedModelError, PortDirection,
    PortType, VerilatorRuntime, VerilatorValue,
    dynamic::DynamicVerilatedModel,
};

use crate::fixed::{FixedFormat, FixedPointError};

/// An evaluable model with one input and one output signal, both seen as
/// `f64`. Construction is the implementor's constructor and destruction is
/// [`Drop`].
pub trait SweepModel {
    type Error: Error + Send + Sync + 'static;

    /// Sets the input signal. Takes effect on the next [`SweepModel::eval`].
    fn pin_input(&mut self, value: f64) -> Result<(), Self::Error>;

    /// Recomputes the outputs from the current inputs.
    fn eval(&mut self);

    /// The input signal as the model holds it, which may differ from what
    /// was pinned if the port quantizes.
    fn read_input(&self) -> Result<f64, Self::Error>;

    /// The output signal as of the last evaluation.
    fn read_output(&self) -> Result<f64, Self::Error>;
}

/// An in-process model whose evaluation applies a function to the input.
pub struct FnModel<F> {
    function: F,
    input: f64,
    output: f64,
}

impl<F: FnMut(f64) -> f64> FnModel<F> {
    /// Both signals start at zero, like a freshly constructed Verilated
    /// model.
    pub fn new(function: F) -> Self {
        Self {
            function,
            input: 0.0,
            output: 0.0,
        }
    }
}

impl<F: FnMut(f64) -> f64> SweepModel for FnModel<F> {
    type Error = Infallible;

    fn pin_input(&mut self, value: f64) -> Result<(), Self::Error> {
        self.input = value;
        Ok(())
    }

    fn eval(&mut self) {
        self.output = (self.function)(self.input);
    }

    fn read_input(&self) -> Result<f64, Self::Error> {
        Ok(self.input)
    }

    fn read_output(&self) -> Result<f64, Self::Error> {
        Ok(self.output)
    }
}

/// A model whose output follows its input.
pub fn identity() -> FnModel<impl FnMut(f64) -> f64> {
    FnModel::new(|input: f64| input)
}

/// A model that ignores its input.
pub fn constant(value: f64) -> FnModel<impl FnMut(f64) -> f64> {
    FnModel::new(move |_: f64| value)
}

/// How a sweep value maps onto a hardware port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalFormat {
    /// A Verilog `real` port.
    #[default]
    Real,

    /// An integer port holding a fixed-point number.
    Fixed(FixedFormat),
}

impl SignalFormat {
    /// The port type the Verilator runtime should generate accessors for.
    pub fn port_type(&self) -> PortType {
        match self {
            SignalFormat::Real => PortType::Real,
            SignalFormat::Fixed(format) => PortType::Bits {
                msb: format.width() as usize - 1,
                lsb: 0,
            },
        }
    }

    fn encode(&self, value: f64) -> Result<VerilatorValue, FixedPointError> {
        Ok(match self {
            SignalFormat::Real => VerilatorValue::Real(value),
            SignalFormat::Fixed(format) => VerilatorValue::from_bits(
                format.width() as usize,
                format.encode(value)?,
            ),
        })
    }

    fn decode(&self, value: VerilatorValue) -> Option<f64> {
        match self {
            SignalFormat::Real => value.as_real(),
            SignalFormat::Fixed(format) => {
                value.as_bits().map(|bits| format.decode(bits))
            }
        }
    }
}

/// A named port together with its [`SignalFormat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalBinding {
    pub port: String,
    pub format: SignalFormat,
}

impl SignalBinding {
    pub fn new(port: impl Into<String>, format: SignalFormat) -> Self {
        Self {
            port: port.into(),
            format,
        }
    }

    /// A `real` port named `port`.
    pub fn real(port: impl Into<String>) -> Self {
        Self::new(port, SignalFormat::Real)
    }
}

#[derive(Debug, Snafu)]
pub enum VerilatedSweepError {
    #[snafu(display("Failed to access port {port}"))]
    Port {
        port: String,
        source: DynamicVerilatedModelError,
    },
    #[snafu(display("Failed to encode {value} for port {port}"))]
    Encode {
        port: String,
        value: f64,
        source: FixedPointError,
    },
    #[snafu(display(
        "Port {port} produced {value}, which does not match its declared format"
    ))]
    UnexpectedValue { port: String, value: VerilatorValue },
}

/// Adapts a dynamically loaded Verilated model to [`SweepModel`] by binding
/// one of its input ports and one of its output ports.
pub struct VerilatedSweepModel<'ctx> {
    model: DynamicVerilatedModel<'ctx>,
    input: SignalBinding,
    output: SignalBinding,
}

impl<'ctx> VerilatedSweepModel<'ctx> {
    /// Builds (or reuses) the library for module `top` defined in
    /// `source_path` and constructs one instance of it.
    pub fn new(
        runtime: &'ctx mut VerilatorRuntime,
        top: &str,
        source_path: &str,
        input: SignalBinding,
        output: SignalBinding,
    ) -> Result<Self, Whatever> {
        if input.port == output.port {
            whatever!(
                "The swept input and the observed output are both port {}",
                input.port
            );
        }

        let model = runtime
            .create_dyn_model(
                top,
                source_path,
                &[
                    (
                        input.port.as_str(),
                        input.format.port_type(),
                        PortDirection::Input,
                    ),
                    (
                        output.port.as_str(),
                        output.format.port_type(),
                        PortDirection::Output,
                    ),
                ],
            )
            .whatever_context(format!("Failed to instantiate module {top}"))?;

        Ok(Self {
            model,
            input,
            output,
        })
    }

    fn read_binding(
        &self,
        binding: &SignalBinding,
    ) -> Result<f64, VerilatedSweepError> {
        let value = self.model.read(binding.port.as_str()).context(PortSnafu {
            port: binding.port.as_str(),
        })?;
        binding
            .format
            .decode(value)
            .ok_or_else(|| VerilatedSweepError::UnexpectedValue {
                port: binding.port.clone(),
                value,
            })
    }
}

impl SweepModel for VerilatedSweepModel<'_> {
    type Error = VerilatedSweepError;

    fn pin_input(&mut self, value: f64) -> Result<(), Self::Error> {
        let encoded = self.input.format.encode(value).context(EncodeSnafu {
            port: self.input.port.as_str(),
            value,
        })?;
        self.model
            .pin(self.input.port.as_str(), encoded)
            .context(PortSnafu {
                port: self.input.port.as_str(),
            })
    }

    fn eval(&mut self) {
        self.model.eval();
    }

    fn read_input(&self) -> Result<f64, Self::Error> {
        self.read_binding(&self.input)
    }

    fn read_output(&self) -> Result<f64, Self::Error> {
        self.read_binding(&self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Rounding;

    #[test]
    fn fn_models_start_at_zero() {
        let model = identity();
        assert_eq!(model.read_input(), Ok(0.0));
        assert_eq!(model.read_output(), Ok(0.0));
    }

    #[test]
    fn output_only_changes_on_eval() {
        let mut model = FnModel::new(|x: f64| 2.0 * x + 1.0);
        model.pin_input(3.0).unwrap();
        assert_eq!(model.read_output(), Ok(0.0));
        model.eval();
        assert_eq!(model.read_output(), Ok(7.0));
        assert_eq!(model.read_input(), Ok(3.0));
    }

    #[test]
    fn constant_ignores_input() {
        let mut model = constant(4.25);
        for value in [0.0, -1.0, 100.0] {
            model.pin_input(value).unwrap();
            model.eval();
            assert_eq!(model.read_output(), Ok(4.25));
        }
    }

    #[test]
    fn fixed_signals_map_to_bit_ports() {
        let format = FixedFormat::new(12, 4, true, Rounding::Round).unwrap();
        let signal = SignalFormat::Fixed(format);
        assert_eq!(signal.port_type(), PortType::Bits { msb: 11, lsb: 0 });
        assert_eq!(SignalFormat::Real.port_type(), PortType::Real);

        let encoded = signal.encode(-0.5).unwrap();
        assert_eq!(encoded, VerilatorValue::SData(0xff8));
        assert_eq!(signal.decode(encoded), Some(-0.5));
        assert_eq!(signal.decode(VerilatorValue::Real(1.0)), None);
    }

    #[test]
    fn real_signals_pass_through() {
        let encoded = SignalFormat::Real.encode(2.75).unwrap();
        assert_eq!(encoded, VerilatorValue::Real(2.75));
        assert_eq!(SignalFormat::Real.decode(encoded), Some(2.75));
        assert_eq!(SignalFormat::Real.decode(VerilatorValue::CData(1)), None);
    }
}
