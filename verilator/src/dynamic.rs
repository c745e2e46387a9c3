// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Support for dynamic models.

use std::{collections::HashMap, ffi, fmt};

use libloading::Library;
use snafu::Snafu;

use crate::{PortDirection, PortType, types};

/// See [`types`].
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum VerilatorValue {
    CData(types::CData),
    SData(types::SData),
    IData(types::IData),
    QData(types::QData),
    Real(types::Real),
}

impl VerilatorValue {
    /// Packs `bits` into the smallest integer type that a port of `width`
    /// bits uses. Bits above `width` are not cleared.
    pub fn from_bits(width: usize, bits: u64) -> Self {
        if width <= 8 {
            Self::CData(bits as types::CData)
        } else if width <= 16 {
            Self::SData(bits as types::SData)
        } else if width <= 32 {
            Self::IData(bits as types::IData)
        } else {
            Self::QData(bits)
        }
    }

    /// The value zero-extended to 64 bits, or `None` for a `real`.
    pub fn as_bits(&self) -> Option<u64> {
        match *self {
            Self::CData(cdata) => Some(cdata.into()),
            Self::SData(sdata) => Some(sdata.into()),
            Self::IData(idata) => Some(idata.into()),
            Self::QData(qdata) => Some(qdata),
            Self::Real(_) => None,
        }
    }

    /// The value of a `real`, or `None` for packed bits.
    pub fn as_real(&self) -> Option<f64> {
        match *self {
            Self::Real(real) => Some(real),
            _ => None,
        }
    }
}

impl fmt::Display for VerilatorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerilatorValue::CData(cdata) => cdata.fmt(f),
            VerilatorValue::SData(sdata) => sdata.fmt(f),
            VerilatorValue::IData(idata) => idata.fmt(f),
            VerilatorValue::QData(qdata) => qdata.fmt(f),
            VerilatorValue::Real(real) => real.fmt(f),
        }
    }
}

impl From<types::CData> for VerilatorValue {
    fn from(value: types::CData) -> Self {
        Self::CData(value)
    }
}

impl From<types::SData> for VerilatorValue {
    fn from(value: types::SData) -> Self {
        Self::SData(value)
    }
}
impl From<types::IData> for VerilatorValue {
    fn from(value: types::IData) -> Self {
        Self::IData(value)
    }
}

impl From<types::QData> for VerilatorValue {
    fn from(value: types::QData) -> Self {
        Self::QData(value)
    }
}

impl From<types::Real> for VerilatorValue {
    fn from(value: types::Real) -> Self {
        Self::Real(value)
    }
}

/// Access model ports at runtime.
pub trait AsDynamicVerilatedModel<'ctx>: 'ctx {
    /// If `port` is a valid port name for this model, returns the current value
    /// of the port. Input ports can be read back as well.
    fn read(
        &self,
        port: impl Into<String>,
    ) -> Result<VerilatorValue, DynamicVerilatedModelError>;

    /// If `port` is a valid input port name for this model, and `value` is of
    /// the port's kind (`real` or packed bits) and wide enough for it, sets the
    /// port to `value`.
    fn pin(
        &mut self,
        port: impl Into<String>,
        value: impl Into<VerilatorValue>,
    ) -> Result<(), DynamicVerilatedModelError>;
}

/// A hardware model constructed at runtime. See
/// [`super::VerilatorRuntime::create_dyn_model`].
pub struct DynamicVerilatedModel<'ctx> {
    pub(crate) ports: HashMap<String, (PortType, PortDirection)>,
    pub(crate) name: String,
    pub(crate) main: *mut ffi::c_void,
    pub(crate) delete_main: extern "C" fn(*mut ffi::c_void),
    pub(crate) eval_main: extern "C" fn(*mut ffi::c_void),
    pub(crate) library: &'ctx Library,
}

impl DynamicVerilatedModel<'_> {
    /// Equivalent to the Verilator `eval` method.
    pub fn eval(&mut self) {
        (self.eval_main)(self.main);
    }

    /// The type and direction `port` was declared with, if it was declared.
    pub fn port(&self, port: &str) -> Option<(PortType, PortDirection)> {
        self.ports.get(port).copied()
    }

    fn lookup(
        &self,
        port: &str,
    ) -> Result<(PortType, PortDirection), DynamicVerilatedModelError> {
        self.port(port)
            .ok_or_else(|| DynamicVerilatedModelError::NoSuchPort {
                top_module: self.name.clone(),
                port: port.to_string(),
                source: None,
            })
    }
}

impl Drop for DynamicVerilatedModel<'_> {
    fn drop(&mut self) {
        (self.delete_main)(self.main);
        self.main = std::ptr::null_mut();
    }
}

/// Runtime port read/write error.
#[derive(Debug, Snafu)]
pub enum DynamicVerilatedModelError {
    #[snafu(display(
        "Port {port} not found on verilated module {top_module}: did you forget to specify it in the runtime `create_dyn_model` constructor?: {source:?}"
    ))]
    NoSuchPort {
        top_module: String,
        port: String,
        #[snafu(source(false))]
        source: Option<libloading::Error>,
    },
    #[snafu(display(
        "Port {port} on verilated module {top_module} has width {width}, but used as if it was in the {attempted_lower} to {attempted_higher} width range"
    ))]
    InvalidPortWidth {
        top_module: String,
        port: String,
        width: usize,
        attempted_lower: usize,
        attempted_higher: usize,
    },
    #[snafu(display(
        "Port {port} on verilated module {top_module} is an {direction} port, but was used as an {attempted_direction} port"
    ))]
    InvalidPortDirection {
        top_module: String,
        port: String,
        direction: PortDirection,
        attempted_direction: PortDirection,
    },
    #[snafu(display(
        "Port {port} on verilated module {top_module} has type {port_type}, but was given the value {value}"
    ))]
    InvalidPortType {
        top_module: String,
        port: String,
        port_type: PortType,
        value: VerilatorValue,
    },
}

impl<'ctx> AsDynamicVerilatedModel<'ctx> for DynamicVerilatedModel<'ctx> {
    fn read(
        &self,
        port: impl Into<String>,
    ) -> Result<VerilatorValue, DynamicVerilatedModelError> {
        let port: String = port.into();
        let (port_type, _) = self.lookup(&port)?;

        macro_rules! read_value {
            ($self:ident, $port:expr, $value_type:ty) => {{
                let symbol: libloading::Symbol<
                    extern "C" fn(*mut ffi::c_void) -> $value_type,
                > = unsafe {
                    $self.library.get(
                        format!("ffi_V{}_read_{}", $self.name, $port).as_bytes(),
                    )
                }
                .map_err(|source| {
                    DynamicVerilatedModelError::NoSuchPort {
                        top_module: $self.name.to_string(),
                        port: $port.clone(),
                        source: Some(source),
                    }
                })?;

                Ok((*symbol)($self.main).into())
            }};
        }

        let width = match port_type {
            PortType::Real => return read_value!(self, port, types::Real),
            PortType::Bits { .. } => port_type.width(),
        };
        if width <= 8 {
            read_value!(self, port, types::CData)
        } else if width <= 16 {
            read_value!(self, port, types::SData)
        } else if width <= 32 {
            read_value!(self, port, types::IData)
        } else if width <= 64 {
            read_value!(self, port, types::QData)
        } else {
            unreachable!("Should have been caught in create_dyn_model")
        }
    }

    fn pin(
        &mut self,
        port: impl Into<String>,
        value: impl Into<VerilatorValue>,
    ) -> Result<(), DynamicVerilatedModelError> {
        macro_rules! pin_value {
            ($self:ident, $port:expr, $port_type:expr, $value:expr, $value_type:ty, $low:literal, $high:literal) => {{
                let symbol: libloading::Symbol<
                    extern "C" fn(*mut ffi::c_void, $value_type),
                > = unsafe {
                    $self.library.get(
                        format!("ffi_V{}_pin_{}", $self.name, $port).as_bytes(),
                    )
                }
                .map_err(|source| {
                    DynamicVerilatedModelError::NoSuchPort {
                        top_module: $self.name.to_string(),
                        port: $port.clone(),
                        source: Some(source),
                    }
                })?;

                let width = $port_type.width();
                if width > $high {
                    return Err(DynamicVerilatedModelError::InvalidPortWidth {
                        top_module: $self.name.clone(),
                        port: $port.clone(),
                        width,
                        attempted_lower: $low,
                        attempted_higher: $high,
                    });
                }

                (*symbol)($self.main, $value);
                Ok(())
            }};
        }

        let port: String = port.into();
        let value: VerilatorValue = value.into();
        let (port_type, direction) = self.lookup(&port)?;

        if !matches!(direction, PortDirection::Input | PortDirection::Inout) {
            return Err(DynamicVerilatedModelError::InvalidPortDirection {
                top_module: self.name.clone(),
                port,
                direction,
                attempted_direction: PortDirection::Input,
            });
        }

        if matches!(port_type, PortType::Real)
            != matches!(value, VerilatorValue::Real(_))
        {
            return Err(DynamicVerilatedModelError::InvalidPortType {
                top_module: self.name.clone(),
                port,
                port_type,
                value,
            });
        }

        match value {
            VerilatorValue::CData(cdata) => {
                pin_value!(self, port, port_type, cdata, types::CData, 0, 8)
            }
            VerilatorValue::SData(sdata) => {
                pin_value!(self, port, port_type, sdata, types::SData, 9, 16)
            }
            VerilatorValue::IData(idata) => {
                pin_value!(self, port, port_type, idata, types::IData, 17, 32)
            }
            VerilatorValue::QData(qdata) => {
                pin_value!(self, port, port_type, qdata, types::QData, 33, 64)
            }
            VerilatorValue::Real(real) => {
                pin_value!(self, port, port_type, real, types::Real, 64, 64)
            }
        }
    }
}
