use crate::{ArgType, PdbStatus, RunMode};

/// An RGBA color with components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rgba {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl Rgba {
    pub fn new(r: f64, g: f64, b: f64, a: f64) -> Self {
        Self { r, g, b, a }
    }
}

/// Named blob attached to an image or item
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parasite {
    pub name: String,
    pub flags: u32,
    pub data: Vec<u8>,
}

/// A single typed argument or return value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int32(i32),
    Int16(i16),
    Int8(u8),
    Float(f64),
    String(String),
    Int32Array(Vec<i32>),
    Int16Array(Vec<i16>),
    Int8Array(Vec<u8>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
    Color(Rgba),
    Item(i32),
    Display(i32),
    Image(i32),
    Layer(i32),
    Channel(i32),
    Drawable(i32),
    Selection(i32),
    ColorArray(Vec<Rgba>),
    Vectors(i32),
    Parasite(Parasite),
    Status(PdbStatus),
    RunMode(RunMode),
    File(String),
    DrawableArray(Vec<i32>),
}

impl ParamValue {
    pub fn arg_type(&self) -> ArgType {
        match self {
            ParamValue::Int32(_) => ArgType::Int32,
            ParamValue::Int16(_) => ArgType::Int16,
            ParamValue::Int8(_) => ArgType::Int8,
            ParamValue::Float(_) => ArgType::Float,
            ParamValue::String(_) => ArgType::String,
            ParamValue::Int32Array(_) => ArgType::Int32Array,
            ParamValue::Int16Array(_) => ArgType::Int16Array,
            ParamValue::Int8Array(_) => ArgType::Int8Array,
            ParamValue::FloatArray(_) => ArgType::FloatArray,
            ParamValue::StringArray(_) => ArgType::StringArray,
            ParamValue::Color(_) => ArgType::Color,
            ParamValue::Item(_) => ArgType::Item,
            ParamValue::Display(_) => ArgType::Display,
            ParamValue::Image(_) => ArgType::Image,
            ParamValue::Layer(_) => ArgType::Layer,
            ParamValue::Channel(_) => ArgType::Channel,
            ParamValue::Drawable(_) => ArgType::Drawable,
            ParamValue::Selection(_) => ArgType::Selection,
            ParamValue::ColorArray(_) => ArgType::ColorArray,
            ParamValue::Vectors(_) => ArgType::Vectors,
            ParamValue::Parasite(_) => ArgType::Parasite,
            ParamValue::Status(_) => ArgType::Status,
            ParamValue::RunMode(_) => ArgType::RunMode,
            ParamValue::File(_) => ArgType::File,
            ParamValue::DrawableArray(_) => ArgType::DrawableArray,
        }
    }

    /// Element count of an array value
    pub fn array_len(&self) -> Option<usize> {
        match self {
            ParamValue::Int32Array(v) | ParamValue::DrawableArray(v) => Some(v.len()),
            ParamValue::Int16Array(v) => Some(v.len()),
            ParamValue::Int8Array(v) => Some(v.len()),
            ParamValue::FloatArray(v) => Some(v.len()),
            ParamValue::StringArray(v) => Some(v.len()),
            ParamValue::ColorArray(v) => Some(v.len()),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            ParamValue::Int32(v)
            | ParamValue::Item(v)
            | ParamValue::Display(v)
            | ParamValue::Image(v)
            | ParamValue::Layer(v)
            | ParamValue::Channel(v)
            | ParamValue::Drawable(v)
            | ParamValue::Selection(v)
            | ParamValue::Vectors(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) | ParamValue::File(s) => Some(s),
            _ => None,
        }
    }
}

/// Return values of a procedure invocation.
///
/// The first element is always the [`PdbStatus`]. Failed calls carry an
/// error message string as the second element.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValues(Vec<ParamValue>);

impl ReturnValues {
    pub fn success(values: Vec<ParamValue>) -> Self {
        let mut all = Vec::with_capacity(values.len() + 1);
        all.push(ParamValue::Status(PdbStatus::Success));
        all.extend(values);
        Self(all)
    }

    pub fn error(status: PdbStatus, message: impl Into<String>) -> Self {
        Self(vec![
            ParamValue::Status(status),
            ParamValue::String(message.into()),
        ])
    }

    pub fn cancel() -> Self {
        Self(vec![ParamValue::Status(PdbStatus::Cancel)])
    }

    /// Wrap values received from a peer. A missing or non-status first
    /// element reads back as an execution error.
    pub fn from_wire(values: Vec<ParamValue>) -> Self {
        Self(values)
    }

    pub fn status(&self) -> PdbStatus {
        match self.0.first() {
            Some(ParamValue::Status(status)) => *status,
            _ => PdbStatus::ExecutionError,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == PdbStatus::Success
    }

    /// Values following the status
    pub fn values(&self) -> &[ParamValue] {
        match self.0.first() {
            Some(ParamValue::Status(_)) => &self.0[1..],
            _ => &self.0,
        }
    }

    /// The `idx`-th value after the status
    pub fn get(&self, idx: usize) -> Option<&ParamValue> {
        self.values().get(idx)
    }

    pub fn error_message(&self) -> Option<&str> {
        if self.is_success() {
            return None;
        }
        self.get(0).and_then(ParamValue::as_str)
    }

    pub fn as_slice(&self) -> &[ParamValue] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<ParamValue> {
        self.0
    }
}
