use plug_in_error::PlugInError;
use std::fmt;

/// Type of a declared procedure argument or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ArgType {
    Int32 = 0,
    Int16 = 1,
    Int8 = 2,
    Float = 3,
    String = 4,
    Int32Array = 5,
    Int16Array = 6,
    Int8Array = 7,
    FloatArray = 8,
    StringArray = 9,
    Color = 10,
    Item = 11,
    Display = 12,
    Image = 13,
    Layer = 14,
    Channel = 15,
    Drawable = 16,
    Selection = 17,
    ColorArray = 18,
    Vectors = 19,
    Parasite = 20,
    Status = 21,
    RunMode = 22,
    File = 23,
    DrawableArray = 24,
}

const ALL: [ArgType; 25] = [
    ArgType::Int32,
    ArgType::Int16,
    ArgType::Int8,
    ArgType::Float,
    ArgType::String,
    ArgType::Int32Array,
    ArgType::Int16Array,
    ArgType::Int8Array,
    ArgType::FloatArray,
    ArgType::StringArray,
    ArgType::Color,
    ArgType::Item,
    ArgType::Display,
    ArgType::Image,
    ArgType::Layer,
    ArgType::Channel,
    ArgType::Drawable,
    ArgType::Selection,
    ArgType::ColorArray,
    ArgType::Vectors,
    ArgType::Parasite,
    ArgType::Status,
    ArgType::RunMode,
    ArgType::File,
    ArgType::DrawableArray,
];

impl ArgType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Array arguments carry their element count in the preceding
    /// int32 argument.
    pub fn is_array(self) -> bool {
        matches!(
            self,
            ArgType::Int32Array
                | ArgType::Int16Array
                | ArgType::Int8Array
                | ArgType::FloatArray
                | ArgType::StringArray
                | ArgType::ColorArray
                | ArgType::DrawableArray
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ArgType::Int32 => "int32",
            ArgType::Int16 => "int16",
            ArgType::Int8 => "int8",
            ArgType::Float => "float",
            ArgType::String => "string",
            ArgType::Int32Array => "int32array",
            ArgType::Int16Array => "int16array",
            ArgType::Int8Array => "int8array",
            ArgType::FloatArray => "floatarray",
            ArgType::StringArray => "stringarray",
            ArgType::Color => "color",
            ArgType::Item => "item",
            ArgType::Display => "display",
            ArgType::Image => "image",
            ArgType::Layer => "layer",
            ArgType::Channel => "channel",
            ArgType::Drawable => "drawable",
            ArgType::Selection => "selection",
            ArgType::ColorArray => "colorarray",
            ArgType::Vectors => "vectors",
            ArgType::Parasite => "parasite",
            ArgType::Status => "status",
            ArgType::RunMode => "run-mode",
            ArgType::File => "file",
            ArgType::DrawableArray => "drawablearray",
        }
    }
}

impl TryFrom<i32> for ArgType {
    type Error = PlugInError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| ALL.get(idx).copied())
            .ok_or_else(|| PlugInError::malformed(format!("invalid argument type {value}")))
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated argument declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub arg_type: ArgType,
    pub name: String,
    pub description: String,
}

impl ArgDef {
    pub fn new(arg_type: ArgType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            arg_type,
            name: name.into(),
            description: description.into(),
        }
    }
}
