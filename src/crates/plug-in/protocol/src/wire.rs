//! Primitive payload encoding: integers, doubles, nullable strings and
//! typed values.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use plug_in_error::{PlugInError, Result};
use plug_in_types::{ArgType, ParamValue, Parasite, PdbStatus, Rgba, RunMode};

pub(crate) fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u32(u32::from(value));
}

/// Strings are `len: u32` followed by `len` bytes including a trailing
/// NUL. A zero length encodes a null string.
pub(crate) fn put_string(dst: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        None => dst.put_u32(0),
        Some(bytes) => {
            dst.put_u32((bytes.len() + 1) as u32);
            dst.put_slice(bytes);
            dst.put_u8(0);
        }
    }
}

pub(crate) fn put_str(dst: &mut BytesMut, value: &str) {
    put_string(dst, Some(value.as_bytes()));
}

fn put_color(dst: &mut BytesMut, color: &Rgba) {
    dst.put_f64(color.r);
    dst.put_f64(color.g);
    dst.put_f64(color.b);
    dst.put_f64(color.a);
}

pub(crate) fn put_values(dst: &mut BytesMut, values: &[ParamValue]) {
    dst.put_u32(values.len() as u32);
    for value in values {
        put_value(dst, value);
    }
}

fn put_value(dst: &mut BytesMut, value: &ParamValue) {
    dst.put_i32(value.arg_type().as_i32());

    match value {
        ParamValue::Int32(v)
        | ParamValue::Item(v)
        | ParamValue::Display(v)
        | ParamValue::Image(v)
        | ParamValue::Layer(v)
        | ParamValue::Channel(v)
        | ParamValue::Drawable(v)
        | ParamValue::Selection(v)
        | ParamValue::Vectors(v) => dst.put_i32(*v),
        ParamValue::Int16(v) => dst.put_i16(*v),
        ParamValue::Int8(v) => dst.put_u8(*v),
        ParamValue::Float(v) => dst.put_f64(*v),
        ParamValue::String(s) | ParamValue::File(s) => put_str(dst, s),
        ParamValue::Int32Array(v) | ParamValue::DrawableArray(v) => {
            dst.put_u32(v.len() as u32);
            v.iter().for_each(|x| dst.put_i32(*x));
        }
        ParamValue::Int16Array(v) => {
            dst.put_u32(v.len() as u32);
            v.iter().for_each(|x| dst.put_i16(*x));
        }
        ParamValue::Int8Array(v) => {
            dst.put_u32(v.len() as u32);
            dst.put_slice(v);
        }
        ParamValue::FloatArray(v) => {
            dst.put_u32(v.len() as u32);
            v.iter().for_each(|x| dst.put_f64(*x));
        }
        ParamValue::StringArray(v) => {
            dst.put_u32(v.len() as u32);
            v.iter().for_each(|s| put_str(dst, s));
        }
        ParamValue::Color(c) => put_color(dst, c),
        ParamValue::ColorArray(v) => {
            dst.put_u32(v.len() as u32);
            v.iter().for_each(|c| put_color(dst, c));
        }
        ParamValue::Parasite(p) => {
            put_str(dst, &p.name);
            dst.put_u32(p.flags);
            dst.put_u32(p.data.len() as u32);
            dst.put_slice(&p.data);
        }
        ParamValue::Status(s) => dst.put_i32(s.as_i32()),
        ParamValue::RunMode(m) => dst.put_i32(m.as_i32()),
    }
}

/// Cursor over one frame's payload. Every read is bounds checked; reading
/// past the end is a malformed frame, never a panic.
pub(crate) struct Payload {
    buf: Bytes,
}

impl Payload {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(PlugInError::malformed(format!(
                "short payload: need {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        Ok(self.u32()? != 0)
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Element count of an array whose elements take at least `min_size`
    /// bytes each; rejected before allocation if the payload cannot
    /// possibly hold that many.
    pub(crate) fn count(&mut self, min_size: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        let needed = count
            .checked_mul(min_size)
            .ok_or_else(|| PlugInError::malformed("array count overflows"))?;
        self.need(needed)?;
        Ok(count)
    }

    /// A nullable string as raw bytes, without the trailing NUL
    pub(crate) fn raw_string(&mut self) -> Result<Option<Bytes>> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let mut bytes = self.bytes(len)?;
        if bytes[len - 1] != 0 {
            return Err(PlugInError::malformed("string is not NUL terminated"));
        }
        bytes.truncate(len - 1);
        Ok(Some(bytes))
    }

    pub(crate) fn string(&mut self) -> Result<Option<String>> {
        match self.raw_string()? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| PlugInError::malformed("string is not valid UTF-8")),
        }
    }

    /// A string where null reads back as empty
    pub(crate) fn string_or_empty(&mut self) -> Result<String> {
        Ok(self.string()?.unwrap_or_default())
    }

    fn color(&mut self) -> Result<Rgba> {
        Ok(Rgba::new(self.f64()?, self.f64()?, self.f64()?, self.f64()?))
    }

    pub(crate) fn values(&mut self) -> Result<Vec<ParamValue>> {
        let count = self.count(4)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.value()?);
        }
        Ok(values)
    }

    fn value(&mut self) -> Result<ParamValue> {
        let arg_type = ArgType::try_from(self.i32()?)?;

        let value = match arg_type {
            ArgType::Int32 => ParamValue::Int32(self.i32()?),
            ArgType::Int16 => ParamValue::Int16(self.i16()?),
            ArgType::Int8 => ParamValue::Int8(self.u8()?),
            ArgType::Float => ParamValue::Float(self.f64()?),
            ArgType::String => ParamValue::String(self.string_or_empty()?),
            ArgType::File => ParamValue::File(self.string_or_empty()?),
            ArgType::Int32Array | ArgType::DrawableArray => {
                let n = self.count(4)?;
                let v = (0..n).map(|_| self.i32()).collect::<Result<Vec<_>>>()?;
                if arg_type == ArgType::Int32Array {
                    ParamValue::Int32Array(v)
                } else {
                    ParamValue::DrawableArray(v)
                }
            }
            ArgType::Int16Array => {
                let n = self.count(2)?;
                ParamValue::Int16Array((0..n).map(|_| self.i16()).collect::<Result<_>>()?)
            }
            ArgType::Int8Array => {
                let n = self.count(1)?;
                ParamValue::Int8Array(self.bytes(n)?.to_vec())
            }
            ArgType::FloatArray => {
                let n = self.count(8)?;
                ParamValue::FloatArray((0..n).map(|_| self.f64()).collect::<Result<_>>()?)
            }
            ArgType::StringArray => {
                let n = self.count(4)?;
                ParamValue::StringArray(
                    (0..n)
                        .map(|_| self.string_or_empty())
                        .collect::<Result<_>>()?,
                )
            }
            ArgType::Color => ParamValue::Color(self.color()?),
            ArgType::ColorArray => {
                let n = self.count(32)?;
                ParamValue::ColorArray((0..n).map(|_| self.color()).collect::<Result<_>>()?)
            }
            ArgType::Item => ParamValue::Item(self.i32()?),
            ArgType::Display => ParamValue::Display(self.i32()?),
            ArgType::Image => ParamValue::Image(self.i32()?),
            ArgType::Layer => ParamValue::Layer(self.i32()?),
            ArgType::Channel => ParamValue::Channel(self.i32()?),
            ArgType::Drawable => ParamValue::Drawable(self.i32()?),
            ArgType::Selection => ParamValue::Selection(self.i32()?),
            ArgType::Vectors => ParamValue::Vectors(self.i32()?),
            ArgType::Parasite => {
                let name = self.string_or_empty()?;
                let flags = self.u32()?;
                let size = self.u32()? as usize;
                let data = self.bytes(size)?.to_vec();
                ParamValue::Parasite(Parasite { name, flags, data })
            }
            ArgType::Status => ParamValue::Status(PdbStatus::try_from(self.i32()?)?),
            ArgType::RunMode => ParamValue::RunMode(RunMode::try_from(self.i32()?)?),
        };

        Ok(value)
    }

    /// The whole payload must have been consumed
    pub(crate) fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(PlugInError::malformed(format!(
                "{} trailing bytes after message",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_and_empty_strings_differ() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, None);
        put_string(&mut buf, Some(&b""[..]));
        assert_eq!(&buf[..], &[0, 0, 0, 0, 0, 0, 0, 1, 0]);

        let mut payload = Payload::new(buf.freeze());
        assert_eq!(payload.string().unwrap(), None);
        assert_eq!(payload.string().unwrap(), Some(String::new()));
        payload.finish().unwrap();
    }

    #[test]
    fn test_unterminated_string_is_malformed() {
        let mut payload = Payload::new(Bytes::from_static(&[0, 0, 0, 2, b'a', b'b']));
        assert!(matches!(payload.string(), Err(PlugInError::Malformed(_))));
    }

    #[test]
    fn test_oversized_count_rejected_before_allocation() {
        // claims u32::MAX int32 elements with four bytes of payload
        let mut payload = Payload::new(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]));
        assert!(payload.count(4).is_err());
    }

    #[test]
    fn test_invalid_status_value() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i32(ArgType::Status.as_i32());
        buf.put_i32(77);
        let mut payload = Payload::new(buf.freeze());
        assert!(payload.values().is_err());
    }
}
