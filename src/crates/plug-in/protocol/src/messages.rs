//! Typed messages and their payload layouts.

use std::fmt;
use std::str::Utf8Error;

use bytes::{BufMut, Bytes, BytesMut};
use plug_in_error::{PlugInError, Result};
use plug_in_types::{ArgType, FileHandlerKind, ParamValue, ProcType};

use crate::wire::{self, Payload};

/// A nullable string kept as raw bytes.
///
/// Installation strings are validated by the receiver rather than the
/// decoder, so that a plug-in sending bad UTF-8 is reported against the
/// procedure it tried to install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WireString(Option<Bytes>);

impl WireString {
    pub fn null() -> Self {
        Self(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    pub fn to_str(&self) -> std::result::Result<Option<&str>, Utf8Error> {
        self.0.as_deref().map(std::str::from_utf8).transpose()
    }

    /// Lossy rendering for log lines
    pub fn display(&self) -> String {
        match &self.0 {
            None => String::from("(null)"),
            Some(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

impl From<&str> for WireString {
    fn from(s: &str) -> Self {
        Self(Some(Bytes::copy_from_slice(s.as_bytes())))
    }
}

impl From<String> for WireString {
    fn from(s: String) -> Self {
        Self(Some(Bytes::from(s.into_bytes())))
    }
}

impl From<Option<&str>> for WireString {
    fn from(s: Option<&str>) -> Self {
        s.map(WireString::from).unwrap_or_default()
    }
}

impl From<&[u8]> for WireString {
    fn from(b: &[u8]) -> Self {
        Self(Some(Bytes::copy_from_slice(b)))
    }
}

/// Environment snapshot sent to a plug-in before each procedure run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tile_width: u32,
    pub tile_height: u32,
    /// Shared memory segment id, `-1` when tiles travel inline
    pub shm_id: i32,
    pub check_size: i8,
    pub check_type: i8,
    pub show_help_button: bool,
    pub use_cpu_accel: bool,
    pub use_opencl: bool,
    pub export_exif: bool,
    pub export_xmp: bool,
    pub export_iptc: bool,
    pub default_display_id: i32,
    pub app_name: String,
    pub wm_class: String,
    pub display_name: String,
    pub monitor_number: i32,
    pub timestamp: u32,
    pub icon_theme_dir: String,
    pub tile_cache_size: u64,
    pub swap_path: String,
    pub swap_compression: String,
    pub num_processors: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tile_width: 64,
            tile_height: 64,
            shm_id: -1,
            check_size: 1,
            check_type: 1,
            show_help_button: true,
            use_cpu_accel: true,
            use_opencl: false,
            export_exif: true,
            export_xmp: true,
            export_iptc: true,
            default_display_id: -1,
            app_name: String::from("plug-in-host"),
            wm_class: String::from("plug-in-host"),
            display_name: String::new(),
            monitor_number: 0,
            timestamp: 0,
            icon_theme_dir: String::new(),
            tile_cache_size: 512 << 20,
            swap_path: String::new(),
            swap_compression: String::from("fast"),
            num_processors: 1,
        }
    }
}

/// Tile request. The plug-in sends one with `drawable_id == -1` to
/// announce that it is about to push a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileReq {
    pub drawable_id: i32,
    pub tile_num: u32,
    pub shadow: bool,
}

impl TileReq {
    pub const PUT: i32 = -1;

    pub fn put() -> Self {
        Self {
            drawable_id: Self::PUT,
            tile_num: 0,
            shadow: false,
        }
    }

    pub fn is_put(&self) -> bool {
        self.drawable_id == Self::PUT
    }
}

/// Tile contents. `data` is present only when the tile travels inline;
/// with `use_shm` set the pixels are in the shared segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileData {
    pub drawable_id: i32,
    pub tile_num: u32,
    pub shadow: bool,
    pub bpp: u32,
    pub width: u32,
    pub height: u32,
    pub use_shm: bool,
    pub data: Option<Bytes>,
}

impl TileData {
    /// Pixel byte count implied by the geometry
    pub fn byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.bpp as usize)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcRun {
    pub name: String,
    pub params: Vec<ParamValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcReturn {
    pub name: String,
    pub params: Vec<ParamValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireParamDef {
    pub arg_type: ArgType,
    pub name: WireString,
    pub description: WireString,
}

impl WireParamDef {
    pub fn new(arg_type: ArgType, name: &str, description: &str) -> Self {
        Self {
            arg_type,
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Procedure registration sent by a plug-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInstall {
    pub name: WireString,
    pub blurb: WireString,
    pub help: WireString,
    pub authors: WireString,
    pub copyright: WireString,
    pub date: WireString,
    pub menu_label: WireString,
    pub image_types: WireString,
    pub proc_type: ProcType,
    pub handler: FileHandlerKind,
    pub handler_extensions: WireString,
    pub params: Vec<WireParamDef>,
    pub return_vals: Vec<WireParamDef>,
}

impl ProcInstall {
    /// A plain procedure with no documentation strings
    pub fn new(name: &str, proc_type: ProcType) -> Self {
        Self {
            name: name.into(),
            blurb: WireString::null(),
            help: WireString::null(),
            authors: WireString::null(),
            copyright: WireString::null(),
            date: WireString::null(),
            menu_label: WireString::null(),
            image_types: WireString::null(),
            proc_type,
            handler: FileHandlerKind::None,
            handler_extensions: WireString::null(),
            params: Vec::new(),
            return_vals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcUninstall {
    pub name: String,
}

/// Numeric message kinds as they appear in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Quit = 0,
    Config = 1,
    TileReq = 2,
    TileAck = 3,
    TileData = 4,
    ProcRun = 5,
    ProcReturn = 6,
    TempProcRun = 7,
    TempProcReturn = 8,
    ProcInstall = 9,
    ProcUninstall = 10,
    ExtensionAck = 11,
    HasInit = 12,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Quit => "quit",
            MessageKind::Config => "config",
            MessageKind::TileReq => "tile-req",
            MessageKind::TileAck => "tile-ack",
            MessageKind::TileData => "tile-data",
            MessageKind::ProcRun => "proc-run",
            MessageKind::ProcReturn => "proc-return",
            MessageKind::TempProcRun => "temp-proc-run",
            MessageKind::TempProcReturn => "temp-proc-return",
            MessageKind::ProcInstall => "proc-install",
            MessageKind::ProcUninstall => "proc-uninstall",
            MessageKind::ExtensionAck => "extension-ack",
            MessageKind::HasInit => "has-init",
        }
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = PlugInError;

    fn try_from(value: u32) -> Result<Self> {
        let kind = match value {
            0 => MessageKind::Quit,
            1 => MessageKind::Config,
            2 => MessageKind::TileReq,
            3 => MessageKind::TileAck,
            4 => MessageKind::TileData,
            5 => MessageKind::ProcRun,
            6 => MessageKind::ProcReturn,
            7 => MessageKind::TempProcRun,
            8 => MessageKind::TempProcReturn,
            9 => MessageKind::ProcInstall,
            10 => MessageKind::ProcUninstall,
            11 => MessageKind::ExtensionAck,
            12 => MessageKind::HasInit,
            other => return Err(PlugInError::UnknownMessage(other)),
        };
        Ok(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every message the protocol carries, in either direction
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Quit,
    Config(Box<Config>),
    TileReq(TileReq),
    TileAck,
    TileData(Box<TileData>),
    ProcRun(ProcRun),
    ProcReturn(ProcReturn),
    TempProcRun(ProcRun),
    TempProcReturn(ProcReturn),
    ProcInstall(Box<ProcInstall>),
    ProcUninstall(ProcUninstall),
    ExtensionAck,
    HasInit,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Quit => MessageKind::Quit,
            Message::Config(_) => MessageKind::Config,
            Message::TileReq(_) => MessageKind::TileReq,
            Message::TileAck => MessageKind::TileAck,
            Message::TileData(_) => MessageKind::TileData,
            Message::ProcRun(_) => MessageKind::ProcRun,
            Message::ProcReturn(_) => MessageKind::ProcReturn,
            Message::TempProcRun(_) => MessageKind::TempProcRun,
            Message::TempProcReturn(_) => MessageKind::TempProcReturn,
            Message::ProcInstall(_) => MessageKind::ProcInstall,
            Message::ProcUninstall(_) => MessageKind::ProcUninstall,
            Message::ExtensionAck => MessageKind::ExtensionAck,
            Message::HasInit => MessageKind::HasInit,
        }
    }

    /// Append this message's payload (without frame header) to `dst`
    pub(crate) fn encode_payload(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Message::Quit | Message::TileAck | Message::ExtensionAck | Message::HasInit => {}
            Message::Config(c) => encode_config(c, dst),
            Message::TileReq(req) => {
                dst.put_i32(req.drawable_id);
                dst.put_u32(req.tile_num);
                wire::put_bool(dst, req.shadow);
            }
            Message::TileData(tile) => encode_tile_data(tile, dst)?,
            Message::ProcRun(run) | Message::TempProcRun(run) => {
                wire::put_str(dst, &run.name);
                wire::put_values(dst, &run.params);
            }
            Message::ProcReturn(ret) | Message::TempProcReturn(ret) => {
                wire::put_str(dst, &ret.name);
                wire::put_values(dst, &ret.params);
            }
            Message::ProcInstall(install) => encode_install(install, dst),
            Message::ProcUninstall(u) => wire::put_str(dst, &u.name),
        }
        Ok(())
    }

    /// Decode a complete payload of the given kind
    pub(crate) fn decode(kind: MessageKind, payload: Bytes) -> Result<Message> {
        let mut p = Payload::new(payload);

        let msg = match kind {
            MessageKind::Quit => Message::Quit,
            MessageKind::TileAck => Message::TileAck,
            MessageKind::ExtensionAck => Message::ExtensionAck,
            MessageKind::HasInit => Message::HasInit,
            MessageKind::Config => Message::Config(Box::new(decode_config(&mut p)?)),
            MessageKind::TileReq => Message::TileReq(TileReq {
                drawable_id: p.i32()?,
                tile_num: p.u32()?,
                shadow: p.bool()?,
            }),
            MessageKind::TileData => Message::TileData(Box::new(decode_tile_data(&mut p)?)),
            MessageKind::ProcRun => Message::ProcRun(decode_run(&mut p)?),
            MessageKind::TempProcRun => Message::TempProcRun(decode_run(&mut p)?),
            MessageKind::ProcReturn => Message::ProcReturn(decode_return(&mut p)?),
            MessageKind::TempProcReturn => Message::TempProcReturn(decode_return(&mut p)?),
            MessageKind::ProcInstall => Message::ProcInstall(Box::new(decode_install(&mut p)?)),
            MessageKind::ProcUninstall => Message::ProcUninstall(ProcUninstall {
                name: p.string_or_empty()?,
            }),
        };

        p.finish()?;
        Ok(msg)
    }
}

fn encode_config(c: &Config, dst: &mut BytesMut) {
    dst.put_u32(c.tile_width);
    dst.put_u32(c.tile_height);
    dst.put_i32(c.shm_id);
    dst.put_i8(c.check_size);
    dst.put_i8(c.check_type);
    wire::put_bool(dst, c.show_help_button);
    wire::put_bool(dst, c.use_cpu_accel);
    wire::put_bool(dst, c.use_opencl);
    wire::put_bool(dst, c.export_exif);
    wire::put_bool(dst, c.export_xmp);
    wire::put_bool(dst, c.export_iptc);
    dst.put_i32(c.default_display_id);
    wire::put_str(dst, &c.app_name);
    wire::put_str(dst, &c.wm_class);
    wire::put_str(dst, &c.display_name);
    dst.put_i32(c.monitor_number);
    dst.put_u32(c.timestamp);
    wire::put_str(dst, &c.icon_theme_dir);
    dst.put_u64(c.tile_cache_size);
    wire::put_str(dst, &c.swap_path);
    wire::put_str(dst, &c.swap_compression);
    dst.put_i32(c.num_processors);
}

fn decode_config(p: &mut Payload) -> Result<Config> {
    Ok(Config {
        tile_width: p.u32()?,
        tile_height: p.u32()?,
        shm_id: p.i32()?,
        check_size: p.u8()? as i8,
        check_type: p.u8()? as i8,
        show_help_button: p.bool()?,
        use_cpu_accel: p.bool()?,
        use_opencl: p.bool()?,
        export_exif: p.bool()?,
        export_xmp: p.bool()?,
        export_iptc: p.bool()?,
        default_display_id: p.i32()?,
        app_name: p.string_or_empty()?,
        wm_class: p.string_or_empty()?,
        display_name: p.string_or_empty()?,
        monitor_number: p.i32()?,
        timestamp: p.u32()?,
        icon_theme_dir: p.string_or_empty()?,
        tile_cache_size: p.u64()?,
        swap_path: p.string_or_empty()?,
        swap_compression: p.string_or_empty()?,
        num_processors: p.i32()?,
    })
}

fn encode_tile_data(tile: &TileData, dst: &mut BytesMut) -> Result<()> {
    dst.put_i32(tile.drawable_id);
    dst.put_u32(tile.tile_num);
    wire::put_bool(dst, tile.shadow);
    dst.put_u32(tile.bpp);
    dst.put_u32(tile.width);
    dst.put_u32(tile.height);
    wire::put_bool(dst, tile.use_shm);

    if tile.use_shm {
        return Ok(());
    }

    let expected = tile
        .byte_len()
        .ok_or_else(|| PlugInError::Encode("tile geometry overflows".to_string()))?;
    let data = tile.data.as_deref().unwrap_or_default();
    if data.len() != expected {
        return Err(PlugInError::Encode(format!(
            "tile carries {} bytes, geometry needs {}",
            data.len(),
            expected
        )));
    }
    dst.put_slice(data);
    Ok(())
}

fn decode_tile_data(p: &mut Payload) -> Result<TileData> {
    let mut tile = TileData {
        drawable_id: p.i32()?,
        tile_num: p.u32()?,
        shadow: p.bool()?,
        bpp: p.u32()?,
        width: p.u32()?,
        height: p.u32()?,
        use_shm: p.bool()?,
        data: None,
    };

    if !tile.use_shm {
        let len = tile
            .byte_len()
            .ok_or_else(|| PlugInError::malformed("tile geometry overflows"))?;
        if len > 0 {
            tile.data = Some(p.bytes(len)?);
        }
    }

    Ok(tile)
}

fn decode_run(p: &mut Payload) -> Result<ProcRun> {
    Ok(ProcRun {
        name: p.string_or_empty()?,
        params: p.values()?,
    })
}

fn decode_return(p: &mut Payload) -> Result<ProcReturn> {
    Ok(ProcReturn {
        name: p.string_or_empty()?,
        params: p.values()?,
    })
}

fn put_wire_string(dst: &mut BytesMut, s: &WireString) {
    wire::put_string(dst, s.as_bytes());
}

fn get_wire_string(p: &mut Payload) -> Result<WireString> {
    Ok(WireString(p.raw_string()?))
}

fn encode_param_defs(dst: &mut BytesMut, defs: &[WireParamDef]) {
    dst.put_u32(defs.len() as u32);
    for def in defs {
        dst.put_i32(def.arg_type.as_i32());
        put_wire_string(dst, &def.name);
        put_wire_string(dst, &def.description);
    }
}

fn decode_param_defs(p: &mut Payload) -> Result<Vec<WireParamDef>> {
    // type tag plus two string lengths
    let count = p.count(12)?;
    let mut defs = Vec::with_capacity(count);
    for _ in 0..count {
        defs.push(WireParamDef {
            arg_type: ArgType::try_from(p.i32()?)?,
            name: get_wire_string(p)?,
            description: get_wire_string(p)?,
        });
    }
    Ok(defs)
}

fn encode_install(install: &ProcInstall, dst: &mut BytesMut) {
    put_wire_string(dst, &install.name);
    put_wire_string(dst, &install.blurb);
    put_wire_string(dst, &install.help);
    put_wire_string(dst, &install.authors);
    put_wire_string(dst, &install.copyright);
    put_wire_string(dst, &install.date);
    put_wire_string(dst, &install.menu_label);
    put_wire_string(dst, &install.image_types);
    dst.put_i32(install.proc_type.as_i32());
    dst.put_i32(install.handler.as_i32());
    put_wire_string(dst, &install.handler_extensions);
    encode_param_defs(dst, &install.params);
    encode_param_defs(dst, &install.return_vals);
}

fn decode_install(p: &mut Payload) -> Result<ProcInstall> {
    Ok(ProcInstall {
        name: get_wire_string(p)?,
        blurb: get_wire_string(p)?,
        help: get_wire_string(p)?,
        authors: get_wire_string(p)?,
        copyright: get_wire_string(p)?,
        date: get_wire_string(p)?,
        menu_label: get_wire_string(p)?,
        image_types: get_wire_string(p)?,
        proc_type: ProcType::try_from(p.i32()?)?,
        handler: FileHandlerKind::try_from(p.i32()?)?,
        handler_extensions: get_wire_string(p)?,
        params: decode_param_defs(p)?,
        return_vals: decode_param_defs(p)?,
    })
}
