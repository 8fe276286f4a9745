use bytes::{Buf, BufMut, BytesMut};
use plug_in_error::PlugInError;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Message, MessageKind};

/// Version written once at the start of each direction of a connection
pub const PROTOCOL_VERSION: u32 = 0x0112;

/// Largest payload accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Frames [`Message`]s on a byte stream.
///
/// One codec instance serves one direction. The decoder verifies the
/// peer's version preamble before yielding the first message; the encoder
/// emits our own preamble in front of the first message it writes.
#[derive(Debug, Default)]
pub struct WireCodec {
    version_checked: bool,
    preamble_sent: bool,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = PlugInError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, PlugInError> {
        if !self.version_checked {
            if src.len() < 4 {
                return Ok(None);
            }
            let found = src.get_u32();
            if found != PROTOCOL_VERSION {
                return Err(PlugInError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    found,
                });
            }
            self.version_checked = true;
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(PlugInError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let kind = MessageKind::try_from(kind)?;
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Message::decode(kind, payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, PlugInError> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(PlugInError::malformed(format!(
                "connection closed inside a frame ({} bytes pending)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = PlugInError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), PlugInError> {
        let start = dst.len();
        if !self.preamble_sent {
            dst.put_u32(PROTOCOL_VERSION);
        }

        let header = dst.len();
        dst.put_u32(msg.kind() as u32);
        dst.put_u32(0);

        if let Err(e) = msg.encode_payload(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - header - HEADER_LEN;
        if len > MAX_FRAME_LEN {
            dst.truncate(start);
            return Err(PlugInError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        dst[header + 4..header + HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());

        self.preamble_sent = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use bytes::Bytes;
    use plug_in_types::{ArgType, FileHandlerKind, ParamValue, PdbStatus, ProcType, Rgba};

    fn round_trip(msg: Message) -> Message {
        let mut enc = WireCodec::new();
        let mut buf = BytesMut::new();
        enc.encode(msg, &mut buf).unwrap();

        let mut dec = WireCodec::new();
        let out = dec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn test_preamble_only_once() {
        let mut enc = WireCodec::new();
        let mut buf = BytesMut::new();
        enc.encode(Message::Quit, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 1, 0x12, 0, 0, 0, 0, 0, 0, 0, 0]);

        buf.clear();
        enc.encode(Message::TileAck, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_version_mismatch() {
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0][..]);
        let err = WireCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            PlugInError::VersionMismatch {
                expected: 0x0112,
                found: 0x0100
            }
        ));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut enc = WireCodec::new();
        let mut full = BytesMut::new();
        let run = Message::ProcRun(ProcRun {
            name: "plug-in-blur".into(),
            params: vec![ParamValue::Int32(1)],
        });
        enc.encode(run.clone(), &mut full).unwrap();

        let mut dec = WireCodec::new();
        let mut buf = BytesMut::new();
        for byte in &full[..full.len() - 1] {
            buf.put_u8(*byte);
            assert!(dec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(full[full.len() - 1]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), run);
    }

    #[test]
    fn test_eof_inside_frame_is_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(MessageKind::ProcRun as u32);
        buf.put_u32(16);
        buf.put_u32(0);
        assert!(WireCodec::new().decode_eof(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(MessageKind::ProcRun as u32);
        buf.put_u32(MAX_FRAME_LEN as u32 + 1);
        assert!(matches!(
            WireCodec::new().decode(&mut buf),
            Err(PlugInError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(99);
        buf.put_u32(0);
        assert!(matches!(
            WireCodec::new().decode(&mut buf),
            Err(PlugInError::UnknownMessage(99))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(MessageKind::Quit as u32);
        buf.put_u32(2);
        buf.put_u16(0);
        assert!(matches!(
            WireCodec::new().decode(&mut buf),
            Err(PlugInError::Malformed(_))
        ));
    }

    #[test]
    fn test_config_round_trip() {
        let config = Config {
            tile_width: 128,
            shm_id: 7,
            display_name: ":0".to_string(),
            timestamp: 12345,
            ..Config::default()
        };
        assert_eq!(
            round_trip(Message::Config(Box::new(config.clone()))),
            Message::Config(Box::new(config))
        );
    }

    #[test]
    fn test_values_round_trip() {
        let params = vec![
            ParamValue::Status(PdbStatus::Success),
            ParamValue::Int32(-4),
            ParamValue::Int16(3),
            ParamValue::Int8(200),
            ParamValue::Float(0.25),
            ParamValue::String("hello".to_string()),
            ParamValue::Int32(2),
            ParamValue::FloatArray(vec![1.0, 2.0]),
            ParamValue::Color(Rgba::new(1.0, 0.5, 0.0, 1.0)),
            ParamValue::Parasite(plug_in_types::Parasite {
                name: "gimp-comment".to_string(),
                flags: 1,
                data: b"hi".to_vec(),
            }),
            ParamValue::File("/tmp/a.png".to_string()),
        ];
        let msg = Message::TempProcReturn(ProcReturn {
            name: "temp".to_string(),
            params,
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_install_round_trip() {
        let mut install = ProcInstall::new("file-foo-load", ProcType::PlugIn);
        install.handler = FileHandlerKind::Load;
        install.handler_extensions = "foo".into();
        install.params = vec![
            WireParamDef::new(ArgType::RunMode, "run-mode", "interactive"),
            WireParamDef::new(ArgType::File, "file", "file to load"),
        ];
        install.return_vals = vec![WireParamDef {
            arg_type: ArgType::Image,
            name: "image".into(),
            description: WireString::null(),
        }];
        let msg = Message::ProcInstall(Box::new(install));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_install_keeps_invalid_utf8() {
        let mut install = ProcInstall::new("x", ProcType::PlugIn);
        install.blurb = WireString::from(&[0xffu8, 0xfe][..]);
        let msg = Message::ProcInstall(Box::new(install));
        let Message::ProcInstall(out) = round_trip(msg) else {
            panic!("expected install");
        };
        assert!(out.blurb.to_str().is_err());
    }

    #[test]
    fn test_invalid_utf8_value_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(MessageKind::ProcUninstall as u32);
        buf.put_u32(7);
        buf.put_u32(3);
        buf.put_slice(&[0xff, 0xfe, 0]);
        assert!(WireCodec::new().decode(&mut buf).is_err());
    }

    #[test]
    fn test_tile_data_inline_and_shm() {
        let inline = TileData {
            drawable_id: 3,
            tile_num: 5,
            shadow: true,
            bpp: 4,
            width: 2,
            height: 2,
            use_shm: false,
            data: Some(Bytes::from(vec![9u8; 16])),
        };
        let msg = Message::TileData(Box::new(inline));
        assert_eq!(round_trip(msg.clone()), msg);

        let shm = TileData {
            drawable_id: 3,
            tile_num: 5,
            shadow: false,
            bpp: 4,
            width: 64,
            height: 64,
            use_shm: true,
            data: None,
        };
        let msg = Message::TileData(Box::new(shm));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_every_kind_round_trips() {
        let params = vec![
            ParamValue::Int32(-17),
            ParamValue::String("drawable".to_string()),
            ParamValue::Float(2.5),
            ParamValue::Color(Rgba::new(0.25, 0.5, 0.75, 1.0)),
        ];
        let config = Config {
            tile_width: 128,
            tile_height: 32,
            shm_id: 3,
            check_size: 2,
            check_type: -1,
            show_help_button: false,
            use_cpu_accel: false,
            use_opencl: true,
            export_exif: false,
            export_xmp: false,
            export_iptc: false,
            default_display_id: 42,
            app_name: "editor".to_string(),
            wm_class: "editor-plug-in".to_string(),
            display_name: ":1".to_string(),
            monitor_number: 2,
            timestamp: 987_654,
            icon_theme_dir: "/usr/share/icons/dark".to_string(),
            tile_cache_size: 1 << 30,
            swap_path: "/var/tmp".to_string(),
            swap_compression: "best".to_string(),
            num_processors: 8,
        };
        let mut install = ProcInstall::new("plug-in-sharpen", ProcType::Temporary);
        install.blurb = "Sharpen".into();
        install.menu_label = "_Sharpen".into();
        install.image_types = "RGB*".into();
        install.params = vec![WireParamDef::new(ArgType::Float, "amount", "strength")];

        let table = vec![
            Message::Quit,
            Message::Config(Box::new(config)),
            Message::TileReq(TileReq {
                drawable_id: 9,
                tile_num: 31,
                shadow: true,
            }),
            Message::TileAck,
            Message::TileData(Box::new(TileData {
                drawable_id: 9,
                tile_num: 31,
                shadow: true,
                bpp: 3,
                width: 2,
                height: 1,
                use_shm: false,
                data: Some(Bytes::from_static(&[1, 2, 3, 4, 5, 6])),
            })),
            Message::ProcRun(ProcRun {
                name: "plug-in-blur".to_string(),
                params: params.clone(),
            }),
            Message::ProcReturn(ProcReturn {
                name: "plug-in-blur".to_string(),
                params: params.clone(),
            }),
            Message::TempProcRun(ProcRun {
                name: "temp-callback".to_string(),
                params: params.clone(),
            }),
            Message::TempProcReturn(ProcReturn {
                name: "temp-callback".to_string(),
                params,
            }),
            Message::ProcInstall(Box::new(install)),
            Message::ProcUninstall(ProcUninstall {
                name: "plug-in-sharpen".to_string(),
            }),
            Message::ExtensionAck,
            Message::HasInit,
        ];

        let mut covered = std::collections::HashSet::new();
        for msg in table {
            assert!(covered.insert(msg.kind()), "{} listed twice", msg.kind());
            assert_eq!(round_trip(msg.clone()), msg, "{}", msg.kind());
        }
        for value in 0..=12 {
            let kind = MessageKind::try_from(value).unwrap();
            assert!(covered.contains(&kind), "{} not covered", kind);
        }
        assert!(MessageKind::try_from(13).is_err());
    }

    #[test]
    fn test_tile_data_length_must_match_geometry() {
        let tile = TileData {
            drawable_id: 3,
            tile_num: 0,
            shadow: false,
            bpp: 4,
            width: 2,
            height: 2,
            use_shm: false,
            data: Some(Bytes::from(vec![0u8; 15])),
        };
        let mut buf = BytesMut::new();
        let err = WireCodec::new()
            .encode(Message::TileData(Box::new(tile)), &mut buf)
            .unwrap_err();
        assert!(matches!(err, PlugInError::Encode(_)));
        assert!(buf.is_empty());
    }
}
