//! Wire protocol spoken between the host and its plug-in processes.
//!
//! Every message is a frame of `kind: u32`, `len: u32` and `len` payload
//! bytes, all big-endian. Each direction of a connection starts with a
//! `u32` protocol version preamble that the decoder checks before it
//! yields the first message.

mod client;
mod codec;
mod messages;
mod transport;
mod wire;

pub use client::{PLUG_IN_FLAG, PlugInArgs};
#[cfg(unix)]
pub use client::{PipeTransport, connect};
pub use codec::{MAX_FRAME_LEN, PROTOCOL_VERSION, WireCodec};
pub use messages::{
    Config, Message, MessageKind, ProcInstall, ProcReturn, ProcRun, ProcUninstall, TileData,
    TileReq, WireParamDef, WireString,
};
pub use transport::{MessageReader, MessageWriter, Transport, WRITE_BUFFER_SIZE};
