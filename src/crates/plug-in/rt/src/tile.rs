//! Tile storage and the tile request sub-protocol.

use std::collections::HashMap;

use parking_lot::RwLock;
use plug_in_error::PlugInError;
use plug_in_protocol::{Message, MessageKind, TileData, TileReq};
use plug_in_shm::ShmError;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

use crate::config::MAX_BPP;
use crate::manager::PlugInReader;
use crate::plug_in::PlugIn;

#[derive(Debug, Error)]
pub enum TileError {
    #[error("plug-in requested invalid drawable {0}")]
    InvalidDrawable(i32),

    #[error("plug-in requested invalid tile {tile_num} of drawable {drawable_id}")]
    InvalidTile { drawable_id: i32, tile_num: u32 },

    #[error("expected {expected} and received {found}")]
    UnexpectedMessage {
        expected: MessageKind,
        found: MessageKind,
    },

    #[error("tile transfer through {sent} while the host uses {host}")]
    TransferMismatch {
        sent: &'static str,
        host: &'static str,
    },

    #[error("tile is {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("plug-in declared a {declared} tile where the drawable has {expected}")]
    GeometryMismatch {
        declared: TileGeometry,
        expected: TileGeometry,
    },

    #[error(transparent)]
    Bulk(#[from] ShmError),

    #[error(transparent)]
    Protocol(#[from] PlugInError),
}

/// Dimensions of one tile, already clipped at the drawable edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl TileGeometry {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bpp as usize
    }
}

impl std::fmt::Display for TileGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.bpp)
    }
}

/// Pixel storage the tile protocol reads from and writes into
pub trait TileStore: Send + Sync {
    fn geometry(&self, drawable_id: i32, tile_num: u32, shadow: bool) -> Option<TileGeometry>;

    fn read_tile(&self, drawable_id: i32, tile_num: u32, shadow: bool) -> Option<(TileGeometry, Vec<u8>)>;

    fn write_tile(&self, drawable_id: i32, tile_num: u32, shadow: bool, data: &[u8]) -> Result<(), TileError>;
}

struct Drawable {
    width: u32,
    height: u32,
    bpp: u32,
    data: Vec<u8>,
    shadow: Vec<u8>,
}

/// In-memory drawables split into a fixed tile grid.
///
/// Tile `n` covers grid column `n % cols` and row `n / cols`; tiles on
/// the right and bottom edges are clipped to the drawable.
pub struct MemoryTileStore {
    tile_width: u32,
    tile_height: u32,
    drawables: RwLock<HashMap<i32, Drawable>>,
}

impl MemoryTileStore {
    pub fn new(tile_width: u32, tile_height: u32) -> Self {
        Self {
            tile_width,
            tile_height,
            drawables: RwLock::new(HashMap::new()),
        }
    }

    /// Add a zero-filled drawable. Returns false for an empty size or
    /// an unsupported pixel size.
    pub fn add_drawable(&self, id: i32, width: u32, height: u32, bpp: u32) -> bool {
        if width == 0 || height == 0 || bpp == 0 || bpp as usize > MAX_BPP {
            return false;
        }
        let len = width as usize * height as usize * bpp as usize;
        self.drawables.write().insert(
            id,
            Drawable {
                width,
                height,
                bpp,
                data: vec![0; len],
                shadow: vec![0; len],
            },
        );
        true
    }

    pub fn pixels(&self, id: i32, shadow: bool) -> Option<Vec<u8>> {
        let drawables = self.drawables.read();
        let d = drawables.get(&id)?;
        Some(if shadow { d.shadow.clone() } else { d.data.clone() })
    }

    pub fn set_pixels(&self, id: i32, shadow: bool, pixels: &[u8]) -> bool {
        let mut drawables = self.drawables.write();
        let Some(d) = drawables.get_mut(&id) else {
            return false;
        };
        let buf = if shadow { &mut d.shadow } else { &mut d.data };
        if buf.len() != pixels.len() {
            return false;
        }
        buf.copy_from_slice(pixels);
        true
    }

    pub fn n_tiles(&self, id: i32) -> Option<u32> {
        let drawables = self.drawables.read();
        let d = drawables.get(&id)?;
        let (cols, rows) = self.grid(d);
        Some(cols * rows)
    }

    fn grid(&self, d: &Drawable) -> (u32, u32) {
        (
            d.width.div_ceil(self.tile_width),
            d.height.div_ceil(self.tile_height),
        )
    }

    /// Origin and clipped geometry of tile `n`
    fn locate(&self, d: &Drawable, n: u32) -> Option<(u32, u32, TileGeometry)> {
        let (cols, rows) = self.grid(d);
        if n >= cols * rows {
            return None;
        }
        let x = (n % cols) * self.tile_width;
        let y = (n / cols) * self.tile_height;
        let geom = TileGeometry {
            width: self.tile_width.min(d.width - x),
            height: self.tile_height.min(d.height - y),
            bpp: d.bpp,
        };
        Some((x, y, geom))
    }
}

impl TileStore for MemoryTileStore {
    fn geometry(&self, drawable_id: i32, tile_num: u32, _shadow: bool) -> Option<TileGeometry> {
        let drawables = self.drawables.read();
        let d = drawables.get(&drawable_id)?;
        self.locate(d, tile_num).map(|(_, _, g)| g)
    }

    fn read_tile(&self, drawable_id: i32, tile_num: u32, shadow: bool) -> Option<(TileGeometry, Vec<u8>)> {
        let drawables = self.drawables.read();
        let d = drawables.get(&drawable_id)?;
        let (x, y, geom) = self.locate(d, tile_num)?;

        let src = if shadow { &d.shadow } else { &d.data };
        let stride = d.width as usize * d.bpp as usize;
        let row_len = geom.width as usize * d.bpp as usize;

        let mut out = Vec::with_capacity(geom.byte_len());
        for row in 0..geom.height as usize {
            let start = (y as usize + row) * stride + x as usize * d.bpp as usize;
            out.extend_from_slice(&src[start..start + row_len]);
        }
        Some((geom, out))
    }

    fn write_tile(&self, drawable_id: i32, tile_num: u32, shadow: bool, data: &[u8]) -> Result<(), TileError> {
        let mut drawables = self.drawables.write();
        let d = drawables
            .get_mut(&drawable_id)
            .ok_or(TileError::InvalidDrawable(drawable_id))?;
        let (x, y, geom) = self.locate(d, tile_num).ok_or(TileError::InvalidTile {
            drawable_id,
            tile_num,
        })?;

        if data.len() != geom.byte_len() {
            return Err(TileError::SizeMismatch {
                expected: geom.byte_len(),
                found: data.len(),
            });
        }

        let bpp = d.bpp as usize;
        let stride = d.width as usize * bpp;
        let row_len = geom.width as usize * bpp;
        let dst = if shadow { &mut d.shadow } else { &mut d.data };

        for (row, chunk) in data.chunks_exact(row_len).enumerate() {
            let start = (y as usize + row) * stride + x as usize * bpp;
            dst[start..start + row_len].copy_from_slice(chunk);
        }
        Ok(())
    }
}

fn transport_name(use_shm: bool) -> &'static str {
    if use_shm { "shared memory" } else { "the pipe" }
}

/// Next message from the plug-in, or `Closed` once the connection is
/// closed from the host side.
async fn reply(plug_in: &PlugIn, reader: &mut PlugInReader) -> Result<Message, PlugInError> {
    let closed = plug_in.closed();
    tokio::select! {
        _ = closed.cancelled() => Err(PlugInError::Closed),
        message = reader.recv() => message,
    }
}

/// Serve one `tile-req` from a plug-in.
///
/// A request for drawable `-1` announces a put: the host answers with an
/// empty tile description, reads the plug-in's tile and acknowledges it.
/// Any other request is a get: the host sends the tile and waits for the
/// acknowledgement. Both run to completion before the next message on the
/// connection is looked at.
///
/// The shared segment is one buffer for every connection, so a transfer
/// through it holds `lease` from staging the pixels until the plug-in's
/// acknowledgement (get) or until the host has copied them out (put).
pub(crate) async fn serve(
    store: &dyn TileStore,
    lease: &Mutex<()>,
    plug_in: &PlugIn,
    reader: &mut PlugInReader,
    req: TileReq,
) -> Result<(), TileError> {
    let bulk = plug_in.bulk();
    let _lease = if bulk.uses_shm() {
        Some(lease.lock().await)
    } else {
        None
    };

    if req.is_put() {
        plug_in
            .send(Message::TileData(Box::new(TileData {
                drawable_id: TileReq::PUT,
                tile_num: 0,
                shadow: false,
                bpp: 0,
                width: 0,
                height: 0,
                use_shm: bulk.uses_shm(),
                data: None,
            })))
            .await?;

        let info = match reply(plug_in, reader).await? {
            Message::TileData(info) => *info,
            other => {
                return Err(TileError::UnexpectedMessage {
                    expected: MessageKind::TileData,
                    found: other.kind(),
                });
            }
        };

        if info.use_shm != bulk.uses_shm() {
            return Err(TileError::TransferMismatch {
                sent: transport_name(info.use_shm),
                host: transport_name(bulk.uses_shm()),
            });
        }

        let geom = store
            .geometry(info.drawable_id, info.tile_num, info.shadow)
            .ok_or(TileError::InvalidTile {
                drawable_id: info.drawable_id,
                tile_num: info.tile_num,
            })?;

        let declared = TileGeometry {
            width: info.width,
            height: info.height,
            bpp: info.bpp,
        };
        if declared != geom {
            return Err(TileError::GeometryMismatch {
                declared,
                expected: geom,
            });
        }

        let data = bulk.receive(info.data, geom.byte_len())?;
        store.write_tile(info.drawable_id, info.tile_num, info.shadow, &data)?;

        trace!(drawable = info.drawable_id, tile = info.tile_num, "stored tile");
        plug_in.send(Message::TileAck).await?;
    } else {
        let (geom, pixels) = store
            .read_tile(req.drawable_id, req.tile_num, req.shadow)
            .ok_or(TileError::InvalidTile {
                drawable_id: req.drawable_id,
                tile_num: req.tile_num,
            })?;

        let data = bulk.send(&pixels)?;
        plug_in
            .send(Message::TileData(Box::new(TileData {
                drawable_id: req.drawable_id,
                tile_num: req.tile_num,
                shadow: req.shadow,
                bpp: geom.bpp,
                width: geom.width,
                height: geom.height,
                use_shm: bulk.uses_shm(),
                data,
            })))
            .await?;

        match reply(plug_in, reader).await? {
            Message::TileAck => {}
            other => {
                return Err(TileError::UnexpectedMessage {
                    expected: MessageKind::TileAck,
                    found: other.kind(),
                });
            }
        }
        trace!(drawable = req.drawable_id, tile = req.tile_num, "sent tile");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryTileStore {
        let store = MemoryTileStore::new(4, 4);
        // 6x5 pixels, 1 byte each: a 2x2 grid with clipped edge tiles
        assert!(store.add_drawable(1, 6, 5, 1));
        let pixels: Vec<u8> = (0..30).collect();
        assert!(store.set_pixels(1, false, &pixels));
        store
    }

    #[test]
    fn test_grid_geometry() {
        let store = store();
        assert_eq!(store.n_tiles(1), Some(4));
        assert_eq!(
            store.geometry(1, 0, false),
            Some(TileGeometry { width: 4, height: 4, bpp: 1 })
        );
        assert_eq!(
            store.geometry(1, 1, false),
            Some(TileGeometry { width: 2, height: 4, bpp: 1 })
        );
        assert_eq!(
            store.geometry(1, 3, false),
            Some(TileGeometry { width: 2, height: 1, bpp: 1 })
        );
        assert_eq!(store.geometry(1, 4, false), None);
        assert_eq!(store.geometry(2, 0, false), None);
    }

    #[test]
    fn test_read_clipped_tile() {
        let store = store();
        let (_, tile) = store.read_tile(1, 1, false).unwrap();
        assert_eq!(tile, vec![4, 5, 10, 11, 16, 17, 22, 23]);
        let (_, tile) = store.read_tile(1, 2, false).unwrap();
        assert_eq!(tile, vec![24, 25, 26, 27]);
    }

    #[test]
    fn test_write_tile_into_shadow() {
        let store = store();
        store.write_tile(1, 3, true, &[9, 9]).unwrap();
        let shadow = store.pixels(1, true).unwrap();
        assert_eq!(&shadow[28..30], &[9, 9]);
        assert_eq!(shadow.iter().filter(|b| **b == 9).count(), 2);
        assert_eq!(store.pixels(1, false).unwrap()[29], 29);

        assert!(matches!(
            store.write_tile(1, 3, true, &[1, 2, 3]),
            Err(TileError::SizeMismatch { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_geometry_mismatch_message() {
        let err = TileError::GeometryMismatch {
            declared: TileGeometry { width: 4, height: 2, bpp: 1 },
            expected: TileGeometry { width: 4, height: 4, bpp: 1 },
        };
        assert_eq!(
            err.to_string(),
            "plug-in declared a 4x2x1 tile where the drawable has 4x4x1"
        );
    }

    #[test]
    fn test_rejects_oversized_pixels() {
        let store = MemoryTileStore::new(64, 64);
        assert!(!store.add_drawable(1, 10, 10, 17));
        assert!(!store.add_drawable(1, 0, 10, 4));
    }
}
