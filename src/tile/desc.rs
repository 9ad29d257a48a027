//! Tile descriptor value types.
//!
//! `TileDesc` identifies a single tile: document part, render size in
//! pixels, origin and extent in twips, plus versioning and wire-id fields
//! used for flow control and de-duplication. `TileCombined` batches a row
//! of descriptors into one `tilecombine` request/response header with
//! comma-separated per-tile columns.
//!
//! Cache lookups care only about the geometric subset of the fields; see
//! [`TileDesc::cache_key`].

use std::fmt::Write as _;

use crate::protocol::{self, ProtocolError};

/// Monotonic per-tile identifier used for de-duplication on the wire.
pub type TileWireId = u32;

/// Grid-column distance beyond which tiles are not combined into one
/// request. A 4K screen is sixteen 256-pixel tiles wide.
const COMBINE_MAX_GRID_DISTANCE: i32 = 16;

/// Identity of a tile as the cache sees it.
///
/// Version, request id, and wire ids are deliberately excluded: a newer
/// render of the same rectangle replaces the cached bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    normalized_view_id: i32,
    part: i32,
    width: i32,
    height: i32,
    tile_pos_x: i32,
    tile_pos_y: i32,
    tile_width: i32,
    tile_height: i32,
}

impl TileCacheKey {
    pub fn normalized_view_id(&self) -> i32 {
        self.normalized_view_id
    }

    pub fn part(&self) -> i32 {
        self.part
    }

    pub fn tile_pos_x(&self) -> i32 {
        self.tile_pos_x
    }

    pub fn tile_pos_y(&self) -> i32 {
        self.tile_pos_y
    }

    pub fn tile_width(&self) -> i32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> i32 {
        self.tile_height
    }
}

/// A tile's coordinates and dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDesc {
    /// Canonical view id shared by sessions with identical view state.
    pub normalized_view_id: i32,
    /// Document part (sheet/slide); 0 for text documents.
    pub part: i32,
    /// Render width in pixels.
    pub width: i32,
    /// Render height in pixels.
    pub height: i32,
    /// Tile origin X in twips.
    pub tile_pos_x: i32,
    /// Tile origin Y in twips.
    pub tile_pos_y: i32,
    /// Tile width in twips.
    pub tile_width: i32,
    /// Tile height in twips.
    pub tile_height: i32,
    /// Render version, monotonic per broker. -1 when unset.
    pub ver: i32,
    /// Payload size in bytes; used on responses.
    pub img_size: i32,
    /// Client correlation id (thumbnails); -1 when unset.
    pub id: i32,
    /// Render for every view, not just the requesting session.
    pub broadcast: bool,
    /// Wire id of the client's previous copy of this tile.
    pub old_wire_id: TileWireId,
    /// Wire id assigned to this render.
    pub wire_id: TileWireId,
}

impl TileDesc {
    /// Construct a descriptor, validating ranges.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        normalized_view_id: i32,
        part: i32,
        width: i32,
        height: i32,
        tile_pos_x: i32,
        tile_pos_y: i32,
        tile_width: i32,
        tile_height: i32,
        ver: i32,
        img_size: i32,
        id: i32,
        broadcast: bool,
    ) -> Result<Self, ProtocolError> {
        if normalized_view_id < 0
            || part < 0
            || width <= 0
            || height <= 0
            || tile_pos_x < 0
            || tile_pos_y < 0
            || tile_width <= 0
            || tile_height <= 0
            || img_size < 0
        {
            return Err(ProtocolError::bad("invalid tile descriptor"));
        }
        Ok(Self {
            normalized_view_id,
            part,
            width,
            height,
            tile_pos_x,
            tile_pos_y,
            tile_width,
            tile_height,
            ver,
            img_size,
            id,
            broadcast,
            old_wire_id: 0,
            wire_id: 0,
        })
    }

    /// The subset of fields the cache keys on.
    pub fn cache_key(&self) -> TileCacheKey {
        TileCacheKey {
            normalized_view_id: self.normalized_view_id,
            part: self.part,
            width: self.width,
            height: self.height,
            tile_pos_x: self.tile_pos_x,
            tile_pos_y: self.tile_pos_y,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
        }
    }

    /// Key for the per-session wire-id map: `part:x:y:w:h:nviewid`.
    pub fn generate_id(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.part,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
            self.normalized_view_id
        )
    }

    fn rectangles_intersect(
        x1: i32,
        y1: i32,
        w1: i32,
        h1: i32,
        x2: i32,
        y2: i32,
        w2: i32,
        h2: i32,
    ) -> bool {
        x1.saturating_add(w1) >= x2
            && x1 <= x2.saturating_add(w2)
            && y1.saturating_add(h1) >= y2
            && y1 <= y2.saturating_add(h2)
    }

    /// True when this tile's rectangle touches `(x, y, w, h)` in twips.
    pub fn intersects_rect(&self, x: i32, y: i32, w: i32, h: i32) -> bool {
        Self::rectangles_intersect(
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
            x,
            y,
            w,
            h,
        )
    }

    /// True when the two tile rectangles touch.
    pub fn intersects(&self, other: &TileDesc) -> bool {
        self.intersects_rect(
            other.tile_pos_x,
            other.tile_pos_y,
            other.tile_width,
            other.tile_height,
        )
    }

    /// True when both tiles share part, render size, tile size, view, and
    /// lie on the same grid row.
    pub fn on_same_row(&self, other: &TileDesc) -> bool {
        if other.part != self.part
            || other.width != self.width
            || other.height != self.height
            || other.tile_width != self.tile_width
            || other.tile_height != self.tile_height
            || other.normalized_view_id != self.normalized_view_id
        {
            return false;
        }
        other.tile_pos_y + other.tile_height >= self.tile_pos_y
            && other.tile_pos_y <= self.tile_pos_y + self.tile_height
    }

    /// True when the two tiles may be batched into one `tilecombine`.
    pub fn can_combine(&self, other: &TileDesc) -> bool {
        if !self.on_same_row(other) {
            return false;
        }
        let grid_x = self.tile_pos_x / self.tile_width;
        let grid_x_other = other.tile_pos_x / other.tile_width;
        let delta = grid_x - grid_x_other;
        (-COMBINE_MAX_GRID_DISTANCE..=COMBINE_MAX_GRID_DISTANCE).contains(&delta)
    }

    /// Serialize to the canonical wire form, with optional prefix/suffix.
    ///
    /// `ver` is always emitted; `id`, `imgsize`, and `broadcast` only when
    /// set.
    pub fn serialize(&self, prefix: &str, suffix: &str) -> String {
        let mut out = String::with_capacity(128 + prefix.len() + suffix.len());
        out.push_str(prefix);
        let _ = write!(
            out,
            " nviewid={} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={} oldwid={} wid={} ver={}",
            self.normalized_view_id,
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
            self.old_wire_id,
            self.wire_id,
            self.ver,
        );
        if self.id >= 0 {
            let _ = write!(out, " id={}", self.id);
        }
        if self.img_size > 0 {
            let _ = write!(out, " imgsize={}", self.img_size);
        }
        if self.broadcast {
            out.push_str(" broadcast=yes");
        }
        out.push_str(suffix);
        out
    }

    /// Parse a descriptor from tokenized `name=value` pairs.
    ///
    /// Unknown fields are ignored; missing required fields fail validation.
    pub fn parse_tokens(tokens: &[&str]) -> Result<Self, ProtocolError> {
        let mut ver: i32 = -1;
        let mut img_size: i32 = 0;
        let mut id: i32 = -1;
        let mut old_wire_id: TileWireId = 0;
        let mut wire_id: TileWireId = 0;
        let mut broadcast = false;

        let mut normalized_view_id: i32 = 0;
        let mut part: i32 = 0;
        let mut width: i32 = 0;
        let mut height: i32 = 0;
        let mut tile_pos_x: i32 = 0;
        let mut tile_pos_y: i32 = 0;
        let mut tile_width: i32 = 0;
        let mut tile_height: i32 = 0;

        for token in tokens {
            let Some((name, value)) = protocol::parse_name_value(token) else {
                continue;
            };
            match name {
                "oldwid" => old_wire_id = value.parse().unwrap_or(0),
                "wid" => wire_id = value.parse().unwrap_or(0),
                "broadcast" => broadcast = value == "yes",
                _ => {
                    let Ok(value) = value.parse::<i32>() else {
                        continue;
                    };
                    match name {
                        "nviewid" => normalized_view_id = value,
                        "part" => part = value,
                        "width" => width = value,
                        "height" => height = value,
                        "tileposx" => tile_pos_x = value,
                        "tileposy" => tile_pos_y = value,
                        "tilewidth" => tile_width = value,
                        "tileheight" => tile_height = value,
                        "ver" => ver = value,
                        "imgsize" => img_size = value,
                        "id" => id = value,
                        _ => {}
                    }
                }
            }
        }

        let mut desc = Self::new(
            normalized_view_id,
            part,
            width,
            height,
            tile_pos_x,
            tile_pos_y,
            tile_width,
            tile_height,
            ver,
            img_size,
            id,
            broadcast,
        )?;
        desc.old_wire_id = old_wire_id;
        desc.wire_id = wire_id;
        Ok(desc)
    }

    /// Parse from a raw message line.
    pub fn parse(message: &str) -> Result<Self, ProtocolError> {
        Self::parse_tokens(&protocol::tokenize(message))
    }
}

/// One or more tile headers: requests rendering of multiple tiles and
/// frames the combined response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombined {
    /// Canonical view id shared by all the tiles.
    pub normalized_view_id: i32,
    /// Document part shared by all the tiles.
    pub part: i32,
    /// Render width in pixels.
    pub width: i32,
    /// Render height in pixels.
    pub height: i32,
    /// Tile width in twips.
    pub tile_width: i32,
    /// Tile height in twips.
    pub tile_height: i32,
    /// The individual descriptors, in request order.
    pub tiles: Vec<TileDesc>,
}

impl TileCombined {
    /// Build a combined header over pre-built descriptors.
    ///
    /// The descriptors must agree on part, render size, tile size, and
    /// view; the first tile supplies the shared fields.
    pub fn create(tiles: Vec<TileDesc>) -> Self {
        debug_assert!(!tiles.is_empty());
        let first = &tiles[0];
        Self {
            normalized_view_id: first.normalized_view_id,
            part: first.part,
            width: first.width,
            height: first.height,
            tile_width: first.tile_width,
            tile_height: first.tile_height,
            tiles,
        }
    }

    /// Wrap a single descriptor.
    pub fn from_desc(desc: TileDesc) -> Self {
        Self::create(vec![desc])
    }

    /// Rewrite the view id on the header and every tile.
    pub fn set_normalized_view_id(&mut self, nviewid: i32) {
        for tile in &mut self.tiles {
            tile.normalized_view_id = nviewid;
        }
        self.normalized_view_id = nviewid;
    }

    /// Serialize to the canonical combined wire form.
    pub fn serialize(&self, prefix: &str, suffix: &str) -> String {
        fn column<T: std::fmt::Display>(
            out: &mut String,
            name: &str,
            tiles: &[TileDesc],
            f: impl Fn(&TileDesc) -> T,
        ) {
            let _ = write!(out, " {name}=");
            for (i, tile) in tiles.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", f(tile));
            }
        }

        let mut out = String::with_capacity(128 + 16 * self.tiles.len());
        out.push_str(prefix);
        let _ = write!(
            out,
            " nviewid={} part={} width={} height={}",
            self.normalized_view_id, self.part, self.width, self.height
        );
        column(&mut out, "tileposx", &self.tiles, |t| t.tile_pos_x);
        column(&mut out, "tileposy", &self.tiles, |t| t.tile_pos_y);
        column(&mut out, "imgsize", &self.tiles, |t| t.img_size);
        let _ = write!(out, " tilewidth={} tileheight={}", self.tile_width, self.tile_height);
        column(&mut out, "ver", &self.tiles, |t| t.ver);
        column(&mut out, "oldwid", &self.tiles, |t| t.old_wire_id);
        column(&mut out, "wid", &self.tiles, |t| t.wire_id);
        out.push_str(suffix);
        out
    }

    /// Parse a combined header from tokenized `name=value` pairs.
    pub fn parse_tokens(tokens: &[&str]) -> Result<Self, ProtocolError> {
        let mut normalized_view_id: i32 = 0;
        let mut part: i32 = 0;
        let mut width: i32 = 0;
        let mut height: i32 = 0;
        let mut tile_width: i32 = 0;
        let mut tile_height: i32 = 0;

        let mut pos_x = "";
        let mut pos_y = "";
        let mut img_sizes = "";
        let mut versions = "";
        let mut old_wire_ids = "";
        let mut wire_ids = "";

        for token in tokens {
            let Some((name, value)) = protocol::parse_name_value(token) else {
                continue;
            };
            match name {
                "tileposx" => pos_x = value,
                "tileposy" => pos_y = value,
                "imgsize" => img_sizes = value,
                "ver" => versions = value,
                "oldwid" => old_wire_ids = value,
                "wid" => wire_ids = value,
                _ => {
                    if let Ok(v) = value.parse::<i32>() {
                        match name {
                            "nviewid" => normalized_view_id = v,
                            "part" => part = v,
                            "width" => width = v,
                            "height" => height = v,
                            "tilewidth" => tile_width = v,
                            "tileheight" => tile_height = v,
                            _ => {}
                        }
                    }
                }
            }
        }

        if part < 0 || width <= 0 || height <= 0 || tile_width <= 0 || tile_height <= 0 {
            return Err(ProtocolError::bad("invalid tilecombine descriptor"));
        }

        let xs = split_column::<i32>(pos_x, "tileposx")?;
        let ys = split_column::<i32>(pos_y, "tileposy")?;
        let sizes = split_column::<i32>(img_sizes, "imgsize")?;
        let vers = split_column_default::<i32>(versions, -1, "ver")?;
        let oldwids = split_column::<TileWireId>(old_wire_ids, "oldwid")?;
        let wids = split_column::<TileWireId>(wire_ids, "wid")?;

        let count = xs.len();
        if count == 0
            || ys.len() != count
            || (!sizes.is_empty() && sizes.len() != count)
            || (!vers.is_empty() && vers.len() != count)
            || (!oldwids.is_empty() && oldwids.len() != count)
            || (!wids.is_empty() && wids.len() != count)
        {
            return Err(ProtocolError::bad(
                "invalid tilecombine descriptor: unequal number of tiles in parameters",
            ));
        }

        let mut tiles = Vec::with_capacity(count);
        for i in 0..count {
            let mut desc = TileDesc::new(
                normalized_view_id,
                part,
                width,
                height,
                xs[i],
                ys[i],
                tile_width,
                tile_height,
                vers.get(i).copied().unwrap_or(-1),
                sizes.get(i).copied().unwrap_or(0),
                -1,
                false,
            )?;
            desc.old_wire_id = oldwids.get(i).copied().unwrap_or(0);
            desc.wire_id = wids.get(i).copied().unwrap_or(0);
            tiles.push(desc);
        }

        Ok(Self {
            normalized_view_id,
            part,
            width,
            height,
            tile_width,
            tile_height,
            tiles,
        })
    }

    /// Parse from a raw message line.
    pub fn parse(message: &str) -> Result<Self, ProtocolError> {
        Self::parse_tokens(&protocol::tokenize(message))
    }
}

/// Split a comma-separated column, rejecting unparsable entries.
fn split_column<T: std::str::FromStr>(raw: &str, what: &str) -> Result<Vec<T>, ProtocolError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|_| ProtocolError::bad(format!("invalid '{what}' in tilecombine descriptor")))
        })
        .collect()
}

/// Like [`split_column`], but empty entries take `default` (the `ver`
/// column may carry gaps).
fn split_column_default<T: std::str::FromStr + Copy>(
    raw: &str,
    default: T,
    what: &str,
) -> Result<Vec<T>, ProtocolError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            if s.is_empty() {
                Ok(default)
            } else {
                s.parse::<T>()
                    .map_err(|_| ProtocolError::bad(format!("invalid '{what}' in tilecombine descriptor")))
            }
        })
        .collect()
}
