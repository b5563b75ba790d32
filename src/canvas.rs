use std::sync::Arc;

use image::{DynamicImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage with copy-on-write sharing
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled image backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and mutations via `put_pixel` / `get_pixel_mut`
/// use `Arc::make_mut` to COW-clone only the touched chunk.  History
/// snapshots are plain clones, so painting after a commit can never reach
/// into a stored entry.
#[derive(Clone)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl std::fmt::Debug for TiledImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image.  Zero-sized images
    /// are allowed and hold no chunks.
    pub fn new(width: u32, height: u32) -> Self {
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        let total = chunks_per_row as usize * chunks_per_col as usize;
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        }
    }

    /// Fill the entire image with `color`.  A transparent fill costs nothing.
    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        let mut img = Self::new(width, height);
        if color[3] > 0 {
            img.fill(color);
        }
        img
    }

    /// Import from a flat `RgbaImage` as-is.  Only non-transparent chunks are stored.
    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        let mut img = Self::new(src.width(), src.height());
        let cs = CHUNK_SIZE;
        let chunks_y = img.height.div_ceil(cs);
        let src_raw = src.as_raw();
        let src_stride = src.width() as usize * 4;

        for cy in 0..chunks_y {
            for cx in 0..img.chunks_per_row {
                let x0 = cx * cs;
                let y0 = cy * cs;
                let w = cs.min(img.width - x0);
                let h = cs.min(img.height - y0);

                let mut chunk = RgbaImage::new(cs, cs);
                let mut has_content = false;
                {
                    let dst = chunk.as_mut();
                    for ly in 0..h {
                        let src_off = (y0 + ly) as usize * src_stride + x0 as usize * 4;
                        let row = &src_raw[src_off..src_off + w as usize * 4];
                        if !has_content {
                            has_content = row.chunks_exact(4).any(|px| px[3] != 0);
                        }
                        let dst_off = ly as usize * cs as usize * 4;
                        dst[dst_off..dst_off + row.len()].copy_from_slice(row);
                    }
                }
                if has_content {
                    img.set_chunk(cx, cy, chunk);
                }
            }
        }
        img
    }

    /// Flatten into a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        let cs = CHUNK_SIZE;
        let dst_stride = self.width as usize * 4;
        let dst = out.as_mut();

        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            let x0 = cx * cs;
            let y0 = cy * cs;
            let w = cs.min(self.width - x0) as usize;
            let h = cs.min(self.height - y0);
            let src = chunk.as_raw();
            for ly in 0..h {
                let src_off = ly as usize * cs as usize * 4;
                let dst_off = (y0 + ly) as usize * dst_stride + x0 as usize * 4;
                dst[dst_off..dst_off + w * 4].copy_from_slice(&src[src_off..src_off + w * 4]);
            }
        }
        out
    }

    // ---- indexing helpers ----------------------------------------------------

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) { (x / CHUNK_SIZE, y / CHUNK_SIZE) }

    #[inline(always)]
    fn local(x: u32, y: u32) -> (u32, u32) { (x % CHUNK_SIZE, y % CHUNK_SIZE) }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks or
    /// out-of-bounds coordinates).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height { return &TRANSPARENT_PIXEL; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        self.chunks[idx].as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    /// Out-of-bounds writes are dropped.
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if let Some(px) = self.get_pixel_mut(x, y) {
            *px = pixel;
        }
    }

    /// Mutable reference to a pixel (creates the chunk on demand, COW-clones if shared).
    #[inline]
    pub fn get_pixel_mut(&mut self, x: u32, y: u32) -> Option<&mut Rgba<u8>> {
        if x >= self.width || y >= self.height { return None; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Some(Arc::make_mut(arc).get_pixel_mut(lx, ly))
    }

    /// Read-only access to a chunk (if it exists).
    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx).and_then(|c| c.as_deref())
    }

    /// Place a fully-built chunk at the given chunk coordinate.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, chunk: RgbaImage) {
        let idx = self.flat_index(cx, cy);
        if idx < self.chunks.len() {
            self.chunks[idx] = Some(Arc::new(chunk));
        }
    }

    /// Iterator over populated chunk coordinates.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks.iter().enumerate().filter_map(move |(i, slot)| {
            slot.as_ref().map(|_| ((i as u32) % cpr, (i as u32) / cpr))
        })
    }

    /// Number of populated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    // ---- bulk operations ----------------------------------------------------

    /// Fill every pixel with `color`.
    pub fn fill(&mut self, color: Rgba<u8>) {
        let mut tile = RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE);
        for pixel in tile.pixels_mut() {
            *pixel = color;
        }
        // One shared tile; the first write to any chunk un-shares it.
        let tile = Arc::new(tile);
        for slot in &mut self.chunks {
            *slot = Some(Arc::clone(&tile));
        }
    }

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }

    pub fn dimensions(&self) -> (u32, u32) { (self.width, self.height) }

    /// Approximate memory usage in bytes.
    /// A shared (COW) chunk is split evenly between its current holders, so
    /// summing over every image that shares it counts its pixels once.
    pub fn memory_bytes(&self) -> usize {
        let chunk_byte_size = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
        self.chunks.iter()
            .filter_map(|c| c.as_ref())
            .map(|arc| chunk_byte_size / Arc::strong_count(arc))
            .sum()
    }

    /// Pixel-exact comparison.  A missing chunk equals a fully transparent one.
    pub fn same_pixels(&self, other: &TiledImage) -> bool {
        if self.dimensions() != other.dimensions() {
            return false;
        }
        self.chunks.iter().zip(&other.chunks).enumerate().all(|(i, (a, b))| {
            match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
                _ => {
                    let cx = (i as u32) % self.chunks_per_row;
                    let cy = (i as u32) / self.chunks_per_row;
                    self.chunk_region_eq(other, cx, cy)
                }
            }
        })
    }

    fn chunk_region_eq(&self, other: &TiledImage, cx: u32, cy: u32) -> bool {
        let x0 = cx * CHUNK_SIZE;
        let y0 = cy * CHUNK_SIZE;
        let x1 = (x0 + CHUNK_SIZE).min(self.width);
        let y1 = (y0 + CHUNK_SIZE).min(self.height);
        (y0..y1).all(|y| (x0..x1).all(|x| self.get_pixel(x, y) == other.get_pixel(x, y)))
    }
}

// ============================================================================
// PREMULTIPLIED ALPHA HELPERS
// ============================================================================

/// Straight → premultiplied alpha.
#[inline]
pub fn premultiply(px: Rgba<u8>) -> Rgba<u8> {
    let a = px[3] as u16;
    if a == 255 {
        return px;
    }
    let mul = |c: u8| ((c as u16 * a + 127) / 255) as u8;
    Rgba([mul(px[0]), mul(px[1]), mul(px[2]), px[3]])
}

/// Premultiplied → straight alpha.
#[inline]
pub fn demultiply(px: Rgba<u8>) -> Rgba<u8> {
    let a = px[3] as u16;
    match a {
        0 => Rgba([0, 0, 0, 0]),
        255 => px,
        _ => {
            let div = |c: u8| ((c as u16 * 255 + a / 2) / a).min(255) as u8;
            Rgba([div(px[0]), div(px[1]), div(px[2]), px[3]])
        }
    }
}

// ============================================================================
// PIXEL SURFACE
// ============================================================================

/// Identity of the surface a tool is bound to.  Survives `replace`, so a
/// painted signal raised before an undo still refers to the same canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(Uuid);

impl SurfaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SurfaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The canvas pixel buffer.  Pixels are RGBA8 with premultiplied alpha.
#[derive(Clone, Debug)]
pub struct PixelSurface {
    id: SurfaceId,
    pixels: TiledImage,
}

impl PixelSurface {
    /// Blank surface filled with a (premultiplied) colour.
    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self::from_tiled(TiledImage::new_filled(width, height, premultiply(color)))
    }

    /// Wrap already-premultiplied pixels.
    pub fn from_tiled(pixels: TiledImage) -> Self {
        Self { id: SurfaceId::new(), pixels }
    }

    /// Import a straight-alpha image, premultiplying on the way in.
    pub fn from_straight_rgba(src: &RgbaImage) -> Self {
        Self::from_tiled(premultiplied_tiles(src))
    }

    /// Import any decoded image.
    pub fn from_dynamic(src: &DynamicImage) -> Self {
        Self::from_straight_rgba(&src.to_rgba8())
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn width(&self) -> u32 { self.pixels.width() }

    pub fn height(&self) -> u32 { self.pixels.height() }

    pub fn dimensions(&self) -> (u32, u32) { self.pixels.dimensions() }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Wholesale replacement.  The identity is kept; the size may change.
    pub fn replace(&mut self, pixels: TiledImage) {
        self.pixels = pixels;
    }

    /// Cheap copy-on-write snapshot for history.
    pub fn snapshot(&self) -> TiledImage {
        self.pixels.clone()
    }

    pub fn pixels(&self) -> &TiledImage {
        &self.pixels
    }

    /// Flat premultiplied copy, used for display.
    pub fn to_rgba_image(&self) -> RgbaImage {
        self.pixels.to_rgba_image()
    }

    /// Flat straight-alpha copy, for hosts that encode files.
    pub fn to_straight_rgba(&self) -> RgbaImage {
        let mut img = self.pixels.to_rgba_image();
        for px in img.pixels_mut() {
            *px = demultiply(*px);
        }
        img
    }

    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        *self.pixels.get_pixel(x, y)
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        self.pixels.put_pixel(x, y, pixel);
    }

    pub fn fill(&mut self, color: Rgba<u8>) {
        self.pixels.fill(color);
    }

    pub fn memory_bytes(&self) -> usize {
        self.pixels.memory_bytes()
    }
}

/// Premultiply a straight-alpha image into tiles.
pub fn premultiplied_tiles(src: &RgbaImage) -> TiledImage {
    if src.pixels().all(|px| px[3] == 255 || px.0 == [0, 0, 0, 0]) {
        return TiledImage::from_rgba_image(src);
    }
    let mut tmp = src.clone();
    for px in tmp.pixels_mut() {
        *px = premultiply(*px);
    }
    TiledImage::from_rgba_image(&tmp)
}

// ============================================================================
// POSITIONS & BLEND MODES
// ============================================================================

/// A pointer position already mapped into canvas (content) coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasPos {
    pub x: f32,
    pub y: f32,
}

impl CanvasPos {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// The pixel under this position, if it lies inside a `width`×`height` canvas.
    pub fn to_pixel(self, width: u32, height: u32) -> Option<(u32, u32)> {
        if self.x < 0.0 || self.y < 0.0 {
            return None;
        }
        let (x, y) = (self.x.floor() as u32, self.y.floor() as u32);
        (x < width && y < height).then_some((x, y))
    }
}

/// Pixel-combination rule used when compositing an overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Source-over.
    #[default]
    Normal,
    /// Source replaces destination.
    Overwrite,
    /// Porter-Duff XOR, for selection marquees.
    Xor,
    Difference,
    Multiply,
    Screen,
    Additive,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Overwrite,
            BlendMode::Xor,
            BlendMode::Difference,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Additive,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Overwrite => "Overwrite",
            BlendMode::Xor => "Xor",
            BlendMode::Difference => "Difference",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Additive => "Additive",
        }
    }

    /// Stable u8 for hosts that store tool presets.
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Overwrite => 1,
            BlendMode::Xor => 2,
            BlendMode::Difference => 3,
            BlendMode::Multiply => 4,
            BlendMode::Screen => 5,
            BlendMode::Additive => 6,
        }
    }

    /// Reconstruct from a u8 (defaults to Normal for unknown values)
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BlendMode::Overwrite,
            2 => BlendMode::Xor,
            3 => BlendMode::Difference,
            4 => BlendMode::Multiply,
            5 => BlendMode::Screen,
            6 => BlendMode::Additive,
            _ => BlendMode::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let mut surface = PixelSurface::new_filled(100, 70, WHITE);
        let before = surface.snapshot();

        surface.put_pixel(65, 3, BLACK);

        assert_eq!(*before.get_pixel(65, 3), WHITE);
        assert_eq!(surface.get_pixel(65, 3), BLACK);
        assert!(!before.same_pixels(surface.pixels()));
    }

    #[test]
    fn flatten_matches_tiles_across_chunk_edges() {
        let mut tiles = TiledImage::new(130, 65);
        tiles.put_pixel(0, 0, BLACK);
        tiles.put_pixel(64, 64, Rgba([10, 20, 30, 40]));
        tiles.put_pixel(129, 64, WHITE);

        let flat = tiles.to_rgba_image();
        assert_eq!(flat.dimensions(), (130, 65));
        assert_eq!(*flat.get_pixel(0, 0), BLACK);
        assert_eq!(*flat.get_pixel(64, 64), Rgba([10, 20, 30, 40]));
        assert_eq!(*flat.get_pixel(129, 64), WHITE);
        assert_eq!(*flat.get_pixel(1, 1), Rgba([0, 0, 0, 0]));

        let back = TiledImage::from_rgba_image(&flat);
        assert!(back.same_pixels(&tiles));
        assert_eq!(back.chunk_count(), 3);
    }

    #[test]
    fn zero_size_surface_is_a_valid_degenerate_state() {
        let surface = PixelSurface::new_filled(0, 0, WHITE);
        assert!(surface.is_empty());
        assert_eq!(surface.to_rgba_image().dimensions(), (0, 0));
        assert_eq!(surface.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn out_of_bounds_writes_are_dropped() {
        let mut surface = PixelSurface::new_filled(4, 4, WHITE);
        let before = surface.snapshot();
        surface.put_pixel(4, 0, BLACK);
        surface.put_pixel(0, 99, BLACK);
        assert!(before.same_pixels(surface.pixels()));
    }

    #[test]
    fn straight_alpha_is_premultiplied_on_import() {
        let mut src = RgbaImage::new(1, 1);
        src.put_pixel(0, 0, Rgba([200, 100, 50, 128]));
        let surface = PixelSurface::from_straight_rgba(&src);

        assert_eq!(surface.get_pixel(0, 0), Rgba([100, 50, 25, 128]));
        let back = surface.to_straight_rgba();
        let px = back.get_pixel(0, 0);
        assert!(px[0].abs_diff(200) <= 1 && px[1].abs_diff(100) <= 1 && px[2].abs_diff(50) <= 1);
    }

    #[test]
    fn replace_keeps_identity_and_adopts_new_size() {
        let mut surface = PixelSurface::new_filled(4, 4, WHITE);
        let id = surface.id();
        surface.replace(TiledImage::new(8, 2));
        assert_eq!(surface.id(), id);
        assert_eq!(surface.dimensions(), (8, 2));
    }

    #[test]
    fn shared_tiles_are_split_between_their_holders() {
        const TILE: usize = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;

        let mut owned = TiledImage::new(64, 64);
        owned.put_pixel(0, 0, BLACK);
        assert_eq!(owned.memory_bytes(), TILE);

        let first = owned.clone();
        let second = owned.clone();
        drop(owned);
        assert_eq!(first.memory_bytes(), TILE / 2);
        assert_eq!(first.memory_bytes() + second.memory_bytes(), TILE);

        // One fill tile behind four chunks counts once.
        let filled = TiledImage::new_filled(128, 128, WHITE);
        assert_eq!(filled.memory_bytes(), TILE);
    }

    #[test]
    fn canvas_pos_maps_to_pixels() {
        assert_eq!(CanvasPos::new(1.7, 2.2).to_pixel(4, 4), Some((1, 2)));
        assert_eq!(CanvasPos::new(-0.5, 2.0).to_pixel(4, 4), None);
        assert_eq!(CanvasPos::new(4.0, 0.0).to_pixel(4, 4), None);
    }

    #[test]
    fn blend_mode_u8_round_trips_every_variant() {
        for mode in BlendMode::all() {
            assert_eq!(BlendMode::from_u8(mode.to_u8()), *mode);
        }
        assert_eq!(BlendMode::from_u8(200), BlendMode::Normal);
    }
}
