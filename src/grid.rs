//! Pixel grids, geotransforms and block arithmetic.
//!
//! A [`GridSpec`] describes a raster's pixel grid: CRS (as an EPSG code),
//! affine geotransform in GDAL coefficient order, dimensions, datatype and
//! nodata sentinel. [`BlockGrid`] carves a grid into fixed-size working
//! blocks enumerated in row-major order, which is the canonical write order
//! of the mosaic.

/// Pixel datatype of a raster band.
///
/// Blocks are decoded to `f32` for scheduling and composition; the output
/// writer converts back to this type on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl PixelType {
    /// Bits per sample as stored on disk.
    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            PixelType::U8 => 8,
            PixelType::U16 | PixelType::I16 => 16,
            PixelType::U32 | PixelType::I32 | PixelType::F32 => 32,
            PixelType::F64 => 64,
        }
    }

    /// TIFF SampleFormat value: 1 unsigned, 2 signed, 3 IEEE float.
    #[must_use]
    pub fn sample_format(self) -> u16 {
        match self {
            PixelType::U8 | PixelType::U16 | PixelType::U32 => 1,
            PixelType::I16 | PixelType::I32 => 2,
            PixelType::F32 | PixelType::F64 => 3,
        }
    }
}

/// Bounding box in world coordinates of some CRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl Bounds {
    #[must_use]
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    /// Smallest box containing both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            minx: self.minx.min(other.minx),
            miny: self.miny.min(other.miny),
            maxx: self.maxx.max(other.maxx),
            maxy: self.maxy.max(other.maxy),
        }
    }
}

/// Affine geotransform in GDAL coefficient order:
/// `x = c0 + col*c1 + row*c2`, `y = c3 + col*c4 + row*c5`.
///
/// Rotation terms (`c2`, `c4`) are preserved through planning but never
/// computed by the resolver, which always produces north-up grids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform from an origin and pixel sizes (`yres` positive).
    #[must_use]
    pub fn north_up(x0: f64, y0: f64, xres: f64, yres: f64) -> Self {
        GeoTransform([x0, xres, 0.0, y0, 0.0, -yres])
    }

    /// Map pixel coordinates to world coordinates.
    #[inline]
    #[must_use]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.0;
        (c[0] + col * c[1] + row * c[2], c[3] + col * c[4] + row * c[5])
    }

    /// Invert the transform, mapping world coordinates back to pixels.
    ///
    /// Returns `None` for a degenerate (zero-determinant) transform.
    #[must_use]
    pub fn invert(&self) -> Option<GeoTransform> {
        let c = &self.0;
        let det = c[1] * c[5] - c[2] * c[4];
        if det.abs() < 1e-15 {
            return None;
        }
        let inv_det = 1.0 / det;
        Some(GeoTransform([
            (c[2] * c[3] - c[0] * c[5]) * inv_det,
            c[5] * inv_det,
            -c[2] * inv_det,
            (c[0] * c[4] - c[1] * c[3]) * inv_det,
            -c[4] * inv_det,
            c[1] * inv_det,
        ]))
    }

    /// True when the rotation terms are zero.
    #[inline]
    #[must_use]
    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }
}

/// Immutable description of a raster's pixel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    /// EPSG code of the CRS (0 when ungeoreferenced).
    pub epsg: u32,
    pub transform: GeoTransform,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    pub dtype: PixelType,
    /// Nodata sentinel, if the raster declares one.
    pub nodata: Option<f64>,
}

impl GridSpec {
    /// X pixel size (absolute).
    #[inline]
    #[must_use]
    pub fn xres(&self) -> f64 {
        self.transform.0[1].abs()
    }

    /// Y pixel size (absolute).
    #[inline]
    #[must_use]
    pub fn yres(&self) -> f64 {
        self.transform.0[5].abs()
    }

    /// World bounds of the full grid. Handles rotated transforms by
    /// sampling all four corners.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bounds(&self) -> Bounds {
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [
            self.transform.apply(0.0, 0.0),
            self.transform.apply(w, 0.0),
            self.transform.apply(0.0, h),
            self.transform.apply(w, h),
        ];
        let mut b = Bounds::new(corners[0].0, corners[0].1, corners[0].0, corners[0].1);
        for &(x, y) in &corners[1..] {
            b.minx = b.minx.min(x);
            b.maxx = b.maxx.max(x);
            b.miny = b.miny.min(y);
            b.maxy = b.maxy.max(y);
        }
        b
    }
}

/// Check a pixel value against a nodata sentinel.
///
/// NaN sentinels compare by NaN-ness, since `NaN != NaN`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn matches_nodata(value: f32, nodata: f64) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else {
        value == nodata as f32
    }
}

/// Identity of a working block: row and column of the block grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub row: usize,
    pub col: usize,
}

/// Rectangle in pixel coordinates of a named grid.
///
/// Offsets are signed: a source rectangle computed from world coordinates
/// may extend past an input's edges, and the reader clamps and pads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRect {
    pub x0: i64,
    pub y0: i64,
    pub w: usize,
    pub h: usize,
}

impl BlockRect {
    #[must_use]
    pub fn new(x0: i64, y0: i64, w: usize, h: usize) -> Self {
        Self { x0, y0, w, h }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.w * self.h
    }

    #[inline]
    #[must_use]
    pub fn x1(&self) -> i64 {
        self.x0 + self.w as i64
    }

    #[inline]
    #[must_use]
    pub fn y1(&self) -> i64 {
        self.y0 + self.h as i64
    }

    /// Intersection of two rectangles in the same grid, `None` when disjoint.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn intersect(&self, other: &BlockRect) -> Option<BlockRect> {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        let x1 = self.x1().min(other.x1());
        let y1 = self.y1().min(other.y1());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BlockRect::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize))
    }
}

/// Row-major enumeration of fixed-size blocks over a pixel grid.
///
/// Right/bottom edge blocks may be smaller than the working block size.
/// Total block count is `ceil(h/b) * ceil(w/b)`.
#[derive(Debug, Clone, Copy)]
pub struct BlockGrid {
    pub width: usize,
    pub height: usize,
    pub block_size: usize,
    pub blocks_across: usize,
    pub blocks_down: usize,
}

impl BlockGrid {
    #[must_use]
    pub fn new(width: usize, height: usize, block_size: usize) -> Self {
        Self {
            width,
            height,
            block_size,
            blocks_across: width.div_ceil(block_size),
            blocks_down: height.div_ceil(block_size),
        }
    }

    /// Total number of blocks.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks_across * self.blocks_down
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block at a linear row-major index.
    #[inline]
    #[must_use]
    pub fn id(&self, index: usize) -> BlockId {
        BlockId {
            row: index / self.blocks_across,
            col: index % self.blocks_across,
        }
    }

    /// Linear row-major index of a block.
    #[inline]
    #[must_use]
    pub fn index(&self, id: BlockId) -> usize {
        id.row * self.blocks_across + id.col
    }

    /// Pixel rectangle of a block, clamped at the right/bottom edges.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn rect(&self, id: BlockId) -> BlockRect {
        let x0 = id.col * self.block_size;
        let y0 = id.row * self.block_size;
        BlockRect::new(
            x0 as i64,
            y0 as i64,
            self.block_size.min(self.width - x0),
            self.block_size.min(self.height - y0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geotransform_roundtrip() {
        let gt = GeoTransform::north_up(500_000.0, 4_100_000.0, 10.0, 10.0);
        let (x, y) = gt.apply(12.0, 34.0);
        assert_eq!(x, 500_120.0);
        assert_eq!(y, 4_099_660.0);

        let inv = gt.invert().unwrap();
        let (col, row) = inv.apply(x, y);
        assert!((col - 12.0).abs() < 1e-9);
        assert!((row - 34.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotated_transform_roundtrip() {
        let gt = GeoTransform([100.0, 2.0, 0.5, 200.0, -0.5, -2.0]);
        assert!(!gt.is_north_up());
        let (x, y) = gt.apply(7.0, 3.0);
        let inv = gt.invert().unwrap();
        let (col, row) = inv.apply(x, y);
        assert!((col - 7.0).abs() < 1e-9);
        assert!((row - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_transform_has_no_inverse() {
        let gt = GeoTransform([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(gt.invert().is_none());
    }

    #[test]
    fn test_grid_bounds_north_up() {
        let grid = GridSpec {
            epsg: 32633,
            transform: GeoTransform::north_up(0.0, 100.0, 10.0, 10.0),
            width: 20,
            height: 10,
            dtype: PixelType::U16,
            nodata: Some(0.0),
        };
        let b = grid.bounds();
        assert_eq!(b.minx, 0.0);
        assert_eq!(b.maxx, 200.0);
        assert_eq!(b.miny, 0.0);
        assert_eq!(b.maxy, 100.0);
    }

    #[test]
    fn test_block_grid_edges() {
        // 10x5 grid with block size 4: 3 across, 2 down
        let bg = BlockGrid::new(10, 5, 4);
        assert_eq!(bg.len(), 6);
        assert_eq!(bg.blocks_across, 3);
        assert_eq!(bg.blocks_down, 2);

        // Interior block is full size
        assert_eq!(bg.rect(BlockId { row: 0, col: 0 }), BlockRect::new(0, 0, 4, 4));
        // Right edge block is narrower
        assert_eq!(bg.rect(BlockId { row: 0, col: 2 }), BlockRect::new(8, 0, 2, 4));
        // Bottom edge block is shorter
        assert_eq!(bg.rect(BlockId { row: 1, col: 1 }), BlockRect::new(4, 4, 4, 1));
    }

    #[test]
    fn test_block_grid_row_major_index() {
        let bg = BlockGrid::new(100, 100, 10);
        for i in 0..bg.len() {
            assert_eq!(bg.index(bg.id(i)), i);
        }
        // Row-major: index increases along a row first
        assert_eq!(bg.id(0), BlockId { row: 0, col: 0 });
        assert_eq!(bg.id(1), BlockId { row: 0, col: 1 });
        assert_eq!(bg.id(10), BlockId { row: 1, col: 0 });
    }

    #[test]
    fn test_rect_intersection() {
        let a = BlockRect::new(0, 0, 10, 10);
        let b = BlockRect::new(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), Some(BlockRect::new(5, 5, 5, 5)));

        let c = BlockRect::new(10, 0, 4, 4);
        assert!(a.intersect(&c).is_none());

        // Negative offsets intersect normally
        let d = BlockRect::new(-3, -3, 6, 6);
        assert_eq!(a.intersect(&d), Some(BlockRect::new(0, 0, 3, 3)));
    }
}
