//! Reprojection views: block readers bound to the output grid.
//!
//! When an input's native grid differs from the output grid (projection,
//! pixel size or alignment), its reads are served through a
//! [`ReprojectingReader`]. Rectangles handed to the view are in output-grid
//! pixel coordinates; the view reads the covering source window once, then
//! inverse-projects each output pixel center into source pixel space and
//! samples it there. Pixels that fall outside the source, or whose nearest
//! source sample is nodata, come back as the output nodata sentinel.

use crate::error::MosaicError;
use crate::geometry::CoordTransformer;
use crate::grid::{matches_nodata, BlockRect, GeoTransform, GridSpec};
use crate::provider::BlockReader;

/// Resampling method used when a reprojection view samples source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplingMethod {
    /// Nearest neighbor: fastest, value-preserving (required for thematic
    /// rasters).
    #[default]
    Nearest,
    /// Bilinear interpolation over the 2x2 neighborhood.
    Bilinear,
    /// Cubic interpolation over the 4x4 neighborhood.
    Cubic,
}

impl ResamplingMethod {
    /// Parse the GDAL-style method name used on the command line.
    ///
    /// # Errors
    /// Returns the offending name if it is not a known method.
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "near" | "nearest" => Ok(ResamplingMethod::Nearest),
            "bilinear" => Ok(ResamplingMethod::Bilinear),
            "cubic" => Ok(ResamplingMethod::Cubic),
            other => Err(other.to_string()),
        }
    }

    /// Extra source pixels needed around the sampling footprint.
    fn margin(self) -> i64 {
        match self {
            ResamplingMethod::Nearest => 1,
            ResamplingMethod::Bilinear => 2,
            ResamplingMethod::Cubic => 3,
        }
    }
}

/// Cubic weight function (Mitchell-Netravali with B=C=1/3).
///
/// Coefficients pre-divided by 6; called 16 times per output pixel.
#[inline(always)]
fn cubic_weight(x: f64) -> f64 {
    const A0: f64 = 7.0 / 6.0;
    const A1: f64 = -2.0;
    const A2: f64 = 16.0 / 18.0;
    const B0: f64 = -7.0 / 18.0;
    const B1: f64 = 2.0;
    const B2: f64 = -10.0 / 3.0;
    const B3: f64 = 16.0 / 9.0;

    let x = x.abs();
    if x < 1.0 {
        let x2 = x * x;
        A0 * x2 * x + A1 * x2 + A2
    } else if x < 2.0 {
        let x2 = x * x;
        B0 * x2 * x + B1 * x2 + B2 * x + B3
    } else {
        0.0
    }
}

/// A [`BlockReader`] that serves output-grid rectangles from a source
/// raster in a different grid.
pub struct ReprojectingReader {
    inner: Box<dyn BlockReader>,
    src: GridSpec,
    /// Inverse of the source geotransform.
    src_inv: GeoTransform,
    view: GridSpec,
    /// Output CRS to source CRS, `None` when they match.
    transformer: Option<CoordTransformer>,
    resampling: ResamplingMethod,
    /// Output nodata sentinel used as the fill value.
    fill: f64,
    /// Source nodata, checked before interpolating.
    src_nodata: Option<f64>,
}

impl ReprojectingReader {
    /// Wrap a native reader in a view bound to `view_grid`.
    ///
    /// # Errors
    /// Fails if the CRS pair cannot be resolved or the source geotransform
    /// is degenerate.
    pub fn new(
        inner: Box<dyn BlockReader>,
        view_grid: GridSpec,
        resampling: ResamplingMethod,
    ) -> Result<Self, MosaicError> {
        let src = inner.grid().clone();
        let src_inv = src
            .transform
            .invert()
            .ok_or_else(|| MosaicError::Projection("degenerate source geotransform".into()))?;

        let transformer = if src.epsg == view_grid.epsg {
            None
        } else {
            Some(
                CoordTransformer::new(view_grid.epsg, src.epsg)
                    .map_err(MosaicError::Projection)?,
            )
        };

        let fill = view_grid.nodata.unwrap_or(0.0);
        let src_nodata = src.nodata.or(Some(fill));

        Ok(Self {
            inner,
            src,
            src_inv,
            view: view_grid,
            transformer,
            resampling,
            fill,
            src_nodata,
        })
    }

    /// Map an output-grid pixel coordinate into source pixel space.
    fn to_source_pixel(&self, col: f64, row: f64) -> Option<(f64, f64)> {
        let (wx, wy) = self.view.transform.apply(col, row);
        let (sx, sy) = match &self.transformer {
            None => (wx, wy),
            Some(t) => t.transform(wx, wy).ok()?,
        };
        Some(self.src_inv.apply(sx, sy))
    }

    /// Source window covering `rect`, padded for the resampling kernel and
    /// clamped to the source extent. `None` when the rect misses the source
    /// entirely.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn source_window(&self, rect: &BlockRect) -> Option<BlockRect> {
        let x0 = rect.x0 as f64;
        let y0 = rect.y0 as f64;
        let x1 = rect.x1() as f64;
        let y1 = rect.y1() as f64;
        let mx = (x0 + x1) / 2.0;
        let my = (y0 + y1) / 2.0;

        let sample_points = [
            (x0, y0),
            (x1, y0),
            (x0, y1),
            (x1, y1),
            (mx, y0),
            (mx, y1),
            (x0, my),
            (x1, my),
            (mx, my),
        ];

        let mut lo_x = f64::INFINITY;
        let mut lo_y = f64::INFINITY;
        let mut hi_x = f64::NEG_INFINITY;
        let mut hi_y = f64::NEG_INFINITY;
        for (c, r) in sample_points {
            let Some((sx, sy)) = self.to_source_pixel(c, r) else {
                continue;
            };
            lo_x = lo_x.min(sx);
            hi_x = hi_x.max(sx);
            lo_y = lo_y.min(sy);
            hi_y = hi_y.max(sy);
        }
        if !lo_x.is_finite() || !hi_x.is_finite() {
            return None;
        }

        let margin = self.resampling.margin();
        let wx0 = (lo_x.floor() as i64 - margin).max(0);
        let wy0 = (lo_y.floor() as i64 - margin).max(0);
        let wx1 = (hi_x.ceil() as i64 + margin).min(self.src.width as i64);
        let wy1 = (hi_y.ceil() as i64 + margin).min(self.src.height as i64);
        if wx1 <= wx0 || wy1 <= wy0 {
            return None;
        }
        Some(BlockRect::new(wx0, wy0, (wx1 - wx0) as usize, (wy1 - wy0) as usize))
    }

    /// Sample the window at a fractional source pixel coordinate.
    ///
    /// `u`/`v` use the edge convention: integer values are pixel edges, the
    /// cell `[i, i+1)` belongs to pixel `i`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn sample(&self, window: &BlockRect, data: &[f32], u: f64, v: f64) -> f32 {
        let fill = self.fill as f32;

        let clamp_col = |c: i64| c.clamp(0, window.w as i64 - 1) as usize;
        let clamp_row = |r: i64| r.clamp(0, window.h as i64 - 1) as usize;
        let at = |c: usize, r: usize| data[r * window.w + c];

        // Local window coordinates
        let lu = u - window.x0 as f64;
        let lv = v - window.y0 as f64;

        // The containing cell is the nearest-neighbor sample
        let near_c = lu.floor() as i64;
        let near_r = lv.floor() as i64;
        if near_c < 0 || near_r < 0 || near_c >= window.w as i64 || near_r >= window.h as i64 {
            return fill;
        }
        let nearest = at(near_c as usize, near_r as usize);
        if let Some(nd) = self.src_nodata {
            if matches_nodata(nearest, nd) {
                return fill;
            }
        }

        match self.resampling {
            ResamplingMethod::Nearest => nearest,
            ResamplingMethod::Bilinear => {
                let tu = lu - 0.5;
                let tv = lv - 0.5;
                let c0 = tu.floor();
                let r0 = tv.floor();
                let fu = tu - c0;
                let fv = tv - r0;

                let mut acc = 0.0_f64;
                for (dr, wr) in [(0_i64, 1.0 - fv), (1, fv)] {
                    for (dc, wc) in [(0_i64, 1.0 - fu), (1, fu)] {
                        let s = at(clamp_col(c0 as i64 + dc), clamp_row(r0 as i64 + dr));
                        if let Some(nd) = self.src_nodata {
                            if matches_nodata(s, nd) {
                                return nearest;
                            }
                        }
                        acc += f64::from(s) * wr * wc;
                    }
                }
                acc as f32
            }
            ResamplingMethod::Cubic => {
                let tu = lu - 0.5;
                let tv = lv - 0.5;
                let c0 = tu.floor();
                let r0 = tv.floor();
                let fu = tu - c0;
                let fv = tv - r0;

                let mut acc = 0.0_f64;
                let mut weight_sum = 0.0_f64;
                for dr in -1_i64..=2 {
                    let wr = cubic_weight(dr as f64 - fv);
                    for dc in -1_i64..=2 {
                        let wc = cubic_weight(dc as f64 - fu);
                        let s = at(clamp_col(c0 as i64 + dc), clamp_row(r0 as i64 + dr));
                        if let Some(nd) = self.src_nodata {
                            if matches_nodata(s, nd) {
                                return nearest;
                            }
                        }
                        acc += f64::from(s) * wr * wc;
                        weight_sum += wr * wc;
                    }
                }
                if weight_sum.abs() < 1e-12 {
                    nearest
                } else {
                    (acc / weight_sum) as f32
                }
            }
        }
    }
}

impl BlockReader for ReprojectingReader {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn read_block(&mut self, band: usize, rect: &BlockRect) -> Result<Vec<f32>, MosaicError> {
        let fill = self.fill as f32;
        let mut out = vec![fill; rect.len()];

        let Some(window) = self.source_window(rect) else {
            return Ok(out);
        };
        let data = self.inner.read_block(band, &window)?;

        for row in 0..rect.h {
            let dst_row = row * rect.w;
            for col in 0..rect.w {
                let out_col = rect.x0 as f64 + col as f64 + 0.5;
                let out_row = rect.y0 as f64 + row as f64 + 0.5;
                let Some((u, v)) = self.to_source_pixel(out_col, out_row) else {
                    continue;
                };
                out[dst_row + col] = self.sample(&window, &data, u, v);
            }
        }
        Ok(out)
    }

    fn grid(&self) -> &GridSpec {
        &self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GeoTransform, PixelType};
    use crate::provider::memory::MemoryProvider;
    use crate::provider::RasterProvider;
    use std::path::Path;

    fn grid(epsg: u32, x0: f64, y0: f64, res: f64, w: usize, h: usize) -> GridSpec {
        GridSpec {
            epsg,
            transform: GeoTransform::north_up(x0, y0, res, res),
            width: w,
            height: h,
            dtype: PixelType::F32,
            nodata: Some(0.0),
        }
    }

    #[test]
    fn test_parse_method_names() {
        assert_eq!(ResamplingMethod::parse("near").unwrap(), ResamplingMethod::Nearest);
        assert_eq!(ResamplingMethod::parse("bilinear").unwrap(), ResamplingMethod::Bilinear);
        assert_eq!(ResamplingMethod::parse("cubic").unwrap(), ResamplingMethod::Cubic);
        assert!(ResamplingMethod::parse("lanczos").is_err());
    }

    #[test]
    fn test_cubic_weight_shape() {
        // Mitchell-Netravali peaks at 16/18 at distance zero and has no
        // support beyond two pixels
        assert!((cubic_weight(0.0) - 16.0 / 18.0).abs() < 1e-12);
        assert_eq!(cubic_weight(2.0), 0.0);
        assert_eq!(cubic_weight(-2.5), 0.0);
        assert!(cubic_weight(0.5) > cubic_weight(1.5));
    }

    #[test]
    fn test_identity_view_same_grid() {
        // View grid identical to source grid: values pass through
        let provider = MemoryProvider::new();
        let g = grid(32633, 0.0, 4.0, 1.0, 4, 4);
        let data: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        provider.add_input(Path::new("a.tif"), g.clone(), vec![data.clone()]);

        let native = provider.open_read(Path::new("a.tif"), None).unwrap();
        let mut view =
            ReprojectingReader::new(native, g, ResamplingMethod::Nearest).unwrap();

        let out = view.read_block(0, &BlockRect::new(0, 0, 4, 4)).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_offset_view_shifts_pixels() {
        // Source origin at x=2: output cols 0-1 are outside, cols 2-3 map to
        // source cols 0-1
        let provider = MemoryProvider::new();
        let src = grid(32633, 2.0, 2.0, 1.0, 2, 2);
        provider.add_input(
            Path::new("a.tif"),
            src,
            vec![vec![5.0, 6.0, 7.0, 8.0]],
        );

        let view_grid = grid(32633, 0.0, 2.0, 1.0, 4, 2);
        let native = provider.open_read(Path::new("a.tif"), None).unwrap();
        let mut view =
            ReprojectingReader::new(native, view_grid, ResamplingMethod::Nearest).unwrap();

        let out = view.read_block(0, &BlockRect::new(0, 0, 4, 2)).unwrap();
        assert_eq!(out, vec![0.0, 0.0, 5.0, 6.0, 0.0, 0.0, 7.0, 8.0]);
    }

    #[test]
    fn test_downsampling_view_nearest() {
        // 4x4 source at res 1, view at res 2: each view pixel takes the
        // source pixel containing its center
        let provider = MemoryProvider::new();
        let src = grid(32633, 0.0, 4.0, 1.0, 4, 4);
        let data: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        provider.add_input(Path::new("a.tif"), src, vec![data]);

        let mut view_grid = grid(32633, 0.0, 4.0, 2.0, 2, 2);
        view_grid.transform = GeoTransform::north_up(0.0, 4.0, 2.0, 2.0);
        let native = provider.open_read(Path::new("a.tif"), None).unwrap();
        let mut view =
            ReprojectingReader::new(native, view_grid, ResamplingMethod::Nearest).unwrap();

        let out = view.read_block(0, &BlockRect::new(0, 0, 2, 2)).unwrap();
        // Centers at source pixels (1,1), (3,1), (1,3), (3,3)
        assert_eq!(out, vec![6.0, 8.0, 14.0, 16.0]);
    }

    #[test]
    fn test_bilinear_interpolates_midpoint() {
        let provider = MemoryProvider::new();
        let src = grid(32633, 0.0, 2.0, 1.0, 2, 2);
        provider.add_input(
            Path::new("a.tif"),
            src,
            vec![vec![10.0, 20.0, 30.0, 40.0]],
        );

        // Half-pixel-shifted view: every sample lands between source centers
        let view_grid = GridSpec {
            epsg: 32633,
            transform: GeoTransform::north_up(0.5, 1.5, 1.0, 1.0),
            width: 1,
            height: 1,
            dtype: PixelType::F32,
            nodata: Some(-1.0),
        };
        let native = provider.open_read(Path::new("a.tif"), None).unwrap();
        let mut view =
            ReprojectingReader::new(native, view_grid, ResamplingMethod::Bilinear).unwrap();

        let out = view.read_block(0, &BlockRect::new(0, 0, 1, 1)).unwrap();
        assert!((out[0] - 25.0).abs() < 1e-4, "expected 25.0, got {}", out[0]);
    }

    #[test]
    fn test_nodata_source_pixel_becomes_fill() {
        let provider = MemoryProvider::new();
        let src = grid(32633, 0.0, 2.0, 1.0, 2, 2);
        provider.add_input(
            Path::new("a.tif"),
            src.clone(),
            vec![vec![0.0, 20.0, 30.0, 40.0]], // top-left is nodata
        );

        let mut view_grid = src;
        view_grid.nodata = Some(-9999.0);
        let native = provider.open_read(Path::new("a.tif"), None).unwrap();
        let mut view =
            ReprojectingReader::new(native, view_grid, ResamplingMethod::Nearest).unwrap();

        let out = view.read_block(0, &BlockRect::new(0, 0, 2, 2)).unwrap();
        assert_eq!(out, vec![-9999.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_view_across_utm_zones() {
        // Source in UTM 33N, view in UTM 32N. A constant raster must stay
        // constant through any projective resampling.
        let provider = MemoryProvider::new();
        let src = grid(32633, 300_000.0, 5_800_000.0, 100.0, 16, 16);
        provider.add_input(Path::new("a.tif"), src.clone(), vec![vec![7.0; 256]]);

        // Place the view over the same ground area, expressed in 32N
        let b = src.bounds();
        let t =
            crate::geometry::transform_bounds(&b, 32633, 32632).unwrap();
        let view_grid = GridSpec {
            epsg: 32632,
            transform: GeoTransform::north_up(t.minx, t.maxy, 100.0, 100.0),
            width: 16,
            height: 16,
            dtype: PixelType::F32,
            nodata: Some(0.0),
        };
        let native = provider.open_read(Path::new("a.tif"), None).unwrap();
        let mut view =
            ReprojectingReader::new(native, view_grid, ResamplingMethod::Nearest).unwrap();

        let out = view.read_block(0, &BlockRect::new(4, 4, 8, 8)).unwrap();
        // Interior pixels land inside the source; all must be 7 or fill
        let covered = out.iter().filter(|&&v| v == 7.0).count();
        assert!(covered > out.len() / 2, "only {covered} of {} covered", out.len());
        for &v in &out {
            assert!(v == 7.0 || v == 0.0, "unexpected value {v}");
        }
    }
}
