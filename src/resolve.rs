//! Output grid resolution.
//!
//! From the probed inputs and the user options, work out the output
//! projection, pixel size, extent and dimensions, and decide per input
//! whether it can be read natively (same CRS, same resolution, grids
//! aligned) or must go through a reprojection view bound to the output
//! grid.

use tracing::{debug, warn};

use crate::error::MosaicError;
use crate::geometry::{transform_bounds, CoordTransformer};
use crate::grid::{BlockRect, Bounds, GeoTransform, GridSpec};
use crate::mosaic::MosaicOptions;
use crate::provider::ImageInfo;

/// Relative tolerance when checking grid alignment: offsets within this
/// fraction of a pixel count as aligned.
const ALIGN_TOL: f64 = 1e-4;

/// How one input maps onto the resolved output grid.
#[derive(Debug, Clone)]
pub struct InputPlacement {
    /// True when reads must go through a reprojection view.
    pub needs_view: bool,
    /// The input's footprint in output pixel coordinates, clamped to the
    /// output grid. Empty when the input misses the output extent.
    pub footprint: BlockRect,
}

/// The resolved output grid plus per-input placements.
#[derive(Debug, Clone)]
pub struct ResolvedGrid {
    pub grid: GridSpec,
    pub placements: Vec<InputPlacement>,
}

/// Compute the output grid from the probed inputs and the user options.
///
/// The output projection defaults to the first input's; `--outprojepsg` /
/// `--outprojwktfile` override it. Pixel size defaults to the first
/// input's, which requires the first input to already be in the target
/// projection; `--xres`/`--yres` override. The extent is the union of the
/// input extents in the target projection, with the origin snapped outward
/// to the resolution lattice.
///
/// # Errors
/// Fails with a projection error when a CRS cannot be resolved, the WKT
/// file carries no EPSG authority, or a default pixel size cannot be
/// deduced.
pub fn resolve_output_grid(
    infos: &[ImageInfo],
    options: &MosaicOptions,
) -> Result<ResolvedGrid, MosaicError> {
    let first = infos
        .first()
        .ok_or_else(|| MosaicError::Usage("input list is empty".into()))?;

    let target_epsg = match (&options.output_epsg, &options.output_wkt_file) {
        (Some(_), Some(_)) => {
            return Err(MosaicError::Usage(
                "use only one of --outprojepsg and --outprojwktfile".into(),
            ))
        }
        (Some(epsg), None) => *epsg,
        (None, Some(path)) => {
            let wkt = std::fs::read_to_string(path)
                .map_err(|e| MosaicError::Usage(format!("cannot read {}: {e}", path.display())))?;
            epsg_from_wkt(&wkt).ok_or_else(|| {
                MosaicError::Projection(format!(
                    "no EPSG authority found in WKT file {}",
                    path.display()
                ))
            })?
        }
        (None, None) => first.grid.epsg,
    };

    // Every distinct input CRS must be transformable into the target
    for info in infos {
        if info.grid.epsg != target_epsg {
            CoordTransformer::new(info.grid.epsg, target_epsg)
                .map_err(MosaicError::Projection)?;
        }
    }

    let (xres, yres) = match (options.xres, options.yres) {
        (Some(x), Some(y)) => (x, y),
        (None, None) if first.grid.epsg == target_epsg => (first.grid.xres(), first.grid.yres()),
        (None, None) => {
            return Err(MosaicError::Projection(
                "cannot deduce a default pixel size: the first input is not in the output \
                 projection, specify --xres and --yres"
                    .into(),
            ))
        }
        _ => {
            return Err(MosaicError::Usage(
                "--xres and --yres must be given together".into(),
            ))
        }
    };
    if xres <= 0.0 || yres <= 0.0 {
        return Err(MosaicError::Usage("pixel sizes must be positive".into()));
    }

    let nodata = options
        .nullval
        .or(first.grid.nodata)
        .unwrap_or_else(|| {
            warn!("No nodata value declared anywhere; using 0");
            0.0
        });

    // Union extent in the target projection
    let mut union: Option<Bounds> = None;
    let mut input_bounds = Vec::with_capacity(infos.len());
    for info in infos {
        let b = transform_bounds(&info.grid.bounds(), info.grid.epsg, target_epsg)
            .map_err(MosaicError::Projection)?;
        union = Some(match union {
            None => b,
            Some(u) => u.union(&b),
        });
        input_bounds.push(b);
    }
    let union = union.expect("at least one input");

    // Snap the origin outward to the resolution lattice
    let x0 = (union.minx / xres).floor() * xres;
    let y0 = (union.maxy / yres).ceil() * yres;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let width = (((union.maxx - x0) / xres).ceil() as usize).max(1);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let height = (((y0 - union.miny) / yres).ceil() as usize).max(1);

    let grid = GridSpec {
        epsg: target_epsg,
        transform: GeoTransform::north_up(x0, y0, xres, yres),
        width,
        height,
        dtype: first.grid.dtype,
        nodata: Some(nodata),
    };
    debug!(
        epsg = target_epsg,
        width, height, xres, yres, "Resolved output grid"
    );

    let placements = infos
        .iter()
        .zip(&input_bounds)
        .map(|(info, bounds)| {
            let needs_view = !is_native_fit(&info.grid, &grid);
            InputPlacement {
                needs_view,
                footprint: footprint_rect(bounds, &grid),
            }
        })
        .collect();

    Ok(ResolvedGrid { grid, placements })
}

/// An input reads natively when its CRS, pixel sizes and grid alignment
/// all match the output grid and its transform is north-up.
fn is_native_fit(input: &GridSpec, output: &GridSpec) -> bool {
    if input.epsg != output.epsg || !input.transform.is_north_up() {
        return false;
    }
    let (oxres, oyres) = (output.xres(), output.yres());
    if (input.xres() - oxres).abs() > ALIGN_TOL * oxres
        || (input.yres() - oyres).abs() > ALIGN_TOL * oyres
    {
        return false;
    }
    is_aligned(input.transform.0[0], output.transform.0[0], oxres)
        && is_aligned(input.transform.0[3], output.transform.0[3], oyres)
}

/// Check that two coordinates differ by an integer multiple of the
/// resolution.
fn is_aligned(a: f64, b: f64, res: f64) -> bool {
    let factor = (a - b).abs() / res;
    (factor - factor.round()).abs() < ALIGN_TOL
}

/// An input's bounds (already in the output CRS) as an output pixel
/// rectangle, rounded outward and clamped to the grid.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn footprint_rect(bounds: &Bounds, grid: &GridSpec) -> BlockRect {
    let c = &grid.transform.0;
    let x0 = ((bounds.minx - c[0]) / c[1]).floor() as i64;
    let x1 = ((bounds.maxx - c[0]) / c[1]).ceil() as i64;
    // Row axis runs north to south
    let y0 = ((bounds.maxy - c[3]) / c[5]).floor() as i64;
    let y1 = ((bounds.miny - c[3]) / c[5]).ceil() as i64;

    let x0 = x0.clamp(0, grid.width as i64);
    let x1 = x1.clamp(0, grid.width as i64);
    let y0 = y0.clamp(0, grid.height as i64);
    let y1 = y1.clamp(0, grid.height as i64);
    BlockRect::new(x0, y0, (x1 - x0).max(0) as usize, (y1 - y0).max(0) as usize)
}

/// Extract the EPSG code from a WKT string's trailing AUTHORITY/ID clause.
///
/// Handles both WKT1 `AUTHORITY["EPSG","32633"]` and WKT2
/// `ID["EPSG",32633]`. The last occurrence is the one describing the whole
/// CRS.
fn epsg_from_wkt(wkt: &str) -> Option<u32> {
    let mut result = None;
    for keyword in ["AUTHORITY", "ID"] {
        let mut rest = wkt;
        while let Some(pos) = rest.find(keyword) {
            rest = &rest[pos + keyword.len()..];
            let Some(open) = rest.find('[') else { break };
            let Some(close) = rest[open..].find(']') else { break };
            let body = &rest[open + 1..open + close];
            if let Some(code) = parse_authority_body(body) {
                result = Some(code);
            }
        }
    }
    result
}

fn parse_authority_body(body: &str) -> Option<u32> {
    let mut parts = body.split(',');
    let name = parts.next()?.trim().trim_matches('"');
    if !name.eq_ignore_ascii_case("EPSG") {
        return None;
    }
    let code = parts.next()?.trim().trim_matches('"');
    code.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::PixelType;
    use std::path::PathBuf;

    fn info(epsg: u32, x0: f64, y0: f64, res: f64, w: usize, h: usize) -> ImageInfo {
        ImageInfo {
            path: PathBuf::from(format!("in_{x0}_{y0}.tif")),
            grid: GridSpec {
                epsg,
                transform: GeoTransform::north_up(x0, y0, res, res),
                width: w,
                height: h,
                dtype: PixelType::U16,
                nodata: Some(0.0),
            },
            bands: 1,
            block_size: (w, h),
        }
    }

    #[test]
    fn test_single_input_grid_matches() {
        let infos = vec![info(32633, 100.0, 200.0, 10.0, 50, 40)];
        let resolved = resolve_output_grid(&infos, &MosaicOptions::default()).unwrap();
        assert_eq!(resolved.grid.epsg, 32633);
        assert_eq!(resolved.grid.width, 50);
        assert_eq!(resolved.grid.height, 40);
        assert_eq!(resolved.grid.transform.0[0], 100.0);
        assert_eq!(resolved.grid.transform.0[3], 200.0);
        assert!(!resolved.placements[0].needs_view);
        assert_eq!(resolved.placements[0].footprint, BlockRect::new(0, 0, 50, 40));
    }

    #[test]
    fn test_union_extent_of_two_inputs() {
        // Side by side, aligned
        let infos = vec![
            info(32633, 0.0, 20.0, 10.0, 2, 2),
            info(32633, 20.0, 20.0, 10.0, 2, 2),
        ];
        let resolved = resolve_output_grid(&infos, &MosaicOptions::default()).unwrap();
        assert_eq!(resolved.grid.width, 4);
        assert_eq!(resolved.grid.height, 2);
        assert!(!resolved.placements[0].needs_view);
        assert!(!resolved.placements[1].needs_view);
        assert_eq!(resolved.placements[0].footprint, BlockRect::new(0, 0, 2, 2));
        assert_eq!(resolved.placements[1].footprint, BlockRect::new(2, 0, 2, 2));
    }

    #[test]
    fn test_misaligned_input_gets_view() {
        // Second input's origin is off the lattice by half a pixel
        let infos = vec![
            info(32633, 0.0, 20.0, 10.0, 2, 2),
            info(32633, 25.0, 20.0, 10.0, 2, 2),
        ];
        let resolved = resolve_output_grid(&infos, &MosaicOptions::default()).unwrap();
        assert!(!resolved.placements[0].needs_view);
        assert!(resolved.placements[1].needs_view);
    }

    #[test]
    fn test_resolution_mismatch_gets_view() {
        let infos = vec![
            info(32633, 0.0, 20.0, 10.0, 2, 2),
            info(32633, 0.0, 20.0, 5.0, 4, 4),
        ];
        let resolved = resolve_output_grid(&infos, &MosaicOptions::default()).unwrap();
        assert!(!resolved.placements[0].needs_view);
        assert!(resolved.placements[1].needs_view);
    }

    #[test]
    fn test_explicit_resolution_override() {
        let infos = vec![info(32633, 0.0, 40.0, 10.0, 4, 4)];
        let options = MosaicOptions {
            xres: Some(20.0),
            yres: Some(20.0),
            ..MosaicOptions::default()
        };
        let resolved = resolve_output_grid(&infos, &options).unwrap();
        assert_eq!(resolved.grid.width, 2);
        assert_eq!(resolved.grid.height, 2);
        // Coarser grid means the native grid no longer fits
        assert!(resolved.placements[0].needs_view);
    }

    #[test]
    fn test_nullval_override_wins() {
        let infos = vec![info(32633, 0.0, 20.0, 10.0, 2, 2)];
        let options = MosaicOptions {
            nullval: Some(-9999.0),
            ..MosaicOptions::default()
        };
        let resolved = resolve_output_grid(&infos, &options).unwrap();
        assert_eq!(resolved.grid.nodata, Some(-9999.0));
    }

    #[test]
    fn test_reprojection_without_res_is_error() {
        let infos = vec![info(32633, 500_000.0, 5_800_000.0, 10.0, 4, 4)];
        let options = MosaicOptions {
            output_epsg: Some(32632),
            ..MosaicOptions::default()
        };
        let err = resolve_output_grid(&infos, &options).unwrap_err();
        assert!(matches!(err, MosaicError::Projection(_)));
    }

    #[test]
    fn test_unknown_target_epsg_is_fatal() {
        let infos = vec![info(32633, 0.0, 20.0, 10.0, 2, 2)];
        let options = MosaicOptions {
            output_epsg: Some(65001),
            xres: Some(10.0),
            yres: Some(10.0),
            ..MosaicOptions::default()
        };
        let err = resolve_output_grid(&infos, &options).unwrap_err();
        assert!(matches!(err, MosaicError::Projection(_)));
    }

    #[test]
    fn test_origin_snap_rounds_outward() {
        // Origin off-lattice: xmin 15 at res 10 snaps to 10, ymax 97 snaps
        // to 100
        let mut infos = vec![info(32633, 15.0, 97.0, 10.0, 3, 3)];
        infos[0].grid.transform = GeoTransform::north_up(15.0, 97.0, 10.0, 10.0);
        let resolved = resolve_output_grid(&infos, &MosaicOptions::default()).unwrap();
        assert_eq!(resolved.grid.transform.0[0], 10.0);
        assert_eq!(resolved.grid.transform.0[3], 100.0);
        // Grid still covers the whole input
        assert_eq!(resolved.grid.width, 4);
        assert_eq!(resolved.grid.height, 4);
        assert!(resolved.placements[0].needs_view);
    }

    #[test]
    fn test_epsg_from_wkt() {
        let wkt1 = r#"PROJCS["WGS 84 / UTM zone 33N",GEOGCS["WGS 84",
            AUTHORITY["EPSG","4326"]],AUTHORITY["EPSG","32633"]]"#;
        assert_eq!(epsg_from_wkt(wkt1), Some(32633));

        let wkt2 = r#"PROJCRS["ETRS89-extended",ID["EPSG",3035]]"#;
        assert_eq!(epsg_from_wkt(wkt2), Some(3035));

        assert_eq!(epsg_from_wkt("PROJCS[\"custom\"]"), None);
    }

    #[test]
    fn test_conflicting_projection_options() {
        let infos = vec![info(32633, 0.0, 20.0, 10.0, 2, 2)];
        let options = MosaicOptions {
            output_epsg: Some(32633),
            output_wkt_file: Some(PathBuf::from("/tmp/x.wkt")),
            ..MosaicOptions::default()
        };
        let err = resolve_output_grid(&infos, &options).unwrap_err();
        assert!(matches!(err, MosaicError::Usage(_)));
    }
}
