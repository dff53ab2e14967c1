//! CRS transforms via proj4rs and the crs-definitions EPSG database.
//!
//! Everything here is pure Rust: an EPSG code is looked up in the
//! crs-definitions database and handed to proj4rs. Geographic CRS use
//! degrees at the API surface; conversion to the radians proj4rs expects is
//! handled internally.

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::grid::Bounds;

/// Get the PROJ4 string for an EPSG code from the crs-definitions database.
#[inline]
#[must_use]
pub fn get_proj_string(epsg: u32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS.
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: u32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        // Fallback: the 4000-4999 block is the geographic range
        epsg == 4326 || (4000..5000).contains(&epsg)
    }
}

/// Reusable point transformer between two EPSG-coded CRS.
pub struct CoordTransformer {
    source_proj: Proj,
    target_proj: Proj,
    source_epsg: u32,
    target_epsg: u32,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl std::fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source_epsg", &self.source_epsg)
            .field("target_epsg", &self.target_epsg)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    /// Create a transformer between two CRS codes.
    ///
    /// # Errors
    /// Returns an error if either EPSG code is not in the database or its
    /// projection fails to initialize.
    pub fn new(source_epsg: u32, target_epsg: u32) -> Result<Self, String> {
        let source_str = get_proj_string(source_epsg)
            .ok_or_else(|| format!("EPSG:{source_epsg} is not in the crs-definitions database"))?;
        let target_str = get_proj_string(target_epsg)
            .ok_or_else(|| format!("EPSG:{target_epsg} is not in the crs-definitions database"))?;

        let source_proj = Proj::from_proj_string(source_str)
            .map_err(|e| format!("Invalid source projection EPSG:{source_epsg}: {e:?}"))?;
        let target_proj = Proj::from_proj_string(target_str)
            .map_err(|e| format!("Invalid target projection EPSG:{target_epsg}: {e:?}"))?;

        Ok(Self {
            source_proj,
            target_proj,
            source_epsg,
            target_epsg,
            source_is_geographic: is_geographic_crs(source_epsg),
            target_is_geographic: is_geographic_crs(target_epsg),
        })
    }

    /// Get the source EPSG code.
    #[inline]
    #[must_use]
    pub fn source_epsg(&self) -> u32 {
        self.source_epsg
    }

    /// Get the target EPSG code.
    #[inline]
    #[must_use]
    pub fn target_epsg(&self) -> u32 {
        self.target_epsg
    }

    /// Transform a point from the source CRS to the target CRS.
    ///
    /// Handles radian/degree conversion based on the CRS kinds.
    ///
    /// # Errors
    /// Returns an error if the underlying transformation fails.
    #[inline]
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), String> {
        let (in_x, in_y) = if self.source_is_geographic {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };

        let mut point = (in_x, in_y, 0.0);
        transform(&self.source_proj, &self.target_proj, &mut point).map_err(|e| {
            format!(
                "Transform from EPSG:{} to EPSG:{} failed: {e:?}",
                self.source_epsg, self.target_epsg
            )
        })?;

        let (out_x, out_y) = if self.target_is_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };

        Ok((out_x, out_y))
    }
}

/// Project a single point between two EPSG codes.
///
/// # Errors
/// Returns an error if a code is unsupported or the transformation fails.
#[inline]
pub fn project_point(
    source_epsg: u32,
    target_epsg: u32,
    x: f64,
    y: f64,
) -> Result<(f64, f64), String> {
    if source_epsg == target_epsg {
        return Ok((x, y));
    }
    CoordTransformer::new(source_epsg, target_epsg)?.transform(x, y)
}

/// Transform a bounding box from one CRS to another.
///
/// Corners alone are not enough for curved projections; edge midpoints are
/// sampled as well and the envelope of all eight points is returned.
///
/// # Errors
/// Returns an error if a code is unsupported or any point transform fails.
pub fn transform_bounds(src: &Bounds, source_epsg: u32, target_epsg: u32) -> Result<Bounds, String> {
    if source_epsg == target_epsg {
        return Ok(*src);
    }

    let transformer = CoordTransformer::new(source_epsg, target_epsg)?;
    let mid_x = (src.minx + src.maxx) / 2.0;
    let mid_y = (src.miny + src.maxy) / 2.0;

    let sample_points = [
        (src.minx, src.miny),
        (src.maxx, src.miny),
        (src.maxx, src.maxy),
        (src.minx, src.maxy),
        (mid_x, src.miny),
        (mid_x, src.maxy),
        (src.minx, mid_y),
        (src.maxx, mid_y),
    ];

    let mut out: Option<Bounds> = None;
    for (x, y) in sample_points {
        let (tx, ty) = transformer.transform(x, y)?;
        out = Some(match out {
            None => Bounds::new(tx, ty, tx, ty),
            Some(b) => {
                Bounds::new(b.minx.min(tx), b.miny.min(ty), b.maxx.max(tx), b.maxy.max(ty))
            }
        });
    }
    Ok(out.expect("sample points are non-empty"))
}
