//! Coordinate reference system handling.

pub mod projection;

pub use projection::{
    get_proj_string, is_geographic_crs, project_point, transform_bounds, CoordTransformer,
};
