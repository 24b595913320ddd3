//! Bounding box types and operations.

use serde::{Deserialize, Serialize};

/// A geographic or projected bounding box.
///
/// For geographic CRS (EPSG:4326), coordinates are in degrees.
/// For projected CRS (EPSG:3857, etc.), coordinates are in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Parse a BBOX parameter string: "minx,miny,maxx,maxy".
    pub fn from_kvp(s: &str) -> Result<Self, BboxParseError> {
        let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
        if parts.len() != 4 {
            return Err(BboxParseError::InvalidFormat(s.to_string()));
        }

        let mut coords = [0.0_f64; 4];
        for (i, part) in parts.iter().enumerate() {
            coords[i] = part
                .parse()
                .map_err(|_| BboxParseError::InvalidNumber(part.to_string()))?;
        }

        let bbox = Self::new(coords[0], coords[1], coords[2], coords[3]);
        if bbox.max_x < bbox.min_x || bbox.max_y < bbox.min_y {
            return Err(BboxParseError::Inverted(s.to_string()));
        }
        Ok(bbox)
    }

    /// Swap axis ordering: interpret the stored values as y,x pairs and
    /// return the x,y form. Used for WMS 1.3.0 lat/lon CRS bboxes.
    pub fn swapped_axes(&self) -> Self {
        Self::new(self.min_y, self.min_x, self.max_y, self.max_x)
    }

    /// Width of the bounding box in coordinate units.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height of the bounding box in coordinate units.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Per-pixel resolution for an output grid of `width` x `height`.
    pub fn resolution(&self, width: usize, height: usize) -> (f64, f64) {
        (
            self.width() / width as f64,
            self.height() / height as f64,
        )
    }

    /// Render as a closed five-vertex WKT polygon ring, the form the
    /// metadata index expects for intersection queries.
    pub fn to_wkt(&self) -> String {
        format!(
            "POLYGON (({:.6} {:.6}, {:.6} {:.6}, {:.6} {:.6}, {:.6} {:.6}, {:.6} {:.6}))",
            self.min_x, self.min_y, self.max_x, self.min_y, self.max_x, self.max_y, self.min_x,
            self.max_y, self.min_x, self.min_y
        )
    }

    /// GDAL-style geotransform for an output grid over this bbox:
    /// `[origin_x, x_res, 0, origin_y, 0, -y_res]` with a top-left origin.
    pub fn geotransform(&self, width: usize, height: usize) -> [f64; 6] {
        let (x_res, y_res) = self.resolution(width, height);
        [self.min_x, x_res, 0.0, self.max_y, 0.0, -y_res]
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }

    /// Smallest bbox covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BboxParseError {
    #[error("Invalid BBOX format: {0}. Expected 'minx,miny,maxx,maxy'")]
    InvalidFormat(String),

    #[error("Invalid number in BBOX: {0}")]
    InvalidNumber(String),

    #[error("Invalid BBOX: {0}: min greater than max")]
    Inverted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kvp() {
        let bbox = BoundingBox::from_kvp("100,-45,155,-10").unwrap();
        assert_eq!(bbox.min_x, 100.0);
        assert_eq!(bbox.min_y, -45.0);
        assert_eq!(bbox.max_x, 155.0);
        assert_eq!(bbox.max_y, -10.0);
    }

    #[test]
    fn test_parse_rejects_bad_arity_and_inversion() {
        assert!(BoundingBox::from_kvp("1,2,3").is_err());
        assert!(BoundingBox::from_kvp("a,b,c,d").is_err());
        assert!(BoundingBox::from_kvp("10,0,5,1").is_err());
    }

    #[test]
    fn test_swapped_axes() {
        // WMS 1.3.0 EPSG:4326 sends lat/lon ordering
        let bbox = BoundingBox::from_kvp("-45,100,-10,155").unwrap().swapped_axes();
        assert_eq!(bbox.min_x, 100.0);
        assert_eq!(bbox.min_y, -45.0);
        assert_eq!(bbox.max_x, 155.0);
        assert_eq!(bbox.max_y, -10.0);
    }

    #[test]
    fn test_wkt_ring_is_closed() {
        let wkt = BoundingBox::new(100.0, -45.0, 155.0, -10.0).to_wkt();
        assert!(wkt.starts_with("POLYGON (("));
        // five vertices, first == last
        assert_eq!(wkt.matches(',').count(), 4);
        let inner = wkt.trim_start_matches("POLYGON ((").trim_end_matches("))");
        let verts: Vec<&str> = inner.split(", ").collect();
        assert_eq!(verts[0], verts[4]);
    }

    #[test]
    fn test_geotransform_top_left_origin() {
        let bbox = BoundingBox::new(100.0, -45.0, 155.0, -10.0);
        let gt = bbox.geotransform(550, 350);
        assert_eq!(gt[0], 100.0);
        assert_eq!(gt[3], -10.0);
        assert!((gt[1] - 0.1).abs() < 1e-9);
        assert!((gt[5] + 0.1).abs() < 1e-9);
    }
}
