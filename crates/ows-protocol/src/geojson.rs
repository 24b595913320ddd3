//! GeoJSON types for the WPS Execute payload.
//!
//! Positions are kept as raw coordinate vectors so payloads carrying
//! elevation values still parse; only the first two components are used.

use serde::{Deserialize, Serialize};

/// A GeoJSON coordinate position (lon, lat, [elevation, ...]).
pub type Position = Vec<f64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    LineString { coordinates: Vec<Position> },
    MultiPoint { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type")]
    pub type_: String,
    pub geometry: Geometry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

impl Feature {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            type_: "Feature".to_string(),
            geometry,
            properties: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub type_: String,
    pub features: Vec<Feature>,
}

impl Geometry {
    /// Planar (shoelace) area. Holes subtract from their outer ring;
    /// non-areal geometry has zero area.
    pub fn planar_area(&self) -> f64 {
        match self {
            Geometry::Polygon { coordinates } => polygon_area(coordinates),
            Geometry::MultiPolygon { coordinates } => {
                coordinates.iter().map(|p| polygon_area(p)).sum()
            }
            _ => 0.0,
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(self, Geometry::Point { .. })
    }

    pub fn is_areal(&self) -> bool {
        matches!(
            self,
            Geometry::Polygon { .. } | Geometry::MultiPolygon { .. }
        )
    }
}

fn polygon_area(rings: &[Vec<Position>]) -> f64 {
    let mut area = 0.0;
    for (i, ring) in rings.iter().enumerate() {
        let ring_area = shoelace(ring).abs();
        if i == 0 {
            area += ring_area;
        } else {
            area -= ring_area;
        }
    }
    area.max(0.0)
}

fn shoelace(ring: &[Position]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = &ring[i];
        let b = &ring[(i + 1) % ring.len()];
        if a.len() < 2 || b.len() < 2 {
            return 0.0;
        }
        sum += a[0] * b[1] - b[0] * a[1];
    }
    sum / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Geometry {
        Geometry::Polygon {
            coordinates: vec![vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
                vec![0.0, 1.0],
                vec![0.0, 0.0],
            ]],
        }
    }

    #[test]
    fn test_polygon_area() {
        assert!((unit_square().planar_area() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_polygon_area_with_hole() {
        let geom = Geometry::Polygon {
            coordinates: vec![
                vec![
                    vec![0.0, 0.0],
                    vec![4.0, 0.0],
                    vec![4.0, 4.0],
                    vec![0.0, 4.0],
                    vec![0.0, 0.0],
                ],
                vec![
                    vec![1.0, 1.0],
                    vec![2.0, 1.0],
                    vec![2.0, 2.0],
                    vec![1.0, 2.0],
                    vec![1.0, 1.0],
                ],
            ],
        };
        assert!((geom.planar_area() - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_point_has_zero_area() {
        let geom = Geometry::Point {
            coordinates: vec![147.0, -35.0],
        };
        assert_eq!(geom.planar_area(), 0.0);
        assert!(geom.is_point());
        assert!(!geom.is_areal());
    }

    #[test]
    fn test_parse_feature_collection() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]},
                "properties": {}
            }]
        }"#;
        let fc: FeatureCollection = serde_json::from_str(json).unwrap();
        assert_eq!(fc.features.len(), 1);
        assert!(fc.features[0].geometry.is_areal());
    }

    #[test]
    fn test_feature_serializes_without_properties() {
        let feat = Feature::new(Geometry::Point {
            coordinates: vec![1.0, 2.0],
        });
        let json = serde_json::to_string(&feat).unwrap();
        assert!(json.contains(r#""type":"Feature""#));
        assert!(json.contains(r#""Point""#));
        assert!(!json.contains("properties"));
    }

    #[test]
    fn test_positions_with_elevation_parse() {
        let json = r#"{"type": "Point", "coordinates": [147.0, -35.0, 120.5]}"#;
        let geom: Geometry = serde_json::from_str(json).unwrap();
        assert!(geom.is_point());
    }
}
