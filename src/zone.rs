//! Zone geometry and membership.
//!
//! Coordinates are in the owning camera's native frame pixel space. Points on
//! a zone's boundary count as inside for both rectangles and polygons.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::rules::RuleConfig;
use crate::{invalid, CameraId, ZoneId};

/// Tolerance for the on-boundary test, in pixels.
const BOUNDARY_EPSILON: f32 = 1e-3;

/// 2-D point. Serialized as `[x, y]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f32, f32)", into = "(f32, f32)")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

impl From<Point> for (f32, f32) {
    fn from(point: Point) -> Self {
        (point.x, point.y)
    }
}

/// Zone shape: `{"kind": "rectangle", "points": [[0,0],[100,100]]}`.
///
/// Points are kept as given so that a malformed shape can still be
/// represented and rejected by `validate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "points", rename_all = "lowercase")]
pub enum Geometry {
    /// Ordered vertices, at least 3.
    Polygon(Vec<Point>),
    /// Two opposite corners, in any order.
    Rectangle(Vec<Point>),
}

impl Geometry {
    pub fn rectangle(a: Point, b: Point) -> Self {
        Geometry::Rectangle(vec![a, b])
    }

    pub fn polygon(points: Vec<Point>) -> Self {
        Geometry::Polygon(points)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Polygon(_) => "polygon",
            Geometry::Rectangle(_) => "rectangle",
        }
    }

    pub fn points(&self) -> &[Point] {
        match self {
            Geometry::Polygon(points) | Geometry::Rectangle(points) => points,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.points().iter().find(|p| !p.is_finite()) {
            return invalid(
                "zone.points",
                format!("non-finite coordinate ({}, {})", bad.x, bad.y),
            );
        }
        match self {
            Geometry::Polygon(points) => {
                if points.len() < 3 {
                    return invalid(
                        "zone.points",
                        format!("polygon needs at least 3 points, got {}", points.len()),
                    );
                }
                if polygon_area(points).abs() <= f32::EPSILON {
                    return invalid("zone.points", "polygon has zero area");
                }
            }
            Geometry::Rectangle(points) => {
                if points.len() != 2 {
                    return invalid(
                        "zone.points",
                        format!("rectangle needs exactly 2 corners, got {}", points.len()),
                    );
                }
                if points[0].x == points[1].x || points[0].y == points[1].y {
                    return invalid("zone.points", "rectangle has zero area");
                }
            }
        }
        Ok(())
    }

    /// Membership test. Malformed geometry contains nothing.
    pub fn contains(&self, point: Point) -> bool {
        match self {
            Geometry::Rectangle(corners) => {
                let [a, b] = corners.as_slice() else {
                    return false;
                };
                let (min_x, max_x) = (a.x.min(b.x), a.x.max(b.x));
                let (min_y, max_y) = (a.y.min(b.y), a.y.max(b.y));
                point.x >= min_x && point.x <= max_x && point.y >= min_y && point.y <= max_y
            }
            Geometry::Polygon(vertices) => {
                if vertices.len() < 3 {
                    return false;
                }
                on_boundary(vertices, point) || ray_cast(vertices, point)
            }
        }
    }
}

fn polygon_area(points: &[Point]) -> f32 {
    let n = points.len();
    let twice: f32 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice / 2.0
}

fn edges(vertices: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = vertices.len();
    (0..n).map(move |i| (vertices[i], vertices[(i + 1) % n]))
}

fn on_boundary(vertices: &[Point], p: Point) -> bool {
    edges(vertices).any(|(a, b)| {
        let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
        let length = a.distance(&b).max(f32::EPSILON);
        if (cross / length).abs() > BOUNDARY_EPSILON {
            return false;
        }
        p.x >= a.x.min(b.x) - BOUNDARY_EPSILON
            && p.x <= a.x.max(b.x) + BOUNDARY_EPSILON
            && p.y >= a.y.min(b.y) - BOUNDARY_EPSILON
            && p.y <= a.y.max(b.y) + BOUNDARY_EPSILON
    })
}

fn ray_cast(vertices: &[Point], p: Point) -> bool {
    let mut inside = false;
    for (a, b) in edges(vertices) {
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

/// A configured region of one camera's frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub camera_id: CameraId,
    pub name: String,
    pub geometry: Geometry,
    pub rules: RuleConfig,
}

impl Zone {
    /// Write-time validation: everything an upsert must reject.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return invalid("zone.name", "must not be empty");
        }
        self.geometry.validate()?;
        self.rules.validate()
    }

    pub fn contains(&self, point: Point) -> bool {
        self.geometry.contains(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValidationError;

    fn p(x: f32, y: f32) -> Point {
        Point::new(x, y)
    }

    fn square() -> Geometry {
        Geometry::polygon(vec![p(0.0, 0.0), p(100.0, 0.0), p(100.0, 100.0), p(0.0, 100.0)])
    }

    #[test]
    fn rectangle_contains_interior_and_boundary() {
        let rect = Geometry::rectangle(p(100.0, 100.0), p(0.0, 0.0));
        assert!(rect.contains(p(50.0, 50.0)));
        assert!(rect.contains(p(0.0, 50.0)));
        assert!(rect.contains(p(100.0, 100.0)));
        assert!(!rect.contains(p(100.1, 50.0)));
    }

    #[test]
    fn polygon_ray_casting_with_boundary_inside() {
        let triangle = Geometry::polygon(vec![p(0.0, 0.0), p(100.0, 0.0), p(0.0, 100.0)]);
        assert!(triangle.contains(p(10.0, 10.0)));
        assert!(triangle.contains(p(50.0, 50.0)));
        assert!(triangle.contains(p(0.0, 0.0)));
        assert!(!triangle.contains(p(60.0, 60.0)));

        let square = square();
        assert!(square.contains(p(100.0, 40.0)));
        assert!(square.contains(p(40.0, 0.0)));
        assert!(!square.contains(p(-0.5, 40.0)));
    }

    #[test]
    fn concave_polygon_notch_is_outside() {
        // "U" shape open at the top between x=40..60.
        let u = Geometry::polygon(vec![
            p(0.0, 0.0),
            p(40.0, 0.0),
            p(40.0, 60.0),
            p(60.0, 60.0),
            p(60.0, 0.0),
            p(100.0, 0.0),
            p(100.0, 100.0),
            p(0.0, 100.0),
        ]);
        assert!(!u.contains(p(50.0, 30.0)));
        assert!(u.contains(p(20.0, 30.0)));
        assert!(u.contains(p(50.0, 80.0)));
    }

    #[test]
    fn validation_rejects_malformed_shapes() {
        let cases = [
            Geometry::polygon(vec![p(0.0, 0.0), p(1.0, 1.0)]),
            Geometry::Rectangle(vec![p(0.0, 0.0)]),
            Geometry::Rectangle(vec![p(0.0, 0.0), p(0.0, 10.0)]),
            Geometry::polygon(vec![p(0.0, 0.0), p(1.0, 1.0), p(2.0, 2.0)]),
            Geometry::polygon(vec![p(0.0, 0.0), p(f32::NAN, 1.0), p(2.0, 0.0)]),
        ];
        for geometry in cases {
            let err = geometry.validate().unwrap_err();
            let validation = err.downcast_ref::<ValidationError>().expect("validation error");
            assert_eq!(validation.field, "zone.points");
        }
        assert!(square().validate().is_ok());
    }

    #[test]
    fn malformed_geometry_contains_nothing() {
        let degenerate = Geometry::polygon(vec![p(0.0, 0.0), p(10.0, 10.0)]);
        assert!(!degenerate.contains(p(5.0, 5.0)));
    }

    #[test]
    fn geometry_serializes_as_kind_and_point_pairs() -> Result<()> {
        let rect: Geometry =
            serde_json::from_str(r#"{"kind":"rectangle","points":[[0,0],[100,100]]}"#)?;
        assert_eq!(rect, Geometry::rectangle(p(0.0, 0.0), p(100.0, 100.0)));
        let json = serde_json::to_value(&square())?;
        assert_eq!(json["kind"], "polygon");
        assert_eq!(json["points"][2][0], 100.0);
        Ok(())
    }
}
