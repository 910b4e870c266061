use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

use crate::zone::Point;

/// Axis-aligned bounding box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Geometric centre. Used for zone membership and track matching.
    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite())
            && self.w >= 0.0
            && self.h >= 0.0
    }
}

/// One object found in one frame. Does not outlive the inference cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class: ObjectClass,
    /// In [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class: ObjectClass, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class,
            confidence,
            bbox,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

impl ObjectClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Animal => "animal",
            ObjectClass::Package => "package",
            ObjectClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(ObjectClass::Person),
            "vehicle" => Ok(ObjectClass::Vehicle),
            "animal" => Ok(ObjectClass::Animal),
            "package" => Ok(ObjectClass::Package),
            "unknown" => Ok(ObjectClass::Unknown),
            other => Err(anyhow!("unknown object class '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_center_is_geometric_midpoint() {
        let bbox = BoundingBox::new(40.0, 20.0, 20.0, 60.0);
        assert_eq!(bbox.center(), Point::new(50.0, 50.0));
    }

    #[test]
    fn bbox_rejects_non_finite_and_negative_sizes() {
        assert!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_valid());
        assert!(!BoundingBox::new(0.0, 0.0, -1.0, 1.0).is_valid());
    }

    #[test]
    fn object_class_parses_case_insensitively() {
        assert_eq!("Person".parse::<ObjectClass>().unwrap(), ObjectClass::Person);
        assert_eq!(" vehicle ".parse::<ObjectClass>().unwrap(), ObjectClass::Vehicle);
        assert!("face".parse::<ObjectClass>().is_err());
    }
}
