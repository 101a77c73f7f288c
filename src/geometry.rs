use float_ord::FloatOrd;
use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A 3D sample position in tree (scaled) coordinates.
pub type Point = DVec3;

pub fn sq_dist(a: Point, b: Point) -> f64 {
    (a - b).length_squared()
}

/// Chained lexicographic order on points: x, then y, then z.
///
/// Total order (via [`FloatOrd`]) so that tie-breaks between equidistant
/// points are deterministic regardless of insertion order.
pub fn lt_chained(a: Point, b: Point) -> bool {
    let ord = FloatOrd(a.x)
        .cmp(&FloatOrd(b.x))
        .then(FloatOrd(a.y).cmp(&FloatOrd(b.y)))
        .then(FloatOrd(a.z).cmp(&FloatOrd(b.z)));
    ord == Ordering::Less
}

/// One of the eight octants of a cubic region, encoded in 3 bits.
///
/// Bit 0 is set when the target lies at or above the midpoint in x, bit 1
/// for y, bit 2 for z.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dir(u8);

impl Dir {
    pub fn new(x: bool, y: bool, z: bool) -> Self {
        Self(x as u8 | (y as u8) << 1 | (z as u8) << 2)
    }

    pub fn x(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn y(self) -> bool {
        self.0 & 2 != 0
    }

    pub fn z(self) -> bool {
        self.0 & 4 != 0
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

/// An axis-aligned box with `min <= max` per axis.
///
/// Containment is half-open: a point on the `max` face is outside. The root
/// bounds of a tree is always cubic, so every octant descent stays cubic.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    min: Point,
    max: Point,
}

impl Bounds {
    pub fn new(min: Point, max: Point) -> Self {
        assert!(
            min.x <= max.x && min.y <= max.y && min.z <= max.z,
            "inverted bounds"
        );
        Self { min, max }
    }

    /// The maximal bounds, used as the default query region.
    pub fn everything() -> Self {
        Self {
            min: Point::splat(f64::MIN),
            max: Point::splat(f64::MAX),
        }
    }

    pub fn min(&self) -> Point {
        self.min
    }

    pub fn max(&self) -> Point {
        self.max
    }

    pub fn mid(&self) -> Point {
        (self.min + self.max) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn is_cubic(&self) -> bool {
        let e = self.max - self.min;
        e.x == e.y && e.y == e.z
    }

    /// Grows this box into the smallest enclosing cube centered on its mid.
    pub fn cubeify(&self) -> Self {
        let mid = self.mid();
        let half = (self.max - self.min).max_element() / 2.0;
        Self {
            min: mid - Point::splat(half),
            max: mid + Point::splat(half),
        }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x
            && p.x < self.max.x
            && p.y >= self.min.y
            && p.y < self.max.y
            && p.z >= self.min.z
            && p.z < self.max.z
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    /// The octant of this point relative to our midpoint.
    pub fn dir(&self, p: Point) -> Dir {
        let mid = self.mid();
        Dir::new(p.x >= mid.x, p.y >= mid.y, p.z >= mid.z)
    }

    /// Descends into one of the eight octants.
    pub fn go(&self, dir: Dir) -> Bounds {
        let mid = self.mid();
        let pick = |low: bool, min, mid, max| if low { (min, mid) } else { (mid, max) };
        let (min_x, max_x) = pick(!dir.x(), self.min.x, mid.x, self.max.x);
        let (min_y, max_y) = pick(!dir.y(), self.min.y, mid.y, self.max.y);
        let (min_z, max_z) = pick(!dir.z(), self.min.z, mid.z, self.max.z);
        Bounds {
            min: Point::new(min_x, min_y, min_z),
            max: Point::new(max_x, max_y, max_z),
        }
    }
}
