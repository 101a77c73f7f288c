use crate::{Error, Point, Result};

use serde::{Deserialize, Serialize};

/// Numeric storage type of one dimension.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DimType {
    pub fn size(self) -> usize {
        match self {
            DimType::U8 | DimType::I8 => 1,
            DimType::U16 | DimType::I16 => 2,
            DimType::U32 | DimType::I32 | DimType::F32 => 4,
            DimType::U64 | DimType::I64 | DimType::F64 => 8,
        }
    }
}

/// One named dimension at a fixed byte offset within a point record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dimension {
    name: String,
    dim_type: DimType,
    offset: usize,
}

impl Dimension {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim_type(&self) -> DimType {
        self.dim_type
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reads this field from a point record, widened to f64.
    pub fn get(&self, data: &[u8]) -> f64 {
        let o = self.offset;
        macro_rules! le {
            ($t:ty) => {{
                let mut b = [0u8; std::mem::size_of::<$t>()];
                b.copy_from_slice(&data[o..o + std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(b) as f64
            }};
        }
        match self.dim_type {
            DimType::U8 => le!(u8),
            DimType::I8 => le!(i8),
            DimType::U16 => le!(u16),
            DimType::I16 => le!(i16),
            DimType::U32 => le!(u32),
            DimType::I32 => le!(i32),
            DimType::U64 => le!(u64),
            DimType::I64 => le!(i64),
            DimType::F32 => le!(f32),
            DimType::F64 => le!(f64),
        }
    }

    /// Writes an f64 into this field of a point record, narrowing to the
    /// dimension's storage type.
    pub fn set(&self, data: &mut [u8], v: f64) {
        let o = self.offset;
        macro_rules! le {
            ($t:ty) => {
                data[o..o + std::mem::size_of::<$t>()].copy_from_slice(&(v as $t).to_le_bytes())
            };
        }
        match self.dim_type {
            DimType::U8 => le!(u8),
            DimType::I8 => le!(i8),
            DimType::U16 => le!(u16),
            DimType::I16 => le!(i16),
            DimType::U32 => le!(u32),
            DimType::I32 => le!(i32),
            DimType::U64 => le!(u64),
            DimType::I64 => le!(i64),
            DimType::F32 => le!(f32),
            DimType::F64 => le!(f64),
        }
    }
}

/// Serialized form of a dimension: offsets are derived from order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DimSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub dim_type: DimType,
}

/// An ordered sequence of dimensions describing one point record.
///
/// Two schemas are equal when their dimension lists are equal, order
/// included. Dimensions whose names begin with `Omit` are padding used for
/// edge-effect buffering and are stripped by [`Schema::filter_omitted`]
/// before any compatibility check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<DimSpec>", into = "Vec<DimSpec>")]
pub struct Schema {
    dims: Vec<Dimension>,
    point_size: usize,
    /// Indexes of X, Y, Z when all three are present.
    position: Option<[usize; 3]>,
}

impl From<Vec<DimSpec>> for Schema {
    fn from(specs: Vec<DimSpec>) -> Self {
        Schema::new(specs)
    }
}

impl From<Schema> for Vec<DimSpec> {
    fn from(s: Schema) -> Self {
        s.dims
            .into_iter()
            .map(|d| DimSpec {
                name: d.name,
                dim_type: d.dim_type,
            })
            .collect()
    }
}

impl Schema {
    pub fn new<I: IntoIterator<Item = DimSpec>>(specs: I) -> Self {
        let mut dims = Vec::new();
        let mut offset = 0;
        for spec in specs {
            let size = spec.dim_type.size();
            dims.push(Dimension {
                name: spec.name,
                dim_type: spec.dim_type,
                offset,
            });
            offset += size;
        }
        let index = |name: &str| dims.iter().position(|d| d.name == name);
        let position = match (index("X"), index("Y"), index("Z")) {
            (Some(x), Some(y), Some(z)) => Some([x, y, z]),
            _ => None,
        };
        Self {
            dims,
            point_size: offset,
            position,
        }
    }

    /// The conventional native layout: X/Y/Z doubles followed by the given
    /// attribute dimensions.
    pub fn xyz_with<I: IntoIterator<Item = DimSpec>>(extra: I) -> Self {
        let xyz = ["X", "Y", "Z"].into_iter().map(|n| DimSpec {
            name: n.to_string(),
            dim_type: DimType::F64,
        });
        Self::new(xyz.chain(extra))
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    pub fn find(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Strips `Omit`-prefixed padding dimensions, recomputing offsets.
    pub fn filter_omitted(&self) -> Schema {
        Schema::new(
            self.dims
                .iter()
                .filter(|d| !d.name.starts_with("Omit"))
                .map(|d| DimSpec {
                    name: d.name.clone(),
                    dim_type: d.dim_type,
                }),
        )
    }

    /// Reads the position fields of a point record.
    ///
    /// Fails with [`Error::InvalidSchema`] when any of X, Y, Z is absent.
    pub fn point_of(&self, data: &[u8]) -> Result<Point> {
        let [x, y, z] = self
            .position
            .ok_or_else(|| Error::InvalidSchema("schema has no X/Y/Z".to_string()))?;
        Ok(Point::new(
            self.dims[x].get(data),
            self.dims[y].get(data),
            self.dims[z].get(data),
        ))
    }
}

/// A `(scale, offset)` pair mapping native coordinates to tree coordinates.
///
/// Tree space is `(native - offset) / scale`; [`Delta::unscale`] inverts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub scale: Point,
    pub offset: Point,
}

impl Default for Delta {
    fn default() -> Self {
        Self {
            scale: Point::ONE,
            offset: Point::ZERO,
        }
    }
}

impl Delta {
    pub fn new(scale: Point, offset: Point) -> Self {
        Self { scale, offset }
    }

    pub fn is_identity(&self) -> bool {
        self.scale == Point::ONE && self.offset == Point::ZERO
    }

    pub fn scale_point(&self, native: Point) -> Point {
        (native - self.offset) / self.scale
    }

    pub fn unscale_point(&self, tree: Point) -> Point {
        tree * self.scale + self.offset
    }

    pub fn unscale_axis(&self, v: f64, axis: usize) -> f64 {
        v * self.scale[axis] + self.offset[axis]
    }

    pub fn scale_axis(&self, v: f64, axis: usize) -> f64 {
        (v - self.offset[axis]) / self.scale[axis]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(name: &str, t: DimType) -> DimSpec {
        DimSpec {
            name: name.to_string(),
            dim_type: t,
        }
    }

    #[test]
    fn offsets_accumulate() {
        let s = Schema::new([
            spec("X", DimType::F64),
            spec("Intensity", DimType::U16),
            spec("Classification", DimType::U8),
        ]);
        assert_eq!(s.point_size(), 11);
        assert_eq!(s.find("Classification").unwrap().offset(), 10);
    }

    #[test]
    fn field_roundtrip_narrows() {
        let s = Schema::new([spec("Intensity", DimType::U16)]);
        let dim = s.find("Intensity").unwrap();
        let mut rec = vec![0u8; s.point_size()];
        dim.set(&mut rec, 513.0);
        assert_eq!(dim.get(&rec), 513.0);
    }

    #[test]
    fn omit_dimensions_are_padding() {
        let padded = Schema::new([
            spec("X", DimType::F64),
            spec("Omit1", DimType::U32),
            spec("Y", DimType::F64),
        ]);
        let bare = Schema::new([spec("X", DimType::F64), spec("Y", DimType::F64)]);
        assert_ne!(padded, bare);
        assert_eq!(padded.filter_omitted(), bare);
    }

    #[test]
    fn point_extraction_requires_xyz() {
        let s = Schema::xyz_with([]);
        let mut rec = vec![0u8; s.point_size()];
        s.find("Y").unwrap().set(&mut rec, -3.5);
        assert_eq!(s.point_of(&rec).unwrap(), Point::new(0.0, -3.5, 0.0));

        let partial = Schema::new([spec("X", DimType::F64)]);
        assert!(partial.point_of(&[0u8; 8]).is_err());
    }

    #[test]
    fn schema_serde_form_is_specs() {
        let s = Schema::xyz_with([spec("Intensity", DimType::U16)]);
        let json = serde_json::to_string(&s).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.point_size(), 26);
    }

    #[test]
    fn delta_roundtrip() {
        let d = Delta::new(Point::splat(0.01), Point::new(100.0, 200.0, 0.0));
        let native = Point::new(101.5, 203.25, 0.75);
        assert_eq!(d.unscale_point(d.scale_point(native)), native);
    }
}
