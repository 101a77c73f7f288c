use crate::{lt_chained, sq_dist, Cell, Error, Key, Result};

use parking_lot::{Mutex, MutexGuard};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Outcome of one tube insertion attempt.
///
/// `remainder` is `None` when the cell was consumed. Otherwise the caller
/// must reinsert the returned cell one depth deeper; because the resident
/// and incoming cells may have been swapped, the returned cell is not
/// necessarily the one passed in.
pub struct Insertion {
    pub delta: i64,
    pub remainder: Option<Box<Cell>>,
}

impl Insertion {
    pub fn done(&self) -> bool {
        self.remainder.is_none()
    }
}

/// A column of cells at one (depth, x, y), keyed by integer z tick.
///
/// After insertion resolves there is exactly one cell per tick; the cell
/// kept at a contested tick is the minimum under squared distance to the
/// node center, ties broken by the chained coordinate order.
#[derive(Default)]
pub struct Tube {
    cells: Mutex<BTreeMap<u64, Box<Cell>>>,
}

impl Tube {
    pub fn insert(&self, key: &Key, mut cell: Box<Cell>) -> Insertion {
        let z = key.position.z;
        let mut cells = self.cells.lock();
        match cells.entry(z) {
            Entry::Vacant(e) => {
                e.insert(cell);
                Insertion {
                    delta: 1,
                    remainder: None,
                }
            }
            Entry::Occupied(mut e) => {
                let curr = e.get_mut();
                if cell.point == curr.point {
                    curr.push(cell);
                    return Insertion {
                        delta: 1,
                        remainder: None,
                    };
                }

                let mid = key.bounds.mid();
                let a = sq_dist(cell.point, mid);
                let b = sq_dist(curr.point, mid);
                if a < b || (a == b && lt_chained(cell.point, curr.point)) {
                    std::mem::swap(curr, &mut cell);
                }
                Insertion {
                    delta: 0,
                    remainder: Some(cell),
                }
            }
        }
    }

    /// Reinstates a decoded cell without running the collision policy.
    ///
    /// Records at an occupied tick must be coordinate-equal stacked
    /// duplicates; anything else means the chunk bytes are inconsistent.
    pub fn restore(&self, z: u64, cell: Box<Cell>) -> Result<()> {
        let mut cells = self.cells.lock();
        match cells.entry(z) {
            Entry::Vacant(e) => {
                e.insert(cell);
                Ok(())
            }
            Entry::Occupied(mut e) => {
                if e.get().point != cell.point {
                    return Err(Error::InvalidChunk(format!(
                        "conflicting cells at tick {z}"
                    )));
                }
                e.get_mut().push(cell);
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }

    pub fn cells(&self) -> MutexGuard<'_, BTreeMap<u64, Box<Cell>>> {
        self.cells.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Bounds, Climber, Point};

    fn root_key() -> Key {
        Climber::new(Bounds::new(Point::splat(-2.0), Point::splat(2.0)))
            .key()
            .clone()
    }

    fn cell(p: Point) -> Box<Cell> {
        Box::new(Cell::new(p, p.x.to_le_bytes().to_vec()))
    }

    #[test]
    fn vacant_tick_consumes() {
        let tube = Tube::default();
        let attempt = tube.insert(&root_key(), cell(Point::new(1.0, 0.0, 0.0)));
        assert!(attempt.done());
        assert_eq!(attempt.delta, 1);
    }

    #[test]
    fn equal_coordinates_stack() {
        let tube = Tube::default();
        let key = root_key();
        tube.insert(&key, cell(Point::ZERO));
        let attempt = tube.insert(&key, cell(Point::ZERO));
        assert!(attempt.done());
        assert_eq!(attempt.delta, 1);
        assert_eq!(tube.cells()[&0].stack_size(), 2);
    }

    #[test]
    fn closer_point_swaps_resident() {
        let tube = Tube::default();
        let key = root_key();
        let far = Point::new(1.0, 1.0, 1.0);
        let near = Point::new(0.5, 0.0, 0.0);

        tube.insert(&key, cell(far));
        let attempt = tube.insert(&key, cell(near));
        assert!(!attempt.done());
        assert_eq!(attempt.delta, 0);
        // The displaced resident comes back for reinsertion deeper.
        assert_eq!(attempt.remainder.unwrap().point, far);
        assert_eq!(tube.cells()[&0].point, near);
    }

    #[test]
    fn equidistant_tie_breaks_on_chained_order() {
        let tube = Tube::default();
        let key = root_key();
        let pos = Point::new(1.0, 0.0, 0.0);
        let neg = Point::new(-1.0, 0.0, 0.0);

        tube.insert(&key, cell(pos));
        let attempt = tube.insert(&key, cell(neg));
        assert!(!attempt.done());
        assert_eq!(attempt.remainder.unwrap().point, pos);
        assert_eq!(tube.cells()[&0].point, neg);
    }

    #[test]
    fn farther_point_bounces() {
        let tube = Tube::default();
        let key = root_key();
        let near = Point::new(0.5, 0.0, 0.0);
        let far = Point::new(1.0, 1.0, 1.0);

        tube.insert(&key, cell(near));
        let attempt = tube.insert(&key, cell(far));
        assert!(!attempt.done());
        assert_eq!(attempt.remainder.unwrap().point, far);
        assert_eq!(tube.cells()[&0].point, near);
    }

    #[test]
    fn restore_rejects_conflicts() {
        let tube = Tube::default();
        tube.restore(3, cell(Point::ZERO)).unwrap();
        tube.restore(3, cell(Point::ZERO)).unwrap();
        assert!(tube.restore(3, cell(Point::ONE)).is_err());
        assert_eq!(tube.cells()[&3].stack_size(), 2);
    }
}
