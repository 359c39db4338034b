//! Forwarded-offset bookkeeping across the peer mesh.
//!
//! For every `(origin, forwarding peer)` pair the matrix tracks the highest
//! change-log file index already forwarded, so recovery never re-propagates
//! whole segments a peer has already seen.
//!
//! The key set is fixed when the engine is constructed from the configured
//! peer set; after that only cell values change. Cells are atomics, so the
//! sending loops advance them without taking the registry lock. If peers
//! could join at runtime this shape would have to become a concurrent map;
//! the cluster model keeps membership static per process lifetime, and
//! [`RecoverOffsetMatrix::advance`] treats an unknown pair as a no-op (the
//! cost is redundant re-forwarding, which the freshness check absorbs).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Fixed-shape table of per-(origin, peer) high-water file indices.
pub struct RecoverOffsetMatrix {
    cells: HashMap<i32, HashMap<i32, AtomicU64>>,
}

impl RecoverOffsetMatrix {
    /// Build the full origin × peer table over `server_ids`.
    ///
    /// Every ordered pair gets a cell (the diagonal included; loop prevention
    /// means diagonal cells simply never advance).
    pub fn new(server_ids: &[i32]) -> Self {
        let mut cells = HashMap::with_capacity(server_ids.len());
        for &origin in server_ids {
            let row = server_ids
                .iter()
                .map(|&peer| (peer, AtomicU64::new(0)))
                .collect();
            cells.insert(origin, row);
        }
        Self { cells }
    }

    /// Raise the high-water mark for `(origin, peer)` to `file_number` if it
    /// is higher than the stored value. Monotonic: never decreases.
    pub fn advance(&self, origin: i32, peer: i32, file_number: u64) {
        match self.cells.get(&origin).and_then(|row| row.get(&peer)) {
            Some(cell) => {
                cell.fetch_max(file_number, Ordering::AcqRel);
            }
            None => {
                // Unknown pair: membership changed outside the configured set.
                warn!(origin, peer, file_number, "offset matrix has no cell for pair");
            }
        }
    }

    /// Highest file index forwarded for `(origin, peer)`, or `None` for an
    /// unknown pair.
    pub fn get(&self, origin: i32, peer: i32) -> Option<u64> {
        self.cells
            .get(&origin)
            .and_then(|row| row.get(&peer))
            .map(|cell| cell.load(Ordering::Acquire))
    }

    /// Server ids the matrix was built over.
    pub fn server_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.cells.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_zero() {
        let matrix = RecoverOffsetMatrix::new(&[1, 2, 3]);
        assert_eq!(matrix.get(1, 2), Some(0));
        assert_eq!(matrix.get(3, 1), Some(0));
    }

    #[test]
    fn test_advance_raises_high_water() {
        let matrix = RecoverOffsetMatrix::new(&[1, 2]);
        matrix.advance(1, 2, 5);
        assert_eq!(matrix.get(1, 2), Some(5));
        matrix.advance(1, 2, 9);
        assert_eq!(matrix.get(1, 2), Some(9));
    }

    #[test]
    fn test_advance_never_decreases() {
        let matrix = RecoverOffsetMatrix::new(&[1, 2]);
        matrix.advance(1, 2, 9);
        matrix.advance(1, 2, 4);
        assert_eq!(matrix.get(1, 2), Some(9));
    }

    #[test]
    fn test_pairs_are_independent() {
        let matrix = RecoverOffsetMatrix::new(&[1, 2, 3]);
        matrix.advance(1, 2, 7);
        assert_eq!(matrix.get(2, 1), Some(0));
        assert_eq!(matrix.get(1, 3), Some(0));
    }

    #[test]
    fn test_unknown_pair_is_noop() {
        let matrix = RecoverOffsetMatrix::new(&[1, 2]);
        matrix.advance(1, 99, 7);
        assert_eq!(matrix.get(1, 99), None);
        // Known cells unaffected.
        assert_eq!(matrix.get(1, 2), Some(0));
    }

    #[test]
    fn test_server_ids_sorted() {
        let matrix = RecoverOffsetMatrix::new(&[3, 1, 2]);
        assert_eq!(matrix.server_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_advance_keeps_max() {
        let matrix = Arc::new(RecoverOffsetMatrix::new(&[1, 2]));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let matrix = Arc::clone(&matrix);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u64 {
                    matrix.advance(1, 2, t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(matrix.get(1, 2), Some(3999));
    }
}
