use std::collections::BTreeMap;

/// Assigns `[start, end)` intervals to the first row they fit in.
///
/// Each row maps interval start to interval end. Intervals sharing a row
/// never overlap; a new row is opened when no existing row has room.
#[derive(Debug, Clone, Default)]
pub struct RowPacker {
    rows: Vec<BTreeMap<i64, i64>>,
}

impl RowPacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn get_row(&mut self, start: i64, end: i64) -> u32 {
        let end = end.max(start);
        let row = self
            .rows
            .iter()
            .position(|row| {
                let next_start = row.range(start..).next().map_or(i64::MAX, |(s, _)| *s);
                let prev_end = row.range(..start).next_back().map_or(i64::MIN, |(_, e)| *e);
                next_start >= end && prev_end <= start
            })
            .unwrap_or_else(|| {
                self.rows.push(BTreeMap::new());
                self.rows.len() - 1
            });

        self.rows[row]
            .entry(start)
            .and_modify(|e| *e = (*e).max(end))
            .or_insert(end);
        row as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlaps_go_to_new_rows() {
        let mut rows = RowPacker::new();
        assert_eq!(rows.get_row(0, 10), 0);
        assert_eq!(rows.get_row(5, 15), 1);
        assert_eq!(rows.get_row(10, 20), 0);
        assert_eq!(rows.get_row(12, 14), 2);
        assert_eq!(rows.get_row(15, 30), 1);
        assert_eq!(rows.row_count(), 3);
    }

    #[test]
    fn test_fills_gap_before_existing_interval() {
        let mut rows = RowPacker::new();
        rows.get_row(100, 200);
        assert_eq!(rows.get_row(0, 100), 0);
        assert_eq!(rows.get_row(50, 150), 1);
        assert_eq!(rows.get_row(200, 210), 0);
    }

    #[test]
    fn test_empty_interval_does_not_shrink_existing() {
        let mut rows = RowPacker::new();
        rows.get_row(10, 50);
        rows.get_row(10, 10);
        assert_eq!(rows.get_row(20, 30), 1);
    }
}
