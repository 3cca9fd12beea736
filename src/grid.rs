use tracing::{debug, trace};

use crate::dataset::Dataset;

/// Row/column addressed view of a [`Dataset`] for a display surface.
///
/// `generation` increases whenever the presented data changes, so a surface can
/// tell when its cached rendering is stale.
#[derive(Debug, Default)]
pub struct GridModel {
    dataset: Dataset,
    generation: u64,
}

impl GridModel {
    pub fn new(dataset: Dataset) -> Self {
        GridModel {
            dataset,
            generation: 0,
        }
    }

    pub fn reset(&mut self, dataset: Dataset) {
        self.dataset = dataset;
        self.generation += 1;
        trace!(
            "Grid reset to {}x{} (generation {})",
            self.dataset.row_count(),
            self.dataset.column_count(),
            self.generation
        );
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn row_count(&self) -> usize {
        self.dataset.row_count()
    }

    pub fn column_count(&self) -> usize {
        self.dataset.column_count()
    }

    pub fn header(&self, column: usize) -> Option<String> {
        self.dataset.column_name(column).map(ToString::to_string)
    }

    pub fn row_label(&self, row: usize) -> String {
        row.to_string()
    }

    /// Display text of a cell, or `None` outside the grid.
    pub fn cell_text(&self, row: usize, column: usize) -> Option<String> {
        self.dataset.value(row, column).ok().map(|v| v.to_string())
    }

    /// Display text of the rows in `rows` of one column.
    pub fn column_window(&self, column: usize, rows: std::ops::Range<usize>) -> Vec<String> {
        let end = rows.end.min(self.row_count());
        let start = rows.start.min(end);
        let window = Dataset::with_frame(self.dataset.frame().slice(start as i64, end - start));
        match window.column_values(column) {
            Ok(values) => values.iter().map(|v| v.to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Parses `raw` as the column's kind and stores it. Returns `false` and leaves
    /// the cell untouched when the address is outside the grid or parsing fails.
    pub fn set_cell(&mut self, row: usize, column: usize, raw: &str) -> bool {
        if row >= self.row_count() {
            return false;
        }
        let Some(kind) = self.dataset.column_kind(column) else {
            return false;
        };
        let value = match kind.parse(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("Rejected edit at {row}:{column}: {e}");
                return false;
            }
        };
        match self.dataset.set_value(row, column, value) {
            Ok(()) => {
                self.generation += 1;
                true
            }
            Err(e) => {
                debug!("Edit at {row}:{column} failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CellValue, ColumnKind, parse_timestamp};

    fn grid() -> GridModel {
        GridModel::new(
            Dataset::from_columns([
                (
                    "When",
                    ColumnKind::Timestamp,
                    vec![
                        CellValue::Timestamp(parse_timestamp("2025-01-01 08:30:00").unwrap()),
                        CellValue::Missing,
                    ],
                ),
                ("Count", ColumnKind::Integer, vec![CellValue::Integer(3), CellValue::Missing]),
                ("Price", ColumnKind::Float, vec![CellValue::Float(1.5), CellValue::Float(2.0)]),
                ("Label", ColumnKind::Text, vec![CellValue::Text("x".into()), CellValue::Missing]),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn presents_cells_as_text() {
        let g = grid();
        assert_eq!(g.row_count(), 2);
        assert_eq!(g.column_count(), 4);
        assert_eq!(g.header(1).as_deref(), Some("Count"));
        assert_eq!(g.header(9), None);
        assert_eq!(g.row_label(1), "1");
        assert_eq!(g.cell_text(0, 0).as_deref(), Some("2025-01-01 08:30:00"));
        assert_eq!(g.cell_text(1, 0).as_deref(), Some(""));
        assert_eq!(g.cell_text(1, 1).as_deref(), Some(""));
        assert_eq!(g.cell_text(1, 2).as_deref(), Some("2.0"));
        assert_eq!(g.cell_text(1, 3).as_deref(), Some(""));
        assert_eq!(g.cell_text(2, 0), None);
        assert_eq!(g.column_window(2, 1..10), vec!["2.0".to_string()]);
    }

    #[test]
    fn column_window_covers_only_the_requested_rows() {
        let g = GridModel::new(
            Dataset::from_columns([(
                "N",
                ColumnKind::Integer,
                (0..6).map(CellValue::Integer).collect(),
            )])
            .unwrap(),
        );
        assert_eq!(g.column_window(0, 2..4), vec!["2".to_string(), "3".to_string()]);
        assert_eq!(g.column_window(0, 5..9), vec!["5".to_string()]);
        assert!(g.column_window(0, 7..9).is_empty());
        assert!(g.column_window(3, 0..2).is_empty());
    }

    #[test]
    fn typed_edits() {
        let mut g = grid();
        assert!(g.set_cell(1, 0, "2025-03-04 05:06:07"));
        assert_eq!(g.cell_text(1, 0).as_deref(), Some("2025-03-04 05:06:07"));
        assert!(g.set_cell(0, 1, "12"));
        assert_eq!(g.cell_text(0, 1).as_deref(), Some("12"));
        assert!(g.set_cell(0, 1, ""));
        assert_eq!(g.cell_text(0, 1).as_deref(), Some(""));
        assert!(g.set_cell(0, 2, "7.25"));
        assert_eq!(g.cell_text(0, 2).as_deref(), Some("7.25"));
        assert!(g.set_cell(1, 3, "free text"));
        assert_eq!(g.cell_text(1, 3).as_deref(), Some("free text"));
    }

    #[test]
    fn rejected_edits_leave_cells_unchanged() {
        let mut g = grid();
        let generation = g.generation();
        assert!(!g.set_cell(0, 1, "three"));
        assert!(!g.set_cell(0, 0, "not a date"));
        assert!(!g.set_cell(5, 1, "1"));
        assert!(!g.set_cell(0, 9, "1"));
        assert_eq!(g.cell_text(0, 1).as_deref(), Some("3"));
        assert_eq!(g.generation(), generation);
    }
}
