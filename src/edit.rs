use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::dataset::{CellValue, ColumnKind, Dataset, build_column};
use crate::domain::SheetError;
use crate::grid::GridModel;
use crate::workbook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn flipped(self) -> Self {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }
}

fn check_row(dataset: &Dataset, index: usize) -> Result<(), SheetError> {
    if index >= dataset.row_count() {
        return Err(SheetError::OutOfRange {
            index,
            len: dataset.row_count(),
        });
    }
    Ok(())
}

fn require_column(dataset: &Dataset, name: &str) -> Result<usize, SheetError> {
    dataset
        .column_index(name)
        .ok_or_else(|| SheetError::NotFound(name.to_string()))
}

/// Inserts one row built from per-column text before or after `position`.
///
/// Each value is coerced to its column's kind. A value that does not coerce is kept
/// verbatim, which turns its column into a text column.
pub fn insert_row<S: AsRef<str>>(
    dataset: &Dataset,
    position: usize,
    values: &[S],
    before: bool,
) -> Result<Dataset, SheetError> {
    check_row(dataset, position)?;
    if values.len() > dataset.column_count() {
        return Err(SheetError::InvalidInput(format!(
            "{} values given for {} columns",
            values.len(),
            dataset.column_count()
        )));
    }

    let names = dataset.column_names();
    let mut kinds = dataset.column_kinds();
    let mut row = Vec::with_capacity(kinds.len());
    for (idx, kind) in kinds.iter_mut().enumerate() {
        let raw = values.get(idx).map(|v| v.as_ref()).unwrap_or("");
        let value = match kind.parse(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("{e}, keeping it as text in column '{}'", names[idx]);
                *kind = ColumnKind::Text;
                CellValue::Text(raw.to_string())
            }
        };
        row.push(value);
    }

    // Promote the columns that received verbatim text before stacking.
    let mut frame = dataset.frame().clone();
    for (idx, kind) in kinds.iter().enumerate() {
        if Some(*kind) != dataset.column_kind(idx) {
            let rendered: Vec<CellValue> = dataset
                .column_values(idx)?
                .into_iter()
                .map(|v| if v.is_missing() { v } else { CellValue::Text(v.to_string()) })
                .collect();
            frame.with_column(build_column(&names[idx], ColumnKind::Text, &rendered)?)?;
        }
    }

    let new_row = DataFrame::new(
        names
            .iter()
            .zip(kinds.iter())
            .zip(row.iter())
            .map(|((name, kind), value)| build_column(name, *kind, std::slice::from_ref(value)))
            .collect::<PolarsResult<Vec<Column>>>()?,
    )?;

    let split = if before { position } else { position + 1 };
    let head = frame.slice(0, split);
    let tail = frame.slice(split as i64, frame.height() - split);
    let stacked = head.vstack(&new_row)?.vstack(&tail)?;
    Ok(Dataset::with_frame(stacked))
}

pub fn remove_row(dataset: &Dataset, index: usize) -> Result<Dataset, SheetError> {
    check_row(dataset, index)?;
    let frame = dataset.frame();
    let head = frame.slice(0, index);
    let tail = frame.slice(index as i64 + 1, frame.height() - index - 1);
    Ok(Dataset::with_frame(head.vstack(&tail)?))
}

/// Appends a text column holding the empty string in every row.
pub fn add_column(dataset: &Dataset, name: &str) -> Result<Dataset, SheetError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SheetError::InvalidInput("column name must not be empty".into()));
    }
    if dataset.column_index(name).is_some() {
        return Err(SheetError::DuplicateName(name.to_string()));
    }
    let blanks = vec![CellValue::Text(String::new()); dataset.row_count()];
    let mut frame = dataset.frame().clone();
    frame.with_column(build_column(name, ColumnKind::Text, &blanks)?)?;
    Ok(Dataset::with_frame(frame))
}

pub fn remove_column(dataset: &Dataset, name: &str) -> Result<Dataset, SheetError> {
    require_column(dataset, name)?;
    Ok(Dataset::with_frame(dataset.frame().drop(name)?))
}

/// Keeps the rows whose display text contains every pattern of `filters` in the
/// filter's column, compared case-insensitively. Missing values never match.
pub fn apply_filters(
    dataset: &Dataset,
    filters: &BTreeMap<String, String>,
) -> Result<Dataset, SheetError> {
    for column in filters.keys() {
        require_column(dataset, column)?;
    }

    let mut current = dataset.clone();
    for (column, pattern) in filters {
        let needle = pattern.to_lowercase();
        let idx = require_column(&current, column)?;
        let mask: BooleanChunked = current
            .display_column(idx)?
            .into_iter()
            .map(|v| v.is_some_and(|s| s.to_lowercase().contains(&needle)))
            .collect();
        current = Dataset::with_frame(current.frame().filter(&mask)?);
        debug!("Filter {column} ~ '{pattern}' keeps {} rows", current.row_count());
    }
    Ok(current)
}

/// Stable sort by one column. Missing values are placed last in both directions.
pub fn sort_by_column(
    dataset: &Dataset,
    name: &str,
    order: SortOrder,
) -> Result<Dataset, SheetError> {
    require_column(dataset, name)?;
    let options = SortMultipleOptions::default()
        .with_order_descending(order == SortOrder::Descending)
        .with_nulls_last(true)
        .with_maintain_order(true);
    let sorted = dataset
        .frame()
        .sort(vec![PlSmallStr::from(name)], options)?;
    Ok(Dataset::with_frame(sorted))
}

/// The dataset a user works on, together with the filter and sort state that
/// belongs to it. Every operation either replaces the dataset or leaves it alone.
pub struct Session {
    grid: GridModel,
    source: Option<PathBuf>,
    loaded: bool,
    filters: BTreeMap<String, String>,
    sort_directions: HashMap<String, SortOrder>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            grid: GridModel::new(Dataset::empty()),
            source: None,
            loaded: false,
            filters: BTreeMap::new(),
            sort_directions: HashMap::new(),
        }
    }

    pub fn with_dataset(dataset: Dataset) -> Self {
        let mut session = Session::new();
        session.replace(dataset);
        session
    }

    pub fn open(&mut self, path: &Path) -> Result<(), SheetError> {
        let start_time = Instant::now();
        let dataset = workbook::read_dataset(path)?;
        info!(
            "Opened {} ({} rows, {} columns) in {}ms",
            path.display(),
            dataset.row_count(),
            dataset.column_count(),
            start_time.elapsed().as_millis()
        );
        self.replace(dataset);
        self.source = Some(path.to_path_buf());
        Ok(())
    }

    fn replace(&mut self, dataset: Dataset) {
        self.grid.reset(dataset);
        self.loaded = true;
        self.filters.clear();
        self.sort_directions.clear();
    }

    pub fn save(&self, path: &Path) -> Result<PathBuf, SheetError> {
        self.require_loaded()?;
        let path = workbook::save_path(path);
        workbook::write_dataset(self.dataset(), &path)?;
        info!("Saved {} rows to {}", self.dataset().row_count(), path.display());
        Ok(path)
    }

    fn require_loaded(&self) -> Result<(), SheetError> {
        if self.loaded { Ok(()) } else { Err(SheetError::NoDataset) }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn dataset(&self) -> &Dataset {
        self.grid.dataset()
    }

    pub fn grid(&self) -> &GridModel {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut GridModel {
        &mut self.grid
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }

    pub fn sort_direction(&self, column: &str) -> Option<SortOrder> {
        self.sort_directions.get(column).copied()
    }

    pub fn insert_row<S: AsRef<str>>(
        &mut self,
        position: usize,
        values: &[S],
        before: bool,
    ) -> Result<(), SheetError> {
        self.require_loaded()?;
        let next = insert_row(self.dataset(), position, values, before)?;
        self.grid.reset(next);
        Ok(())
    }

    pub fn remove_row(&mut self, index: usize) -> Result<(), SheetError> {
        self.require_loaded()?;
        let next = remove_row(self.dataset(), index)?;
        self.grid.reset(next);
        Ok(())
    }

    pub fn add_column(&mut self, name: &str) -> Result<(), SheetError> {
        self.require_loaded()?;
        let next = add_column(self.dataset(), name)?;
        self.grid.reset(next);
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<(), SheetError> {
        self.require_loaded()?;
        let next = remove_column(self.dataset(), name)?;
        self.grid.reset(next);
        self.filters.remove(name);
        self.sort_directions.remove(name);
        Ok(())
    }

    /// Applies `filters` and makes them the active filter mapping. Blank patterns
    /// are dropped, which removes the filter of their column.
    pub fn apply_filters(&mut self, filters: BTreeMap<String, String>) -> Result<(), SheetError> {
        self.require_loaded()?;
        let filters: BTreeMap<String, String> = filters
            .into_iter()
            .map(|(column, pattern)| (column, pattern.trim().to_string()))
            .filter(|(_, pattern)| !pattern.is_empty())
            .collect();
        let next = apply_filters(self.dataset(), &filters).inspect_err(|e| {
            warn!("Applying filters failed: {e}");
        })?;
        self.grid.reset(next);
        self.filters = filters;
        Ok(())
    }

    /// Sorts by `name`, ascending on the first request and flipping afterwards.
    pub fn sort_by_column(&mut self, name: &str) -> Result<SortOrder, SheetError> {
        self.require_loaded()?;
        let order = self
            .sort_directions
            .get(name)
            .map_or(SortOrder::Ascending, |last| last.flipped());
        let next = sort_by_column(self.dataset(), name, order).inspect_err(|e| {
            warn!("Sorting by '{name}' failed: {e}");
        })?;
        self.grid.reset(next);
        self.sort_directions.insert(name.to_string(), order);
        Ok(order)
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::parse_timestamp;

    fn ts(s: &str) -> CellValue {
        CellValue::Timestamp(parse_timestamp(s).unwrap())
    }

    fn sample() -> Dataset {
        Dataset::from_columns([
            ("Date", ColumnKind::Timestamp, vec![ts("2025-01-01"), ts("2025-01-02")]),
            ("Amount", ColumnKind::Integer, vec![CellValue::Integer(10), CellValue::Integer(20)]),
        ])
        .unwrap()
    }

    fn amounts(ds: &Dataset) -> Vec<CellValue> {
        ds.column_values(1).unwrap()
    }

    #[test]
    fn insert_after_last_row() {
        let ds = insert_row(&sample(), 1, &["2025-01-03", "5"], false).unwrap();
        assert_eq!(ds.row_count(), 3);
        assert_eq!(
            ds.column_values(0).unwrap(),
            vec![ts("2025-01-01"), ts("2025-01-02"), ts("2025-01-03")]
        );
        assert_eq!(
            amounts(&ds),
            vec![CellValue::Integer(10), CellValue::Integer(20), CellValue::Integer(5)]
        );
    }

    #[test]
    fn insert_before_first_row() {
        let ds = insert_row(&sample(), 0, &["2024-12-31", "1"], true).unwrap();
        assert_eq!(
            amounts(&ds),
            vec![CellValue::Integer(1), CellValue::Integer(10), CellValue::Integer(20)]
        );
    }

    #[test]
    fn insert_out_of_range_is_rejected() {
        let ds = sample();
        assert!(matches!(
            insert_row(&ds, 2, &["", ""], false),
            Err(SheetError::OutOfRange { index: 2, len: 2 })
        ));
        assert!(insert_row(&Dataset::empty(), 0, &[] as &[&str], true).is_err());
        assert!(matches!(
            insert_row(&ds, 0, &["", "", "extra"], false),
            Err(SheetError::InvalidInput(_))
        ));
    }

    #[test]
    fn insert_with_missing_values() {
        let ds = insert_row(&sample(), 0, &["2025-02-01"], false).unwrap();
        assert_eq!(ds.value(1, 1).unwrap(), CellValue::Missing);
        assert_eq!(ds.column_kind(1), Some(ColumnKind::Integer));
    }

    #[test]
    fn failed_coercion_keeps_text() {
        let ds = insert_row(&sample(), 0, &["2025-02-01", "lots"], false).unwrap();
        assert_eq!(ds.column_kind(0), Some(ColumnKind::Timestamp));
        assert_eq!(ds.column_kind(1), Some(ColumnKind::Text));
        assert_eq!(
            amounts(&ds),
            vec![
                CellValue::Text("10".into()),
                CellValue::Text("lots".into()),
                CellValue::Text("20".into())
            ]
        );
    }

    #[test]
    fn insert_then_remove_restores_rows() {
        let original = sample();
        let inserted = insert_row(&original, 0, &["2025-03-01", "7"], true).unwrap();
        let restored = remove_row(&inserted, 0).unwrap();
        assert!(restored.frame().equals_missing(original.frame()));
    }

    #[test]
    fn remove_row_bounds() {
        let ds = remove_row(&sample(), 0).unwrap();
        assert_eq!(amounts(&ds), vec![CellValue::Integer(20)]);
        assert!(matches!(
            remove_row(&sample(), 7),
            Err(SheetError::OutOfRange { index: 7, .. })
        ));
    }

    #[test]
    fn add_column_fills_empty_text() {
        let ds = add_column(&sample(), " Note ").unwrap();
        assert_eq!(ds.column_names(), vec!["Date", "Amount", "Note"]);
        assert_eq!(ds.column_kind(2), Some(ColumnKind::Text));
        assert_eq!(ds.value(1, 2).unwrap(), CellValue::Text(String::new()));
        assert!(matches!(add_column(&ds, "Amount"), Err(SheetError::DuplicateName(_))));
        assert!(matches!(add_column(&ds, "  "), Err(SheetError::InvalidInput(_))));
    }

    #[test]
    fn remove_column_keeps_others() {
        let ds = remove_column(&sample(), "Date").unwrap();
        assert_eq!(ds.column_names(), vec!["Amount"]);
        assert_eq!(ds.column_kind(0), Some(ColumnKind::Integer));
    }

    #[test]
    fn removing_unknown_column_leaves_dataset_unchanged() {
        let mut session = Session::with_dataset(sample());
        let before = session.dataset().clone();
        assert!(matches!(
            session.remove_column("Ghost"),
            Err(SheetError::NotFound(name)) if name == "Ghost"
        ));
        assert!(session.dataset().frame().equals_missing(before.frame()));
    }

    #[test]
    fn filter_is_case_insensitive_substring() {
        let ds = Dataset::from_columns([(
            "Name",
            ColumnKind::Text,
            vec![
                CellValue::Text("Alpha".into()),
                CellValue::Text("beta".into()),
                CellValue::Missing,
                CellValue::Text("ALPHABET".into()),
            ],
        )])
        .unwrap();
        let filters = BTreeMap::from([("Name".to_string(), "alph".to_string())]);
        let filtered = apply_filters(&ds, &filters).unwrap();
        assert_eq!(
            filtered.column_values(0).unwrap(),
            vec![CellValue::Text("Alpha".into()), CellValue::Text("ALPHABET".into())]
        );
    }

    #[test]
    fn filter_matches_numeric_display_text() {
        let ds = insert_row(&sample(), 1, &["2025-01-03", "5"], false).unwrap();
        let filters = BTreeMap::from([("Amount".to_string(), "2".to_string())]);
        let filtered = apply_filters(&ds, &filters).unwrap();
        assert_eq!(filtered.row_count(), 1);
        assert_eq!(filtered.value(0, 0).unwrap(), ts("2025-01-02"));
    }

    #[test]
    fn filters_narrow_monotonically() {
        let ds = sample();
        let one = BTreeMap::from([("Date".to_string(), "2025".to_string())]);
        let mut two = one.clone();
        two.insert("Amount".to_string(), "1".to_string());

        let first = apply_filters(&ds, &one).unwrap();
        let second = apply_filters(&ds, &two).unwrap();
        assert!(first.row_count() <= ds.row_count());
        assert!(second.row_count() <= first.row_count());
        assert_eq!(second.row_count(), 1);
    }

    #[test]
    fn filter_on_unknown_column_fails() {
        let filters = BTreeMap::from([("Ghost".to_string(), "x".to_string())]);
        assert!(matches!(apply_filters(&sample(), &filters), Err(SheetError::NotFound(_))));
    }

    #[test]
    fn sort_directions_reverse_without_ties() {
        let ds = insert_row(&sample(), 1, &["2025-01-03", "5"], false).unwrap();
        let asc = sort_by_column(&ds, "Amount", SortOrder::Ascending).unwrap();
        let desc = sort_by_column(&ds, "Amount", SortOrder::Descending).unwrap();
        let mut reversed = amounts(&asc);
        reversed.reverse();
        assert_eq!(amounts(&desc), reversed);
        assert_eq!(
            amounts(&asc),
            vec![CellValue::Integer(5), CellValue::Integer(10), CellValue::Integer(20)]
        );
    }

    #[test]
    fn missing_values_sort_last_in_both_directions() {
        let ds = Dataset::from_columns([(
            "n",
            ColumnKind::Float,
            vec![CellValue::Float(2.0), CellValue::Missing, CellValue::Float(1.0)],
        )])
        .unwrap();
        let asc = sort_by_column(&ds, "n", SortOrder::Ascending).unwrap();
        let desc = sort_by_column(&ds, "n", SortOrder::Descending).unwrap();
        assert_eq!(
            asc.column_values(0).unwrap(),
            vec![CellValue::Float(1.0), CellValue::Float(2.0), CellValue::Missing]
        );
        assert_eq!(
            desc.column_values(0).unwrap(),
            vec![CellValue::Float(2.0), CellValue::Float(1.0), CellValue::Missing]
        );
    }

    #[test]
    fn session_sort_toggles_per_column() {
        let mut session = Session::with_dataset(sample());
        session.insert_row(1, &["2025-01-03", "5"], false).unwrap();

        assert_eq!(session.sort_by_column("Amount").unwrap(), SortOrder::Ascending);
        assert_eq!(
            amounts(session.dataset()),
            vec![CellValue::Integer(5), CellValue::Integer(10), CellValue::Integer(20)]
        );
        assert_eq!(session.sort_by_column("Amount").unwrap(), SortOrder::Descending);
        assert_eq!(
            amounts(session.dataset()),
            vec![CellValue::Integer(20), CellValue::Integer(10), CellValue::Integer(5)]
        );
        assert_eq!(session.sort_by_column("Date").unwrap(), SortOrder::Ascending);
        assert_eq!(session.sort_by_column("Amount").unwrap(), SortOrder::Ascending);
    }

    #[test]
    fn session_failed_sort_keeps_state() {
        let mut session = Session::with_dataset(sample());
        assert!(session.sort_by_column("Ghost").is_err());
        assert_eq!(session.sort_direction("Ghost"), None);
    }

    #[test]
    fn session_filters_replace_mapping() {
        let mut session = Session::with_dataset(sample());
        let filters = BTreeMap::from([
            ("Amount".to_string(), " 2 ".to_string()),
            ("Date".to_string(), "   ".to_string()),
        ]);
        session.apply_filters(filters).unwrap();
        assert_eq!(session.dataset().row_count(), 1);
        assert_eq!(
            session.filters(),
            &BTreeMap::from([("Amount".to_string(), "2".to_string())])
        );

        let bad = BTreeMap::from([("Ghost".to_string(), "x".to_string())]);
        assert!(session.apply_filters(bad).is_err());
        assert_eq!(session.filters().len(), 1);
        assert_eq!(session.dataset().row_count(), 1);
    }

    #[test]
    fn session_requires_a_dataset() {
        let mut session = Session::new();
        assert!(matches!(session.add_column("x"), Err(SheetError::NoDataset)));
        assert!(matches!(session.sort_by_column("x"), Err(SheetError::NoDataset)));
    }

    #[test]
    fn session_edits_bump_grid_generation() {
        let mut session = Session::with_dataset(sample());
        let generation = session.grid().generation();
        session.remove_row(0).unwrap();
        assert!(session.grid().generation() > generation);
        let generation = session.grid().generation();
        assert!(session.remove_row(9).is_err());
        assert_eq!(session.grid().generation(), generation);
    }
}
