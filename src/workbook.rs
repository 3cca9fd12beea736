use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use calamine::{Data, Range, Reader, Sheets, Xls, Xlsx, open_workbook};
use polars::prelude::*;
use rayon::prelude::*;
use rust_xlsxwriter::{
    Format, Table, TableColumn, TableFunction, TableStyle, Workbook, Worksheet,
};
use tracing::{debug, info, trace};

use crate::dataset::{CellValue, ColumnKind, Dataset, build_column, parse_timestamp};
use crate::domain::SheetError;

pub const SHEET_NAME: &str = "Spreadsheet";
pub const TABLE_NAME: &str = "Table1";
const DATETIME_NUM_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";
const COLUMN_WIDTH_MARGIN: usize = 2;
const EMPTY_CELL: &Data = &Data::Empty;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FileType {
    XLSX,
    XLS,
    CSV,
}

fn detect_file_type(path: &Path) -> Result<FileType, SheetError> {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_uppercase())
        .as_deref()
    {
        Some("XLSX") => Ok(FileType::XLSX),
        Some("XLS") => Ok(FileType::XLS),
        Some("CSV") => Ok(FileType::CSV),
        _ => Err(SheetError::UnknownFileType(path.to_path_buf())),
    }
}

fn check_file(path: &Path) -> Result<FileType, SheetError> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => SheetError::FileNotFound(path.to_path_buf()),
        ErrorKind::PermissionDenied => SheetError::PermissionDenied(path.to_path_buf()),
        _ => SheetError::read(path, e),
    })?;
    if !metadata.is_file() {
        return Err(SheetError::read(path, "not a file"));
    }
    detect_file_type(path)
}

/// Destination used when saving: `.xlsx` is appended unless already present.
pub fn save_path(path: &Path) -> PathBuf {
    let has_extension = path
        .extension()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.eq_ignore_ascii_case("xlsx"));
    if has_extension {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_os_string();
        name.push(".xlsx");
        PathBuf::from(name)
    }
}

/// Reads the first sheet of a workbook, or a CSV file.
pub fn read_dataset(path: &Path) -> Result<Dataset, SheetError> {
    if check_file(path)? == FileType::CSV {
        return load_csv(path);
    }
    let mut sheets = read_sheets(path)?;
    if sheets.is_empty() {
        return Err(SheetError::read(path, "workbook contains no sheets"));
    }
    Ok(sheets.swap_remove(0).1)
}

/// Reads every sheet of a workbook, in workbook order.
pub fn read_sheets(path: &Path) -> Result<Vec<(String, Dataset)>, SheetError> {
    let start_time = Instant::now();
    let mut workbook = match check_file(path)? {
        FileType::XLSX => Sheets::Xlsx(
            open_workbook::<Xlsx<_>, _>(path).map_err(|e| SheetError::read(path, e))?,
        ),
        FileType::XLS => Sheets::Xls(
            open_workbook::<Xls<_>, _>(path).map_err(|e| SheetError::read(path, e))?,
        ),
        FileType::CSV => {
            return Err(SheetError::read(path, "a CSV file has no sheets"));
        }
    };

    let table_bodies = table_bodies(&mut workbook).map_err(|e| SheetError::read(path, e))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| SheetError::read(path, format!("sheet '{name}': {e}")))?;
        // A table below the header row declares how many body rows the sheet has,
        // including trailing rows left entirely blank.
        let declared_rows = range
            .start()
            .and_then(|(header_row, _)| table_bodies.get(&(name.clone(), header_row + 1)))
            .copied()
            .unwrap_or(0);
        let dataset =
            dataset_from_range(&range, declared_rows).map_err(|e| SheetError::read(path, e))?;
        debug!(
            "Sheet '{name}': {} rows, {:?}",
            dataset.row_count(),
            dataset.column_kinds()
        );
        sheets.push((name, dataset));
    }
    info!(
        "Read {} sheet(s) from {} in {}ms",
        sheets.len(),
        path.display(),
        start_time.elapsed().as_millis()
    );
    Ok(sheets)
}

/// Body row counts of the tables in an xlsx workbook, keyed by sheet and first body row.
fn table_bodies<RS: std::io::Read + std::io::Seek>(
    workbook: &mut Sheets<RS>,
) -> Result<HashMap<(String, u32), usize>, calamine::XlsxError> {
    let mut bodies = HashMap::new();
    let Sheets::Xlsx(xlsx) = workbook else {
        return Ok(bodies);
    };
    xlsx.load_tables()?;
    let names: Vec<String> = xlsx.table_names().into_iter().cloned().collect();
    for name in names {
        let table = xlsx.table_by_name(&name)?;
        if let Some((first_row, _)) = table.data().start() {
            trace!("Table '{name}' has {} body rows", table.data().height());
            bodies.insert(
                (table.sheet_name().to_string(), first_row),
                table.data().height(),
            );
        }
    }
    Ok(bodies)
}

fn load_csv(path: &Path) -> Result<Dataset, SheetError> {
    let frame = LazyCsvReader::new(PlPath::Local(path.into()))
        .with_has_header(true)
        .with_try_parse_dates(true)
        .finish()
        .and_then(|lf| lf.collect())
        .map_err(|e| SheetError::read(path, e))?;
    Dataset::from_frame(frame)
}

/// Converts a worksheet range into a dataset. The first row holds the headers.
/// The body is padded with blank rows up to `declared_rows`.
fn dataset_from_range(range: &Range<Data>, declared_rows: usize) -> Result<Dataset, SheetError> {
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Dataset::empty());
    };
    let mut body: Vec<&[Data]> = rows.collect();
    if body.len() < declared_rows {
        let blank: &[Data] = &[];
        body.resize(declared_rows, blank);
    }
    let headers = header_names(header_row);

    // Each column is inferred and converted in its own task.
    let columns = headers
        .par_iter()
        .enumerate()
        .map(|(idx, name)| {
            let cells: Vec<&Data> = body
                .iter()
                .map(|row| row.get(idx).unwrap_or(EMPTY_CELL))
                .collect();
            let kind = infer_kind(&cells);
            let values: Vec<CellValue> = cells.iter().map(|c| cell_value(c, kind)).collect();
            trace!("Column '{name}' inferred as {kind}");
            build_column(name, kind, &values)
        })
        .collect::<PolarsResult<Vec<Column>>>()?;

    Ok(Dataset::with_frame(DataFrame::new(columns)?))
}

/// Header labels with blanks named after their position and repeats suffixed.
fn header_names(row: &[Data]) -> Vec<String> {
    let mut seen = HashSet::new();
    row.iter()
        .enumerate()
        .map(|(idx, cell)| {
            let base = match data_text(cell) {
                Some(text) if !text.trim().is_empty() => text,
                _ => format!("Unnamed: {idx}"),
            };
            let mut name = base.clone();
            let mut suffix = 1;
            while !seen.insert(name.clone()) {
                name = format!("{base}.{suffix}");
                suffix += 1;
            }
            name
        })
        .collect()
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.is_empty(),
        _ => false,
    }
}

fn data_timestamp(cell: &Data) -> Option<chrono::NaiveDateTime> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime(),
        Data::DateTimeIso(s) => parse_timestamp(s),
        _ => None,
    }
}

/// Picks the narrowest kind that holds every non-empty cell of a column.
fn infer_kind(cells: &[&Data]) -> ColumnKind {
    let filled: Vec<&Data> = cells.iter().copied().filter(|c| !is_blank(c)).collect();
    if filled.is_empty() {
        return ColumnKind::Text;
    }
    let numeric = filled
        .iter()
        .all(|c| matches!(c, Data::Int(_) | Data::Float(_)));
    if numeric {
        let integral = filled.iter().all(|c| match c {
            Data::Float(f) => f.fract() == 0.0 && f.abs() < i64::MAX as f64,
            _ => true,
        });
        return if integral {
            ColumnKind::Integer
        } else {
            ColumnKind::Float
        };
    }
    if filled.iter().all(|c| data_timestamp(c).is_some()) {
        return ColumnKind::Timestamp;
    }
    ColumnKind::Text
}

/// Text form of a cell as it appears in a text column.
fn data_text(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::Empty => return None,
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => CellValue::Float(*f).to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => format!("#{e:?}"),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) => CellValue::Timestamp(ts).to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    };
    Some(text)
}

fn cell_value(cell: &Data, kind: ColumnKind) -> CellValue {
    if is_blank(cell) {
        return CellValue::Missing;
    }
    match kind {
        ColumnKind::Integer => match cell {
            Data::Int(n) => CellValue::Integer(*n),
            Data::Float(f) => CellValue::Integer(*f as i64),
            _ => CellValue::Missing,
        },
        ColumnKind::Float => match cell {
            Data::Int(n) => CellValue::Float(*n as f64),
            Data::Float(f) => CellValue::Float(*f),
            _ => CellValue::Missing,
        },
        ColumnKind::Timestamp => data_timestamp(cell).map_or(CellValue::Missing, CellValue::Timestamp),
        ColumnKind::Text => data_text(cell).map_or(CellValue::Missing, CellValue::Text),
    }
}

/// The trailing totals row of a table.
#[derive(Debug, Clone)]
pub struct TotalsRow {
    pub label: String,
    pub sum_columns: Vec<usize>,
}

impl TotalsRow {
    /// The label goes in the first column that is not summed.
    pub fn label_column(&self, column_count: usize) -> Option<usize> {
        (0..column_count).find(|idx| !self.sum_columns.contains(idx))
    }
}

/// How a dataset is laid out as a worksheet table.
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub table_name: String,
    pub totals: Option<TotalsRow>,
    pub autofit: bool,
}

impl Default for TableLayout {
    fn default() -> Self {
        TableLayout {
            table_name: TABLE_NAME.to_string(),
            totals: None,
            autofit: false,
        }
    }
}

/// Writes `dataset` as the single sheet of a new workbook at `path`.
pub fn write_dataset(dataset: &Dataset, path: &Path) -> Result<(), SheetError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(SHEET_NAME)
        .map_err(|e| SheetError::write(path, e))?;
    write_table(worksheet, dataset, &TableLayout::default()).map_err(|e| SheetError::write(path, e))?;
    workbook.save(path).map_err(|e| SheetError::write(path, e))?;
    Ok(())
}

/// Writes header, data and an optional totals row, then covers them with a styled table.
pub fn write_table(
    worksheet: &mut Worksheet,
    dataset: &Dataset,
    layout: &TableLayout,
) -> Result<(), SheetError> {
    let names = dataset.column_names();
    if names.is_empty() {
        return Ok(());
    }
    let header_format = Format::new().set_bold();
    let datetime_format = Format::new().set_num_format(DATETIME_NUM_FORMAT);

    for (col, name) in names.iter().enumerate() {
        let col16 = col as u16;
        worksheet.write_string_with_format(0, col16, name, &header_format)?;
        for (row, value) in dataset.column_values(col)?.iter().enumerate() {
            let row32 = row as u32 + 1;
            match value {
                CellValue::Missing => {}
                CellValue::Integer(n) => {
                    worksheet.write_number(row32, col16, *n as f64)?;
                }
                CellValue::Float(f) => {
                    worksheet.write_number(row32, col16, *f)?;
                }
                CellValue::Timestamp(ts) => {
                    worksheet.write_datetime_with_format(row32, col16, ts, &datetime_format)?;
                }
                CellValue::Text(s) => {
                    worksheet.write_string(row32, col16, s)?;
                }
            }
        }
    }

    let data_rows = dataset.row_count() as u32;
    // A table needs at least one body row, so a bare header stays plain cells.
    if data_rows > 0 || layout.totals.is_some() {
        let mut columns: Vec<TableColumn> = names
            .iter()
            .map(|name| {
                TableColumn::new()
                    .set_header(name)
                    .set_header_format(header_format.clone())
            })
            .collect();

        let mut last_row = data_rows.max(1);
        let mut table = Table::new()
            .set_name(&layout.table_name)
            .set_style(TableStyle::Medium9)
            .set_banded_rows(true);

        if let Some(totals) = &layout.totals {
            last_row += 1;
            let label_column = totals.label_column(columns.len());
            for (idx, column) in columns.iter_mut().enumerate() {
                if totals.sum_columns.contains(&idx) {
                    *column = column.clone().set_total_function(TableFunction::Sum);
                } else if Some(idx) == label_column {
                    *column = column.clone().set_total_label(&totals.label);
                }
            }
            table = table.set_total_row(true);
        }
        table = table.set_columns(&columns);

        let last_col = (names.len() - 1) as u16;
        worksheet.add_table(0, 0, last_row, last_col, &table)?;
        trace!("Table '{}' spans A1 to row {}", layout.table_name, last_row + 1);
    }

    if layout.autofit {
        for (col, width) in autofit_widths(dataset, layout.totals.as_ref())?.iter().enumerate() {
            worksheet.set_column_width(col as u16, *width as f64)?;
        }
    }
    Ok(())
}

/// Width of each column: its longest header, value or totals label, plus a margin.
pub(crate) fn autofit_widths(
    dataset: &Dataset,
    totals: Option<&TotalsRow>,
) -> Result<Vec<usize>, SheetError> {
    let mut widths = Vec::with_capacity(dataset.column_count());
    for (col, name) in dataset.column_names().iter().enumerate() {
        let longest = dataset
            .display_column(col)?
            .iter()
            .flatten()
            .map(|s| s.chars().count())
            .max()
            .unwrap_or(0);
        widths.push(name.chars().count().max(longest));
    }
    if let Some(totals) = totals
        && let Some(col) = totals.label_column(widths.len())
    {
        widths[col] = widths[col].max(totals.label.chars().count());
    }
    Ok(widths.into_iter().map(|w| w + COLUMN_WIDTH_MARGIN).collect())
}
