use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::trace;

use crate::domain::SheetError;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// Accepted when parsing timestamps typed by a user or stored as text in a workbook.
const DATETIME_INPUT_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];
const DATE_INPUT_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Timestamp,
    Text,
}

impl ColumnKind {
    /// The dtype a column of this kind is stored as.
    pub fn dtype(&self) -> DataType {
        match self {
            ColumnKind::Integer => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Timestamp => DataType::Datetime(TimeUnit::Milliseconds, None),
            ColumnKind::Text => DataType::String,
        }
    }

    pub fn from_dtype(dtype: &DataType) -> Self {
        match dtype {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnKind::Integer,
            DataType::Float32 | DataType::Float64 => ColumnKind::Float,
            DataType::Date | DataType::Datetime(_, _) => ColumnKind::Timestamp,
            _ => ColumnKind::Text,
        }
    }

    /// Coerces raw text to a value of this kind. Empty input is a missing value.
    pub fn parse(&self, raw: &str) -> Result<CellValue, SheetError> {
        if raw.is_empty() {
            return Ok(CellValue::Missing);
        }
        let coercion_error = || SheetError::Coercion {
            input: raw.to_string(),
            kind: *self,
        };
        match self {
            ColumnKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(CellValue::Integer)
                .map_err(|_| coercion_error()),
            ColumnKind::Float => raw
                .trim()
                .parse::<f64>()
                .map(CellValue::Float)
                .map_err(|_| coercion_error()),
            ColumnKind::Timestamp => parse_timestamp(raw)
                .map(CellValue::Timestamp)
                .ok_or_else(coercion_error),
            ColumnKind::Text => Ok(CellValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Text => "text",
        };
        f.write_str(name)
    }
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_INPUT_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Missing,
    Integer(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl CellValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, CellValue::Missing)
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            CellValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_millis(&self) -> Option<i64> {
        match self {
            CellValue::Timestamp(ts) => Some(ts.and_utc().timestamp_millis()),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Missing => None,
            other => Some(other.to_string()),
        }
    }
}

/// Missing values present as the empty string.
impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Missing => Ok(()),
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Float(v) => write!(f, "{v:?}"),
            CellValue::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// Builds a frame column of the given kind. Values of another kind are converted
/// where that is lossless enough (int <-> float), otherwise they become missing,
/// except for text columns which take the display form of anything.
pub fn build_column(name: &str, kind: ColumnKind, values: &[CellValue]) -> PolarsResult<Column> {
    let name = PlSmallStr::from(name);
    let series = match kind {
        ColumnKind::Integer => Series::new(
            name,
            values.iter().map(CellValue::as_i64).collect::<Vec<_>>(),
        ),
        ColumnKind::Float => Series::new(
            name,
            values.iter().map(CellValue::as_f64).collect::<Vec<_>>(),
        ),
        ColumnKind::Timestamp => Series::new(
            name,
            values.iter().map(CellValue::as_millis).collect::<Vec<_>>(),
        )
        .cast(&kind.dtype())?,
        ColumnKind::Text => Series::new(
            name,
            values.iter().map(CellValue::as_text).collect::<Vec<_>>(),
        ),
    };
    Ok(Column::from(series))
}

/// The tabular dataset: named, typed columns over positional rows.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    frame: DataFrame,
}

impl Dataset {
    pub fn empty() -> Self {
        Dataset::default()
    }

    /// Wraps a frame, casting every column to the storage dtype of its kind.
    pub fn from_frame(frame: DataFrame) -> Result<Self, SheetError> {
        let columns = frame
            .get_columns()
            .iter()
            .map(|c| {
                let kind = ColumnKind::from_dtype(c.dtype());
                if c.dtype() == &kind.dtype() {
                    Ok(c.clone())
                } else {
                    trace!("Normalising column {} from {:?} to {kind}", c.name(), c.dtype());
                    c.cast(&kind.dtype())
                }
            })
            .collect::<PolarsResult<Vec<Column>>>()?;
        Ok(Dataset {
            frame: DataFrame::new(columns)?,
        })
    }

    pub fn from_columns<I, S>(columns: I) -> Result<Self, SheetError>
    where
        I: IntoIterator<Item = (S, ColumnKind, Vec<CellValue>)>,
        S: AsRef<str>,
    {
        let columns = columns
            .into_iter()
            .map(|(name, kind, values)| build_column(name.as_ref(), kind, &values))
            .collect::<PolarsResult<Vec<Column>>>()?;
        Ok(Dataset {
            frame: DataFrame::new(columns)?,
        })
    }

    pub(crate) fn with_frame(frame: DataFrame) -> Self {
        Dataset { frame }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn row_count(&self) -> usize {
        self.frame.height()
    }

    pub fn column_count(&self) -> usize {
        self.frame.width()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names_str()
            .into_iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn column_name(&self, column: usize) -> Option<&str> {
        self.frame.get_columns().get(column).map(|c| c.name().as_str())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.frame.get_column_index(name)
    }

    pub fn column_kind(&self, column: usize) -> Option<ColumnKind> {
        self.frame
            .get_columns()
            .get(column)
            .map(|c| ColumnKind::from_dtype(c.dtype()))
    }

    pub fn column_kinds(&self) -> Vec<ColumnKind> {
        self.frame
            .get_columns()
            .iter()
            .map(|c| ColumnKind::from_dtype(c.dtype()))
            .collect()
    }

    pub fn column_values(&self, column: usize) -> Result<Vec<CellValue>, SheetError> {
        let col = self.frame.get_columns().get(column).ok_or(SheetError::OutOfRange {
            index: column,
            len: self.column_count(),
        })?;
        let series = col.as_materialized_series();
        let values = match ColumnKind::from_dtype(col.dtype()) {
            ColumnKind::Integer => series
                .i64()?
                .into_iter()
                .map(|v| v.map_or(CellValue::Missing, CellValue::Integer))
                .collect(),
            ColumnKind::Float => series
                .f64()?
                .into_iter()
                .map(|v| v.map_or(CellValue::Missing, CellValue::Float))
                .collect(),
            ColumnKind::Timestamp => series
                .cast(&DataType::Int64)?
                .i64()?
                .into_iter()
                .map(millis_to_value)
                .collect(),
            ColumnKind::Text => series
                .str()?
                .into_iter()
                .map(|v| v.map_or(CellValue::Missing, |s| CellValue::Text(s.to_string())))
                .collect(),
        };
        Ok(values)
    }

    pub fn value(&self, row: usize, column: usize) -> Result<CellValue, SheetError> {
        if row >= self.row_count() {
            return Err(SheetError::OutOfRange {
                index: row,
                len: self.row_count(),
            });
        }
        let col = self.frame.get_columns().get(column).ok_or(SheetError::OutOfRange {
            index: column,
            len: self.column_count(),
        })?;
        let series = col.as_materialized_series();
        let value = match ColumnKind::from_dtype(col.dtype()) {
            ColumnKind::Integer => series.i64()?.get(row).map_or(CellValue::Missing, CellValue::Integer),
            ColumnKind::Float => series.f64()?.get(row).map_or(CellValue::Missing, CellValue::Float),
            ColumnKind::Timestamp => millis_to_value(series.cast(&DataType::Int64)?.i64()?.get(row)),
            ColumnKind::Text => series
                .str()?
                .get(row)
                .map_or(CellValue::Missing, |s| CellValue::Text(s.to_string())),
        };
        Ok(value)
    }

    /// Replaces one cell. The value must already be of the column's kind.
    pub fn set_value(&mut self, row: usize, column: usize, value: CellValue) -> Result<(), SheetError> {
        let mut values = self.column_values(column)?;
        let len = values.len();
        let slot = values
            .get_mut(row)
            .ok_or(SheetError::OutOfRange { index: row, len })?;
        *slot = value;

        let kind = self.column_kinds()[column];
        let name = self.column_name(column).unwrap_or_default().to_string();
        let rebuilt = build_column(&name, kind, &values)?;
        self.frame.with_column(rebuilt)?;
        Ok(())
    }

    /// Display strings of one column, `None` for missing values.
    pub fn display_column(&self, column: usize) -> Result<Vec<Option<String>>, SheetError> {
        Ok(self
            .column_values(column)?
            .into_iter()
            .map(|v| if v.is_missing() { None } else { Some(v.to_string()) })
            .collect())
    }
}

fn millis_to_value(millis: Option<i64>) -> CellValue {
    millis
        .and_then(DateTime::from_timestamp_millis)
        .map_or(CellValue::Missing, |dt| CellValue::Timestamp(dt.naive_utc()))
}
