use std::io::Error;
use std::path::PathBuf;

use derive_setters::Setters;
use polars::error::PolarsError;
use ratatui::crossterm::event::KeyEvent;
use rust_xlsxwriter::XlsxError;
use thiserror::Error;

use crate::dataset::ColumnKind;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("I/O error: {0}")]
    IoError(#[from] Error),
    #[error("data frame error: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("workbook writer error: {0}")]
    XlsxError(#[from] XlsxError),
    #[error("error reading '{}': {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("error writing '{}': {reason}", path.display())]
    Write { path: PathBuf, reason: String },
    #[error("index {index} out of range (row count {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("column '{0}' already exists")]
    DuplicateName(String),
    #[error("column '{0}' does not exist")]
    NotFound(String),
    #[error("cannot read '{input}' as {kind}")]
    Coercion { input: String, kind: ColumnKind },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown file type: '{}'", .0.display())]
    UnknownFileType(PathBuf),
    #[error("file not found: '{}'", .0.display())]
    FileNotFound(PathBuf),
    #[error("permission denied: '{}'", .0.display())]
    PermissionDenied(PathBuf),
    #[error("open a spreadsheet first")]
    NoDataset,
    #[error("no sheet of '{}' has the expected columns, nothing was written", .0.display())]
    NoQualifyingSheets(PathBuf),
}

impl SheetError {
    pub fn read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SheetError::Read {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SheetError::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Setters)]
pub struct TEConfig {
    pub event_poll_time: u64,
    pub max_column_width: usize,
    pub min_column_width: usize,
}

impl Default for TEConfig {
    fn default() -> Self {
        TEConfig {
            event_poll_time: 100,
            max_column_width: 32,
            min_column_width: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Quit,
    MoveUp,
    MoveDown,
    MoveLeft,
    MoveRight,
    MovePageUp,
    MovePageDown,
    MoveBeginning,
    MoveEnd,
    SortColumn,
    EditCell,
    InsertRowAfter,
    InsertRowBefore,
    RemoveRow,
    AddColumn,
    RemoveColumn,
    FilterColumn,
    ClearFilters,
    Open,
    Save,
    Help,
    Exit,
    Resize(usize, usize),
    RawKey(KeyEvent),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CMDMode {
    EditCell,
    InsertRow { before: bool },
    AddColumn,
    RemoveColumn,
    FilterColumn,
    Open,
    Save,
}

impl CMDMode {
    pub fn prompt(&self) -> &'static str {
        match self {
            CMDMode::EditCell => "edit",
            CMDMode::InsertRow { before: true } => "insert before",
            CMDMode::InsertRow { before: false } => "insert after",
            CMDMode::AddColumn => "add column",
            CMDMode::RemoveColumn => "remove column",
            CMDMode::FilterColumn => "filter",
            CMDMode::Open => "open",
            CMDMode::Save => "save as",
        }
    }
}

pub const HELP_TEXT: &str = "\
Navigation
  arrows / h j k l   move the cursor
  PgUp / PgDn        move one page
  g / G              first / last row

Editing
  e / Enter          edit the current cell
  i / I              insert a row after / before the cursor (comma separated values)
  d                  remove the current row
  a                  add a column
  x                  remove a column
  s                  sort by the current column (toggles ascending / descending)
  f                  filter the current column (empty clears it)
  F                  clear all filters

Files
  o                  open an .xlsx, .xls or .csv file
  w                  save as .xlsx

  ?                  this help
  Esc                close popup / cancel input
  q                  quit";
