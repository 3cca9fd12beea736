use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ratatui::crossterm::event::KeyEvent;
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::dataset::Dataset;
use crate::domain::{CMDMode, HELP_TEXT, Message, SheetError, TEConfig};
use crate::edit::{Session, SortOrder};
use crate::inputter::{InputResult, Inputter};
use crate::ui::{CMDLINE_HEIGHT, COLUMN_SPACING, COLUMN_WIDTH_MARGIN, TABLE_HEADER_HEIGHT};
use crate::workbook;

const SORT_MARKER_WIDTH: usize = 2;

#[derive(Debug, PartialEq)]
pub enum Status {
    READY,
    QUITTING,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Modus {
    TABLE,
    POPUP,
    CMDINPUT,
}

#[derive(Clone, Debug, Default)]
pub struct ColumnView {
    pub name: String,
    pub width: usize,
    pub data: Vec<String>,
}

/// Everything the UI needs to draw one frame.
#[derive(Default)]
pub struct UIData {
    pub name: String,
    pub table: Vec<ColumnView>,
    pub index: ColumnView,
    pub nrows: usize,
    pub ncolumns: usize,
    pub selected_row: usize,
    pub selected_column: usize,
    pub abs_selected_row: usize,
    pub abs_selected_column: usize,
    pub show_popup: bool,
    pub popup_message: String,
    pub layout: UILayout,
    pub cmdinput: InputResult,
    pub cmd_mode: Option<CMDMode>,
    pub active_cmdinput: bool,
    pub status_message: String,
}

#[derive(Default, Clone, Debug, PartialEq)]
pub struct UILayout {
    pub width: usize,
    pub height: usize,
    pub table_width: usize,
    pub table_height: usize,
    pub index_width: usize,
}

impl UILayout {
    pub fn from_values(index_width: usize, ui_width: usize, ui_height: usize) -> Self {
        let layout = UILayout {
            width: ui_width,
            height: ui_height,
            table_width: ui_width.saturating_sub(index_width + COLUMN_SPACING),
            table_height: ui_height.saturating_sub(CMDLINE_HEIGHT + TABLE_HEADER_HEIGHT),
            index_width,
        };
        trace!("Build UILayout: {:?}", layout);
        layout
    }
}

pub struct Model {
    config: TEConfig,
    session: Session,
    pub status: Status,
    modus: Modus,
    previous_modus: Modus,
    curser_row: usize,
    curser_column: usize,
    offset_row: usize,
    offset_column: usize,
    column_widths: Vec<usize>,
    widths_generation: Option<u64>,
    uilayout: UILayout,
    uidata: UIData,
    input: Inputter,
    cmd_mode: Option<CMDMode>,
    last_input: InputResult,
    active_cmdinput: bool,
    status_message: String,
}

impl Model {
    pub fn init(config: &TEConfig, ui_width: usize, ui_height: usize) -> Self {
        let mut model = Self {
            config: config.clone(),
            session: Session::new(),
            status: Status::READY,
            modus: Modus::TABLE,
            previous_modus: Modus::TABLE,
            curser_row: 0,
            curser_column: 0,
            offset_row: 0,
            offset_column: 0,
            column_widths: Vec::new(),
            widths_generation: None,
            uilayout: UILayout::from_values(0, ui_width, ui_height),
            uidata: UIData::default(),
            input: Inputter::default(),
            cmd_mode: None,
            last_input: InputResult::default(),
            active_cmdinput: false,
            status_message: "Press 'o' to open a spreadsheet, '?' for help".to_string(),
        };
        model.update_table_data();
        model
    }

    pub fn load_data_file(&mut self, path: PathBuf) -> Result<(), SheetError> {
        let message = self.open_file(&path)?;
        self.set_status_message(message);
        self.update_table_data();
        Ok(())
    }

    pub fn get_uidata(&self) -> &UIData {
        &self.uidata
    }

    pub fn raw_keyevents(&self) -> bool {
        self.active_cmdinput
    }

    pub fn quit(&mut self) {
        self.status = Status::QUITTING;
    }

    pub fn update(&mut self, message: Message) {
        match self.modus {
            Modus::TABLE => match message {
                Message::Quit => self.quit(),
                Message::MoveUp => self.move_selection_up(1),
                Message::MoveDown => self.move_selection_down(1),
                Message::MoveLeft => self.move_selection_left(),
                Message::MoveRight => self.move_selection_right(),
                Message::MovePageUp => self.move_selection_up(self.uilayout.table_height.max(1)),
                Message::MovePageDown => {
                    self.move_selection_down(self.uilayout.table_height.max(1))
                }
                Message::MoveBeginning => self.curser_row = 0,
                Message::MoveEnd => self.curser_row = self.session.grid().row_count().saturating_sub(1),
                Message::Resize(width, height) => self.ui_resize(width, height),
                Message::Help => self.show_help(),
                Message::SortColumn => self.sort_current_column(),
                Message::EditCell => self.enter_cmd_mode(CMDMode::EditCell),
                Message::InsertRowAfter => self.enter_cmd_mode(CMDMode::InsertRow { before: false }),
                Message::InsertRowBefore => self.enter_cmd_mode(CMDMode::InsertRow { before: true }),
                Message::RemoveRow => self.remove_current_row(),
                Message::AddColumn => self.enter_cmd_mode(CMDMode::AddColumn),
                Message::RemoveColumn => self.enter_cmd_mode(CMDMode::RemoveColumn),
                Message::FilterColumn => self.enter_cmd_mode(CMDMode::FilterColumn),
                Message::ClearFilters => self.clear_filters(),
                Message::Open => self.enter_cmd_mode(CMDMode::Open),
                Message::Save => self.enter_cmd_mode(CMDMode::Save),
                Message::Exit | Message::RawKey(_) => (),
            },
            Modus::POPUP => match message {
                Message::Quit => self.quit(),
                Message::Resize(width, height) => self.ui_resize(width, height),
                Message::Exit | Message::Help => self.exit(),
                _ => (),
            },
            Modus::CMDINPUT => match message {
                Message::RawKey(key) => self.raw_input(key),
                Message::Resize(width, height) => self.ui_resize(width, height),
                _ => (),
            },
        }
        self.update_table_data();
    }

    // -------------------- View building ---------------------- //

    fn update_table_data(&mut self) {
        let generation = self.session.grid().generation();
        if self.widths_generation != Some(generation) {
            self.column_widths = Self::calculate_column_widths(self.session.dataset(), &self.config);
            self.widths_generation = Some(generation);
        }

        let nrows = self.session.grid().row_count();
        let ncolumns = self.session.grid().column_count();
        self.curser_row = self.curser_row.min(nrows.saturating_sub(1));
        self.curser_column = self.curser_column.min(ncolumns.saturating_sub(1));

        let index_width = nrows.saturating_sub(1).to_string().len().max(3);
        if index_width != self.uilayout.index_width {
            self.uilayout = UILayout::from_values(index_width, self.uilayout.width, self.uilayout.height);
        }

        let height = self.uilayout.table_height.max(1);
        if self.curser_row < self.offset_row {
            self.offset_row = self.curser_row;
        } else if self.curser_row >= self.offset_row + height {
            self.offset_row = self.curser_row + 1 - height;
        }
        self.offset_row = self.offset_row.min(nrows.saturating_sub(1));

        if self.curser_column < self.offset_column {
            self.offset_column = self.curser_column;
        }
        let mut visible = self.visible_columns();
        while self.offset_column < self.curser_column && !self.fully_visible(&visible) {
            self.offset_column += 1;
            visible = self.visible_columns();
        }

        let rbegin = self.offset_row;
        let rend = (rbegin + height).min(nrows);
        trace!(
            "Table: Cr {}, Cc {}, Or {}, Oc {}, Rb {}, Re {}, visible {:?}",
            self.curser_row, self.curser_column, self.offset_row, self.offset_column, rbegin, rend, visible
        );

        let grid = self.session.grid();
        let table = visible
            .iter()
            .map(|&(idx, width)| {
                let header = grid.header(idx).unwrap_or_default();
                let marker = match grid.header(idx).and_then(|h| self.session.sort_direction(&h)) {
                    Some(SortOrder::Ascending) => " ▲",
                    Some(SortOrder::Descending) => " ▼",
                    None => "",
                };
                ColumnView {
                    name: Self::get_visible_name(&format!("{header}{marker}"), width),
                    width,
                    data: grid.column_window(idx, rbegin..rend),
                }
            })
            .collect::<Vec<_>>();
        let index = ColumnView {
            name: String::new(),
            width: index_width,
            data: (rbegin..rend).map(|r| grid.row_label(r)).collect(),
        };

        let name = self
            .session
            .source()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        self.uidata = UIData {
            name,
            table,
            index,
            nrows,
            ncolumns,
            selected_row: self.curser_row - self.offset_row,
            selected_column: self.curser_column - self.offset_column,
            abs_selected_row: self.curser_row,
            abs_selected_column: self.curser_column,
            show_popup: self.modus == Modus::POPUP,
            popup_message: HELP_TEXT.to_string(),
            layout: self.uilayout.clone(),
            cmdinput: self.last_input.clone(),
            cmd_mode: self.cmd_mode,
            active_cmdinput: self.active_cmdinput,
            status_message: self.status_message.clone(),
        };
    }

    /// Columns, starting at the column offset, that fit the table width with their
    /// render width. The last one may be cut.
    fn visible_columns(&self) -> Vec<(usize, usize)> {
        let table_width = self.uilayout.table_width;
        let mut used = 0;
        let mut visible = Vec::new();
        for (idx, &width) in self.column_widths.iter().enumerate().skip(self.offset_column) {
            if used + width + COLUMN_SPACING <= table_width {
                visible.push((idx, width));
                used += width + COLUMN_SPACING;
            } else {
                if used < table_width {
                    visible.push((idx, table_width - used));
                }
                break;
            }
        }
        visible
    }

    fn fully_visible(&self, visible: &[(usize, usize)]) -> bool {
        visible
            .iter()
            .any(|&(idx, width)| idx == self.curser_column && width == self.column_widths[idx])
    }

    fn calculate_column_widths(dataset: &Dataset, config: &TEConfig) -> Vec<usize> {
        (0..dataset.column_count())
            .into_par_iter()
            .map(|idx| {
                let name_width =
                    dataset.column_name(idx).map_or(0, |n| n.chars().count()) + SORT_MARKER_WIDTH;
                let data_width = dataset
                    .display_column(idx)
                    .map(|values| {
                        values
                            .iter()
                            .flatten()
                            .map(|s| s.chars().count())
                            .max()
                            .unwrap_or(0)
                    })
                    .unwrap_or(0);
                (name_width.max(data_width) + COLUMN_WIDTH_MARGIN)
                    .min(config.max_column_width)
                    .max(config.min_column_width)
            })
            .collect()
    }

    fn get_visible_name(name: &str, width: usize) -> String {
        if width < 3 {
            return String::new();
        }
        if name.chars().count() > width {
            let mut reduced: String = name.chars().take(width - 3).collect();
            reduced.push_str("...");
            reduced
        } else {
            name.to_string()
        }
    }

    fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
    }

    fn shape_message(&self) -> String {
        let mut message = format!(
            "Rows: {} Columns: {}",
            self.session.grid().row_count(),
            self.session.grid().column_count()
        );
        if !self.session.filters().is_empty() {
            let filters: Vec<String> = self
                .session
                .filters()
                .iter()
                .map(|(column, pattern)| format!("{column}~'{pattern}'"))
                .collect();
            message.push_str(&format!(" Filters: {}", filters.join(", ")));
        }
        message
    }

    fn current_column_name(&self) -> Result<String, SheetError> {
        if !self.session.is_loaded() {
            return Err(SheetError::NoDataset);
        }
        self.session
            .grid()
            .header(self.curser_column)
            .ok_or_else(|| SheetError::InvalidInput("the dataset has no columns".to_string()))
    }

    // -------------------- Control handling functions ---------------------- //

    fn ui_resize(&mut self, width: usize, height: usize) {
        trace!(
            "UI was resized! w:{}->{}, h:{}->{}",
            self.uilayout.width, width, self.uilayout.height, height
        );
        self.uilayout = UILayout::from_values(self.uilayout.index_width, width, height);
    }

    fn exit(&mut self) {
        if self.modus == Modus::POPUP {
            trace!("Close popup ...");
            self.modus = self.previous_modus;
            self.previous_modus = Modus::POPUP;
        }
    }

    fn show_help(&mut self) {
        self.previous_modus = self.modus;
        self.modus = Modus::POPUP;
    }

    fn move_selection_up(&mut self, size: usize) {
        self.curser_row = self.curser_row.saturating_sub(size);
    }

    fn move_selection_down(&mut self, size: usize) {
        let last = self.session.grid().row_count().saturating_sub(1);
        self.curser_row = (self.curser_row + size).min(last);
    }

    fn move_selection_left(&mut self) {
        self.curser_column = self.curser_column.saturating_sub(1);
    }

    fn move_selection_right(&mut self) {
        let last = self.session.grid().column_count().saturating_sub(1);
        self.curser_column = (self.curser_column + 1).min(last);
    }

    fn sort_current_column(&mut self) {
        let outcome = self.current_column_name().and_then(|name| {
            let order = self.session.sort_by_column(&name)?;
            Ok(format!("Sorted by '{name}' {}", match order {
                SortOrder::Ascending => "ascending",
                SortOrder::Descending => "descending",
            }))
        });
        self.report("sort", outcome);
    }

    fn remove_current_row(&mut self) {
        let row = self.curser_row;
        let outcome = self
            .session
            .remove_row(row)
            .map(|_| format!("Removed row {row}. {}", self.shape_message()));
        self.report("remove row", outcome);
    }

    fn clear_filters(&mut self) {
        let outcome = self
            .session
            .apply_filters(BTreeMap::new())
            .map(|_| "Filters cleared, re-open the file to restore hidden rows".to_string());
        self.report("clear filters", outcome);
    }

    fn report(&mut self, action: &str, outcome: Result<String, SheetError>) {
        match outcome {
            Ok(message) => {
                info!("{message}");
                self.set_status_message(message);
            }
            Err(e) => {
                warn!("{action} failed: {e}");
                self.set_status_message(format!("Error: {e}"));
            }
        }
    }

    fn raw_input(&mut self, key: KeyEvent) {
        if self.active_cmdinput {
            self.last_input = self.input.read(key);
            if self.last_input.finished {
                self.handle_cmd_input();
            }
        }
    }

    fn enter_cmd_mode(&mut self, mode: CMDMode) {
        let prefill = match mode {
            CMDMode::EditCell => {
                match self.session.grid().cell_text(self.curser_row, self.curser_column) {
                    Some(text) => text,
                    None => {
                        self.set_status_message("No cell selected");
                        return;
                    }
                }
            }
            CMDMode::RemoveColumn => self.current_column_name().unwrap_or_default(),
            CMDMode::FilterColumn => match self.current_column_name() {
                Ok(name) => self.session.filters().get(&name).cloned().unwrap_or_default(),
                Err(e) => {
                    self.set_status_message(format!("Error: {e}"));
                    return;
                }
            },
            CMDMode::Save => self
                .session
                .source()
                .map(|p| workbook::save_path(p).to_string_lossy().to_string())
                .unwrap_or_default(),
            CMDMode::InsertRow { .. } | CMDMode::AddColumn | CMDMode::Open => String::new(),
        };

        trace!("Entering command mode {mode:?} ...");
        self.previous_modus = self.modus;
        self.modus = Modus::CMDINPUT;
        self.cmd_mode = Some(mode);
        self.active_cmdinput = true;
        self.input.clear();
        self.input.set(&prefill);
        self.last_input = self.input.get();
    }

    fn handle_cmd_input(&mut self) {
        trace!("Handle cmd input {}", self.last_input.input);

        self.active_cmdinput = false;
        self.modus = self.previous_modus;
        self.previous_modus = Modus::CMDINPUT;

        let Some(mode) = self.cmd_mode.take() else {
            debug!("Cmd input without a command mode");
            return;
        };
        if self.last_input.canceled {
            self.set_status_message("Canceled");
            return;
        }

        let cmd_input = self.last_input.input.clone();
        let outcome = match mode {
            CMDMode::EditCell => self.edit_current_cell(&cmd_input),
            CMDMode::InsertRow { before } => self.insert_row(&cmd_input, before),
            CMDMode::AddColumn => self
                .session
                .add_column(&cmd_input)
                .map(|_| format!("Added column '{}'", cmd_input.trim())),
            CMDMode::RemoveColumn => self
                .session
                .remove_column(cmd_input.trim())
                .map(|_| format!("Removed column '{}'", cmd_input.trim())),
            CMDMode::FilterColumn => self.filter_current_column(&cmd_input),
            CMDMode::Open => expand_path(&cmd_input).and_then(|path| self.open_file(&path)),
            CMDMode::Save => expand_path(&cmd_input)
                .and_then(|path| self.session.save(&path))
                .map(|path| format!("Saved to {}", path.display())),
        };
        self.report(mode.prompt(), outcome);
    }

    fn edit_current_cell(&mut self, input: &str) -> Result<String, SheetError> {
        let (row, column) = (self.curser_row, self.curser_column);
        if self.session.grid_mut().set_cell(row, column, input) {
            return Ok(format!("Updated cell {row}:{column}"));
        }
        match self.session.dataset().column_kind(column) {
            Some(kind) if row < self.session.grid().row_count() => Err(SheetError::Coercion {
                input: input.to_string(),
                kind,
            }),
            _ => Err(SheetError::OutOfRange {
                index: row,
                len: self.session.grid().row_count(),
            }),
        }
    }

    fn insert_row(&mut self, input: &str, before: bool) -> Result<String, SheetError> {
        let values = parse_row(input)?;
        self.session.insert_row(self.curser_row, &values, before)?;
        if !before {
            self.curser_row += 1;
        }
        Ok(format!("Inserted row {}. {}", self.curser_row, self.shape_message()))
    }

    fn filter_current_column(&mut self, pattern: &str) -> Result<String, SheetError> {
        let name = self.current_column_name()?;
        let mut filters = self.session.filters().clone();
        filters.insert(name.clone(), pattern.to_string());
        self.session.apply_filters(filters)?;
        self.curser_row = 0;
        if pattern.trim().is_empty() {
            Ok(format!("Filter on '{name}' removed. {}", self.shape_message()))
        } else {
            Ok(self.shape_message())
        }
    }

    fn open_file(&mut self, path: &Path) -> Result<String, SheetError> {
        self.session.open(path)?;
        self.curser_row = 0;
        self.curser_column = 0;
        self.offset_row = 0;
        self.offset_column = 0;
        Ok(format!("Loaded {}. {}", path.display(), self.shape_message()))
    }
}

/// Expands `~` and environment variables in a user supplied path.
pub fn expand_path(input: &str) -> Result<PathBuf, SheetError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SheetError::InvalidInput("no path given".to_string()));
    }
    shellexpand::full(input)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| SheetError::InvalidInput(e.to_string()))
}

/// Splits one line of comma separated values, honouring CSV quoting.
fn parse_row(input: &str) -> Result<Vec<String>, SheetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input.as_bytes());
    match reader.records().next() {
        Some(record) => Ok(record
            .map_err(|e| SheetError::InvalidInput(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect()),
        None => Ok(Vec::new()),
    }
}
