use ratatui::{
    Frame,
    layout::{Constraint, Layout, Position, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table},
};

use crate::model::{Model, UIData};

pub const TABLE_HEADER_HEIGHT: usize = 1;
pub const CMDLINE_HEIGHT: usize = 2; // status line and command line
pub const COLUMN_SPACING: usize = 1;
pub const COLUMN_WIDTH_MARGIN: usize = 1;

const POPUP_WIDTH: u16 = 84;

pub struct TableUI {
    header_style: Style,
    index_style: Style,
    selected_style: Style,
    row_style: Style,
}

impl Default for TableUI {
    fn default() -> Self {
        Self::new()
    }
}

impl TableUI {
    pub fn new() -> Self {
        Self {
            header_style: Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            index_style: Style::default().fg(Color::DarkGray),
            selected_style: Style::default().fg(Color::Black).bg(Color::Cyan),
            row_style: Style::default().bg(Color::Rgb(40, 40, 40)),
        }
    }

    pub fn draw(&self, model: &Model, frame: &mut Frame) {
        let uidata = model.get_uidata();
        let [table_area, status_area, cmd_area] = Layout::vertical([
            Constraint::Min(0),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .areas(frame.area());

        self.draw_table(uidata, frame, table_area);
        self.draw_statusline(uidata, frame, status_area);
        self.draw_cmdline(uidata, frame, cmd_area);

        if uidata.show_popup {
            self.draw_popup(uidata, frame);
        }
    }

    fn draw_table(&self, uidata: &UIData, frame: &mut Frame, area: Rect) {
        if uidata.table.is_empty() {
            let hint = Paragraph::new("No data").centered().style(self.index_style);
            frame.render_widget(hint, area);
            return;
        }

        let header = Row::new(
            std::iter::once(Cell::from(""))
                .chain(uidata.table.iter().map(|c| Cell::from(c.name.as_str()))),
        )
        .style(self.header_style)
        .height(TABLE_HEADER_HEIGHT as u16);

        let nrows = uidata.index.data.len();
        let rows = (0..nrows).map(|r| {
            let index = Cell::from(uidata.index.data[r].as_str()).style(self.index_style);
            let cells = uidata.table.iter().enumerate().map(|(c, column)| {
                let text = column.data.get(r).map(String::as_str).unwrap_or("");
                let cell = Cell::from(text);
                if r == uidata.selected_row && c == uidata.selected_column {
                    cell.style(self.selected_style)
                } else {
                    cell
                }
            });
            let row = Row::new(std::iter::once(index).chain(cells));
            if r == uidata.selected_row { row.style(self.row_style) } else { row }
        });

        let widths = std::iter::once(Constraint::Length(uidata.index.width as u16)).chain(
            uidata
                .table
                .iter()
                .map(|c| Constraint::Length(c.width as u16)),
        );

        let table = Table::new(rows, widths)
            .header(header)
            .column_spacing(COLUMN_SPACING as u16);
        frame.render_widget(table, area);
    }

    fn draw_statusline(&self, uidata: &UIData, frame: &mut Frame, area: Rect) {
        let position = if uidata.nrows > 0 {
            format!(
                "{} [{}/{}:{}/{}] ",
                uidata.name,
                uidata.abs_selected_row,
                uidata.nrows,
                uidata.abs_selected_column,
                uidata.ncolumns
            )
        } else {
            format!("{} ", uidata.name)
        };
        let line = Line::from(vec![
            Span::from(position).bold(),
            Span::from(uidata.status_message.as_str()),
        ]);
        frame.render_widget(
            Paragraph::new(line).style(Style::default().bg(Color::DarkGray)),
            area,
        );
    }

    fn draw_cmdline(&self, uidata: &UIData, frame: &mut Frame, area: Rect) {
        let Some(mode) = uidata.cmd_mode.filter(|_| uidata.active_cmdinput) else {
            frame.render_widget(Paragraph::new("? help  q quit").style(self.index_style), area);
            return;
        };
        let prompt = format!("{}: ", mode.prompt());
        let prompt_width = prompt.chars().count();
        let line = Line::from(vec![
            Span::from(prompt).fg(Color::Cyan),
            Span::from(uidata.cmdinput.input.as_str()),
        ]);
        frame.render_widget(Paragraph::new(line), area);

        let x = area.x as usize + prompt_width + uidata.cmdinput.curser_pos;
        let x = x.min((area.x + area.width.saturating_sub(1)) as usize) as u16;
        frame.set_cursor_position(Position::new(x, area.y));
    }

    fn draw_popup(&self, uidata: &UIData, frame: &mut Frame) {
        let area = frame.area();
        let lines: Vec<Line> = uidata.popup_message.lines().map(Line::from).collect();
        let width = POPUP_WIDTH.min(area.width);
        let height = (lines.len() as u16 + 2).min(area.height);
        let popup = Rect::new(
            area.x + (area.width - width) / 2,
            area.y + (area.height - height) / 2,
            width,
            height,
        );

        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan))
            .title(" Help ")
            .title_style(self.header_style);
        frame.render_widget(Clear, popup);
        frame.render_widget(Paragraph::new(lines).block(block), popup);
    }
}
