use std::time::Duration;
use tracing::trace;

use crate::domain::{Message, SheetError, TEConfig};
use crate::model::Model;
use ratatui::crossterm::event::{self, Event, KeyCode, KeyModifiers};

pub struct Controller {
    event_poll_time: u64,
}

impl Controller {
    pub fn new(cfg: &TEConfig) -> Self {
        Self {
            event_poll_time: cfg.event_poll_time,
        }
    }

    pub fn handle_event(&self, model: &Model) -> Result<Option<Message>, SheetError> {
        if event::poll(Duration::from_millis(self.event_poll_time))? {
            match event::read()? {
                Event::Key(key) if key.kind == event::KeyEventKind::Press => {
                    if model.raw_keyevents() {
                        return Ok(Some(Message::RawKey(key)));
                    }
                    return Ok(Self::handle_key(key));
                }
                Event::Resize(width, height) => {
                    return Ok(Some(Message::Resize(width as usize, height as usize)));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    fn handle_key(key: event::KeyEvent) -> Option<Message> {
        let message = match (key.code, key.modifiers) {
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(Message::Quit),
            (KeyCode::Char('q'), _) => Some(Message::Quit),
            (KeyCode::Up | KeyCode::Char('k'), _) => Some(Message::MoveUp),
            (KeyCode::Down | KeyCode::Char('j'), _) => Some(Message::MoveDown),
            (KeyCode::Left | KeyCode::Char('h'), _) => Some(Message::MoveLeft),
            (KeyCode::Right | KeyCode::Char('l'), _) => Some(Message::MoveRight),
            (KeyCode::PageUp, _) => Some(Message::MovePageUp),
            (KeyCode::PageDown, _) => Some(Message::MovePageDown),
            (KeyCode::Char('g'), _) => Some(Message::MoveBeginning),
            (KeyCode::Char('G'), _) => Some(Message::MoveEnd),
            (KeyCode::Char('s'), _) => Some(Message::SortColumn),
            (KeyCode::Char('e') | KeyCode::Enter, _) => Some(Message::EditCell),
            (KeyCode::Char('i'), _) => Some(Message::InsertRowAfter),
            (KeyCode::Char('I'), _) => Some(Message::InsertRowBefore),
            (KeyCode::Char('d'), _) => Some(Message::RemoveRow),
            (KeyCode::Char('a'), _) => Some(Message::AddColumn),
            (KeyCode::Char('x'), _) => Some(Message::RemoveColumn),
            (KeyCode::Char('f'), _) => Some(Message::FilterColumn),
            (KeyCode::Char('F'), _) => Some(Message::ClearFilters),
            (KeyCode::Char('o'), _) => Some(Message::Open),
            (KeyCode::Char('w'), _) => Some(Message::Save),
            (KeyCode::Char('?'), _) => Some(Message::Help),
            (KeyCode::Esc, _) => Some(Message::Exit),
            _ => None,
        };
        trace!("Mapped: {key:?} => {message:?}");
        message
    }
}
