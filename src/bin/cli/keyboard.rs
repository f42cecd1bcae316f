use std::io::stdout;
use std::time::Duration;

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode},
    Result,
};

/// Wait up to `timeout` for a key press and report whether the user asked to
/// quit, with `ESC` or `Ctrl+C`.
pub(crate) fn poll_escape(timeout: Duration) -> Result<bool> {
    enable_raw_mode()?;
    execute!(stdout(), Hide)?;
    let result = poll(timeout);
    execute!(stdout(), MoveToColumn(0), Show)?;
    disable_raw_mode()?;

    if !result? {
        return Ok(false);
    }
    // It's guaranteed that read() wont block if `poll` returns `Ok(true)`
    let event = read()?;
    // In raw mode Ctrl+C is a key event like any other.
    let interrupt = Event::Key(KeyEvent {
        modifiers: KeyModifiers::CONTROL,
        code: KeyCode::Char('c'),
    });
    Ok(event == Event::Key(KeyCode::Esc.into()) || event == interrupt)
}
