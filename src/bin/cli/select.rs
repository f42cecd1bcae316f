//! Board selection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use boardctl::{Board, BoardManager, Timeout};

use crate::keyboard::poll_escape;

/// Find the board to work with, waiting for it to show up if needed.
///
/// With a `tag`, the first board matching it is used. Otherwise, when more
/// than one board is attached, the user picks one if stdout is a terminal;
/// the first one is used if not. Returns `None` when the wait is cancelled
/// with `ESC` or `Ctrl+C`.
pub(crate) fn select_board(
    manager: &mut BoardManager,
    tag: Option<&str>,
    interrupted: &AtomicBool,
) -> Option<Arc<Board>> {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            // For more spinners check out the cli-spinners project:
            // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[BC] {spinner:.blue} {msg}"),
    );
    let target = match tag {
        Some(tag) => format!("board {}", style(tag).cyan()),
        None => "a board".to_owned(),
    };

    let start = Instant::now();
    loop {
        let candidates: Vec<_> = match tag {
            Some(tag) => manager.find(tag).into_iter().collect(),
            None => manager.boards(),
        };
        if !candidates.is_empty() {
            pb.finish_and_clear();
            return pick(candidates);
        }

        pb.set_message(format!(
            "[{:03}s] ⏳ Waiting for {} to be connected (ESC to cancel)...",
            style(start.elapsed().as_secs()).dim(),
            target
        ));
        let escaped = poll_escape(Duration::from_millis(100)).unwrap_or(false);
        if escaped || interrupted.load(Ordering::SeqCst) {
            pb.finish_with_message(format!("❌ Waiting for {} canceled", target));
            return None;
        }
        if let Err(err) = manager.wait(Timeout::After(Duration::from_millis(400))) {
            warn!("Cannot refresh the board list: {}", err);
        }
    }
}

fn pick(mut candidates: Vec<Arc<Board>>) -> Option<Arc<Board>> {
    use dialoguer::{theme::ColorfulTheme, Select};

    if candidates.len() == 1 || !Term::stdout().is_term() {
        if candidates.len() > 1 {
            info!("{} boards found, using the first one", candidates.len());
        }
        return Some(candidates.swap_remove(0));
    }

    let items: Vec<String> = candidates
        .iter()
        .map(|board| format!("{} ({}) at {}", board.tag(), board.mode(), board.location()))
        .collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a board:")
        .items(&items)
        .default(0)
        .interact_on_opt(&Term::stderr());
    match selection {
        Ok(Some(index)) => Some(candidates.swap_remove(index)),
        Ok(None) => None,
        Err(ref e) => {
            info!("error: {}", e);
            None
        }
    }
}
