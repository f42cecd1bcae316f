//! Implementation of the `boardctl` subcommands.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use console::style;
use hexplay::HexViewBuilder;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, log_enabled, Level::Debug};

use boardctl::{
    upload, wait_for, Board, BoardEvent, BoardManager, BoardState, Capability, Error, Firmware,
    ResetOutcome, Result, SharedManager, Timeout, UploadOptions, UploadStatus,
};

use crate::keyboard::poll_escape;

pub(crate) fn list(manager: &mut BoardManager, watch: bool, interrupted: &AtomicBool) -> Result<()> {
    manager.refresh()?;
    let mut count = 0;
    manager.list(|board| {
        print_board("=", board);
        count += 1;
    });
    if count == 0 && !watch {
        println!("[BC] No board found");
    }
    if !watch {
        return Ok(());
    }

    let id = manager.register_callback(|board, event| {
        let sign = match event {
            BoardEvent::Added => "+",
            BoardEvent::Changed => "*",
            BoardEvent::Closed | BoardEvent::Dropped => "-",
        };
        print_board(sign, board);
        0
    });
    println!("[BC] Watching boards (ESC to quit)...");
    while !interrupted.load(Ordering::SeqCst) && !poll_escape(Duration::from_millis(100)).unwrap_or(true) {
        manager.wait(Timeout::After(Duration::from_millis(200)))?;
    }
    manager.deregister_callback(id);
    Ok(())
}

/// Print everything the board sends until the user hits `ESC`.
pub(crate) fn monitor(
    manager: &Mutex<BoardManager>,
    board: &Arc<Board>,
    interrupted: &AtomicBool,
) -> Result<()> {
    println!(
        "[BC] Monitoring {} (ESC to quit)",
        style(board.tag()).green()
    );
    let mut buf = vec![0u8; 4096];
    let mut stdout = io::stdout();
    loop {
        if interrupted.load(Ordering::SeqCst) || poll_escape(Duration::from_millis(10)).unwrap_or(false) {
            return Ok(());
        }
        lock(manager).wait(Timeout::Poll)?;

        match board.state() {
            BoardState::Dropped => {
                return Err(Error::NotFound(format!("board {} disappeared", board.tag())))
            }
            BoardState::Closed => {
                lock(manager).wait(Timeout::After(Duration::from_millis(100)))?;
                continue;
            }
            BoardState::Online => {}
        }
        if !board.has_capability(Capability::Serial) {
            debug!("Board {} is in {} mode, waiting", board.tag(), board.mode());
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        match board.read_serial(&mut buf, Duration::from_millis(50)) {
            Ok(0) => {}
            Ok(n) => {
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
                // Dump the received data in a hex table for debugging
                if log_enabled!(Debug) {
                    let view = HexViewBuilder::new(&buf[..n])
                        .address_offset(0)
                        .row_width(16)
                        .finish();
                    println!("{}", view);
                }
            }
            Err(err) => {
                info!("error: {}", err);
                lock(manager).wait(Timeout::After(Duration::from_millis(100)))?;
            }
        }
    }
}

/// Start the board application, going through the bootloader if needed.
pub(crate) fn reset(manager: &Mutex<BoardManager>, board: &Arc<Board>, interrupted: &AtomicBool) -> Result<()> {
    let settings = lock(manager).settings().clone();
    if !board.has_capability(Capability::Reset) {
        board.reboot()?;
        wait_for(manager, board, Capability::Reset, settings.reboot_timeout, interrupted)?;
    }
    board.reset()?;
    match wait_for(manager, board, Capability::Serial, settings.reset_timeout, interrupted) {
        Ok(()) => println!("[BC] 👍 Board {} was reset", style(board.tag()).green()),
        Err(err) => println!(
            "[BC] {} Board {} did not come back: {}",
            style("warning").yellow(),
            board.tag(),
            err
        ),
    }
    Ok(())
}

/// Reboot the board into its bootloader.
pub(crate) fn reboot(manager: &Mutex<BoardManager>, board: &Arc<Board>, interrupted: &AtomicBool) -> Result<()> {
    let timeout = lock(manager).settings().reboot_timeout;
    board.reboot()?;
    wait_for(manager, board, Capability::Upload, timeout, interrupted)?;
    println!(
        "[BC] 👍 Board {} is in its bootloader",
        style(board.tag()).green()
    );
    Ok(())
}

pub(crate) fn upload_firmware(
    manager: &SharedManager,
    board: &Arc<Board>,
    paths: &[&str],
    options: UploadOptions,
    interrupted: &AtomicBool,
) -> Result<()> {
    let firmwares = paths
        .iter()
        .map(Firmware::load_binary)
        .collect::<Result<Vec<_>>>()?;
    let task = upload(manager, board, firmwares, options)?;

    let pb = ProgressBar::new(1);
    pb.set_style(ProgressStyle::default_bar()
        .template("[BC] ⏩ {msg:10} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .progress_chars("=>-"));

    let mut cancelled = false;
    while !task.is_finished() {
        if interrupted.load(Ordering::SeqCst) && !cancelled {
            task.cancel();
            cancelled = true;
        }
        match task.status() {
            UploadStatus::Pending => pb.set_message("Starting"),
            UploadStatus::Rebooting => pb.set_message("Rebooting"),
            UploadStatus::Uploading { written, total } => {
                pb.set_message("Uploading");
                pb.set_length(total as u64);
                pb.set_position(written as u64);
            }
            UploadStatus::Resetting => pb.set_message("Resetting"),
            UploadStatus::Finished | UploadStatus::Failed => {}
        }
        thread::sleep(Duration::from_millis(50));
    }

    match task.join() {
        Ok(report) => {
            pb.finish_with_message("Done");
            println!(
                "[BC] 👍 '{}' ({} bytes) uploaded to {} ({})",
                report.firmware,
                report.size,
                style(board.tag()).green(),
                report.model.desc
            );
            if report.reset == ResetOutcome::Unconfirmed {
                println!(
                    "[BC] {} the board did not come back after the reset",
                    style("warning").yellow()
                );
            }
            Ok(())
        }
        Err(err) => {
            pb.abandon_with_message("Failed");
            if err.is_partial() {
                println!(
                    "[BC] {} the board flash was partially written, upload again",
                    style("warning").yellow()
                );
            }
            Err(err)
        }
    }
}

fn print_board(sign: &str, board: &Board) {
    println!(
        "{} {} {:<12} {:<12} [{}] {} {}",
        sign,
        style(board.tag()).green(),
        board.model().map_or("unknown", |m| m.desc),
        board.mode().name,
        board.capabilities(),
        style(board.location()).dim(),
        board.path()
    );
}

fn lock(manager: &Mutex<BoardManager>) -> std::sync::MutexGuard<'_, BoardManager> {
    manager.lock().unwrap_or_else(|e| e.into_inner())
}
