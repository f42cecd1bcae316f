//! States for the upload state machine.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use log::{error, info, warn};

use super::events::*;
use super::{ResetOutcome, UploadContext, UploadReport, UploadStatus};
use crate::board::BoardState;
use crate::capability::Capability;
use crate::caterina::FlashObserver;
use crate::error::{Error, Result};
use crate::manager::wait_for;
use crate::registry::BoardModel;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// Do the work of the state and request the next transition by returning
    /// the appropriate `event`.
    fn run(&mut self, context: &UploadContext) -> Event;
}

// Init State ==================================================================

/// Represents the initial state of the upload state machine.
///
/// From the `InitState`, the state machine can evolve via the following
/// transitions:
///
///  * **`FlashEvent` => `FlashState`** when the board is already in its
///    bootloader,
///  * **`WaitBootloaderEvent` => `WaitBootloaderState`** when the user will
///    start the bootloader manually,
///  * **`RebootEvent` => `RebootState`** when the board can be rebooted,
///  * **`DoneEvent` => `DoneState`** otherwise.
#[derive(Debug)]
pub(crate) struct InitState {}
impl Runnable for InitState {
    fn run(&mut self, context: &UploadContext) -> Event {
        info!("=> Init");
        let board = &context.board;
        if context.cancelled() {
            return fail(context, Error::Cancelled { written: 0 });
        }
        if board.state() == BoardState::Dropped {
            return fail(
                context,
                Error::NotFound(format!("board {} disappeared", board.tag())),
            );
        }

        if board.has_capability(Capability::Upload) {
            Event::Flash(FlashEvent {
                context: context.clone(),
            })
        } else if context.options.wait {
            info!(
                "Waiting for board {} to enter its bootloader, press its reset button",
                board.tag()
            );
            Event::WaitBootloader(WaitBootloaderEvent {
                context: context.clone(),
                timeout: context.settings.manual_reboot_timeout,
            })
        } else if board.has_capability(Capability::Reboot) {
            Event::Reboot(RebootEvent {
                context: context.clone(),
            })
        } else {
            fail(
                context,
                Error::Unsupported(format!(
                    "board {} can neither be flashed nor rebooted in {} mode",
                    board.tag(),
                    board.mode()
                )),
            )
        }
    }
}

// Reboot State ================================================================

#[derive(Debug)]
pub(crate) struct RebootState {}
impl Runnable for RebootState {
    fn run(&mut self, context: &UploadContext) -> Event {
        info!("=> Reboot");
        match context.board.reboot() {
            Ok(()) => Event::WaitBootloader(WaitBootloaderEvent {
                context: context.clone(),
                timeout: context.settings.reboot_timeout,
            }),
            Err(err) => fail(context, err),
        }
    }
}

// WaitBootloader State ========================================================

/// Waits for the board to come back in bootloader mode. Missing the
/// reappearance is fatal; the board is left as the device reports it.
#[derive(Debug)]
pub(crate) struct WaitBootloaderState {
    pub timeout: std::time::Duration,
}
impl Runnable for WaitBootloaderState {
    fn run(&mut self, context: &UploadContext) -> Event {
        info!("=> WaitBootloader ({:?})", self.timeout);
        match wait_for(
            &context.manager,
            &context.board,
            Capability::Upload,
            self.timeout,
            &context.cancel,
        ) {
            Ok(()) => Event::Flash(FlashEvent {
                context: context.clone(),
            }),
            Err(err) => fail(context, err),
        }
    }
}

// Flash State =================================================================

#[derive(Debug)]
pub(crate) struct FlashState {}
impl Runnable for FlashState {
    fn run(&mut self, context: &UploadContext) -> Event {
        info!("=> Flash");
        let mut observer = TaskObserver { context };
        let model = match context.board.flash(
            &context.firmware,
            context.settings.transfer_retries,
            &mut observer,
        ) {
            Ok(model) => model,
            Err(err) => return fail(context, err),
        };

        if context.options.reset {
            Event::Reset(ResetEvent {
                context: context.clone(),
                model,
            })
        } else {
            finish(context, model, ResetOutcome::Skipped)
        }
    }
}

// Reset State =================================================================

/// Restarts the application. The firmware is already verified at this point:
/// not seeing the board come back is reported, not fatal.
#[derive(Debug)]
pub(crate) struct ResetState {
    pub model: &'static BoardModel,
}
impl Runnable for ResetState {
    fn run(&mut self, context: &UploadContext) -> Event {
        info!("=> Reset");
        if context.cancelled() {
            info!("Reset skipped, the upload was cancelled");
            return finish(context, self.model, ResetOutcome::Skipped);
        }
        if let Err(err) = context.board.reset() {
            error!(
                "'{}' is written and verified on board {}, but the reset failed: {}",
                context.firmware.name(),
                context.board.tag(),
                err
            );
            let verified = format!(
                "'{}' was written and verified, but the board could not be reset",
                context.firmware.name()
            );
            return fail(context, err.context(&verified));
        }

        let outcome = match wait_for(
            &context.manager,
            &context.board,
            Capability::Serial,
            context.settings.reset_timeout,
            &context.cancel,
        ) {
            Ok(()) => ResetOutcome::Confirmed,
            Err(err) => {
                warn!(
                    "Board {} did not come back after the reset: {}",
                    context.board.tag(),
                    err
                );
                ResetOutcome::Unconfirmed
            }
        };
        finish(context, self.model, outcome)
    }
}

// Done State ==================================================================

#[derive(Debug)]
pub(crate) struct DoneState {
    pub result: Option<Result<UploadReport>>,
}
impl Runnable for DoneState {
    fn run(&mut self, context: &UploadContext) -> Event {
        match &self.result {
            Some(Ok(_)) => info!("=> Done"),
            Some(Err(err)) => info!("=> Done with error: {}", err),
            None => info!("=> Done (result taken)"),
        }
        Event::Done(DoneEvent {
            context: context.clone(),
            result: self.result.take(),
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct TaskObserver<'a> {
    context: &'a UploadContext,
}

impl FlashObserver for TaskObserver<'_> {
    fn progress(&mut self, written: usize, total: usize) {
        self.context
            .set_status(UploadStatus::Uploading { written, total });
    }

    fn cancelled(&self) -> bool {
        self.context.cancelled()
    }
}

fn fail(context: &UploadContext, err: Error) -> Event {
    Event::Done(DoneEvent {
        context: context.clone(),
        result: Some(Err(err)),
    })
}

fn finish(context: &UploadContext, model: &'static BoardModel, reset: ResetOutcome) -> Event {
    Event::Done(DoneEvent {
        context: context.clone(),
        result: Some(Ok(UploadReport {
            firmware: context.firmware.name().to_owned(),
            model,
            size: context.firmware.size(),
            reset,
        })),
    })
}
