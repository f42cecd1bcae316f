//! Upload sequencing.
//!
//! An upload reboots the board into its bootloader, transfers and verifies
//! the firmware, then resets the board back into its application. Each step
//! may fail, and the first fatal error ends the task.
//!
//! ```text
//!                    START
//!                      |
//!                      v
//!                 .---------.    in bootloader
//!                 |  Init   |-------------------------.
//!                 '---------'                         |
//!            can     |    |  wait for                 |
//!           reboot   |    |  the user                 |
//!                    v    '-------------.             |
//!              .---------.              v             v
//!              | Reboot  |------>.----------------. .-------.
//!              '---------'       | WaitBootloader |>| Flash |
//!                                '----------------' '-------'
//!                                                    |    |
//!                                             reset  |    | noreset
//!                                                    v    |
//!                                              .-------.  |
//!                                              | Reset |  |
//!                                              '-------'  |
//!                                                  |      |
//!                                                  v      v
//!                   any fatal error -------->  .------------.
//!                                              |    Done    |
//!                                              '------------'
//! ```

use log::debug;

use super::events::*;
use super::states::*;
use super::{UploadContext, UploadReport, UploadStatus};
use crate::error::{Error, Result};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Run the state machine to completion on the calling thread. The board is
/// held for the whole run, so that its trips through the bootloader never
/// drop it.
pub(crate) fn execute(context: UploadContext) -> Result<UploadReport> {
    let board = context.board.clone();
    let _hold = board.hold();
    let mut sm = UploadStates::Init(UploadStateMachine::new(context));
    loop {
        sm = sm.step();
        if let UploadStates::Done(done) = &mut sm {
            return done
                .state
                .result
                .take()
                .unwrap_or_else(|| Err(Error::System("upload ended without a result".into())));
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

// -----------------------------------------------------------------------------
// The State Machine
// -----------------------------------------------------------------------------

/// The state machine driving one upload.
///
/// The context shared by all states (board, manager, firmware, options and
/// status) travels with the machine; the state holds only its own data.
#[derive(Debug)]
struct UploadStateMachine<S: Runnable> {
    context: UploadContext,
    state: S,
}
impl<S: Runnable> UploadStateMachine<S> {
    fn run(&mut self) -> Event {
        self.state.run(&self.context)
    }
}

/// The upload state machine starts in the `InitState`.
impl UploadStateMachine<InitState> {
    fn new(context: UploadContext) -> Self {
        UploadStateMachine {
            context,
            state: InitState {},
        }
    }
}

/// Wraps the state machine and its various states into a simple enum, which
/// can also be used for pattern matching during state transitions.
enum UploadStates {
    Init(UploadStateMachine<InitState>),
    Reboot(UploadStateMachine<RebootState>),
    WaitBootloader(UploadStateMachine<WaitBootloaderState>),
    Flash(UploadStateMachine<FlashState>),
    Reset(UploadStateMachine<ResetState>),
    Done(UploadStateMachine<DoneState>),
}
impl UploadStates {
    fn step(&mut self) -> Self {
        match self {
            UploadStates::Init(sm) => {
                let event = sm.run();
                match event {
                    Event::Flash(ev) => UploadStates::Flash(ev.into()),
                    Event::WaitBootloader(ev) => UploadStates::WaitBootloader(ev.into()),
                    Event::Reboot(ev) => UploadStates::Reboot(ev.into()),
                    Event::Done(ev) => UploadStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            UploadStates::Reboot(sm) => {
                let event = sm.run();
                match event {
                    Event::WaitBootloader(ev) => UploadStates::WaitBootloader(ev.into()),
                    Event::Done(ev) => UploadStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            UploadStates::WaitBootloader(sm) => {
                let event = sm.run();
                match event {
                    Event::Flash(ev) => UploadStates::Flash(ev.into()),
                    Event::Done(ev) => UploadStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            UploadStates::Flash(sm) => {
                let event = sm.run();
                match event {
                    Event::Reset(ev) => UploadStates::Reset(ev.into()),
                    Event::Done(ev) => UploadStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            UploadStates::Reset(sm) => {
                let event = sm.run();
                match event {
                    Event::Done(ev) => UploadStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            UploadStates::Done(sm) => {
                let event = sm.run();
                match event {
                    Event::Done(ev) => UploadStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<RebootEvent> for UploadStateMachine<RebootState> {
    fn from(event: RebootEvent) -> UploadStateMachine<RebootState> {
        event.context.set_status(UploadStatus::Rebooting);
        UploadStateMachine {
            context: event.context,
            state: RebootState {},
        }
    }
}

impl From<WaitBootloaderEvent> for UploadStateMachine<WaitBootloaderState> {
    fn from(event: WaitBootloaderEvent) -> UploadStateMachine<WaitBootloaderState> {
        event.context.set_status(UploadStatus::Rebooting);
        UploadStateMachine {
            context: event.context,
            state: WaitBootloaderState {
                timeout: event.timeout,
            },
        }
    }
}

impl From<FlashEvent> for UploadStateMachine<FlashState> {
    fn from(event: FlashEvent) -> UploadStateMachine<FlashState> {
        event.context.set_status(UploadStatus::Uploading {
            written: 0,
            total: event.context.firmware.size(),
        });
        UploadStateMachine {
            context: event.context,
            state: FlashState {},
        }
    }
}

impl From<ResetEvent> for UploadStateMachine<ResetState> {
    fn from(event: ResetEvent) -> UploadStateMachine<ResetState> {
        event.context.set_status(UploadStatus::Resetting);
        UploadStateMachine {
            context: event.context,
            state: ResetState { model: event.model },
        }
    }
}

impl From<DoneEvent> for UploadStateMachine<DoneState> {
    fn from(event: DoneEvent) -> UploadStateMachine<DoneState> {
        match &event.result {
            Some(Ok(_)) => event.context.set_status(UploadStatus::Finished),
            Some(Err(err)) => {
                debug!("Upload failed: {}", err);
                event.context.set_status(UploadStatus::Failed);
            }
            None => {}
        }
        UploadStateMachine {
            context: event.context,
            state: DoneState {
                result: event.result,
            },
        }
    }
}
