//! Events for the upload state machine.
//!
//! This module is private and restricted to the [`upload`](crate::upload)
//! scope. The public interface of the task is provided by
//! [`upload`](crate::upload).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::time::Duration;

use super::UploadContext;
use crate::error::Result;
use crate::registry::BoardModel;
use crate::upload::UploadReport;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// RebootEvent =================================================================

/// Event fired from the `Init` state when the board runs its application and
/// can be rebooted into the bootloader.
#[derive(Debug)]
pub(crate) struct RebootEvent {
    pub context: UploadContext,
}

// WaitBootloaderEvent =========================================================

/// Event fired to wait for the board to show up in bootloader mode, either
/// after a reboot request or because the user was asked to press the reset
/// button. The wait is bounded by `timeout`.
#[derive(Debug)]
pub(crate) struct WaitBootloaderEvent {
    pub context: UploadContext,
    pub timeout: Duration,
}

// FlashEvent ==================================================================

/// Event fired when the board is online with the `Upload` capability.
#[derive(Debug)]
pub(crate) struct FlashEvent {
    pub context: UploadContext,
}

// ResetEvent ==================================================================

/// Event fired after a verified transfer, unless the reset was disabled.
#[derive(Debug)]
pub(crate) struct ResetEvent {
    pub context: UploadContext,
    pub model: &'static BoardModel,
}

// DoneEvent ===================================================================

/// Event fired with the outcome of the task. It can be fired from any state:
/// the first fatal error ends the task.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub context: UploadContext,
    pub result: Option<Result<UploadReport>>,
}

// Events enum =================================================================

/// Events that can be triggered within the upload state machine.
///
/// Each possible value holds an `event`, which in turn may hold additional data
/// for the state transition.
#[derive(Debug)]
pub(crate) enum Event {
    Reboot(RebootEvent),
    WaitBootloader(WaitBootloaderEvent),
    Flash(FlashEvent),
    Reset(ResetEvent),
    Done(DoneEvent),
}
