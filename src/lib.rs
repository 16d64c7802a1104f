//! Acquisition core for XAFS beamline scans.
//!
//! The crate holds both halves of the beamline suite: the controller, which
//! sequences step and fly scans against the hardware, and the viewer, which turns
//! the recorded runs into live plots. The halves only talk through the line-based
//! event bus in [`bus`] and through the run store in [`store`].
//!
//! Controller side:
//! - [`trajectory`] turns a segmented scan specification into energy steps.
//! - [`flyer`] runs one continuous sweep with buffered capture.
//! - [`orchestrator`] sequences scans, dark-current measurement, abort and cleanup.
//! - [`controller`] handles viewer -> controller messages.
//!
//! Viewer side:
//! - [`pipeline`] retrieves, corrects and differentiates run data on a worker task.
//! - [`viewer`] owns the display settings and the rendering context.

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod error_recovery;
pub mod flyer;
pub mod hardware;
pub mod messages;
pub mod orchestrator;
pub mod physics;
pub mod pipeline;
pub mod store;
pub mod trajectory;
pub mod viewer;
