//! Events emitted by a session
//!
//! A [SessionController](crate::SessionController) never renders anything
//! itself. Progress, log lines and state changes are handed to a [Reporter],
//! which can forward them over a channel, to the `log` facade, or anywhere
//! else.

use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::session::SessionState;

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Something the operator should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Overall progress of the running operation
    Progress { percent: u8, message: String },
    /// A human readable log line
    Log { level: LogLevel, text: String },
    /// The session moved to a new state
    StateChanged(SessionState),
}

/// Receiver of session events
pub trait Reporter: Send + Sync {
    fn report(&self, event: Event);
}

impl Reporter for UnboundedSender<Event> {
    fn report(&self, event: Event) {
        // Nobody listening is not an error
        let _ = self.send(event);
    }
}

/// A [Reporter] which forwards everything to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: Event) {
        match event {
            Event::Progress { percent, message } => info!("[{percent:>3}%] {message}"),
            Event::Log {
                level: LogLevel::Error,
                text,
            } => error!("{text}"),
            Event::Log {
                level: LogLevel::Warning,
                text,
            } => warn!("{text}"),
            Event::Log { text, .. } => info!("{text}"),
            Event::StateChanged(state) => info!("Device is {state}"),
        }
    }
}
