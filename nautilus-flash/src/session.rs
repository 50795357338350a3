//! Device sessions
//!
//! The [SessionController] owns the single connection to a device and runs
//! every operation on it: connect, flash, erase and disconnect. Operations are
//! never queued. While one is running, `flash` and `erase` are rejected and
//! `connect` is a no-op, so a double click in a front end can't start a second
//! write over the same link.
//!
//! Failures are reported, and the session is put back into a stable state,
//! before the error is returned. A failed connect always ends disconnected with
//! the port released; a failed flash or erase leaves the device connected so
//! the operation can be retried.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::{
    error::{ConnectError, Error, FlashError, ProgrammerError, TransportError},
    fetch::SegmentFetcher,
    manifest::{ManifestResolver, Selection},
    programmer::{FlashImage, Programmer, WriteOptions},
    progress::{FlashProgress, ProgressCallbacks},
    report::{Event, LogLevel, Reporter},
    transport::{ControlLine, Link, PortHandle, Transport},
};

/// How long RTS is held when resetting the device through the link
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Where a session is in its lifecycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Flashing,
    Erasing,
}

impl SessionState {
    /// Whether the state can be left without an operation running
    pub fn is_stable(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Connected)
    }

    pub fn is_busy(&self) -> bool {
        !self.is_stable()
    }
}

/// Snapshot of a controller, published on every change
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Chip description reported by the handshake
    pub device: Option<String>,
}

/// The operator's answer to "erase the entire flash?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

impl From<bool> for Confirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            Confirmation::Confirmed
        } else {
            Confirmation::Declined
        }
    }
}

struct Session {
    port: PortHandle,
    link: Box<dyn Link>,
    device: String,
}

struct Inner {
    transport: Box<dyn Transport>,
    programmer: Box<dyn Programmer>,
    session: Option<Session>,
}

/// Owner of the connection to a device
pub struct SessionController {
    inner: Mutex<Inner>,
    status: watch::Sender<SessionStatus>,
    reporter: Arc<dyn Reporter>,
    fetcher: Arc<dyn SegmentFetcher>,
    resolver: ManifestResolver,
}

impl SessionController {
    pub fn new(
        transport: impl Transport + 'static,
        programmer: impl Programmer + 'static,
        fetcher: impl SegmentFetcher + 'static,
        resolver: ManifestResolver,
        reporter: impl Reporter + 'static,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());

        SessionController {
            inner: Mutex::new(Inner {
                transport: Box::new(transport),
                programmer: Box::new(programmer),
                session: None,
            }),
            status,
            reporter: Arc::new(reporter),
            fetcher: Arc::new(fetcher),
            resolver,
        }
    }

    pub fn resolver(&self) -> &ManifestResolver {
        &self.resolver
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch the status of the session
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Ask the operator for a port, open it and identify the chip
    ///
    /// Does nothing if a session already exists or another operation is
    /// running, and returns the current status instead.
    pub async fn connect(&self) -> Result<SessionStatus, Error> {
        let Ok(mut inner) = self.inner.try_lock() else {
            debug!("Ignoring connect request, an operation is in progress");
            return Ok(self.status());
        };
        if inner.session.is_some() {
            debug!("Ignoring connect request, already connected");
            return Ok(self.status());
        }

        let mut transition = self.transition(SessionState::Connecting, SessionState::Disconnected);
        let inner = &mut *inner;

        self.log(LogLevel::Info, "Requesting serial port...");
        let port = match inner.transport.request_port().await {
            Ok(port) => port,
            Err(err) => return Err(self.connect_failed(err.into())),
        };

        self.log(LogLevel::Info, "Opening port...");
        let mut link = match inner.transport.open(&port).await {
            Ok(link) => link,
            Err(err) => return Err(self.connect_failed(err.into())),
        };
        debug!("Opened {port}");

        self.log(LogLevel::Info, "Connecting to ESP32-S3...");
        let device = match inner.programmer.identify(link.as_mut()).await {
            Ok(device) => device,
            Err(err) => {
                release(inner.programmer.as_mut(), link).await;
                return Err(self.connect_failed(ConnectError::Handshake(err)));
            }
        };

        self.log(LogLevel::Success, format!("Connected to {device}"));
        self.log(LogLevel::Info, "Ready to flash firmware");

        self.status.send_modify(|status| status.device = Some(device.clone()));
        inner.session = Some(Session { port, link, device });
        transition.settle(SessionState::Connected);
        drop(transition);

        Ok(self.status())
    }

    /// Reset the device and release the port
    ///
    /// Waits for a running operation to finish first. Never fails: problems
    /// resetting or closing are logged and the session ends regardless.
    pub async fn disconnect(&self) -> SessionStatus {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if let Some(session) = inner.session.take() {
            debug!("Disconnecting from {}", session.port);
            release(inner.programmer.as_mut(), session.link).await;

            self.status.send_modify(|status| status.device = None);
            self.set_state(SessionState::Disconnected);
            self.log(LogLevel::Info, "Disconnected");
        }

        self.status()
    }

    /// Write the selected firmware and reboot the device
    pub async fn flash(&self, selection: Selection<'_>) -> Result<(), Error> {
        let mut inner = self.acquire()?;
        let inner = &mut *inner;
        let session = inner.session.as_mut().ok_or(Error::NotConnected)?;

        let _transition = self.transition(SessionState::Flashing, SessionState::Connected);

        self.progress(0, "Preparing to flash...");
        self.log(LogLevel::Info, "Starting flash process...");

        match self
            .write_firmware(inner.programmer.as_mut(), session, selection)
            .await
        {
            Ok(()) => {
                self.log(LogLevel::Success, "Flash completed successfully!");
                self.log(LogLevel::Info, "You can disconnect the device now.");
                Ok(())
            }
            Err(err) => {
                self.progress(0, "Flash failed!");
                self.log(LogLevel::Error, format!("Flash error: {err}"));
                Err(Error::Flash(err))
            }
        }
    }

    /// Erase the entire flash of the device
    pub async fn erase(&self, confirmation: Confirmation) -> Result<(), Error> {
        if confirmation == Confirmation::Declined {
            debug!("Erase declined by the operator");
            return Err(Error::Cancelled);
        }

        let mut inner = self.acquire()?;
        let inner = &mut *inner;
        let session = inner.session.as_mut().ok_or(Error::NotConnected)?;

        let _transition = self.transition(SessionState::Erasing, SessionState::Connected);

        self.progress(0, "Erasing flash...");
        self.log(LogLevel::Info, "Erasing entire flash...");

        match inner.programmer.erase_all(session.link.as_mut()).await {
            Ok(()) => {
                self.progress(100, "Erase complete!");
                self.log(LogLevel::Success, "Flash erased successfully!");
                Ok(())
            }
            Err(err) => {
                self.progress(0, "Erase failed!");
                self.log(LogLevel::Error, format!("Erase error: {err}"));
                Err(Error::Erase(err))
            }
        }
    }

    async fn write_firmware(
        &self,
        programmer: &mut dyn Programmer,
        session: &mut Session,
        selection: Selection<'_>,
    ) -> Result<(), FlashError> {
        let manifest = self.resolver.resolve(selection)?;

        if !session.device.contains(manifest.chip_family()) {
            self.log(
                LogLevel::Warning,
                format!(
                    "Connected device '{}' does not look like an {}, flashing anyway",
                    session.device,
                    manifest.chip_family()
                ),
            );
        }

        // Fetched fresh on every attempt, one at a time and in write order
        let mut images = Vec::with_capacity(manifest.len());
        for segment in manifest.segments() {
            self.log(LogLevel::Info, format!("Loading {}...", segment.name()));

            let data = self
                .fetcher
                .fetch(segment.source())
                .await
                .map_err(|source| FlashError::Fetch {
                    segment: segment.name().to_string(),
                    source,
                })?;

            self.log(
                LogLevel::Info,
                format!("Loaded {} ({} bytes)", segment.name(), data.len()),
            );
            images.push(FlashImage::new(segment.offset(), data));
        }

        let mut tracker = FlashProgress::new(images.len());
        self.progress(tracker.write_started(), "Erasing flash...");

        let mut callbacks = SegmentProgress {
            controller: self,
            tracker: &mut tracker,
            names: manifest.segments().iter().map(|s| s.name()).collect(),
            index: 0,
            total: 0,
        };
        // Header flash size is kept, nothing is erased beyond the written
        // regions and images are always deflated
        programmer
            .write_segments(
                session.link.as_mut(),
                &images,
                &WriteOptions::default(),
                &mut callbacks,
            )
            .await
            .map_err(FlashError::Write)?;

        self.progress(tracker.verifying(), "Verifying flash...");
        reset_device(programmer, session.link.as_mut()).await;
        self.progress(tracker.complete(), "Flash complete! Device rebooted.");

        Ok(())
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        self.inner
            .try_lock()
            .map_err(|_| Error::Busy(self.status().state))
    }

    fn connect_failed(&self, err: ConnectError) -> Error {
        self.log(LogLevel::Error, format!("Connection error: {err}"));
        Error::Connect(err)
    }

    fn transition(&self, state: SessionState, restore: SessionState) -> Transition<'_> {
        self.set_state(state);

        Transition {
            controller: self,
            restore,
        }
    }

    fn set_state(&self, state: SessionState) {
        let changed = self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });

        if changed {
            debug!("Session is now {state}");
            self.reporter.report(Event::StateChanged(state));
        }
    }

    fn progress(&self, percent: u8, message: impl Into<String>) {
        self.reporter.report(Event::Progress {
            percent,
            message: message.into(),
        });
    }

    fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.reporter.report(Event::Log {
            level,
            text: text.into(),
        });
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("status", &*self.status.borrow())
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

/// Holds a transient state, restoring a stable one when dropped
struct Transition<'a> {
    controller: &'a SessionController,
    restore: SessionState,
}

impl Transition<'_> {
    /// Change the state restored once the transition ends
    fn settle(&mut self, state: SessionState) {
        self.restore = state;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        self.controller.set_state(self.restore);
    }
}

/// Translates per-segment programmer progress into overall progress events
struct SegmentProgress<'a> {
    controller: &'a SessionController,
    tracker: &'a mut FlashProgress,
    names: Vec<&'static str>,
    index: usize,
    total: usize,
}

impl SegmentProgress<'_> {
    fn report(&mut self, written: usize) {
        let percent = self.tracker.segment(self.index, written, self.total);
        let name = self.names.get(self.index).copied().unwrap_or("image");

        self.controller
            .progress(percent, format!("Flashing {name}..."));
    }
}

impl ProgressCallbacks for SegmentProgress<'_> {
    fn init(&mut self, index: usize, addr: u32, total: usize) {
        debug!("Writing segment {index} ({total} bytes) at {addr:#x}");
        self.index = index;
        self.total = total;
        self.report(0);
    }

    fn update(&mut self, current: usize) {
        self.report(current);
    }

    fn finish(&mut self) {
        self.report(self.total);
    }
}

/// Reset the device, then close the link whatever the outcome
async fn release(programmer: &mut dyn Programmer, mut link: Box<dyn Link>) {
    reset_device(programmer, link.as_mut()).await;

    if let Err(err) = link.close() {
        warn!("Failed to close the serial port: {err}");
    }
}

/// Best-effort reset: the programmer first, then an RTS pulse
async fn reset_device(programmer: &mut dyn Programmer, link: &mut dyn Link) {
    match programmer.reset(link).await {
        Ok(()) => return,
        Err(ProgrammerError::Unsupported(_)) => debug!("Programmer cannot reset, pulsing RTS"),
        Err(err) => warn!("Reset failed, pulsing RTS instead: {err}"),
    }

    if let Err(err) = pulse_rts(link).await {
        warn!("Failed to reset the device: {err}");
    }
}

async fn pulse_rts(link: &mut dyn Link) -> Result<(), TransportError> {
    link.set_control_line(ControlLine::RequestToSend, true)?;
    tokio::time::sleep(RESET_PULSE).await;
    link.set_control_line(ControlLine::RequestToSend, false)
}
