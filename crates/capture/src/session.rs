//! Capture session lifecycle
//!
//! [`SessionCoordinator`] runs activation and negotiation in order, hands the
//! bulk IN stream to a reader thread, and tears everything down again in
//! reverse acquisition order. Teardown is best-effort: every step runs even
//! when an earlier one fails.

use crate::consumer::ConsumerGate;
use crate::error::{CaptureError, Result};
use crate::reader::{BulkFrameReader, ReaderExit, ReaderSettings};
use crate::usb::activation::{ActivationController, ActivationSettings};
use crate::usb::backend::UsbBackend;
use crate::usb::catalog::DeviceCatalog;
use crate::usb::descriptor::DeviceIdentity;
use crate::usb::negotiator::{DeviceTransport, InterfaceNegotiator, NegotiatedSession};
use crate::usb::stream::{BulkOut, StreamSettings};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Longest teardown waits for the reader to notice the stream closing
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of one capture attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Activating,
    Negotiating,
    Streaming,
    Draining,
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Activating => 1,
            SessionState::Negotiating => 2,
            SessionState::Streaming => 3,
            SessionState::Draining => 4,
            SessionState::Closed => 5,
        }
    }

    /// Forward moves only; any live state may jump straight to `Closed`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        self != SessionState::Closed && next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

/// Ordered teardown steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TeardownStep {
    CloseConsumer,
    CloseStream,
    ReleaseInterface,
    CloseConfiguration,
    Deactivate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: TeardownStep,
    /// Failure message, if the step failed
    pub error: Option<String>,
}

/// What `stop()` did; empty when there was nothing to tear down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    fn record(&mut self, step: TeardownStep, result: Result<()>) {
        let error = match result {
            Ok(()) => {
                debug!("Teardown step {:?} done", step);
                None
            }
            Err(e) => {
                warn!("Teardown step {:?} failed: {}", step, e);
                Some(e.to_string())
            }
        };
        self.steps.push(StepOutcome { step, error });
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    /// Steps in the order they ran
    pub fn order(&self) -> Vec<TeardownStep> {
        self.steps.iter().map(|s| s.step).collect()
    }
}

/// Everything a session needs besides the backend and consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub activation: ActivationSettings,
    pub transport: DeviceTransport,
    pub stream: StreamSettings,
    pub reader: ReaderSettings,
}

/// Bounded retry of a whole session start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Owns one streaming attempt from device selection to teardown
pub struct SessionCoordinator {
    backend: Arc<dyn UsbBackend>,
    settings: SessionSettings,
    serial: String,
    identity: Option<DeviceIdentity>,
    state: SessionState,
    gate: ConsumerGate,
    negotiated: Option<NegotiatedSession>,
    bulk_out: Option<BulkOut>,
    reader: Option<JoinHandle<()>>,
    reader_exit: Option<oneshot::Receiver<ReaderExit>>,
}

impl SessionCoordinator {
    /// Create an idle session for `serial` (empty selects the first device)
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        settings: SessionSettings,
        serial: impl Into<String>,
        gate: ConsumerGate,
    ) -> Self {
        Self {
            backend,
            settings,
            serial: serial.into(),
            identity: None,
            state: SessionState::Idle,
            gate,
            negotiated: None,
            bulk_out: None,
            reader: None,
            reader_exit: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity of the selected device, once selection has happened
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Resolved (IN, OUT) bulk endpoint addresses while streaming
    pub fn endpoints(&self) -> Option<(u8, u8)> {
        self.negotiated
            .as_ref()
            .map(|n| (n.in_endpoint(), n.out_endpoint()))
    }

    /// Receiver for the reader's exit reason; only the first call returns it
    pub fn take_reader_exit(&mut self) -> Option<oneshot::Receiver<ReaderExit>> {
        self.reader_exit.take()
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CaptureError::InvalidState {
                state: self.state,
                expected: next,
            });
        }
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Activate, negotiate and start reading
    ///
    /// On failure everything acquired so far is released and the session is
    /// closed; whether to retry is up to the caller.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(CaptureError::InvalidState {
                state: self.state,
                expected: SessionState::Idle,
            });
        }

        match self.start_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Session start failed: {}", e);
                self.bulk_out = None;
                self.negotiated = None;
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    fn start_inner(&mut self) -> Result<()> {
        self.transition(SessionState::Activating)?;

        let catalog = DeviceCatalog::new(self.backend.clone());
        let conn = catalog.select_by_serial(&self.serial)?;
        self.identity = Some(conn.descriptor().identity());

        let mut controller = ActivationController::new(catalog, self.settings.activation);
        let conn = controller.activate(conn)?;

        self.transition(SessionState::Negotiating)?;

        let negotiator = InterfaceNegotiator::new(self.settings.transport, self.settings.stream);
        let mut negotiated = negotiator.negotiate(conn)?;
        let stream = negotiated
            .take_stream()
            .ok_or_else(|| CaptureError::Io(io::Error::other("bulk stream already taken")))?;
        self.bulk_out = Some(negotiated.bulk_out());
        self.negotiated = Some(negotiated);

        let (handle, exit_rx) =
            BulkFrameReader::new(stream, self.settings.reader).spawn(self.gate.clone())?;
        self.reader = Some(handle);
        self.reader_exit = Some(exit_rx);

        self.transition(SessionState::Streaming)?;
        if let Some(identity) = &self.identity {
            info!("Streaming from {}", identity);
        }
        Ok(())
    }

    /// Send `data` on the bulk OUT endpoint
    pub fn write_to_device(&self, data: &[u8]) -> Result<usize> {
        match (&self.bulk_out, self.state) {
            (Some(out), SessionState::Streaming) => out.write(data),
            _ => Err(CaptureError::InvalidState {
                state: self.state,
                expected: SessionState::Streaming,
            }),
        }
    }

    /// Tear the session down
    ///
    /// Runs every step in order regardless of earlier failures. Calling this
    /// on a session that never started, or a second time, does nothing.
    pub fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        match self.state {
            SessionState::Closed => {
                debug!("Session already closed");
                return report;
            }
            SessionState::Idle => {
                self.state = SessionState::Closed;
                return report;
            }
            _ => {}
        }
        self.state = SessionState::Draining;
        info!("Stopping session");

        // 1. No frame reaches the consumer after this
        self.gate.close();
        report.record(TeardownStep::CloseConsumer, Ok(()));

        self.bulk_out = None;
        let mut negotiated = self.negotiated.take();

        // 2. Stream, then wait for the reader to notice
        let mut result = match negotiated.as_mut() {
            Some(n) => n.close_stream(),
            None => Ok(()),
        };
        if let Some(handle) = self.reader.take()
            && let Err(e) = join_reader(handle, READER_JOIN_TIMEOUT)
        {
            result = result.and(Err(e));
        }
        report.record(TeardownStep::CloseStream, result);

        // 3.
        let result = match negotiated.as_mut() {
            Some(n) => n.release_interface(),
            None => Ok(()),
        };
        report.record(TeardownStep::ReleaseInterface, result);

        // 4.
        let result = match negotiated.as_mut() {
            Some(n) => n.close_configuration(),
            None => Ok(()),
        };
        report.record(TeardownStep::CloseConfiguration, result);

        // 5. The device handle closes once this last reference drops
        let conn = negotiated.map(|n| n.connection().clone());
        let result = match &conn {
            Some(conn) => ActivationController::send_deactivation_request(conn.as_ref())
                .map(|_| ())
                .map_err(|e| CaptureError::usb("disable screen mirroring config", e)),
            None => Ok(()),
        };
        report.record(TeardownStep::Deactivate, result);
        drop(conn);

        self.state = SessionState::Closed;
        info!("Session closed");
        report
    }
}

/// Wait for the reader thread, giving up after `timeout`
///
/// A reader stuck in a consumer that cannot be interrupted is left detached.
fn join_reader(handle: JoinHandle<()>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("Reader thread still busy after {:?}, detaching it", timeout);
            return Err(CaptureError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "reader thread did not stop",
            )));
        }
        thread::sleep(Duration::from_millis(5));
    }

    handle
        .join()
        .map_err(|_| CaptureError::Io(io::Error::other("reader thread panicked")))
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.state != SessionState::Idle {
            let report = self.stop();
            debug!("Stopped session on drop: {:?}", report.order());
        }
    }
}

/// Start a session, retrying transient failures
///
/// Every attempt uses a fresh coordinator; only the identity of the device
/// chosen on the first attempt carries over.
pub fn start_with_retry(
    backend: Arc<dyn UsbBackend>,
    settings: SessionSettings,
    serial: &str,
    gate: ConsumerGate,
    policy: RetryPolicy,
) -> Result<SessionCoordinator> {
    let attempts = policy.attempts.max(1);
    let mut serial = serial.to_string();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut session =
            SessionCoordinator::new(backend.clone(), settings, serial.clone(), gate.clone());

        let err = match session.start() {
            Ok(()) => return Ok(session),
            Err(e) => e,
        };

        if let Some(identity) = session.identity() {
            serial = identity.serial.clone();
        }

        if !err.is_retryable() || attempt >= attempts {
            return Err(err);
        }

        warn!(
            "Start attempt {}/{} failed: {}, retrying in {:?}",
            attempt, attempts, err, policy.backoff
        );
        thread::sleep(policy.backoff);
    }
}
