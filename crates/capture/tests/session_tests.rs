//! Integration tests for the capture session
//!
//! Drives the whole pipeline against the scripted USB backend:
//! - Activation polling limits
//! - Idempotent teardown
//! - Renumeration, streaming and ordered teardown end to end

use capture::testing::{
    CollectedFrames, CollectingConsumer, FakeUsbBackend, UsbEvent, mux_only_device,
    qt_active_device,
};
use capture::usb::transfers::{DISABLE_DIAGNOSTIC_CONFIG, ENABLE_DIAGNOSTIC_CONFIG};
use capture::usb::{ActivationController, ActivationSettings, DeviceCatalog, StreamSettings};
use capture::{
    CaptureError, ChannelConsumer, ConsumerGate, SessionCoordinator, SessionSettings,
    SessionState, TeardownStep,
};
use protocol::{Endianness, encode_frame};
use std::sync::Arc;
use std::time::Duration;

fn fast_settings(max_attempts: u32) -> SessionSettings {
    SessionSettings {
        activation: ActivationSettings {
            max_attempts,
            poll_interval: Duration::from_millis(1),
        },
        stream: StreamSettings {
            poll_timeout: Duration::from_millis(5),
            ..StreamSettings::default()
        },
        ..SessionSettings::default()
    }
}

fn collecting_gate() -> (ConsumerGate, CollectedFrames) {
    let (consumer, frames) = CollectingConsumer::new();
    (ConsumerGate::new(Box::new(consumer)), frames)
}

fn serial_events(backend: &FakeUsbBackend, serial: &str) -> Vec<UsbEvent> {
    backend
        .events()
        .into_iter()
        .filter(|e| match e {
            UsbEvent::Enumerate => false,
            UsbEvent::Open { serial: s }
            | UsbEvent::Close { serial: s }
            | UsbEvent::Control { serial: s, .. }
            | UsbEvent::SetConfiguration { serial: s, .. }
            | UsbEvent::DetachKernelDriver { serial: s, .. }
            | UsbEvent::AttachKernelDriver { serial: s, .. }
            | UsbEvent::Claim { serial: s, .. }
            | UsbEvent::Release { serial: s, .. }
            | UsbEvent::BulkWrite { serial: s, .. } => s == serial,
        })
        .collect()
}

mod activation_polling {
    use super::*;

    #[test]
    fn test_always_mux_only_times_out_after_exact_attempts() {
        let backend = FakeUsbBackend::new(vec![mux_only_device("AAA")]);
        let catalog = DeviceCatalog::new(Arc::new(backend.clone()));
        let mut controller = ActivationController::new(
            catalog,
            ActivationSettings {
                max_attempts: 4,
                poll_interval: Duration::from_millis(1),
            },
        );

        let identity = mux_only_device("AAA").identity();
        let err = controller.poll_until_active(&identity).err().unwrap();

        assert!(matches!(
            err,
            CaptureError::ActivationTimeout { ref serial, attempts: 4 } if serial == "AAA"
        ));
        assert_eq!(backend.enumerations(), 4);
        assert_eq!(backend.open_handles(), 0);

        // Nothing happens after the last poll
        let events_after = backend.events().len();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.events().len(), events_after);
        assert_eq!(backend.enumerations(), 4);
        assert!(backend.control_requests().is_empty());
    }

    #[test]
    fn test_session_start_reports_activation_timeout() {
        let backend = FakeUsbBackend::new(vec![mux_only_device("AAA")]);
        let (gate, frames) = collecting_gate();
        let mut session =
            SessionCoordinator::new(Arc::new(backend.clone()), fast_settings(3), "AAA", gate);

        let err = session.start().unwrap_err();
        assert!(matches!(err, CaptureError::ActivationTimeout { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.control_requests(), vec![ENABLE_DIAGNOSTIC_CONFIG]);
        assert_eq!(backend.enumerations(), 4);
        assert_eq!(frames.close_count(), 0);
    }
}

mod teardown {
    use super::*;

    #[test]
    fn test_stop_twice_sends_single_deactivation() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        let (gate, frames) = collecting_gate();
        let mut session =
            SessionCoordinator::new(Arc::new(backend.clone()), fast_settings(3), "", gate);
        session.start().unwrap();

        let first = session.stop();
        let second = session.stop();

        assert_eq!(first.steps.len(), 5);
        assert!(second.is_noop());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(frames.close_count(), 1);

        let disables = backend
            .control_requests()
            .into_iter()
            .filter(|r| *r == DISABLE_DIAGNOSTIC_CONFIG)
            .count();
        assert_eq!(disables, 1);
    }

    #[test]
    fn test_deactivation_failure_is_reported_not_raised() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        let (gate, _frames) = collecting_gate();
        let mut session =
            SessionCoordinator::new(Arc::new(backend.clone()), fast_settings(3), "", gate);
        session.start().unwrap();

        // Clear-feature requests have already been sent; this hits the disable
        backend.fail_control(rusb::Error::NoDevice);
        let report = session.stop();

        let last = report.steps.last().unwrap();
        assert_eq!(last.step, TeardownStep::Deactivate);
        assert!(last.error.is_some());
        assert_eq!(backend.open_handles(), 0);
    }
}

mod stalled_consumer {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_stop_completes_while_consumer_is_blocked() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        for payload in [&b"one"[..], &b"two"[..], &b"three"[..], &b"four"[..]] {
            backend.push_bulk_in(encode_frame(payload, Endianness::Little).unwrap());
        }

        // Nobody drains the receiver, so the second frame blocks the reader
        let (consumer, frames_rx) = ChannelConsumer::bounded(1);
        let gate = ConsumerGate::new(Box::new(consumer));
        let mut session = SessionCoordinator::new(
            Arc::new(backend.clone()),
            fast_settings(3),
            "",
            gate.clone(),
        );
        session.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while gate.delivered() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(gate.delivered(), 1);

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = done_tx.send(session.stop());
        });
        let report = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("stop did not finish");

        assert_eq!(report.steps.len(), 5);
        assert!(report.is_clean(), "{:?}", report);
        assert!(!gate.is_accepting());
        assert!(backend.control_requests().contains(&DISABLE_DIAGNOSTIC_CONFIG));
        assert_eq!(backend.open_handles(), 0);

        assert_eq!(frames_rx.recv_blocking().unwrap().payload(), b"one");
        assert!(frames_rx.recv_blocking().is_err());
    }
}

mod end_to_end {
    use super::*;

    #[test]
    fn test_renumeration_stream_and_teardown() {
        let backend = FakeUsbBackend::scripted(vec![
            vec![mux_only_device("AAA")],
            vec![mux_only_device("AAA")],
            vec![mux_only_device("AAA")],
            vec![qt_active_device("AAA")],
        ]);

        let mut wire = Vec::new();
        for payload in [&b"F1F1"[..], &b"F2F2F2F2"[..], &b"F3F3"[..]] {
            wire.extend(encode_frame(payload, Endianness::Little).unwrap());
        }
        backend.push_bulk_in(wire[..1].to_vec());
        backend.push_bulk_in(wire[1..7].to_vec());
        backend.push_bulk_in(wire[7..].to_vec());
        // Start of a fourth frame that never completes
        backend.push_bulk_in(vec![0x10, 0x00]);

        let (gate, frames) = collecting_gate();
        let mut session =
            SessionCoordinator::new(Arc::new(backend.clone()), fast_settings(10), "", gate);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.endpoints(), Some((0x86, 0x05)));
        // Selection plus two MuxOnly polls and the QTActive one
        assert_eq!(backend.enumerations(), 4);
        assert_eq!(backend.control_requests()[0], ENABLE_DIAGNOSTIC_CONFIG);

        assert!(frames.wait_for(3, Duration::from_secs(5)));

        backend.fail_release(rusb::Error::Io);
        let report = session.stop();

        assert_eq!(
            frames.payloads(),
            vec![b"F1F1".to_vec(), b"F2F2F2F2".to_vec(), b"F3F3".to_vec()]
        );
        assert_eq!(frames.close_count(), 1);

        assert_eq!(
            report.order(),
            vec![
                TeardownStep::CloseConsumer,
                TeardownStep::CloseStream,
                TeardownStep::ReleaseInterface,
                TeardownStep::CloseConfiguration,
                TeardownStep::Deactivate,
            ]
        );
        for outcome in &report.steps {
            if outcome.step == TeardownStep::ReleaseInterface {
                assert!(outcome.error.is_some());
            } else {
                assert!(outcome.error.is_none(), "{:?} failed", outcome.step);
            }
        }

        let events = serial_events(&backend, "AAA");
        let release = events
            .iter()
            .position(|e| matches!(e, UsbEvent::Release { interface: 2, .. }))
            .unwrap();
        let disable = events
            .iter()
            .position(|e| {
                matches!(e, UsbEvent::Control { request, .. } if *request == DISABLE_DIAGNOSTIC_CONFIG)
            })
            .unwrap();
        let close = events
            .iter()
            .rposition(|e| matches!(e, UsbEvent::Close { .. }))
            .unwrap();
        assert!(release < disable);
        assert!(disable < close);
        assert_eq!(backend.open_handles(), 0);
    }
}
