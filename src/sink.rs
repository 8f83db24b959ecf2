//! Result sinks.
//!
//! A [`ResultSink`] is a passive consumer of sweep results and controller
//! events. Delivery is fire-and-forget: methods are synchronous, return
//! nothing and must not block, so a slow consumer never holds up the next
//! sweep. Sinks that do real work (plotting, storage) should hand the value
//! off to their own task, as [`ChannelSink`] does.

use crate::data::SweepReport;
use crate::error::ErrorKind;
use crate::measurement::{Direction, SweepData};
use crate::plan::SweepPlan;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Controller progress notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// A plan was applied to the device.
    Configured(SweepPlan),
    /// The device was triggered; completion is expected within `timeout`.
    Triggered {
        /// Sweep leg
        direction: Direction,
        /// Points requested
        point_count: usize,
        /// Deadline headroom granted to the device
        timeout: Duration,
    },
    /// Samples were read back from the device.
    Fetched {
        /// Sweep leg
        direction: Direction,
        /// Samples received
        samples: usize,
    },
    /// A running sweep was cancelled and its partial samples discarded.
    Cancelled {
        /// Sweep leg
        direction: Direction,
    },
    /// The device was released.
    Closed,
}

/// Consumer of fit results, failures and controller events.
pub trait ResultSink: Send + Sync {
    /// A forward sweep was acquired and fitted.
    fn on_forward_result(&self, report: &SweepReport);

    /// A reverse sweep was acquired and fitted.
    fn on_reverse_result(&self, report: &SweepReport);

    /// A sweep or its fit failed. `partial` holds whatever raw data survived.
    fn on_failure(&self, kind: ErrorKind, partial: Option<&SweepData>);

    /// Controller progress. Ignored unless overridden.
    fn on_event(&self, _event: &SweepEvent) {}
}

/// Logs everything through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn on_forward_result(&self, report: &SweepReport) {
        info!("Forward sweep: {}", report.fit);
    }

    fn on_reverse_result(&self, report: &SweepReport) {
        info!("Reverse sweep: {}", report.fit);
    }

    fn on_failure(&self, kind: ErrorKind, partial: Option<&SweepData>) {
        match partial {
            Some(data) => warn!(
                "Sweep failed ({:?}) with {} raw samples retained",
                kind,
                data.len()
            ),
            None => warn!("Sweep failed ({:?})", kind),
        }
    }

    fn on_event(&self, event: &SweepEvent) {
        debug!("Controller event: {:?}", event);
    }
}

/// Message forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkMessage {
    /// Fitted forward sweep
    Forward(SweepReport),
    /// Fitted reverse sweep
    Reverse(SweepReport),
    /// Failure with optional raw data
    Failure(ErrorKind, Option<SweepData>),
    /// Controller event
    Event(SweepEvent),
}

/// Forwards everything to an unbounded channel.
///
/// Sending never blocks. A dropped receiver is not an error for the producer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    /// A sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, message: SinkMessage) {
        if self.tx.send(message).is_err() {
            debug!("Result receiver dropped, discarding message");
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_forward_result(&self, report: &SweepReport) {
        self.send(SinkMessage::Forward(report.clone()));
    }

    fn on_reverse_result(&self, report: &SweepReport) {
        self.send(SinkMessage::Reverse(report.clone()));
    }

    fn on_failure(&self, kind: ErrorKind, partial: Option<&SweepData>) {
        self.send(SinkMessage::Failure(kind, partial.cloned()));
    }

    fn on_event(&self, event: &SweepEvent) {
        self.send(SinkMessage::Event(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CurveFitter;
    use crate::measurement::SweepSample;
    use crate::plan::SourceVariable;

    fn report() -> SweepReport {
        let data = SweepData::new(
            SourceVariable::Voltage,
            Direction::Forward,
            1e-3,
            (0..4)
                .map(|i| SweepSample::new(i as f64, i as f64 * 1e-4))
                .collect(),
        );
        let fit = CurveFitter::new().fit(&data).unwrap();
        SweepReport::new(data, fit)
    }

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let report = report();
        sink.on_event(&SweepEvent::Closed);
        sink.on_forward_result(&report);
        sink.on_failure(ErrorKind::DegenerateFit, Some(&report.data));

        assert_eq!(rx.try_recv().unwrap(), SinkMessage::Event(SweepEvent::Closed));
        assert_eq!(rx.try_recv().unwrap(), SinkMessage::Forward(report.clone()));
        assert_eq!(
            rx.try_recv().unwrap(),
            SinkMessage::Failure(ErrorKind::DegenerateFit, Some(report.data))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_reverse_result(&report());
        sink.on_failure(ErrorKind::SweepTimeout, None);
    }
}
