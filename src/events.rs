//! Typed notification channel.
//!
//! Every core component publishes [`StageEvent`]s on a shared [`EventBus`],
//! which is a thin wrapper over a `tokio::sync::broadcast` channel: one
//! publisher per component, any number of subscribers (UI, metadata writer,
//! bookmark manager). Publishing when nobody listens is not an error.

use tokio::sync::broadcast;
use tracing::trace;

use crate::axis::Axis;
use crate::connection::ConnectionState;
use crate::error::StageError;

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// One `(position, metric)` pair recorded after an auto-step move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Confirmed axis position after the step (µm)
    pub position: f64,
    /// Metric value returned by the sampler
    pub metric: f64,
}

/// Notification emitted by the core.
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// The connection manager changed state
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
        /// Human-readable reason
        message: String,
    },
    /// An axis position was committed
    PositionChanged {
        /// Axis that moved
        axis: Axis,
        /// New confirmed position (µm)
        position: f64,
    },
    /// One auto-step tick finished
    AutoStepProgress {
        /// Steps completed so far
        current_step: u32,
        /// Steps in the sequence
        total_steps: u32,
    },
    /// An auto-step sequence ran to completion
    AutoStepCompleted {
        /// Steps taken; equals `total_steps`
        current_step: u32,
        /// Steps requested
        total_steps: u32,
        /// Recorded samples, in step order
        samples: Vec<Sample>,
        /// Position of the highest metric, if any metric was recorded
        peak_position: Option<f64>,
    },
    /// An auto-step sequence aborted on an error
    AutoStepFailed {
        /// Why the step failed
        error: StageError,
    },
}

/// Broadcast channel shared by all components.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StageEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; a missing audience is ignored.
    pub fn publish(&self, event: StageEvent) {
        if self.sender.send(event).is_err() {
            trace!("event published with no subscribers");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order_to_every_subscriber() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        for position in [1.0, 2.0, 3.0] {
            bus.publish(StageEvent::PositionChanged {
                axis: Axis::Z,
                position,
            });
        }

        for rx in [&mut first, &mut second] {
            for expected in [1.0, 2.0, 3.0] {
                match rx.recv().await.unwrap() {
                    StageEvent::PositionChanged { axis, position } => {
                        assert_eq!(axis, Axis::Z);
                        assert_eq!(position, expected);
                    }
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(StageEvent::AutoStepProgress {
            current_step: 1,
            total_steps: 2,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
