//! The cooperative loop around one [`LaneController`].
//!
//! A single task multiplexes three event sources with `tokio::select!`:
//! inbound bus messages, a fixed-interval tick, and the shutdown signal.
//! Everything the controller emits is published immediately, and every
//! aspect change is pushed to the [`SignalActuator`].
//!
//! Bus faults never stop the loop. A failed publish is retried once; if the
//! retry fails too the message is lost and a gap is logged.

use std::future::Future;
use std::time::Duration;

use crossway_core::LaneController;
use crossway_core::clock::Clock;
use crossway_types::wire::{self, Topic};
use crossway_types::{Outbound, SignalAspect};
use futures::{Stream, StreamExt as _};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::actuator::SignalActuator;
use crate::error::NodeError;

/// A raw message taken off the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Full subject, prefix included.
    pub subject: String,
    /// Undecoded payload.
    pub payload: Vec<u8>,
}

/// Sends controller output onto the bus.
pub trait Publisher {
    /// Encode and publish one message.
    fn publish(&self, message: &Outbound) -> impl Future<Output = Result<(), NodeError>>;
}

/// A controller bound to its subject prefix and signal head.
#[derive(Debug)]
pub struct Driver<C, A> {
    controller: LaneController<C>,
    actuator: A,
    prefix: String,
    shown: SignalAspect,
}

impl<C: Clock, A: SignalActuator> Driver<C, A> {
    /// Wrap `controller` and show its initial aspect.
    pub fn new(controller: LaneController<C>, mut actuator: A, prefix: &str) -> Self {
        let shown = controller.aspect();
        actuator.show(controller.lane(), shown);
        Self {
            controller,
            actuator,
            prefix: prefix.to_owned(),
            shown,
        }
    }

    /// The wrapped controller.
    pub const fn controller(&self) -> &LaneController<C> {
        &self.controller
    }

    /// Route one bus message to the controller.
    ///
    /// Unknown subjects, outbound-only topics and malformed payloads are
    /// dropped.
    pub fn receive(&mut self, subject: &str, payload: &[u8]) -> Vec<Outbound> {
        let Some(topic) = Topic::from_subject(&self.prefix, subject) else {
            trace!(subject = subject, "ignoring unknown subject");
            return Vec::new();
        };
        if !topic.is_inbound() {
            return Vec::new();
        }
        let emitted = match wire::decode(topic, payload, self.controller.utc_offset()) {
            Ok(inbound) => self.controller.handle(inbound),
            Err(e) => {
                debug!(topic = %topic, error = %e, "dropped malformed payload");
                return Vec::new();
            }
        };
        self.actuate();
        emitted
    }

    /// Advance the controller's timers.
    pub fn tick(&mut self) -> Vec<Outbound> {
        let emitted = self.controller.tick();
        self.actuate();
        emitted
    }

    fn actuate(&mut self) {
        let aspect = self.controller.aspect();
        if aspect != self.shown {
            self.shown = aspect;
            self.actuator.show(self.controller.lane(), aspect);
        }
    }
}

/// Run `driver` until `shutdown` resolves or the inbound stream ends.
pub async fn run<C, A, P, S, F>(
    mut driver: Driver<C, A>,
    mut inbound: S,
    publisher: &P,
    tick_every: Duration,
    shutdown: F,
) where
    C: Clock,
    A: SignalActuator,
    P: Publisher,
    S: Stream<Item = Incoming> + Unpin,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        lane = %driver.controller().lane(),
        tick_interval_ms = tick_every.as_millis(),
        "driver loop started"
    );

    loop {
        let emitted = tokio::select! {
            () = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            incoming = inbound.next() => {
                let Some(incoming) = incoming else {
                    warn!("subscription closed");
                    break;
                };
                driver.receive(&incoming.subject, &incoming.payload)
            }
            _ = ticker.tick() => driver.tick(),
        };
        for message in &emitted {
            publish_with_retry(publisher, message).await;
        }
    }
}

/// Publish `message`, retrying once before giving up.
pub async fn publish_with_retry<P: Publisher>(publisher: &P, message: &Outbound) -> bool {
    let Err(first) = publisher.publish(message).await else {
        return true;
    };
    debug!(error = %first, "publish failed, retrying");
    match publisher.publish(message).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "publish failed twice; message lost");
            false
        }
    }
}
