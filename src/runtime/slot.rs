//! Handler slot: one worker endpoint serving broker dispatches.
//!
//! A slot announces itself with the ready sentinel, then loops over its
//! dispatch channel. Pings keep flowing while a request is being handled so
//! a slow allocation does not look like a dead worker.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::core::{RequestHandler, WorkerAddress};
use crate::runtime::broker::WorkerLink;

/// Signal the owner of a slot pool broadcasts to its slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotStop {
    /// Keep serving.
    #[default]
    Running,
    /// Finish and answer the request in hand, then leave.
    Drain,
    /// Leave now; the broker redelivers whatever was in hand.
    Abandon,
}

/// Why [`run_slot`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotExit {
    /// The owner asked the slot to stop.
    Stopped,
    /// The broker dropped this endpoint while the slot was still serving.
    Evicted,
    /// The broker is gone.
    BrokerGone,
}

/// Serve dispatches for `address` until `stop` leaves
/// [`SlotStop::Running`] or the broker lets go of the endpoint.
pub async fn run_slot<H>(
    address: WorkerAddress,
    link: WorkerLink,
    handler: H,
    ping_interval: Duration,
    mut stop: watch::Receiver<SlotStop>,
) -> SlotExit
where
    H: RequestHandler,
{
    let (dispatch_tx, mut dispatch) = mpsc::unbounded_channel();
    if link.ready(address.clone(), dispatch_tx).is_err() {
        warn!(slot = %address, "broker unreachable, slot not started");
        return SlotExit::BrokerGone;
    }
    info!(slot = %address, "slot registered");

    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    let exit = loop {
        if *stop.borrow() != SlotStop::Running {
            break SlotExit::Stopped;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break SlotExit::Stopped;
                }
            }
            _ = ping.tick() => {
                if link.heartbeat(address.clone()).is_err() {
                    break SlotExit::BrokerGone;
                }
            }
            next = dispatch.recv() => {
                let Some(envelope) = next else {
                    warn!(slot = %address, "evicted by broker, dispatch channel closed");
                    break SlotExit::Evicted;
                };
                let work = handler.handle(&envelope);
                tokio::pin!(work);
                let mut watching = true;
                let payload = loop {
                    tokio::select! {
                        payload = &mut work => break Some(payload),
                        _ = ping.tick() => {
                            let _ = link.heartbeat(address.clone());
                        }
                        changed = stop.changed(), if watching => {
                            if changed.is_err() {
                                watching = false;
                            } else if *stop.borrow() == SlotStop::Abandon {
                                break None;
                            }
                        }
                    }
                };
                let Some(payload) = payload else {
                    warn!(
                        slot = %address,
                        correlation_id = %envelope.correlation_id,
                        "slot abandoned request, broker will redeliver"
                    );
                    break SlotExit::Stopped;
                };
                if link.reply(address.clone(), envelope.reply_with(payload)).is_err() {
                    break SlotExit::BrokerGone;
                }
            }
        }
    };

    let _ = link.disconnect(address.clone());
    info!(slot = %address, ?exit, "slot stopped");
    exit
}
