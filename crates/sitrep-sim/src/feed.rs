use std::collections::HashMap;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use sitrep_core::feed::FeedEvent;
use sitrep_core::model::IncidentId;

/// Fault injection configuration for the simulated change feed and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of events delivered twice.
    pub duplicate_rate_percent: u8,
    /// Percentage chance per round of swapping adjacent ready events that
    /// belong to different incidents.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round of hanging up every subscriber.
    pub disconnect_rate_percent: u8,
    /// Percentage of operator status writes that fail.
    pub write_failure_percent: u8,
    /// Percentage chance per round that officer lookups fail.
    pub lookup_failure_percent: u8,
    /// Percentage chance per round that page reads fail.
    pub read_failure_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 10,
            disconnect_rate_percent: 3,
            write_failure_percent: 10,
            lookup_failure_percent: 5,
            read_failure_percent: 3,
        }
    }
}

/// Bernoulli trial with integer percent.
pub fn hit(rng: &mut StdRng, percent: u8) -> bool {
    match percent {
        0 => false,
        100.. => true,
        _ => rng.gen_range(0..100_u8) < percent,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct InFlight {
    deliver_at_round: u64,
    seq: u64,
    event: FeedEvent,
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub duplicated: bool,
    pub delay_rounds: u8,
}

/// Result of delivering all ready events for a round.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverOutcome {
    pub delivered: Vec<FeedEvent>,
    /// Adjacent cross-incident swaps applied.
    pub swaps: usize,
}

/// Deterministic fault-injecting change feed.
///
/// Events for the same incident are never delivered out of order. Delays,
/// duplicates and swaps only ever interleave events of different incidents.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFeed {
    in_flight: Vec<InFlight>,
    /// Latest delivery round promised per incident.
    horizon: HashMap<IncidentId, u64>,
    next_seq: u64,
    fault: FaultConfig,
}

impl SimulatedFeed {
    #[must_use]
    pub fn new(fault: FaultConfig) -> Self {
        Self {
            fault,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Number of queued in-flight events.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.in_flight.len()
    }

    fn enqueue(&mut self, deliver_at_round: u64, event: FeedEvent) {
        self.in_flight.push(InFlight {
            deliver_at_round,
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    pub fn send(&mut self, event: FeedEvent, round: u64, rng: &mut StdRng) -> SendOutcome {
        let delay = rng.gen_range(0..=self.fault.max_delay_rounds);
        let wanted = round.saturating_add(u64::from(delay));
        let horizon = self.horizon.entry(event.id().clone()).or_insert(0);
        let deliver_at = wanted.max(*horizon);
        *horizon = deliver_at;

        let duplicated = hit(rng, self.fault.duplicate_rate_percent);
        if duplicated {
            self.enqueue(deliver_at, event.clone());
        }
        self.enqueue(deliver_at, event);

        SendOutcome {
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Deliver every event whose round has arrived, in enqueue order with
    /// optional cross-incident swaps.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut StdRng) -> DeliverOutcome {
        let (mut ready, future): (Vec<InFlight>, Vec<InFlight>) = self
            .in_flight
            .drain(..)
            .partition(|pending| pending.deliver_at_round <= round);
        self.in_flight = future;
        ready.sort_by_key(|pending| (pending.deliver_at_round, pending.seq));

        let mut delivered: Vec<FeedEvent> = ready.into_iter().map(|pending| pending.event).collect();
        let mut swaps = 0;
        if delivered.len() > 1 && hit(rng, self.fault.reorder_rate_percent) {
            let mut i = 0;
            while i + 1 < delivered.len() {
                if delivered[i].id() != delivered[i + 1].id() && rng.gen_bool(0.5) {
                    delivered.swap(i, i + 1);
                    swaps += 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }

        DeliverOutcome { delivered, swaps }
    }

    /// Deliver everything still queued, ignoring delays.
    pub fn drain_all(&mut self) -> Vec<FeedEvent> {
        let mut all: Vec<InFlight> = self.in_flight.drain(..).collect();
        all.sort_by_key(|pending| (pending.deliver_at_round, pending.seq));
        all.into_iter().map(|pending| pending.event).collect()
    }

    /// Drop everything in flight, as a severed connection would.
    pub fn sever(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        dropped
    }
}
