//! sitrep-sim: deterministic simulation of desk views under feed faults.
//!
//! A [`Simulator`] drives several [`IncidentView`]s over a [`SimBackend`]
//! whose change feed is routed through a [`SimulatedFeed`]. Each round mixes
//! officer submissions, external desk updates, operator transitions, removals
//! and reads that race the feed, while the feed delays, duplicates and
//! reorders events and occasionally hangs up. The [`oracle`] checks every view
//! after each round and once more after the system has gone quiet.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod backend;
pub mod campaign;
pub mod feed;
pub mod oracle;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sitrep_core::IncidentView;
use sitrep_core::backend::Faults;
use sitrep_core::clock::{Clock, ManualClock};
use sitrep_core::config::{ArchiveConfig, EngineConfig, ViewConfig};
use sitrep_core::feed::{ConnectionState, FeedEvent, FeedMessage, Subscription};
use sitrep_core::model::{
    FieldPatch, GeoPoint, IncidentId, IncidentRecord, IncidentRow, Officer, PLACEHOLDER_REPORTER,
    Reporter, Status, micros_to_utc,
};
use sitrep_core::ports::INCIDENTS_COLLECTION;
use sitrep_core::query::{PageRequest, SeverityBucket, ViewScope};
use sitrep_core::transition::TransitionOutcome;

pub use backend::SimBackend;
pub use campaign::{CampaignConfig, CampaignReport, run_campaign};
pub use feed::{FaultConfig, SimulatedFeed};
use oracle::{OracleResult, ViewOracle, ViewState};

/// Wall-clock start of every simulation.
pub const BASE_MILLIS: i64 = 1_700_000_000_000;

/// Upper bound on settle passes after the last round.
const QUIESCE_PASSES: usize = 16;

const CATEGORIES: [&str; 6] = ["Flood", "Fire", "Landslide", "Collision", "Medical", "Storm"];
const OFFICER_NAMES: [&str; 5] = ["K. Silva", "A. Perera", "N. Fernando", "R. Jayasuriya", "M. Dias"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub rounds: u64,
    /// Incidents filed before any view opens.
    pub initial_incidents: usize,
    pub officer_count: usize,
    pub page_size: u32,
    /// Simulated time per round.
    pub tick_millis: u64,
    pub archive_delay_ms: u64,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            rounds: 40,
            initial_incidents: 12,
            officer_count: 4,
            page_size: 8,
            tick_millis: 500,
            archive_delay_ms: 2_000,
            fault: FaultConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.page_size == 0 {
            bail!("page_size must be > 0");
        }
        if self.officer_count == 0 {
            bail!("officer_count must be > 0");
        }
        Ok(())
    }
}

/// What happened in one simulation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Submit { id: IncidentId },
    ExternalUpdate { id: IncidentId, status: Option<Status> },
    Transition {
        view: String,
        id: IncidentId,
        target: Status,
        write_failed: bool,
    },
    Remove { id: IncidentId },
    RacedRefresh { view: String, applied: bool, degraded: bool },
    Deliver { count: usize, swaps: usize },
    Disconnect { dropped: usize },
    Reconnect { view: String },
    Archive { view: String, id: IncidentId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

/// How often each fault actually fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounters {
    pub duplicates: usize,
    pub swaps: usize,
    pub disconnects: usize,
    /// Transitions whose write failed, forcing a re-read.
    pub resyncs: usize,
    pub raced_reads: usize,
    pub archived: usize,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub oracle: OracleResult,
    pub counters: FaultCounters,
    /// View states after the final read.
    pub final_views: Vec<ViewState>,
    /// Whether the run exercised a duplicate, a swap, a hang-up and a
    /// resync.
    pub interesting_state_reached: bool,
}

struct DeskView {
    name: &'static str,
    view: IncidentView<SimBackend>,
    reconnect_at: Option<u64>,
}

pub struct Simulator {
    config: SimulationConfig,
    engine: EngineConfig,
    rng: StdRng,
    clock: Arc<ManualClock>,
    backend: Arc<SimBackend>,
    tap: Subscription,
    feed: SimulatedFeed,
    views: Vec<DeskView>,
    next_incident: usize,
    round: u64,
    round_events: Vec<FeedEvent<IncidentRecord>>,
    trace: Vec<TraceEvent>,
    counters: FaultCounters,
    oracle: OracleResult,
}

impl Simulator {
    /// Seed the store, open the views and tap the store's feed.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid config or if a view cannot open.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let clock = Arc::new(ManualClock::new(BASE_MILLIS));
        let backend = Arc::new(SimBackend::new());

        for n in 1..=config.officer_count {
            backend.inner().upsert_officer(Officer {
                id: format!("off-{n}"),
                name: OFFICER_NAMES[(n - 1) % OFFICER_NAMES.len()].to_string(),
                phone: None,
                role: "officer".to_string(),
            });
        }
        for n in 0..config.initial_incidents {
            let row = incident_row(&mut rng, n, BASE_MILLIS, config.officer_count)?;
            backend.inner().submit(row);
        }
        let tap = backend.inner().hub().open(INCIDENTS_COLLECTION);

        let engine = EngineConfig {
            view: ViewConfig {
                page_size: config.page_size,
            },
            archive: ArchiveConfig {
                delay_ms: config.archive_delay_ms,
                ..ArchiveConfig::default()
            },
            ..EngineConfig::default()
        };

        let active = PageRequest::scoped(ViewScope::Active, config.page_size);
        let requests = [
            ("active", active.clone()),
            ("completed", PageRequest::scoped(ViewScope::Completed, config.page_size)),
            ("critical", active.with_severity(SeverityBucket::Critical)),
        ];
        let mut views = Vec::with_capacity(requests.len());
        for (name, request) in requests {
            let view = IncidentView::open(Arc::clone(&backend), clock.clone(), request, &engine)
                .with_context(|| format!("open {name} view"))?;
            views.push(DeskView {
                name,
                view,
                reconnect_at: None,
            });
        }

        Ok(Self {
            feed: SimulatedFeed::new(config.fault),
            next_incident: config.initial_incidents,
            config,
            engine,
            rng,
            clock,
            backend,
            tap,
            views,
            round: 0,
            round_events: Vec::new(),
            trace: Vec::new(),
            counters: FaultCounters::default(),
            oracle: OracleResult::pass(),
        })
    }

    /// Run every round, let the system settle, then check convergence.
    ///
    /// # Errors
    ///
    /// Returns an error if an incident cannot be generated.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(seed = self.config.seed, rounds = self.config.rounds, "simulation started");
        for round in 0..self.config.rounds {
            self.round = round;
            self.step()?;
        }
        self.quiesce();
        let final_views = self.final_checks();

        let c = self.counters;
        let result = SimulationResult {
            seed: self.config.seed,
            trace: std::mem::take(&mut self.trace),
            oracle: std::mem::replace(&mut self.oracle, OracleResult::pass()),
            counters: c,
            final_views,
            interesting_state_reached: c.duplicates > 0
                && c.swaps > 0
                && c.disconnects > 0
                && c.resyncs > 0,
        };
        info!(
            seed = result.seed,
            passed = result.oracle.passed,
            violations = result.oracle.violations.len(),
            "simulation finished"
        );
        Ok(result)
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &SimBackend {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    fn step(&mut self) -> Result<()> {
        let fault = self.config.fault;
        let faults = Faults {
            fail_lookups: feed::hit(&mut self.rng, fault.lookup_failure_percent),
            fail_reads: feed::hit(&mut self.rng, fault.read_failure_percent),
            ..Faults::default()
        };
        self.backend.inner().set_faults(faults);

        let actions = self.rng.gen_range(1..=3);
        for _ in 0..actions {
            self.act()?;
        }
        if feed::hit(&mut self.rng, fault.disconnect_rate_percent) {
            self.disconnect();
        }

        self.drain_tap();
        let outcome = self.feed.deliver_ready(self.round, &mut self.rng);
        self.counters.swaps += outcome.swaps;
        if !outcome.delivered.is_empty() {
            self.record(TraceEventKind::Deliver {
                count: outcome.delivered.len(),
                swaps: outcome.swaps,
            });
        }
        self.deliver(outcome.delivered);
        self.pump_views(false);

        self.clock
            .advance(Duration::from_millis(self.config.tick_millis));
        self.tick_views();
        self.check_views();
        Ok(())
    }

    fn act(&mut self) -> Result<()> {
        match self.rng.gen_range(0..100_u8) {
            0..=29 => self.submit()?,
            30..=54 => self.external_update(),
            55..=79 => self.operator_transition(),
            80..=87 => self.remove(),
            _ => self.raced_refresh(),
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        let row = incident_row(
            &mut self.rng,
            self.next_incident,
            self.clock.now_millis(),
            self.config.officer_count,
        )?;
        self.next_incident += 1;
        let id = row.id.clone();
        self.backend.inner().submit(row);
        self.record(TraceEventKind::Submit { id });
        Ok(())
    }

    fn random_incident(&mut self) -> Option<IncidentId> {
        let ids = self.backend.inner().incident_ids();
        if ids.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..ids.len());
        ids.into_iter().nth(idx)
    }

    fn random_status(&mut self) -> Status {
        Status::ALL[self.rng.gen_range(0..Status::ALL.len())]
    }

    /// Another desk edits an incident directly in the store.
    fn external_update(&mut self) {
        let Some(id) = self.random_incident() else {
            return;
        };
        let patch = match self.rng.gen_range(0..4_u8) {
            0 | 1 => FieldPatch::status(self.random_status()),
            2 => FieldPatch {
                severity: Some(self.rng.gen_range(1..=5)),
                ..FieldPatch::default()
            },
            _ => FieldPatch {
                victim_count: Some(self.rng.gen_range(0..20)),
                evidence_ref: Some(Some(format!("evidence/{id}.jpg"))),
                ..FieldPatch::default()
            },
        };
        if let Err(err) = self.backend.inner().apply_patch(&id, &patch) {
            debug!(%id, error = %err, "external update skipped");
            return;
        }
        self.record(TraceEventKind::ExternalUpdate {
            id,
            status: patch.status,
        });
    }

    /// An operator moves a visible incident through one of the views.
    fn operator_transition(&mut self) {
        let idx = self.rng.gen_range(0..self.views.len());
        let visible: Vec<IncidentId> = self.views[idx]
            .view
            .records()
            .map(|record| record.id().clone())
            .collect();
        if visible.is_empty() {
            return;
        }
        let id = visible[self.rng.gen_range(0..visible.len())].clone();
        let target = self.random_status();
        let write_failed = feed::hit(&mut self.rng, self.config.fault.write_failure_percent);

        let inner = self.backend.inner();
        let before = inner.faults();
        if write_failed {
            inner.set_faults(Faults {
                fail_writes: true,
                ..before
            });
        }
        let outcome = self.views[idx].view.transition_to(&id, target);
        inner.set_faults(before);

        if outcome == TransitionOutcome::Resync {
            self.counters.resyncs += 1;
        }
        let view = self.views[idx].name.to_string();
        self.record(TraceEventKind::Transition {
            view,
            id,
            target,
            write_failed,
        });
    }

    fn remove(&mut self) {
        let Some(id) = self.random_incident() else {
            return;
        };
        if self.backend.inner().remove(&id) {
            self.record(TraceEventKind::Remove { id });
        }
    }

    /// Issue a read, let the feed deliver while it is outstanding, then land it.
    fn raced_refresh(&mut self) {
        let idx = self.rng.gen_range(0..self.views.len());
        let (token, page) = self.views[idx].view.begin_refresh();
        let degraded = page.degraded;

        self.drain_tap();
        let outcome = self.feed.deliver_ready(self.round, &mut self.rng);
        self.counters.swaps += outcome.swaps;
        self.deliver(outcome.delivered);
        self.views[idx].view.pump();

        let applied = self.views[idx].view.finish_refresh(token, page);
        self.counters.raced_reads += 1;
        let view = self.views[idx].name.to_string();
        self.record(TraceEventKind::RacedRefresh {
            view,
            applied,
            degraded,
        });
    }

    fn disconnect(&mut self) {
        self.backend.delivery().disconnect_all();
        let dropped = self.feed.sever();
        for desk in &mut self.views {
            desk.reconnect_at = Some(self.round + 1 + self.rng.gen_range(0..=2));
        }
        self.counters.disconnects += 1;
        self.record(TraceEventKind::Disconnect { dropped });
    }

    // -----------------------------------------------------------------------
    // Feed plumbing
    // -----------------------------------------------------------------------

    /// Move everything the store published into the simulated feed.
    fn drain_tap(&mut self) -> usize {
        let mut sent = 0;
        while let Ok(message) = self.tap.try_recv() {
            if let FeedMessage::Change(event) = message {
                let outcome = self.feed.send(event, self.round, &mut self.rng);
                if outcome.duplicated {
                    self.counters.duplicates += 1;
                }
                sent += 1;
            }
        }
        sent
    }

    fn deliver(&mut self, events: Vec<FeedEvent>) {
        for event in events {
            self.backend
                .delivery()
                .publish(INCIDENTS_COLLECTION, &event);
            self.round_events.push(
                event.map_inserted(|row| row.hydrate(Reporter::placeholder(PLACEHOLDER_REPORTER))),
            );
        }
    }

    /// Pump every view and bring disconnected ones back, immediately when
    /// `force` is set. Returns how many views reconnected.
    fn pump_views(&mut self, force: bool) -> usize {
        let mut reconnected = Vec::new();
        for desk in &mut self.views {
            desk.view.pump();
            if desk.view.connection() != ConnectionState::Disconnected {
                continue;
            }
            let due = *desk.reconnect_at.get_or_insert(self.round + 1);
            if force || due <= self.round {
                desk.view.reconnect();
                desk.reconnect_at = None;
                reconnected.push(desk.name.to_string());
            }
        }
        let count = reconnected.len();
        for view in reconnected {
            self.record(TraceEventKind::Reconnect { view });
        }
        count
    }

    fn tick_views(&mut self) -> usize {
        let mut archived = Vec::new();
        for desk in &mut self.views {
            for id in desk.view.tick() {
                archived.push((desk.name.to_string(), id));
            }
        }
        let count = archived.len();
        self.counters.archived += count;
        for (view, id) in archived {
            self.record(TraceEventKind::Archive { view, id });
        }
        count
    }

    fn record(&mut self, kind: TraceEventKind) {
        self.trace.push(TraceEvent {
            round: self.round,
            kind,
        });
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    fn capture(&self, desk: &DeskView) -> ViewState {
        ViewState::capture(desk.name, &desk.view, self.engine.stats.critical_threshold)
    }

    fn check_views(&mut self) {
        let events = std::mem::take(&mut self.round_events);
        let mut result = OracleResult::pass();
        for desk in &self.views {
            let state = self.capture(desk);
            result = result
                .merge(ViewOracle::check_view(&state))
                .merge(ViewOracle::check_idempotence(desk.name, desk.view.store(), &events));
        }
        self.absorb(result);
    }

    fn absorb(&mut self, result: OracleResult) {
        if !result.passed {
            debug!(round = self.round, violations = result.violations.len(), "invariant violated");
        }
        let so_far = std::mem::replace(&mut self.oracle, OracleResult::pass());
        self.oracle = so_far.merge(result);
    }

    /// Clear faults and deliver everything until no view has work left.
    fn quiesce(&mut self) {
        self.backend.inner().set_faults(Faults::default());
        for pass in 0..QUIESCE_PASSES {
            self.round = self.config.rounds + pass as u64;
            let sent = self.drain_tap();
            let events = self.feed.drain_all();
            let delivered = events.len();
            self.deliver(events);
            let reconnected = self.pump_views(true);

            self.clock
                .advance(Duration::from_millis(self.config.archive_delay_ms));
            let archived = self.tick_views();
            self.check_views();
            if sent == 0 && delivered == 0 && reconnected == 0 && archived == 0 {
                debug!(passes = pass + 1, "simulation quiesced");
                return;
            }
        }
    }

    /// Compare every view against the store before and after a final read.
    fn final_checks(&mut self) -> Vec<ViewState> {
        let source = self.backend.inner().all_records();
        let mut result = OracleResult::pass();
        for desk in &self.views {
            let state = self.capture(desk);
            result = result.merge(ViewOracle::check_feed_convergence(&state, &source));
        }

        let mut finals = Vec::with_capacity(self.views.len());
        for idx in 0..self.views.len() {
            self.views[idx].view.refresh();
            let state = self.capture(&self.views[idx]);
            result = result
                .merge(ViewOracle::check_view(&state))
                .merge(ViewOracle::check_page(&state, &source));
            finals.push(state);
        }
        self.absorb(result);
        finals
    }
}

/// A fresh report filed by a random officer, sometimes one the roster lacks.
fn incident_row(rng: &mut StdRng, n: usize, now_ms: i64, officer_count: usize) -> Result<IncidentRow> {
    let age_ms = rng.gen_range(0..600_000_i64);
    let reported_at = micros_to_utc((now_ms - age_ms) * 1_000)
        .context("simulated report time out of range")?;
    let reporter_id = match rng.gen_range(0..10_u8) {
        0 => None,
        1 => Some("off-unlisted".to_string()),
        _ => Some(format!("off-{}", rng.gen_range(1..=officer_count))),
    };
    Ok(IncidentRow {
        id: IncidentId::new(format!("inc-{n:04}")),
        category: CATEGORIES[rng.gen_range(0..CATEGORIES.len())].to_string(),
        severity: rng.gen_range(1..=5),
        position: GeoPoint::new(rng.gen_range(5.9..9.9), rng.gen_range(79.5..81.9)),
        victim_count: rng.gen_range(0..12),
        reported_at,
        status: Status::Pending,
        evidence_ref: None,
        reporter_id,
    })
}
