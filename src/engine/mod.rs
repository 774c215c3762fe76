mod availability;
mod locks;
mod mutations;
mod queries;

pub use availability::{
    calendar, check_available, find_conflict, free_ranges, is_available, merge_adjacent,
    occupied_ranges, subtract_ranges, validate_range,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::lifecycle::Effect;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::observability;
use crate::scheduler::CompletionScheduler;
use crate::wal::{Wal, WalWriter};

pub type SharedEstateState = Arc<RwLock<EstateState>>;

pub struct Engine {
    pub(super) estates: DashMap<Ulid, SharedEstateState>,
    /// Reverse lookup: reservation id → estate id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    pub(super) wal: WalWriter,
    pub notify: Arc<NotifyHub>,
    pub(super) scheduler: CompletionScheduler,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) completion_grace: Duration,
    /// Confirmed reservations whose completion job may not be armed.
    pub(super) unscheduled: DashSet<Ulid>,
    /// Serializes estate registration against WAL compaction.
    pub(super) registry: Mutex<()>,
}

/// Apply an event to an estate. The caller holds the estate lock.
fn apply_to_estate(state: &mut EstateState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::EstateUpdated { estate } => state.terms = estate.clone(),
        Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
            index.insert(reservation.id, reservation.estate_id);
            state.upsert_reservation(reservation.clone());
        }
        Event::LockPlaced { lock } => state.insert_lock(lock.clone()),
        Event::LocksRemoved { ids, .. } => {
            for id in ids {
                state.remove_lock(id);
            }
        }
        Event::RatingRecorded { rating, .. } => state.rating = *rating,
        // Registration is handled at the DashMap level.
        Event::EstateRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        scheduler: CompletionScheduler,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalWriter::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            estates: DashMap::new(),
            reservation_index: DashMap::new(),
            wal,
            notify,
            scheduler,
            clock: Arc::new(SystemClock),
            completion_grace: Duration::zero(),
            unscheduled: DashSet::new(),
            registry: Mutex::new(()),
        };

        // Rebuild plain states first, then publish them behind locks.
        let mut states: Vec<(Ulid, EstateState)> = Vec::new();
        let mut slots: std::collections::HashMap<Ulid, usize> = std::collections::HashMap::new();
        for event in &events {
            if let Event::EstateRegistered { estate } = event {
                slots.insert(estate.id, states.len());
                states.push((estate.id, EstateState::new(estate.clone())));
                continue;
            }
            match slots.get(&event.estate_id()) {
                Some(&slot) => apply_to_estate(&mut states[slot].1, event, &engine.reservation_index),
                None => tracing::warn!(estate_id = %event.estate_id(), "WAL event for unknown estate"),
            }
        }

        for (id, state) in states {
            // Jobs died with the previous process; the sweeper re-arms these.
            for r in &state.reservations {
                if r.status == ReservationStatus::Confirmed {
                    engine.unscheduled.insert(r.id);
                }
            }
            engine.estates.insert(id, Arc::new(RwLock::new(state)));
        }

        metrics::gauge!(observability::ESTATES_ACTIVE).set(engine.estates.len() as f64);
        metrics::gauge!(observability::RECONCILIATION_BACKLOG).set(engine.unscheduled.len() as f64);
        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                estates = engine.estates.len(),
                reservations = engine.reservation_index.len(),
                "replayed WAL"
            );
        }
        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delay after midnight UTC of the end day before a stay counts as ended.
    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn completion_grace(&self) -> Duration {
        self.completion_grace
    }

    /// When the completion job for a stay ending on `end` should fire.
    pub fn completion_time(&self, end: Day) -> DateTime<Utc> {
        midnight_utc(end) + self.completion_grace
    }

    pub fn get_estate_state(&self, id: &Ulid) -> Option<SharedEstateState> {
        self.estates.get(id).map(|e| e.value().clone())
    }

    pub fn estate_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append then apply. Nothing touches memory unless the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut EstateState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal.append(event).await?;
        apply_to_estate(state, event, &self.reservation_index);
        Ok(())
    }

    pub(super) async fn estate_write(
        &self,
        estate_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<EstateState>, EngineError> {
        let state = self
            .get_estate_state(estate_id)
            .ok_or(EngineError::NotFound(*estate_id))?;
        Ok(state.write_owned().await)
    }

    /// Lookup reservation → estate, acquire that estate's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<EstateState>, EngineError> {
        let estate_id = self
            .estate_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        self.estate_write(&estate_id).await
    }

    /// Read-check-write one reservation under its estate's write lock.
    ///
    /// `step` mutates a copy of the reservation and returns the effects to
    /// run, or `None` for a no-op. On error nothing is written. Returns the
    /// committed record, or `None` if the step was a no-op.
    pub(super) async fn transition<F>(
        &self,
        reservation_id: Ulid,
        op: &'static str,
        step: F,
    ) -> Result<Option<Reservation>, EngineError>
    where
        F: FnOnce(&EstateState, &mut Reservation) -> Result<Option<Vec<Effect>>, EngineError>,
    {
        let started = std::time::Instant::now();
        let mut guard = self.resolve_reservation_write(&reservation_id).await?;
        let mut next = guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;
        let status_before = next.status;

        let effects = match step(&*guard, &mut next) {
            Ok(Some(effects)) => effects,
            Ok(None) => {
                tracing::debug!(%reservation_id, op, "no-op transition");
                return Ok(None);
            }
            Err(e) => {
                observability::record_transition(op, e.label());
                tracing::debug!(%reservation_id, op, error = %e, "transition rejected");
                return Err(e);
            }
        };

        next.updated_at = self.clock.now();
        let event = Event::ReservationUpdated { reservation: next.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        self.run_effects(&next, &effects).await;
        drop(guard);

        self.notify
            .send(next.estate_id, Notice::ReservationChanged(next.clone()));
        observability::record_transition(op, "ok");
        metrics::histogram!(observability::TRANSITION_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            %reservation_id,
            op,
            from = %status_before,
            to = %next.status,
            "reservation transition"
        );
        Ok(Some(next))
    }

    /// Run lifecycle effects for a committed reservation. Scheduler failures
    /// never undo the commit; they leave the reservation for reconciliation.
    pub(super) async fn run_effects(&self, reservation: &Reservation, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::ScheduleCompletion { ends } => {
                    self.arm_completion(reservation.id, *ends, false).await;
                }
                Effect::RescheduleCompletion { ends } => {
                    self.arm_completion(reservation.id, *ends, true).await;
                }
                Effect::CancelCompletion => {
                    self.unscheduled.remove(&reservation.id);
                    match self.scheduler.cancel(reservation.id).await {
                        Ok(true) => metrics::counter!(observability::JOBS_CANCELED_TOTAL).increment(1),
                        Ok(false) => {}
                        // A stray fire is a no-op, so a failed cancel only needs a log line.
                        Err(e) => tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to cancel completion job"),
                    }
                    self.update_backlog_gauge();
                }
                Effect::RequestContract(kind) => {
                    tracing::info!(reservation_id = %reservation.id, kind = kind.as_str(), "contract requested");
                    self.notify.send(
                        reservation.estate_id,
                        Notice::ContractRequested {
                            reservation: reservation.clone(),
                            kind: *kind,
                        },
                    );
                }
            }
        }
    }

    pub(super) async fn arm_completion(&self, reservation_id: Ulid, ends: Day, replace: bool) {
        let fires_at = self.completion_time(ends);
        let result = if replace {
            self.scheduler.reschedule(reservation_id, fires_at).await
        } else {
            self.scheduler.schedule(reservation_id, fires_at).await
        };
        match result {
            Ok(()) => {
                self.unscheduled.remove(&reservation_id);
                metrics::counter!(observability::JOBS_ARMED_TOTAL).increment(1);
                tracing::debug!(%reservation_id, %fires_at, "completion job armed");
            }
            Err(e) => {
                self.unscheduled.insert(reservation_id);
                metrics::counter!(observability::SCHEDULE_FAILURES_TOTAL).increment(1);
                tracing::warn!(%reservation_id, error = %e, "failed to arm completion job, queued for reconciliation");
            }
        }
        self.update_backlog_gauge();
    }

    fn update_backlog_gauge(&self) {
        metrics::gauge!(observability::RECONCILIATION_BACKLOG).set(self.unscheduled.len() as f64);
    }
}
