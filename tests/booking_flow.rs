use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::sync::mpsc;
use ulid::Ulid;

use estatebook::clock::ManualClock;
use estatebook::engine::Engine;
use estatebook::error::EngineError;
use estatebook::model::*;
use estatebook::notify::NotifyHub;
use estatebook::reaper;
use estatebook::scheduler::{completion_key, CompletionScheduler, FiredJob, TimerQueue};

// ── Test infrastructure ──────────────────────────────────────

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("estatebook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn day(y: i32, m: u32, d: u32) -> Day {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

struct Service {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    queue: Arc<TimerQueue>,
    // Held so the queue keeps accepting jobs.
    _fired: mpsc::Receiver<FiredJob>,
}

impl Service {
    fn open(path: PathBuf) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()));
        let (queue, fired) = TimerQueue::new(clock.clone(), 1024);
        let queue = Arc::new(queue);
        let engine = Engine::new(
            path,
            Arc::new(NotifyHub::new()),
            CompletionScheduler::new(queue.clone()),
        )
        .unwrap()
        .with_clock(clock.clone());
        Self {
            engine: Arc::new(engine),
            clock,
            queue,
            _fired: fired,
        }
    }

    fn deadline(&self, reservation_id: Ulid) -> Option<DateTime<Utc>> {
        self.queue.fires_at(&completion_key(reservation_id))
    }

    async fn estate(&self, rate: Rate, min_stay: u32) -> (Estate, Actor) {
        let mut estate = Estate::new(Ulid::new(), Ulid::new(), rate);
        estate.min_stay = min_stay;
        self.engine.register_estate(estate.clone()).await.unwrap();
        let host = Actor::host(estate.host_id);
        (estate, host)
    }

    async fn book(&self, estate: &Estate, guest: &Actor, start: Day, end: Day) -> Result<Reservation, EngineError> {
        self.engine
            .create_reservation(
                guest,
                BookingRequest {
                    estate_id: estate.id,
                    range: DateRange::new(start, end),
                    occupancy: Occupancy::guests(2),
                },
            )
            .await
    }
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn nightly_stay_is_confirmed_at_rate_times_nights() {
    let svc = Service::open(wal_path("nightly.wal"));
    let (estate, _) = svc.estate(Rate::Nightly(100), 1).await;
    let guest = Actor::guest(Ulid::new());

    let r = svc.book(&estate, &guest, day(2024, 3, 1), day(2024, 3, 4)).await.unwrap();
    assert_eq!(r.price.total_price, 300);
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(svc.deadline(r.id), Some(midnight_utc(day(2024, 3, 4))));
}

#[tokio::test]
async fn overlapping_request_is_rejected() {
    let svc = Service::open(wal_path("overlap.wal"));
    let (estate, _) = svc.estate(Rate::Nightly(100), 1).await;
    let first = svc
        .book(&estate, &Actor::guest(Ulid::new()), day(2024, 3, 1), day(2024, 3, 4))
        .await
        .unwrap();

    let err = svc
        .book(&estate, &Actor::guest(Ulid::new()), day(2024, 3, 3), day(2024, 3, 6))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err, EngineError::Conflict(first.id));
    assert_eq!(svc.engine.reservations_for_estate(estate.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn monthly_lease_rounds_up_and_waits_for_host() {
    let svc = Service::open(wal_path("monthly.wal"));
    let (estate, host) = svc.estate(Rate::Monthly(800), 3).await;
    let guest = Actor::guest(Ulid::new());

    // Two months and twenty days.
    let r = svc.book(&estate, &guest, day(2024, 3, 1), day(2024, 5, 21)).await.unwrap();
    assert_eq!(r.price.total_price, 2400);
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(svc.deadline(r.id), None);

    let approved = svc.engine.approve_long_term(&host, r.id).await.unwrap();
    assert_eq!(approved.status, ReservationStatus::Confirmed);
    assert_eq!(svc.deadline(r.id), Some(midnight_utc(day(2024, 5, 21))));
}

#[tokio::test]
async fn approved_extension_adds_nights_and_moves_job() {
    let svc = Service::open(wal_path("extend.wal"));
    let (estate, host) = svc.estate(Rate::Nightly(100), 1).await;
    let guest = Actor::guest(Ulid::new());
    let r = svc.book(&estate, &guest, day(2024, 3, 1), day(2024, 3, 4)).await.unwrap();

    svc.engine.propose_extend(&guest, r.id, day(2024, 3, 9), None).await.unwrap();
    let extended = svc.engine.approve_change(&host, r.id).await.unwrap();

    assert_eq!(extended.range.end, day(2024, 3, 9));
    assert_eq!(extended.price.total_price, r.price.total_price + 500);
    assert_eq!(extended.status, ReservationStatus::Confirmed);
    assert_eq!(svc.deadline(r.id), Some(midnight_utc(day(2024, 3, 9))));
    assert_eq!(svc.queue.armed(), 1);
}

#[tokio::test]
async fn canceled_stay_ignores_late_completion() {
    let svc = Service::open(wal_path("cancel.wal"));
    let (estate, _) = svc.estate(Rate::Nightly(100), 1).await;
    let guest = Actor::guest(Ulid::new());
    let r = svc.book(&estate, &guest, day(2024, 3, 1), day(2024, 3, 4)).await.unwrap();

    let canceled = svc.engine.cancel_reservation(&guest, r.id).await.unwrap();
    assert_eq!(canceled.status, ReservationStatus::Canceled);
    assert_eq!(svc.deadline(r.id), None);

    svc.clock.set(midnight_utc(day(2024, 3, 5)));
    assert!(!svc.engine.fire_completion(r.id, "scheduler").await.unwrap());
    assert_eq!(svc.engine.get_reservation(r.id).await.unwrap(), canceled);
}

// ── Restart ──────────────────────────────────────────────────

#[tokio::test]
async fn sweep_after_restart_rearms_and_completes() {
    let path = wal_path("restart.wal");
    let (estate_id, ended, running) = {
        let svc = Service::open(path.clone());
        let (estate, _) = svc.estate(Rate::Nightly(100), 1).await;
        let ended = svc
            .book(&estate, &Actor::guest(Ulid::new()), day(2024, 3, 1), day(2024, 3, 4))
            .await
            .unwrap();
        let running = svc
            .book(&estate, &Actor::guest(Ulid::new()), day(2024, 3, 10), day(2024, 3, 20))
            .await
            .unwrap();
        (estate.id, ended.id, running.id)
    };

    let svc = Service::open(path);
    assert_eq!(svc.engine.pending_reconciliation(), 2);
    svc.clock.set(midnight_utc(day(2024, 3, 5)));

    let report = reaper::sweep_once(&svc.engine).await;
    assert_eq!(report.rearmed, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(svc.engine.pending_reconciliation(), 0);

    let ended = svc.engine.get_reservation(ended).await.unwrap();
    assert_eq!(ended.status, ReservationStatus::Completed);
    assert_eq!(svc.deadline(running), Some(midnight_utc(day(2024, 3, 20))));
    assert_eq!(
        svc.engine
            .occupied_ranges(estate_id, DateRange::new(day(2024, 3, 1), day(2024, 4, 1)))
            .await
            .unwrap(),
        vec![DateRange::new(day(2024, 3, 10), day(2024, 3, 20))]
    );
}
