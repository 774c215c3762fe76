use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::lifecycle::ContractKind;
use crate::model::{DateRange, LockWindow, Reservation};

const CHANNEL_CAPACITY: usize = 256;

/// What the engine tells its collaborators (contracts, email, calendar UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ReservationChanged(Reservation),
    ContractRequested {
        reservation: Reservation,
        kind: ContractKind,
    },
    LockPlaced(LockWindow),
    LocksRemoved {
        estate_id: Ulid,
        range: DateRange,
        ids: Vec<Ulid>,
    },
}

/// Broadcast hub with one channel per estate plus a firehose of everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
    all: broadcast::Sender<Notice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notices for one estate. Creates the channel if needed.
    pub fn subscribe(&self, estate_id: Ulid) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(estate_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Publish a notice. No-op if nobody is listening.
    pub fn send(&self, estate_id: Ulid, notice: Notice) {
        if let Some(sender) = self.channels.get(&estate_id) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }
}
