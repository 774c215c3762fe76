use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::availability::{check_available, validate_range};
use super::mutations::validate_note;
use super::{Engine, EngineError};

fn require_owner(terms: &Estate, actor: &Actor) -> Result<(), EngineError> {
    if actor.role != Role::Host || actor.user_id != terms.host_id {
        return Err(EngineError::Unauthorized(format!(
            "{} does not own estate {}",
            actor.user_id, terms.id
        )));
    }
    Ok(())
}

impl Engine {
    /// Black out `range` on an estate. Fails if any active reservation or
    /// existing lock overlaps it.
    pub async fn lock_dates(
        &self,
        actor: &Actor,
        estate_id: Ulid,
        range: DateRange,
        note: Option<String>,
    ) -> Result<LockWindow, EngineError> {
        validate_range(&range)?;
        validate_note(&note)?;
        let mut guard = self.estate_write(&estate_id).await?;
        require_owner(&guard.terms, actor)?;
        if guard.locks.len() >= MAX_LOCKS_PER_ESTATE {
            return Err(EngineError::LimitExceeded("too many locks on estate"));
        }
        check_available(&guard, &range, None)?;

        let lock = LockWindow {
            id: Ulid::new(),
            estate_id,
            host_id: actor.user_id,
            range,
            note,
            created_at: self.clock.now(),
        };
        let event = Event::LockPlaced { lock: lock.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.notify.send(estate_id, Notice::LockPlaced(lock.clone()));
        tracing::info!(lock_id = %lock.id, %estate_id, range = %range, "dates locked");
        Ok(lock)
    }

    /// Remove every lock overlapping `range`. Returns how many were removed.
    pub async fn unlock_dates(
        &self,
        actor: &Actor,
        estate_id: Ulid,
        range: DateRange,
    ) -> Result<usize, EngineError> {
        validate_range(&range)?;
        let mut guard = self.estate_write(&estate_id).await?;
        require_owner(&guard.terms, actor)?;

        let ids: Vec<Ulid> = guard.locks_overlapping(&range).map(|l| l.id).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let event = Event::LocksRemoved { estate_id, ids: ids.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        let removed = ids.len();
        self.notify
            .send(estate_id, Notice::LocksRemoved { estate_id, range, ids });
        tracing::info!(%estate_id, range = %range, removed, "dates unlocked");
        Ok(removed)
    }
}
