//! The call state machine.
//!
//! ```text
//! (none) --initiate--> ringing --answer--> connected --end--> ended
//!                         |--reject--> rejected
//!                         |--end-----> ended
//!                         `--timeout-> missed
//! ```
//!
//! [`CallService`] is the only writer of call records. Every transition is a
//! conditional update in the store, so racing operations on one call resolve
//! to exactly one winner and the loser sees `InvalidState`.
//!
//! rusqlite is synchronous: every store access runs on tokio's blocking pool
//! through [`CallService::with_db`], never on an executor thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_shared::{CallError, CallId, CallRecord, CallStatus, MediaKind, ServerEvent, Signal, UserId};
use tandem_store::{CallChange, Database, StoreError, User};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::ServerError;
use crate::relay::SignalingRelay;

#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    /// `None` disables the `ringing -> missed` transition.
    pub ring_timeout: Option<Duration>,
    pub history_limit: u32,
}

#[derive(Clone)]
pub struct CallService {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Mutex<Database>>,
    relay: SignalingRelay,
    clock: Arc<dyn Clock>,
    settings: CallSettings,
}

impl CallService {
    pub fn new(
        db: Database,
        relay: SignalingRelay,
        clock: Arc<dyn Clock>,
        settings: CallSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db: Arc::new(Mutex::new(db)),
                relay,
                clock,
                settings,
            }),
        }
    }

    pub fn relay(&self) -> &SignalingRelay {
        &self.inner.relay
    }

    pub fn settings(&self) -> CallSettings {
        self.inner.settings
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Run `f` with exclusive access to the store on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Database) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = db
                .lock()
                .map_err(|_| ServerError::Internal("store lock poisoned".into()))?;
            f(&mut db)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("store task failed: {e}")))?
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Create a ringing call from `caller` to `receiver` and notify the
    /// receiver if it is connected.
    pub async fn initiate(
        &self,
        caller: UserId,
        receiver: UserId,
        media_kind: MediaKind,
    ) -> Result<CallRecord, ServerError> {
        if caller == receiver {
            return Err(CallError::SelfCallNotAllowed.into());
        }

        let now = self.now();
        let call = self
            .with_db(move |db| {
                if !db.user_exists(&receiver)? {
                    return Err(CallError::ReceiverNotFound.into());
                }

                let call = CallRecord::ringing(caller, receiver, media_kind, now);
                match db.insert_call(&call) {
                    Ok(()) => Ok(call),
                    Err(StoreError::Conflict(reason)) => {
                        let existing = db.find_active_call_between(&caller, &receiver)?;
                        warn!(
                            caller = %caller.short(),
                            receiver = %receiver.short(),
                            existing = ?existing.map(|c| c.id),
                            %reason,
                            "call already in progress for pair"
                        );
                        Err(CallError::AlreadyActive.into())
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        info!(
            call = %call.id,
            caller = %caller.short(),
            receiver = %receiver.short(),
            kind = media_kind.as_str(),
            "call ringing"
        );

        self.notify(&receiver, ServerEvent::IncomingCall { call: call.clone() });
        self.schedule_ring_timeout(call.id);
        Ok(call)
    }

    /// Receiver accepts a ringing call.
    pub async fn answer(&self, call_id: CallId, user: UserId) -> Result<CallRecord, ServerError> {
        let call = self
            .transition_as_receiver(call_id, user, CallChange::Connect { at: self.now() })
            .await?;

        info!(call = %call.id, "call connected");
        self.notify(&call.caller_id, ServerEvent::CallAnswered { call: call.clone() });
        Ok(call)
    }

    /// Receiver declines a ringing call.
    pub async fn reject(&self, call_id: CallId, user: UserId) -> Result<CallRecord, ServerError> {
        let change = CallChange::Finish {
            status: CallStatus::Rejected,
            at: self.now(),
        };
        let call = self.transition_as_receiver(call_id, user, change).await?;

        info!(call = %call.id, "call rejected");
        self.notify(&call.caller_id, ServerEvent::CallRejected { call: call.clone() });
        Ok(call)
    }

    /// Either participant ends a ringing or connected call.
    ///
    /// Ending a call that is already over returns it unchanged.
    pub async fn end(&self, call_id: CallId, user: UserId) -> Result<CallRecord, ServerError> {
        let change = CallChange::Finish {
            status: CallStatus::Ended,
            at: self.now(),
        };
        let (ended, changed) = self
            .with_db(move |db| {
                let current = load_call(db, call_id)?;
                if !current.is_participant(&user) {
                    return Err(CallError::Unauthorized.into());
                }
                if current.status.is_terminal() {
                    debug!(call = %call_id, status = %current.status, "end on finished call");
                    return Ok((current, false));
                }

                match db.transition_call(call_id, &CallStatus::ACTIVE, change)? {
                    Some(call) => Ok((call, true)),
                    // Lost a race with another terminal transition.
                    None => Ok((load_call(db, call_id)?, false)),
                }
            })
            .await?;
        if !changed {
            return Ok(ended);
        }

        info!(
            call = %ended.id,
            by = %user.short(),
            duration = ended.duration,
            "call ended"
        );
        if let Some(other) = ended.counterpart(&user) {
            self.notify(
                &other,
                ServerEvent::CallEnded {
                    call: ended.clone(),
                    ended_by: user,
                },
            );
        }
        Ok(ended)
    }

    /// Mark a call missed if it is still ringing. Both parties are told.
    pub async fn expire(&self, call_id: CallId) -> Result<Option<CallRecord>, ServerError> {
        let change = CallChange::Finish {
            status: CallStatus::Missed,
            at: self.now(),
        };
        let missed = self
            .with_db(move |db| {
                match db.transition_call(call_id, &[CallStatus::Ringing], change) {
                    Ok(call) => Ok(call),
                    Err(StoreError::NotFound) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if let Some(call) = &missed {
            info!(call = %call.id, "call missed");
            self.notify(&call.caller_id, ServerEvent::CallMissed { call: call.clone() });
            self.notify(&call.receiver_id, ServerEvent::CallMissed { call: call.clone() });
        }
        Ok(missed)
    }

    /// Expire every call that has been ringing longer than the ring timeout.
    pub async fn sweep(&self) -> Result<usize, ServerError> {
        let Some(timeout) = self.inner.settings.ring_timeout else {
            return Ok(0);
        };
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        let cutoff = self.now() - timeout;

        let stale = self
            .with_db(move |db| Ok(db.list_ringing_started_before(cutoff)?))
            .await?;

        let mut expired = 0;
        for call in stale {
            if self.expire(call.id).await?.is_some() {
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "ring sweep");
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn active_for(&self, user: UserId) -> Result<Option<CallRecord>, ServerError> {
        self.with_db(move |db| Ok(db.find_active_call_for_user(&user)?))
            .await
    }

    pub async fn history_for(&self, user: UserId) -> Result<Vec<CallRecord>, ServerError> {
        let limit = self.inner.settings.history_limit;
        self.with_db(move |db| Ok(db.list_calls_for_user(&user, limit)?))
            .await
    }

    /// A single call, visible to its participants only.
    pub async fn get_for(&self, call_id: CallId, user: UserId) -> Result<CallRecord, ServerError> {
        let call = self.with_db(move |db| load_call(db, call_id)).await?;
        if !call.is_participant(&user) {
            return Err(CallError::Unauthorized.into());
        }
        Ok(call)
    }

    pub async fn active_call_count(&self) -> Result<u64, ServerError> {
        self.with_db(|db| Ok(db.count_active_calls()?)).await
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    pub async fn register_user(&self, id: UserId, display_name: Option<String>) -> Result<User, ServerError> {
        let user = User {
            id,
            display_name,
            created_at: self.now(),
        };
        self.with_db(move |db| {
            db.upsert_user(&user)?;
            Ok(db.get_user(&id)?)
        })
        .await
    }

    /// Directory entry for display purposes.
    pub async fn user(&self, id: UserId) -> Result<User, ServerError> {
        self.with_db(move |db| {
            db.get_user(&id).map_err(|e| match e {
                StoreError::NotFound => ServerError::NotFound(format!("user {id}")),
                other => other.into(),
            })
        })
        .await
    }

    pub async fn user_count(&self) -> Result<u64, ServerError> {
        self.with_db(|db| Ok(db.count_users()?)).await
    }

    // ------------------------------------------------------------------
    // Negotiation relay
    // ------------------------------------------------------------------

    /// Relay a negotiation payload from `sender` to the other participant.
    ///
    /// The call must be active and `sender` must be on it. Delivery itself
    /// is best effort.
    pub async fn forward_signal(
        &self,
        sender: UserId,
        call_id: CallId,
        signal: Signal,
    ) -> Result<(), ServerError> {
        let call = self.with_db(move |db| load_call(db, call_id)).await?;

        let Some(target) = call.counterpart(&sender) else {
            warn!(call = %call_id, sender = %sender.short(), "signal from non-participant");
            return Err(CallError::Unauthorized.into());
        };
        if !call.status.is_active() {
            debug!(call = %call_id, status = %call.status, kind = signal.label(), "signal for finished call");
            return Err(CallError::InvalidState {
                current: call.status,
            }
            .into());
        }

        // Undeliverable negotiation traffic is already logged by the relay.
        let _ = self.inner.relay.forward(sender, &target, call_id, signal);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Run [`CallService::sweep`] every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = service.sweep().await {
                    error!(error = %e, "ring sweep failed");
                }
            }
        })
    }

    fn schedule_ring_timeout(&self, call_id: CallId) {
        let Some(timeout) = self.inner.settings.ring_timeout else {
            return;
        };
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = service.expire(call_id).await {
                error!(call = %call_id, error = %e, "ring timeout failed");
            }
        });
    }

    async fn transition_as_receiver(
        &self,
        call_id: CallId,
        user: UserId,
        change: CallChange,
    ) -> Result<CallRecord, ServerError> {
        self.with_db(move |db| {
            let current = load_call(db, call_id)?;
            if current.receiver_id != user {
                warn!(call = %call_id, user = %user.short(), target = %change.target(), "not the receiver");
                return Err(CallError::Unauthorized.into());
            }

            match db.transition_call(call_id, &[CallStatus::Ringing], change)? {
                Some(call) => Ok(call),
                None => {
                    let current = load_call(db, call_id)?;
                    warn!(call = %call_id, status = %current.status, target = %change.target(), "transition refused");
                    Err(CallError::InvalidState {
                        current: current.status,
                    }
                    .into())
                }
            }
        })
        .await
    }

    fn notify(&self, target: &UserId, event: ServerEvent) {
        // Offline targets simply miss the event; the record is authoritative.
        let _ = self.inner.relay.relay(target, event);
    }
}

fn load_call(db: &Database, call_id: CallId) -> Result<CallRecord, ServerError> {
    db.get_call(call_id).map_err(|e| match e {
        StoreError::NotFound => CallError::CallNotFound.into(),
        other => other.into(),
    })
}
