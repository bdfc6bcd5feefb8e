//! Per-user, per-day session buffers.
//!
//! Each `(user, date)` key is guarded by its own async mutex, so the
//! `open -> aggregating` transition can succeed at most once per session
//! while other users proceed in parallel.  History reads bypass the locks.
use chrono::{DateTime, Days, NaiveDate, Utc};
use diarist_store::{DiaryEvent, DiarySession, SessionOutcome, SessionState, day_key};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::error::SessionError;
use crate::lock::KeyedLocks;
use crate::storage::BoundedStore;
use crate::tz::TimezoneResolver;

const HISTORY_PAGE_SIZE: usize = 16;

/// First day of a `days`-long history window ending on `today`.
pub fn history_start(today: NaiveDate, days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(days.max(1) - 1)))
        .unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub user_id: String,
    pub diary_date: NaiveDate,
    pub event_count: usize,
}

impl SessionRef {
    fn of(session: &DiarySession) -> Self {
        Self {
            user_id: session.user_id.clone(),
            diary_date: session.diary_date,
            event_count: session.events.len(),
        }
    }
}

/// Result of an explicit new-session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedSession {
    Created(SessionRef),
    AlreadyOpen(SessionRef),
}

#[derive(Debug)]
pub struct SessionStore {
    db: BoundedStore,
    locks: KeyedLocks,
    tz: TimezoneResolver,
}

impl SessionStore {
    pub fn new(db: BoundedStore, tz: TimezoneResolver) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
            tz,
        }
    }

    pub fn date_of(&self, user_id: &str, timestamp: DateTime<Utc>) -> NaiveDate {
        self.tz.date_of(user_id, timestamp)
    }

    async fn load(&self, user_id: &str, date: NaiveDate) -> Result<Option<DiarySession>, SessionError> {
        let user = user_id.to_string();
        Ok(self.db.call(move |db| db.get_session(&user, date)).await?)
    }

    async fn save(&self, session: DiarySession) -> Result<(), SessionError> {
        Ok(self.db.call(move |db| db.put_session(&session)).await?)
    }

    /// Append `event` to the open session for its user and day, creating the
    /// session on the day's first event.
    pub async fn append(&self, event: DiaryEvent) -> Result<SessionRef, SessionError> {
        let user_id = event.user_id.clone();
        let date = self.date_of(&user_id, event.timestamp);
        let _guard = self.locks.lock(&day_key(&user_id, date)).await;

        let now = Utc::now();
        let mut session = match self.load(&user_id, date).await? {
            Some(session) if session.state == SessionState::Open => session,
            Some(_) => return Err(SessionError::SessionClosed { user_id, date }),
            None => {
                info!(user_id = %user_id, date = %date, "opening diary session");
                DiarySession::open(user_id.clone(), date, now)
            }
        };

        session.events.push(event);
        session.updated_at = now;
        let session_ref = SessionRef::of(&session);
        self.save(session).await?;
        debug!(user_id = %user_id, date = %date, events = session_ref.event_count, "event appended");
        Ok(session_ref)
    }

    /// Open today's session without an event.  Reports an existing open
    /// session instead of replacing it.
    pub async fn open_session(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenedSession, SessionError> {
        let date = self.date_of(user_id, now);
        let _guard = self.locks.lock(&day_key(user_id, date)).await;

        match self.load(user_id, date).await? {
            Some(session) if session.state == SessionState::Open => {
                Ok(OpenedSession::AlreadyOpen(SessionRef::of(&session)))
            }
            Some(_) => Err(SessionError::SessionClosed {
                user_id: user_id.to_string(),
                date,
            }),
            None => {
                let session = DiarySession::open(user_id, date, now);
                let session_ref = SessionRef::of(&session);
                self.save(session).await?;
                info!(user_id = %user_id, date = %date, "opened empty diary session");
                Ok(OpenedSession::Created(session_ref))
            }
        }
    }

    /// Move the session from `open` to `aggregating` and hand back its
    /// events in `(timestamp, seq)` order.  Exactly one caller wins.
    pub async fn begin_aggregation(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DiaryEvent>, SessionError> {
        let _guard = self.locks.lock(&day_key(user_id, date)).await;

        let mut session = match self.load(user_id, date).await? {
            Some(session) if session.state == SessionState::Open => session,
            _ => {
                return Err(SessionError::NoOpenSession {
                    user_id: user_id.to_string(),
                    date,
                });
            }
        };
        if session.events.is_empty() {
            return Err(SessionError::EmptySession {
                user_id: user_id.to_string(),
                date,
            });
        }

        let events = session.ordered_events();
        session.state = SessionState::Aggregating;
        session.updated_at = Utc::now();
        self.save(session).await?;
        info!(user_id = %user_id, date = %date, events = events.len(), "aggregation started");
        Ok(events)
    }

    /// Terminal transition.  Returns `false` when the session was already
    /// closed.
    pub async fn mark_closed(
        &self,
        user_id: &str,
        date: NaiveDate,
        outcome: SessionOutcome,
    ) -> Result<bool, SessionError> {
        let _guard = self.locks.lock(&day_key(user_id, date)).await;

        let Some(mut session) = self.load(user_id, date).await? else {
            return Err(SessionError::NoOpenSession {
                user_id: user_id.to_string(),
                date,
            });
        };
        if session.state == SessionState::Closed {
            return Ok(false);
        }

        session.state = SessionState::Closed;
        session.outcome = Some(outcome);
        session.updated_at = Utc::now();
        self.save(session).await?;
        info!(user_id = %user_id, date = %date, "session closed");
        Ok(true)
    }

    /// Sessions still `aggregating` whose last change is older than
    /// `cutoff`.  Read without locks; callers close them via `mark_closed`.
    pub async fn stale_aggregations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRef>, SessionError> {
        let sessions = self
            .db
            .call(|db| db.sessions_with_state(SessionState::Aggregating))
            .await?;
        Ok(sessions
            .iter()
            .filter(|session| session.updated_at < cutoff)
            .map(SessionRef::of)
            .collect())
    }

    /// The last `limit` events of a session in aggregation order.  Read
    /// without locks.
    pub async fn recent_events(
        &self,
        user_id: &str,
        date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<DiaryEvent>, SessionError> {
        let Some(session) = self.load(user_id, date).await? else {
            return Ok(Vec::new());
        };
        let events = session.ordered_events();
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }

    /// Sessions of `user_id` dated `from..=to`, oldest first, fetched a page
    /// at a time as the stream is polled.
    pub fn query(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxStream<'static, Result<DiarySession, SessionError>> {
        let db = self.db.clone();
        let user_id = user_id.to_string();

        stream::try_unfold(Some(None), move |cursor: Option<Option<NaiveDate>>| {
            let db = db.clone();
            let user_id = user_id.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok::<_, SessionError>(None);
                };
                let page = db
                    .call(move |db| db.sessions_page(&user_id, from, to, after, HISTORY_PAGE_SIZE))
                    .await
                    .map_err(SessionError::from)?;
                let next = if page.len() < HISTORY_PAGE_SIZE {
                    None
                } else {
                    Some(page.last().map(|session| session.diary_date))
                };
                let items = stream::iter(page.into_iter().map(Ok::<_, SessionError>));
                Ok(Some((items, next)))
            }
        })
        .try_flatten()
        .boxed()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
