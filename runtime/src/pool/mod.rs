//! Bounded pool of browser sessions.
//!
//! At most `max_browsers` sessions exist at any instant, counting launches in
//! flight. A free session is reused while it is younger than `max_age` and has
//! served fewer than `max_uses` leases; stale free sessions are destroyed
//! lazily by the next acquire scan. All bookkeeping happens under one mutex
//! that is never held across an await point.

use crate::config::PoolConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::renderer::{BrowserDriver, BrowserProfile, BrowserSession, PageContext};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Slot {
    id: u64,
    profile: BrowserProfile,
    session: Arc<dyn BrowserSession>,
    created_at: Instant,
    use_count: u32,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    /// Launches reserved against capacity but not yet registered.
    pending: usize,
    next_id: u64,
    shut_down: bool,
    created: u64,
    closed: u64,
}

impl PoolState {
    fn mark_free(&mut self, id: u64) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
            slot.in_use = false;
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub open: usize,
    pub leased: usize,
    pub pending: usize,
    pub created: u64,
    pub closed: u64,
}

/// What the acquire scan decided while holding the lock.
enum Step {
    Reuse {
        hold: SlotHold,
        session: Arc<dyn BrowserSession>,
        created_at: Instant,
        use_count: u32,
    },
    Create(Reservation),
    Wait,
}

/// Capacity reserved for a launch in flight.
///
/// Dropping it (a failed launch, or an acquire cancelled mid-launch) gives
/// the capacity back.
struct Reservation {
    id: u64,
    state: Arc<Mutex<PoolState>>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.state).pending -= 1;
        }
    }
}

/// A slot marked in use for an acquire that has not handed out a lease yet.
/// Dropping it frees the slot again.
struct SlotHold {
    id: u64,
    state: Arc<Mutex<PoolState>>,
    armed: bool,
}

impl SlotHold {
    fn new(id: u64, state: &Arc<Mutex<PoolState>>) -> Self {
        Self {
            id,
            state: Arc::clone(state),
            armed: true,
        }
    }

    /// The lease takes over freeing the slot.
    fn into_lease(mut self) -> u64 {
        self.armed = false;
        self.id
    }
}

impl Drop for SlotHold {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.state).mark_free(self.id);
        }
    }
}

/// A leased browser session with its own isolated context.
///
/// Exclusively owned by the caller between `acquire` and `release`. Dropping a
/// lease without releasing it returns the slot to the pool without closing the
/// context.
pub struct BrowserLease {
    id: u64,
    profile: BrowserProfile,
    created_at: Instant,
    use_count: u32,
    context: Option<Box<dyn PageContext>>,
    state: Arc<Mutex<PoolState>>,
}

impl BrowserLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of leases this session has served, including this one.
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn context(&mut self) -> ScrapeResult<&mut (dyn PageContext + 'static)> {
        self.context
            .as_deref_mut()
            .ok_or_else(|| ScrapeError::Driver("lease context already closed".into()))
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.context.is_some() {
            lock(&self.state).mark_free(self.id);
        }
    }
}

/// Bounded, recycling pool of browser sessions.
pub struct BrowserPool {
    driver: Arc<dyn BrowserDriver>,
    max_browsers: usize,
    max_age: Duration,
    max_uses: u32,
    poll_interval: Duration,
    state: Arc<Mutex<PoolState>>,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: &PoolConfig) -> Self {
        Self {
            driver,
            max_browsers: config.max_browsers.max(1),
            max_age: config.max_age(),
            max_uses: config.max_uses.max(1),
            poll_interval: config.poll_interval(),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn max_browsers(&self) -> usize {
        self.max_browsers
    }

    fn is_stale(&self, slot: &Slot) -> bool {
        slot.created_at.elapsed() > self.max_age || slot.use_count >= self.max_uses
    }

    /// Lease a session for `profile`, waiting up to `timeout` for capacity.
    pub async fn acquire(
        &self,
        profile: &BrowserProfile,
        timeout: Duration,
    ) -> ScrapeResult<BrowserLease> {
        let started = Instant::now();

        loop {
            let (step, doomed) = self.scan(profile)?;
            self.destroy(doomed).await;

            match step {
                Step::Reuse {
                    hold,
                    session,
                    created_at,
                    use_count,
                } => {
                    debug!(id = hold.id, use_count, "reusing browser session");
                    return self
                        .open_lease(hold, profile, session, created_at, use_count)
                        .await;
                }
                Step::Create(reservation) => {
                    let (hold, session) = self.create(reservation, profile).await?;
                    return self
                        .open_lease(hold, profile, session, Instant::now(), 1)
                        .await;
                }
                Step::Wait => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        warn!(
                            max = self.max_browsers,
                            "browser pool exhausted after {}ms",
                            elapsed.as_millis()
                        );
                        return Err(ScrapeError::timeout("browser session", elapsed));
                    }
                    let remaining = timeout - elapsed;
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
            }
        }
    }

    /// Decide under the lock: reuse a fresh free session, reserve a launch, or wait.
    /// Returns stale sessions detached from the pool so they can be closed outside it.
    fn scan(&self, profile: &BrowserProfile) -> ScrapeResult<(Step, Vec<Arc<dyn BrowserSession>>)> {
        let mut state = lock(&self.state);
        if state.shut_down {
            return Err(ScrapeError::Driver("browser pool is shut down".into()));
        }

        let mut doomed = Vec::new();
        let mut kept = Vec::with_capacity(state.slots.len());
        for slot in state.slots.drain(..) {
            if !slot.in_use && self.is_stale(&slot) {
                debug!(id = slot.id, uses = slot.use_count, "retiring stale browser session");
                doomed.push(slot.session);
            } else {
                kept.push(slot);
            }
        }
        state.slots = kept;

        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| !s.in_use && s.profile == *profile)
        {
            slot.in_use = true;
            slot.use_count += 1;
            let step = Step::Reuse {
                hold: SlotHold::new(slot.id, &self.state),
                session: Arc::clone(&slot.session),
                created_at: slot.created_at,
                use_count: slot.use_count,
            };
            return Ok((step, doomed));
        }

        if state.slots.len() + state.pending >= self.max_browsers {
            // Full: make room by evicting a free session launched for another profile.
            match state.slots.iter().position(|s| !s.in_use) {
                Some(idx) => {
                    let evicted = state.slots.remove(idx);
                    debug!(id = evicted.id, "evicting idle session of another profile");
                    doomed.push(evicted.session);
                }
                None => return Ok((Step::Wait, doomed)),
            }
        }

        state.pending += 1;
        state.next_id += 1;
        let reservation = Reservation {
            id: state.next_id,
            state: Arc::clone(&self.state),
            armed: true,
        };
        Ok((Step::Create(reservation), doomed))
    }

    /// Launch and register a reserved session. Dropping the reservation on
    /// any early exit releases the capacity.
    async fn create(
        &self,
        mut reservation: Reservation,
        profile: &BrowserProfile,
    ) -> ScrapeResult<(SlotHold, Arc<dyn BrowserSession>)> {
        let id = reservation.id;
        let session: Arc<dyn BrowserSession> = match self.driver.launch(profile).await {
            Ok(session) => Arc::from(session),
            Err(e) => {
                warn!(kind = ?profile.kind, "browser launch failed: {e:#}");
                return Err(ScrapeError::Driver(format!("{e:#}")));
            }
        };

        let shut_down = {
            let mut state = lock(&self.state);
            state.pending -= 1;
            reservation.armed = false;
            state.created += 1;
            if !state.shut_down {
                state.slots.push(Slot {
                    id,
                    profile: profile.clone(),
                    session: Arc::clone(&session),
                    created_at: Instant::now(),
                    use_count: 1,
                    in_use: true,
                });
            }
            state.shut_down
        };

        if shut_down {
            self.destroy(vec![session]).await;
            return Err(ScrapeError::Driver("browser pool is shut down".into()));
        }
        info!(id, kind = ?profile.kind, "launched browser session");
        Ok((SlotHold::new(id, &self.state), session))
    }

    async fn open_lease(
        &self,
        hold: SlotHold,
        profile: &BrowserProfile,
        session: Arc<dyn BrowserSession>,
        created_at: Instant,
        use_count: u32,
    ) -> ScrapeResult<BrowserLease> {
        let id = hold.id;
        match session.new_context().await {
            Ok(context) => Ok(BrowserLease {
                id: hold.into_lease(),
                profile: profile.clone(),
                created_at,
                use_count,
                context: Some(context),
                state: Arc::clone(&self.state),
            }),
            Err(e) => {
                // A session that cannot open a context is broken: drop it from the pool.
                let detached = {
                    let mut state = lock(&self.state);
                    state
                        .slots
                        .iter()
                        .position(|s| s.id == id)
                        .map(|idx| state.slots.remove(idx).session)
                };
                self.destroy(detached.into_iter().collect()).await;
                Err(ScrapeError::Driver(format!("failed to open browser context: {e:#}")))
            }
        }
    }

    /// Return a lease to the pool. The isolated context is closed; the session stays.
    ///
    /// The slot is freed before the context is closed, so a caller cancelled
    /// during the close does not strand it.
    pub async fn release(&self, mut lease: BrowserLease) {
        let context = lease.context.take();
        lock(&self.state).mark_free(lease.id);
        if let Some(context) = context {
            if let Err(e) = context.close().await {
                debug!(id = lease.id, "closing browser context failed: {e:#}");
            }
        }
    }

    /// Close every tracked session, leased or free. Later acquires fail.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<dyn BrowserSession>> = {
            let mut state = lock(&self.state);
            state.shut_down = true;
            state.slots.drain(..).map(|s| s.session).collect()
        };
        let count = sessions.len();
        self.destroy(sessions).await;
        info!(closed = count, "browser pool shut down");
    }

    async fn destroy(&self, sessions: Vec<Arc<dyn BrowserSession>>) {
        if sessions.is_empty() {
            return;
        }
        let count = sessions.len() as u64;
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("closing browser session failed: {e:#}");
            }
        }
        lock(&self.state).closed += count;
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            open: state.slots.len(),
            leased: state.slots.iter().filter(|s| s.in_use).count(),
            pending: state.pending,
            created: state.created,
            closed: state.closed,
        }
    }
}
