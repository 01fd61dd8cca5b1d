//! Adaptive polling scheduler.
//!
//! Owns the repeating timer that drives sync cycles. The steady-state
//! period stretches under server backpressure and shrinks when local
//! activity wants a prompt sync. Two knobs express every adjustment: the
//! `period` (repeating interval) and a one-shot `period_addition` applied
//! to the next tick only. An explicit server retry-duration only shifts
//! the next tick; repeated generic failures permanently raise the period
//! until a cycle succeeds.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::auth::{AuthEvent, AuthProvider};
use crate::engine::SyncEngine;
use crate::transport::{BackoffSignal, TransportEvent};

/// Pacing parameters for the polling loop.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    /// Steady-state polling interval
    pub normal_period: Duration,
    /// Shortest interval a server directive can request
    pub min_period: Duration,
    /// Longest successive backoffs are allowed to get
    pub max_period: Duration,
    /// Added to the period on each generic failure
    pub failure_increase: Duration,
    /// Delay before an "immediate" sync, letting rapid local writes batch
    pub immediate_update_delay: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            normal_period: Duration::from_secs(5 * 60),
            min_period: Duration::from_secs(30),
            max_period: Duration::from_secs(60 * 60),
            failure_increase: Duration::from_secs(5 * 60),
            immediate_update_delay: Duration::from_millis(500),
        }
    }
}

/// Current pacing: the repeating period plus a one-shot adjustment for
/// the next tick. The addition may be negative, down to `-period` for an
/// immediate run.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    settings: ScheduleSettings,
    period: Duration,
    period_addition_ms: i64,
}

impl ScheduleState {
    pub fn new(settings: ScheduleSettings) -> Self {
        let period = settings.normal_period;
        Self {
            settings,
            period,
            period_addition_ms: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn period_addition_ms(&self) -> i64 {
        self.period_addition_ms
    }

    /// The delay until the next tick, consuming the one-shot addition.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.period.as_millis() as i64 + self.period_addition_ms;
        self.period_addition_ms = 0;
        Duration::from_millis(delay.max(0) as u64)
    }

    /// Back to steady-state pacing, dropping any adjustment.
    pub fn reset(&mut self) {
        self.period = self.settings.normal_period;
        self.period_addition_ms = 0;
    }

    /// Makes the next tick fire with no delay at all.
    pub fn force_immediate(&mut self) {
        self.period_addition_ms = -(self.period.as_millis() as i64);
    }

    /// Makes the next tick fire after only the immediate-update delay.
    pub fn immediate(&mut self) {
        self.period_addition_ms = -(self.period.as_millis() as i64)
            + self.settings.immediate_update_delay.as_millis() as i64;
    }

    /// Stretches the period out to its maximum.
    pub fn slow(&mut self) {
        self.period = self.settings.max_period;
    }

    /// Applies a server backoff signal.
    ///
    /// Without an explicit duration this is a generic overload: the
    /// period itself grows by the failure increase, up to the maximum.
    /// An explicit duration is a one-time instruction: it is clamped
    /// into `[min_period, max_period]` and expressed through the
    /// one-shot addition, leaving the steady period untouched.
    pub fn retry_after(&mut self, signal: &BackoffSignal) {
        match signal.retry_after {
            None => {
                self.period = (self.period + self.settings.failure_increase)
                    .min(self.settings.max_period);
            }
            Some(duration) => {
                let clamped = duration.clamp(self.settings.min_period, self.settings.max_period);
                self.period_addition_ms =
                    clamped.as_millis() as i64 - self.period.as_millis() as i64;
            }
        }
    }
}

enum LoopCommand {
    /// Recompute the delay and restart the pending timer
    Rearm,
    /// Stop polling; an in-flight cycle still completes
    Stop,
}

/// Timer-driven polling loop around a [`SyncEngine`].
///
/// Inactive until [`activate`] (or a login notification); each tick runs
/// one sync cycle and always rearms, on success and failure alike, so a
/// sync error never silently stops polling.
///
/// [`activate`]: Scheduler::activate
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    state: Arc<StdMutex<ScheduleState>>,
    commands: StdMutex<Option<mpsc::UnboundedSender<LoopCommand>>>,
    last_successful_sync: Arc<StdMutex<Option<i64>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, settings: ScheduleSettings) -> Self {
        Self {
            engine,
            state: Arc::new(StdMutex::new(ScheduleState::new(settings))),
            commands: StdMutex::new(None),
            last_successful_sync: Arc::new(StdMutex::new(None)),
        }
    }

    /// Starts regular syncing, with one cycle right away. Any previous
    /// loop is stopped first.
    pub fn activate(&self) {
        self.deactivate();
        {
            let mut state = self.state.lock().unwrap();
            state.reset();
            state.force_immediate();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock().unwrap() = Some(tx);
        tokio::spawn(run_loop(
            self.engine.clone(),
            self.state.clone(),
            self.last_successful_sync.clone(),
            rx,
        ));
    }

    /// Stops regular syncing. A cycle already in flight completes and
    /// its state changes are kept; no further ticks fire.
    pub fn deactivate(&self) {
        if let Some(commands) = self.commands.lock().unwrap().take() {
            let _ = commands.send(LoopCommand::Stop);
        }
    }

    pub fn is_active(&self) -> bool {
        self.commands.lock().unwrap().is_some()
    }

    /// Runs a sync soon: after `immediate_update_delay`, so several
    /// rapid local writes batch into one cycle. Call when the local
    /// record store gains pending work.
    pub fn schedule_immediately(&self) {
        self.state.lock().unwrap().immediate();
        self.rearm();
    }

    /// Polls as rarely as allowed, for when nobody is watching.
    pub fn schedule_slowly(&self) {
        self.state.lock().unwrap().slow();
        self.rearm();
    }

    /// Restores steady-state pacing without forcing an immediate run.
    pub fn reset_schedule(&self) {
        self.state.lock().unwrap().reset();
    }

    /// Applies a backoff signal to the pacing.
    pub fn retry_after(&self, signal: &BackoffSignal) {
        self.state.lock().unwrap().retry_after(signal);
    }

    /// Application visibility hook: hidden slows polling to the maximum
    /// period, visible restores normal pacing and syncs promptly.
    pub fn set_visible(&self, visible: bool) {
        if visible {
            self.state.lock().unwrap().reset();
            self.schedule_immediately();
        } else {
            self.schedule_slowly();
        }
    }

    /// Epoch milliseconds of the last successful cycle, if any.
    pub fn last_successful_sync(&self) -> Option<i64> {
        *self.last_successful_sync.lock().unwrap()
    }

    /// Follows the auth provider: active while logged in. Also activates
    /// right away when a session already exists.
    pub fn watch_auth(self: &Arc<Self>, auth: &Arc<dyn AuthProvider>) {
        if auth.logged_in() {
            self.activate();
        }
        let scheduler = Arc::clone(self);
        let mut events = auth.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AuthEvent::LoggedIn { email }) => {
                        info!(%email, "logged in, activating sync");
                        scheduler.activate();
                    }
                    Ok(AuthEvent::LoggedOut) => {
                        info!("logged out, deactivating sync");
                        scheduler.deactivate();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed auth events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Consumes the transport's event channel: backoff signals adjust
    /// the pacing, auth failures stop polling.
    pub fn watch_transport(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Backoff(signal) => {
                        debug!(status = signal.status, retry_after = ?signal.retry_after,
                            "applying backoff signal");
                        scheduler.retry_after(&signal);
                        scheduler.rearm();
                    }
                    TransportEvent::AuthFailure { status } => {
                        warn!(status, "authentication failure, deactivating sync");
                        scheduler.deactivate();
                    }
                }
            }
        });
    }

    fn rearm(&self) {
        if let Some(commands) = self.commands.lock().unwrap().as_ref() {
            let _ = commands.send(LoopCommand::Rearm);
        }
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    state: Arc<StdMutex<ScheduleState>>,
    last_successful_sync: Arc<StdMutex<Option<i64>>>,
    mut commands: mpsc::UnboundedReceiver<LoopCommand>,
) {
    loop {
        let delay = state.lock().unwrap().next_delay();
        tokio::select! {
            biased;
            command = commands.recv() => {
                match command {
                    Some(LoopCommand::Rearm) => continue,
                    _ => return,
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
        debug!("sync tick");
        match engine.sync_now(false).await {
            Ok(()) => {
                state.lock().unwrap().reset();
                *last_successful_sync.lock().unwrap() = Some(Utc::now().timestamp_millis());
            }
            Err(e) => {
                // Pacing stays where the last backoff signal put it
                warn!(error = %e, "sync cycle failed");
            }
        }
        // A stop issued while the cycle ran must win before rearming
        loop {
            match commands.try_recv() {
                Ok(LoopCommand::Rearm) => {}
                Ok(LoopCommand::Stop) => return,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }
    }
}
