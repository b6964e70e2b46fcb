// Pedal Firmware - BLE Session Manager
//
// Owns the wireless transport and its three exchange points. Runs as a
// dedicated task pinned next to the radio: bringing the stack up and
// tearing peers down are blocking calls.
//
// State machine:
//   Unbound --start ok--> Advertising --peer connects--> Connected
//   Connected --last peer gone--> Advertising
//   any --transport failed--> Unbound
//
// Every poll the session adopts the transport's peer count if the two
// drifted apart, then drops all peers once nothing happened on the link
// for `idle_timeout_ms`.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};

use crate::config::{FirmwareConfig, SESSION_CORE, SESSION_SETUP_RETRY_MAX_MS, SESSION_SETUP_RETRY_MS, STACK_SESSION};
use crate::events::{SensorValue, ValueSink};
use crate::hal::{Clock, Timestamp};
use crate::lock;
use crate::settings::SettingsStore;
use crate::task::{Placement, SuspendHandle, Task, TaskCore};
use crate::tasks::power::BatteryState;
use crate::transport::{ExchangePoint, SessionEvents, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Advertising,
    Connected,
}

pub struct Session<T: Transport> {
    transport: Mutex<T>,
    state: Mutex<SessionState>,
    connected: AtomicUsize,
    // Bumped under the state lock by every transport failure.
    failures: AtomicU32,
    last_activity: AtomicU64,
    latest: Mutex<Option<SensorValue>>,
    // Timed suspends cut short when a peer shows up.
    wake_on_connect: Mutex<Vec<SuspendHandle>>,
    // Woken when the transport dies and needs another bind.
    wake_on_unbind: Mutex<Vec<SuspendHandle>>,
    settings: Arc<SettingsStore>,
    battery: Arc<BatteryState>,
    clock: Arc<dyn Clock>,
    config: FirmwareConfig,
}

impl<T: Transport + 'static> Session<T> {
    pub fn new(
        transport: T,
        settings: Arc<SettingsStore>,
        battery: Arc<BatteryState>,
        clock: Arc<dyn Clock>,
        config: FirmwareConfig,
    ) -> Arc<Self> {
        let now = clock.now_ms();
        Arc::new(Self {
            transport: Mutex::new(transport),
            state: Mutex::new(SessionState::Unbound),
            connected: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            last_activity: AtomicU64::new(now),
            latest: Mutex::new(None),
            wake_on_connect: Mutex::new(Vec::new()),
            wake_on_unbind: Mutex::new(Vec::new()),
            settings,
            battery,
            clock,
            config,
        })
    }

    /// Start the transport with this session as its event sink and begin
    /// advertising. No-op once bound.
    pub fn bind(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.state() != SessionState::Unbound {
            return Ok(());
        }

        let failures = self.failures.load(Ordering::SeqCst);
        let events: Arc<dyn SessionEvents> = self.clone();
        lock(&self.transport)
            .start(events)
            .context("starting BLE transport")?;

        {
            let mut state = lock(&self.state);
            if self.failures.load(Ordering::SeqCst) != failures {
                bail!("BLE transport failed while starting");
            }
            *state = SessionState::Advertising;
        }
        self.touch();
        log::info!("Session advertising");
        Ok(())
    }

    /// Cancel `handle`'s pending timed suspend whenever a peer connects.
    pub fn wake_on_connect(&self, handle: SuspendHandle) {
        lock(&self.wake_on_connect).push(handle);
    }

    /// Cancel `handle`'s pending timed suspend when the transport fails.
    pub fn wake_on_unbind(&self, handle: SuspendHandle) {
        lock(&self.wake_on_unbind).push(handle);
    }

    /// Push the latest value to connected peers. Nothing is queued while
    /// no peer is connected.
    pub fn set_value(&self, value: SensorValue) {
        if !self.is_active() {
            return;
        }

        *lock(&self.latest) = Some(value);
        let result = lock(&self.transport).notify(ExchangePoint::Value, &value.to_bytes());
        if let Err(e) = result {
            log::warn!("Value notify failed: {:#}", e);
        }
        self.touch();
    }

    pub fn is_active(&self) -> bool {
        self.connected_count() > 0
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> Timestamp {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Drop every peer once the link has been idle for longer than the
    /// configured timeout. Returns true when a disconnect was requested.
    pub fn check_idle(&self, now: Timestamp) -> bool {
        let timeout = self.config.idle_timeout_ms;
        if timeout == 0 || !self.is_active() {
            return false;
        }

        let idle = now.saturating_sub(self.last_activity());
        if idle <= timeout {
            return false;
        }

        log::info!("Session idle for {} ms, disconnecting peers", idle);
        if let Err(e) = lock(&self.transport).disconnect_all() {
            log::warn!("Disconnect failed: {:#}", e);
            return false;
        }
        self.last_activity.store(now, Ordering::SeqCst);
        true
    }

    /// Adopt the transport's peer count when a connect or disconnect event
    /// went missing. Returns true when the counts disagreed.
    pub fn reconcile_peers(&self) -> bool {
        if self.state() == SessionState::Unbound {
            return false;
        }

        let actual = lock(&self.transport).connected_count();
        let known = self.connected.swap(actual, Ordering::SeqCst);
        if actual == known {
            return false;
        }

        log::warn!("Peer count out of sync: session had {}, transport has {}", known, actual);
        if actual == 0 {
            self.set_state(SessionState::Advertising);
        } else {
            self.set_state(SessionState::Connected);
        }
        if actual < self.config.max_peers {
            self.readvertise();
        }
        true
    }

    fn touch(&self) {
        self.last_activity.store(self.clock.now_ms(), Ordering::SeqCst);
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn readvertise(&self) {
        if let Err(e) = lock(&self.transport).start_advertising() {
            log::warn!("Restarting advertising failed: {:#}", e);
        }
    }
}

impl<T: Transport + 'static> SessionEvents for Session<T> {
    fn on_connect(&self) {
        let count = self.connected.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(SessionState::Connected);
        self.touch();
        log::info!("Peer connected ({} total)", count);

        for handle in lock(&self.wake_on_connect).iter() {
            handle.cancel_suspend();
        }
        if count < self.config.max_peers {
            self.readvertise();
        }
    }

    fn on_disconnect(&self) {
        let count = match self
            .connected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                log::warn!("Disconnect with no peer connected");
                0
            }
        };
        log::info!("Peer disconnected ({} left)", count);

        if count == 0 {
            self.set_state(SessionState::Advertising);
        }
        if count < self.config.max_peers {
            self.readvertise();
        }
        self.touch();
    }

    fn on_read(&self, point: ExchangePoint) -> Vec<u8> {
        self.touch();
        match point {
            ExchangePoint::Configuration => self.settings.snapshot().to_bytes().to_vec(),
            ExchangePoint::Power => self.battery.record().to_vec(),
            ExchangePoint::Value => {
                let latest = *lock(&self.latest);
                latest.unwrap_or_default().to_bytes().to_vec()
            }
        }
    }

    fn on_write(&self, point: ExchangePoint, data: &[u8]) {
        self.touch();
        if !point.is_writable() {
            log::warn!("Write to read-only {} ignored", point.label());
            return;
        }

        match self.settings.apply_record(data) {
            Ok(settings) => log::info!("Settings updated: {:?}", settings),
            Err(e) => log::warn!("Settings write rejected: {:#}", e),
        }
    }

    fn on_transport_failed(&self, reason: &str) {
        log::error!("BLE transport failed: {}", reason);
        {
            let mut state = lock(&self.state);
            self.failures.fetch_add(1, Ordering::SeqCst);
            *state = SessionState::Unbound;
        }
        self.connected.store(0, Ordering::SeqCst);

        for handle in lock(&self.wake_on_unbind).iter() {
            handle.cancel_suspend();
        }
    }
}

impl<T: Transport + 'static> ValueSink for Session<T> {
    fn push(&self, value: SensorValue) {
        self.set_value(value);
    }

    fn has_peer(&self) -> bool {
        self.is_active()
    }
}

/// Dedicated task driving a [`Session`]: binds the transport (retrying
/// with backoff, and again whenever the transport reports a failure) and
/// polls for idle peers.
pub struct SessionTask<T: Transport> {
    core: TaskCore,
    session: Arc<Session<T>>,
    retry_ms: u32,
    poll_ms: u32,
}

impl<T: Transport + 'static> SessionTask<T> {
    pub fn new(session: Arc<Session<T>>, clock: Arc<dyn Clock>) -> Self {
        let placement = Placement {
            core: Some(SESSION_CORE),
            stack_size: STACK_SESSION,
        };
        let poll_ms = session.config.session_poll_ms;
        let core = TaskCore::dedicated("session", clock, placement);
        session.wake_on_unbind(core.handle());
        Self {
            core,
            session,
            retry_ms: SESSION_SETUP_RETRY_MS,
            poll_ms,
        }
    }

    pub fn session(&self) -> &Arc<Session<T>> {
        &self.session
    }

    /// Delay before the next bind attempt.
    pub fn retry_ms(&self) -> u32 {
        self.retry_ms
    }
}

impl<T: Transport + 'static> Task for SessionTask<T> {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        log::info!("Session task started");
        if let Err(e) = self.session.bind() {
            log::warn!("BLE setup failed, retrying in {} ms: {:#}", self.retry_ms, e);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.session.is_active()
    }

    fn step_work(&mut self, now: Timestamp) {
        if self.session.state() == SessionState::Unbound {
            match self.session.bind() {
                Ok(()) => self.retry_ms = SESSION_SETUP_RETRY_MS,
                Err(e) => {
                    log::warn!("BLE setup failed, retrying in {} ms: {:#}", self.retry_ms, e);
                    let wait = self.retry_ms;
                    self.retry_ms = self.retry_ms.saturating_mul(2).min(SESSION_SETUP_RETRY_MAX_MS);
                    self.core.suspend(now, wait);
                    return;
                }
            }
        }

        self.session.reconcile_peers();
        self.session.check_idle(now);
        log::debug!("Session: {} peer(s) connected", self.session.connected_count());
        self.core.suspend(now, self.poll_ms);
    }
}
