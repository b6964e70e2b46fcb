// Pedal Firmware - Host Test Doubles
//
// In-memory stand-ins for the board and the BLE stack. Handles are cheap
// clones sharing state, so a test can keep one side while a task owns the
// other.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::hal::{AnalogInput, Clock, KeyValueStore, OutputPin, Timestamp};
use crate::lock;
use crate::task::{SuspendHandle, WakeToken};
use crate::transport::{ExchangePoint, SessionEvents, Transport};

/// Manually driven clock. Sleeping advances time instead of blocking.
#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_us(&self, _us: u32) {}

    /// Jumps straight to the deadline unless a wake already landed.
    fn sleep_ms_or_wake(&self, ms: u32, wake: &SuspendHandle, token: WakeToken) {
        if !wake.woken_since(token) {
            self.advance(u64::from(ms));
        }
    }
}

/// Replays a fixed list of readings, then repeats the last one.
#[derive(Debug, Clone)]
pub struct ScriptedAdc {
    script: VecDeque<u16>,
    last: u16,
}

impl ScriptedAdc {
    pub fn new(script: impl IntoIterator<Item = u16>) -> Self {
        Self {
            script: script.into_iter().collect(),
            last: 0,
        }
    }
}

impl AnalogInput for ScriptedAdc {
    fn read_raw(&mut self) -> anyhow::Result<u16> {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }
}

/// Output pin remembering every level written to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    history: Arc<Mutex<Vec<bool>>>,
}

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> Option<bool> {
        lock(&self.history).last().copied()
    }

    pub fn history(&self) -> Vec<bool> {
        lock(&self.history).clone()
    }
}

impl OutputPin for RecordingPin {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        lock(&self.history).push(on);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Blobs {
    entries: HashMap<String, Vec<u8>>,
    saves: usize,
}

/// Key-value store backed by a shared map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<Mutex<Blobs>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry without counting it as a save.
    pub fn insert(&self, key: &str, data: &[u8]) {
        lock(&self.blobs).entries.insert(key.to_owned(), data.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.blobs).entries.get(key).cloned()
    }

    pub fn save_count(&self) -> usize {
        lock(&self.blobs).saves
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&mut self, key: &str, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        let blobs = lock(&self.blobs);
        let Some(data) = blobs.entries.get(key) else {
            return Ok(None);
        };
        if data.len() > buf.len() {
            bail!("blob {} is {} bytes, buffer holds {}", key, data.len(), buf.len());
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(Some(data.len()))
    }

    fn save(&mut self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        let mut blobs = lock(&self.blobs);
        blobs.entries.insert(key.to_owned(), data.to_vec());
        blobs.saves += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Link {
    events: Option<Arc<dyn SessionEvents>>,
    connected: usize,
    failures_left: u32,
    // Report a failure from inside the next successful `start`.
    fail_late: bool,
    start_attempts: u32,
    advertise_count: u32,
    disconnect_requests: u32,
    pending_disconnects: usize,
    notifications: Vec<(ExchangePoint, Vec<u8>)>,
}

/// Transport that records calls. Peer activity is driven through the
/// paired [`PeerSide`].
pub struct MockTransport {
    link: Arc<Mutex<Link>>,
}

impl MockTransport {
    pub fn new() -> (Self, PeerSide) {
        Self::failing(0)
    }

    /// The first `failures` calls to `start` return an error.
    pub fn failing(failures: u32) -> (Self, PeerSide) {
        let link = Arc::new(Mutex::new(Link {
            failures_left: failures,
            ..Link::default()
        }));
        (Self { link: link.clone() }, PeerSide { link })
    }
}

impl Transport for MockTransport {
    fn start(&mut self, events: Arc<dyn SessionEvents>) -> anyhow::Result<()> {
        let fail_late = {
            let mut link = lock(&self.link);
            link.start_attempts += 1;
            if link.failures_left > 0 {
                link.failures_left -= 1;
                bail!("radio not ready");
            }
            link.events = Some(events.clone());
            link.connected = 0;
            link.pending_disconnects = 0;
            link.advertise_count += 1;
            std::mem::take(&mut link.fail_late)
        };
        if fail_late {
            events.on_transport_failed("service registration rejected");
        }
        Ok(())
    }

    fn start_advertising(&mut self) -> anyhow::Result<()> {
        lock(&self.link).advertise_count += 1;
        Ok(())
    }

    fn connected_count(&self) -> usize {
        lock(&self.link).connected
    }

    fn notify(&mut self, point: ExchangePoint, data: &[u8]) -> anyhow::Result<()> {
        let mut link = lock(&self.link);
        if link.connected == 0 {
            bail!("no peer to notify");
        }
        link.notifications.push((point, data.to_vec()));
        Ok(())
    }

    // Completion is deferred to `PeerSide::complete_disconnects`,
    // the way a real stack reports it later from its own context.
    fn disconnect_all(&mut self) -> anyhow::Result<()> {
        let mut link = lock(&self.link);
        link.disconnect_requests += 1;
        link.pending_disconnects = link.connected;
        Ok(())
    }
}

/// Test-side handle of a [`MockTransport`]. Events are delivered with the
/// link lock released.
#[derive(Clone)]
pub struct PeerSide {
    link: Arc<Mutex<Link>>,
}

impl PeerSide {
    fn events(&self) -> Arc<dyn SessionEvents> {
        match &lock(&self.link).events {
            Some(events) => events.clone(),
            None => panic!("transport not started"),
        }
    }

    pub fn connect_peer(&self) {
        lock(&self.link).connected += 1;
        self.events().on_connect();
    }

    pub fn disconnect_peer(&self) {
        {
            let mut link = lock(&self.link);
            link.connected = link.connected.saturating_sub(1);
        }
        self.events().on_disconnect();
    }

    /// Lose a peer without telling the session.
    pub fn drop_peer_silently(&self) {
        let mut link = lock(&self.link);
        link.connected = link.connected.saturating_sub(1);
    }

    /// The stack dies after a successful start, taking every peer with it.
    pub fn fail_setup(&self) {
        lock(&self.link).connected = 0;
        self.events().on_transport_failed("controller fault");
    }

    /// The next successful `start` reports a failure before returning.
    pub fn fail_next_start_late(&self) {
        lock(&self.link).fail_late = true;
    }

    /// Deliver the disconnects requested by `disconnect_all`.
    pub fn complete_disconnects(&self) {
        let pending = {
            let mut link = lock(&self.link);
            let pending = std::mem::take(&mut link.pending_disconnects);
            link.connected = link.connected.saturating_sub(pending);
            pending
        };
        let events = self.events();
        for _ in 0..pending {
            events.on_disconnect();
        }
    }

    pub fn read(&self, point: ExchangePoint) -> Vec<u8> {
        self.events().on_read(point)
    }

    pub fn write(&self, point: ExchangePoint, data: &[u8]) {
        self.events().on_write(point, data);
    }

    pub fn notifications(&self) -> Vec<(ExchangePoint, Vec<u8>)> {
        lock(&self.link).notifications.clone()
    }

    pub fn advertise_count(&self) -> u32 {
        lock(&self.link).advertise_count
    }

    pub fn start_attempts(&self) -> u32 {
        lock(&self.link).start_attempts
    }

    pub fn disconnect_requests(&self) -> u32 {
        lock(&self.link).disconnect_requests
    }
}
