// Pedal Firmware - Task Base
//
// Every schedulable unit implements `Task`. Two execution classes exist:
//   Cooperative  stepped by the scheduler on the main context, never blocks.
//   Dedicated    owns a thread pinned to a core and may block freely.
//
// Suspension lives in a `SuspendHandle` so other contexts can resume a task
// or cut a timed suspend short.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use crate::hal::{Clock, Timestamp};
use crate::lock;
use crate::scheduler::Spawner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Cooperative,
    Dedicated,
}

/// Where a dedicated task's thread lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub core: Option<usize>,
    pub stack_size: usize,
}

#[derive(Debug, Default)]
struct SuspendInner {
    count: u16,
    until: Option<Timestamp>,
    // Bumped on cancel; a sleeper compares it against the value it saw
    // when it went to sleep.
    wake_epoch: u32,
    // Context that runs this task (the scheduler loop for cooperative
    // tasks). Cancels and final resumes are forwarded to it.
    context: Option<SuspendHandle>,
}

/// Wake epoch observed before deciding to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeToken(u32);

#[derive(Debug, Default)]
struct SuspendState {
    inner: Mutex<SuspendInner>,
    wake: Condvar,
}

/// Cross-context handle to one task's suspend bookkeeping.
///
/// A task is runnable iff its manual suspend count is zero and any timed
/// suspend has expired.
#[derive(Debug, Clone, Default)]
pub struct SuspendHandle(Arc<SuspendState>);

impl SuspendHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manual, reentrant suspend. Pair every call with [`resume`](Self::resume).
    pub fn suspend(&self) {
        let mut inner = lock(&self.0.inner);
        inner.count = inner.count.saturating_add(1);
    }

    /// Undo one [`suspend`](Self::suspend). Extra calls are clamped at zero.
    pub fn resume(&self) {
        let mut inner = lock(&self.0.inner);
        if inner.count == 0 {
            log::warn!("resume() without matching suspend() - ignored");
            return;
        }
        inner.count -= 1;
        if inner.count > 0 {
            return;
        }
        self.0.wake.notify_all();
        let context = inner.context.clone();
        drop(inner);

        if let Some(context) = context {
            context.cancel_suspend();
        }
    }

    /// Drop a pending timed suspend and wake the task if it is sleeping on
    /// its own context. A task that already woke up is unaffected.
    pub fn cancel_suspend(&self) {
        let context = {
            let mut inner = lock(&self.0.inner);
            inner.until = None;
            inner.wake_epoch = inner.wake_epoch.wrapping_add(1);
            self.0.wake.notify_all();
            inner.context.clone()
        };

        if let Some(context) = context {
            context.cancel_suspend();
        }
    }

    /// Forward cancels and final resumes to the handle of the context that
    /// runs this task.
    pub fn attach_context(&self, context: SuspendHandle) {
        lock(&self.0.inner).context = Some(context);
    }

    pub fn wake_token(&self) -> WakeToken {
        WakeToken(lock(&self.0.inner).wake_epoch)
    }

    /// True once a cancel arrived after `token` was taken.
    pub fn woken_since(&self, token: WakeToken) -> bool {
        lock(&self.0.inner).wake_epoch != token.0
    }

    /// Block for up to `ms`, returning early on a cancel issued after
    /// `token` was taken. Leaves the recorded deadline alone.
    pub fn wait_from(&self, token: WakeToken, ms: u32) {
        let deadline = Instant::now() + Duration::from_millis(u64::from(ms));
        let inner = lock(&self.0.inner);
        drop(self.wait_locked(inner, token.0, deadline));
    }

    fn wait_locked<'a>(
        &'a self,
        mut inner: std::sync::MutexGuard<'a, SuspendInner>,
        epoch: u32,
        deadline: Instant,
    ) -> std::sync::MutexGuard<'a, SuspendInner> {
        while inner.wake_epoch == epoch {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            inner = match self.0.wake.wait_timeout(inner, left) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        inner
    }

    /// Record a cooperative, deadline-based suspend.
    pub fn suspend_until(&self, until: Timestamp) {
        lock(&self.0.inner).until = Some(until);
    }

    /// Block the calling context for `ms`, unless cancelled first.
    ///
    /// `now` only feeds the recorded deadline; the wait itself runs on the
    /// system monotonic clock.
    pub fn sleep_for(&self, now: Timestamp, ms: u32) {
        let deadline = Instant::now() + Duration::from_millis(u64::from(ms));
        let mut inner = lock(&self.0.inner);
        inner.until = Some(now + u64::from(ms));
        let epoch = inner.wake_epoch;

        let mut inner = self.wait_locked(inner, epoch, deadline);
        inner.until = None;
    }

    /// Block until the manual suspend count drops to zero.
    pub fn wait_while_held(&self) {
        let mut inner = lock(&self.0.inner);
        while inner.count > 0 {
            inner = match self.0.wake.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn is_runnable(&self, now: Timestamp) -> bool {
        let inner = lock(&self.0.inner);
        inner.count == 0 && inner.until.map_or(true, |until| now >= until)
    }

    /// `now` when no timed suspend is pending, the deadline otherwise. A
    /// held task has no deadline of its own ([`Timestamp::MAX`]); its final
    /// `resume()` wakes the context instead.
    pub fn next_step_time(&self, now: Timestamp) -> Timestamp {
        let inner = lock(&self.0.inner);
        if inner.count > 0 {
            return Timestamp::MAX;
        }
        match inner.until {
            Some(until) if until > now => until,
            _ => now,
        }
    }

    pub fn suspend_count(&self) -> u16 {
        lock(&self.0.inner).count
    }

    pub fn suspended_until(&self) -> Option<Timestamp> {
        lock(&self.0.inner).until
    }
}

/// State shared by every task: identity, execution class, clock and
/// suspend bookkeeping.
pub struct TaskCore {
    name: &'static str,
    mode: TaskMode,
    placement: Option<Placement>,
    clock: Arc<dyn Clock>,
    suspend: SuspendHandle,
    disabled: AtomicBool,
}

impl TaskCore {
    pub fn cooperative(name: &'static str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            mode: TaskMode::Cooperative,
            placement: None,
            clock,
            suspend: SuspendHandle::new(),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn dedicated(name: &'static str, clock: Arc<dyn Clock>, placement: Placement) -> Self {
        Self {
            name,
            mode: TaskMode::Dedicated,
            placement: Some(placement),
            clock,
            suspend: SuspendHandle::new(),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    pub fn placement(&self) -> Option<Placement> {
        self.placement
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn handle(&self) -> SuspendHandle {
        self.suspend.clone()
    }

    /// A disabled task is neither set up nor stepped.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Cooperative tasks record a deadline and return; dedicated tasks
    /// really sleep on their own context.
    pub fn suspend(&self, now: Timestamp, ms: u32) {
        match self.mode {
            TaskMode::Cooperative => self.suspend.suspend_until(now + u64::from(ms)),
            TaskMode::Dedicated => self.suspend.sleep_for(now, ms),
        }
    }

    pub fn is_runnable(&self, now: Timestamp) -> bool {
        self.suspend.is_runnable(now)
    }

    pub fn next_step_time(&self, now: Timestamp) -> Timestamp {
        self.suspend.next_step_time(now)
    }
}

/// Flag every task whose name `is_disabled` picks; the scheduler then
/// leaves it out.
pub fn disable_matching(tasks: &[Box<dyn Task>], is_disabled: impl Fn(&str) -> bool) {
    for task in tasks {
        if is_disabled(task.name()) {
            log::warn!("Task {} disabled by configuration", task.name());
            task.core().set_disabled(true);
        }
    }
}

/// Contract for every schedulable unit.
///
/// `step_work` must return in bounded time for cooperative tasks; anything
/// that blocks belongs in a dedicated task.
pub trait Task: Send + 'static {
    fn core(&self) -> &TaskCore;

    /// One-time initialisation, run before the first step.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Task-specific work for one step.
    fn step_work(&mut self, now: Timestamp);

    fn is_active(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        self.core().name()
    }

    fn mode(&self) -> TaskMode {
        self.core().mode()
    }

    fn next_step_time(&self, now: Timestamp) -> Timestamp {
        self.core().next_step_time(now)
    }

    /// Run `step_work` if the task is runnable. A suspended cooperative task
    /// returns at once; a held dedicated task parks until resumed.
    fn step(&mut self, now: Timestamp) {
        let core = self.core();
        if !core.is_runnable(now) {
            if core.mode() == TaskMode::Dedicated {
                core.handle().wait_while_held();
            }
            return;
        }
        self.step_work(now);
    }

    /// Start a dedicated task: `setup()`, then hand a loop of `step()` to
    /// `spawner` on the task's placement.
    fn run(mut self: Box<Self>, spawner: &dyn Spawner) -> anyhow::Result<()> {
        let name = self.name();
        if self.mode() != TaskMode::Dedicated {
            bail!("{name} is cooperative and runs inside the scheduler");
        }
        let placement = self
            .core()
            .placement()
            .with_context(|| format!("{name} has no placement"))?;

        self.setup().with_context(|| format!("setting up {name}"))?;

        let clock = Arc::clone(self.core().clock());
        spawner.spawn(
            name,
            placement,
            Box::new(move || {
                log::info!("{} running on its own context", name);
                loop {
                    let now = clock.now_ms();
                    self.step(now);
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockClock;
    use std::thread;

    #[test]
    fn balanced_suspend_resume_restores_runnable() {
        let handle = SuspendHandle::new();
        for depth in 1..=5 {
            for _ in 0..depth {
                handle.suspend();
            }
            assert!(!handle.is_runnable(0));
            for _ in 0..depth {
                handle.resume();
            }
            assert!(handle.is_runnable(0));
        }
    }

    #[test]
    fn extra_resume_clamps_at_zero() {
        let handle = SuspendHandle::new();
        handle.resume();
        handle.resume();
        assert_eq!(handle.suspend_count(), 0);

        handle.suspend();
        assert!(!handle.is_runnable(0));
        handle.resume();
        assert!(handle.is_runnable(0));
    }

    #[test]
    fn next_step_time_for_runnable_and_suspended() {
        let handle = SuspendHandle::new();
        assert_eq!(handle.next_step_time(1234), 1234);

        handle.suspend_until(1500);
        for now in [1000, 1234, 1499] {
            assert_eq!(handle.next_step_time(now), 1500);
            assert!(handle.next_step_time(now) >= now);
            assert!(!handle.is_runnable(now));
        }
        assert_eq!(handle.next_step_time(1500), 1500);
        assert!(handle.is_runnable(1500));
        assert_eq!(handle.next_step_time(2000), 2000);
    }

    #[test]
    fn cancel_clears_cooperative_deadline() {
        let handle = SuspendHandle::new();
        handle.suspend_until(10_000);
        handle.cancel_suspend();
        assert!(handle.is_runnable(0));
        assert_eq!(handle.suspended_until(), None);
    }

    #[test]
    fn cancel_interrupts_dedicated_sleep() {
        let handle = SuspendHandle::new();
        let sleeper = handle.clone();
        let started = Instant::now();

        let worker = thread::spawn(move || sleeper.sleep_for(0, 10_000));
        while handle.suspended_until().is_none() {
            thread::yield_now();
        }
        handle.cancel_suspend();
        worker.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.suspended_until(), None);
    }

    #[test]
    fn dedicated_sleep_runs_to_deadline() {
        let handle = SuspendHandle::new();
        let started = Instant::now();
        handle.sleep_for(0, 30);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn late_cancel_is_absorbed() {
        let handle = SuspendHandle::new();
        handle.cancel_suspend();

        // The cancel predates this sleep, so it must not cut it short.
        let started = Instant::now();
        handle.sleep_for(0, 20);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wakes_reach_the_attached_context() {
        let context = SuspendHandle::new();
        let handle = SuspendHandle::new();
        handle.attach_context(context.clone());

        let token = context.wake_token();
        handle.suspend_until(500);
        assert!(!context.woken_since(token));
        handle.cancel_suspend();
        assert!(context.woken_since(token));

        handle.suspend();
        handle.suspend();
        assert_eq!(handle.next_step_time(0), Timestamp::MAX);
        let token = context.wake_token();
        handle.resume();
        assert!(!context.woken_since(token));
        handle.resume();
        assert!(context.woken_since(token));
        assert_eq!(handle.next_step_time(0), 0);
    }

    #[test]
    fn wait_from_ends_on_a_later_cancel() {
        let handle = SuspendHandle::new();
        let waker = handle.clone();
        let token = handle.wake_token();
        let started = Instant::now();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.cancel_suspend();
        });
        handle.wait_from(token, 10_000);
        worker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    struct Counter {
        core: TaskCore,
        steps: u32,
    }

    impl Task for Counter {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        fn step_work(&mut self, now: Timestamp) {
            self.steps += 1;
            self.core.suspend(now, 100);
        }
    }

    #[test]
    fn cooperative_step_skips_work_while_suspended() {
        let clock = Arc::new(MockClock::new());
        let mut task = Counter {
            core: TaskCore::cooperative("counter", clock),
            steps: 0,
        };

        task.step(0);
        assert_eq!(task.steps, 1);
        assert_eq!(task.next_step_time(0), 100);

        task.step(50);
        assert_eq!(task.steps, 1);

        task.step(100);
        assert_eq!(task.steps, 2);

        let handle = task.core().handle();
        handle.suspend();
        task.step(1000);
        assert_eq!(task.steps, 2);
        handle.resume();
        task.step(1000);
        assert_eq!(task.steps, 3);
    }
}
