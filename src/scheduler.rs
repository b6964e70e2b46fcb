// Pedal Firmware - Super-loop Scheduler
//
// Owns the cooperative tasks and steps them in a fixed order, then sleeps
// until the earliest deadline or until one of them is woken from another
// context. Dedicated tasks start through `Task::run` on a `Spawner` and
// live on their own thread from then on.

use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};

use crate::config::STEP_BUDGET_MS;
use crate::hal::{Clock, Timestamp};
use crate::task::{Placement, SuspendHandle, Task, TaskMode, WakeToken};

/// Pass length when no cooperative task exists.
const IDLE_PASS_MS: u64 = 1000;

/// Host threads need more room than the firmware stack budget.
const HOST_MIN_STACK: usize = 64 * 1024;

/// Starts a dedicated execution context.
pub trait Spawner {
    fn spawn(
        &self,
        name: &'static str,
        placement: Placement,
        body: Box<dyn FnOnce() + Send>,
    ) -> anyhow::Result<()>;
}

/// Plain named `std::thread`; core affinity is ignored and the stack is
/// never smaller than [`HOST_MIN_STACK`].
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(
        &self,
        name: &'static str,
        placement: Placement,
        body: Box<dyn FnOnce() + Send>,
    ) -> anyhow::Result<()> {
        thread::Builder::new()
            .name(name.into())
            .stack_size(placement.stack_size.max(HOST_MIN_STACK))
            .spawn(body)
            .with_context(|| format!("spawning {name}"))?;
        Ok(())
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    tasks: Vec<Box<dyn Task>>,
    started: bool,
    // Cancelled whenever a cooperative task is woken from outside the loop.
    wake: SuspendHandle,
    token: WakeToken,
    overruns: u32,
    last_overrun: Option<(&'static str, u64)>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let wake = SuspendHandle::new();
        let token = wake.wake_token();
        Self {
            clock,
            tasks: Vec::new(),
            started: false,
            wake,
            token,
            overruns: 0,
            last_overrun: None,
        }
    }

    /// Install the fixed task set. Cooperative tasks get `setup()` and stay
    /// with the scheduler; dedicated tasks start through [`Task::run`].
    /// Disabled tasks are skipped.
    pub fn start(&mut self, tasks: Vec<Box<dyn Task>>, spawner: &dyn Spawner) -> anyhow::Result<()> {
        if self.started {
            bail!("scheduler already started");
        }
        self.started = true;

        for mut task in tasks {
            if task.core().is_disabled() {
                log::info!("Skipping disabled task {}", task.name());
                continue;
            }
            log::info!("Setup {} ({:?})", task.name(), task.mode());

            match task.mode() {
                TaskMode::Cooperative => {
                    task.setup()
                        .with_context(|| format!("setting up {}", task.name()))?;
                    task.core().handle().attach_context(self.wake.clone());
                    self.tasks.push(task);
                }
                TaskMode::Dedicated => task.run(spawner)?,
            }
        }
        Ok(())
    }

    pub fn cooperative_count(&self) -> usize {
        self.tasks.len()
    }

    /// Steps that ran past [`STEP_BUDGET_MS`] so far.
    pub fn overrun_count(&self) -> u32 {
        self.overruns
    }

    /// Name and duration of the latest overrunning step.
    pub fn last_overrun(&self) -> Option<(&'static str, u64)> {
        self.last_overrun
    }

    /// Step every enabled cooperative task once and return the earliest
    /// deadline.
    pub fn run_pass(&mut self) -> Timestamp {
        // Wakes from here on cut the following sleep short.
        self.token = self.wake.wake_token();
        // One `now` per pass keeps the deadline math consistent.
        let now = self.clock.now_ms();

        for task in self.tasks.iter_mut() {
            if task.core().is_disabled() {
                continue;
            }
            let started = self.clock.now_ms();
            task.step(now);
            let spent = self.clock.now_ms().saturating_sub(started);
            if spent > STEP_BUDGET_MS {
                log::warn!("{} step took {} ms (budget {} ms)", task.name(), spent, STEP_BUDGET_MS);
                self.overruns = self.overruns.saturating_add(1);
                self.last_overrun = Some((task.name(), spent));
            }
        }

        self.tasks
            .iter()
            .filter(|task| !task.core().is_disabled())
            .map(|task| task.next_step_time(now))
            .min()
            .unwrap_or(now + IDLE_PASS_MS)
    }

    /// Sleep until `deadline`. Returns at once if it already passed or a
    /// task was woken since the pass began.
    pub fn sleep_until(&self, deadline: Timestamp) {
        if self.wake.woken_since(self.token) {
            return;
        }
        let now = self.clock.now_ms();
        if deadline > now {
            let delta = (deadline - now).min(u64::from(u32::MAX)) as u32;
            self.clock.sleep_ms_or_wake(delta, &self.wake, self.token);
        }
    }

    pub fn run(mut self) -> ! {
        log::info!("Scheduler running {} cooperative task(s)", self.tasks.len());
        loop {
            let next = self.run_pass();
            self.sleep_until(next);
        }
    }
}
