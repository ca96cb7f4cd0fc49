//! One worker thread per target plus the global pause/resume listener.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::action::ActionNode;
use crate::interpreter::{run_pass, Engine, PassOutcome};
use crate::logger;
use crate::platform::hotkey::{start_hotkey_listener, HotkeyBindings};
use crate::types::*;

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Pause between passes.
    pub pass_interval: Duration,
    /// Poll interval while paused.
    pub idle_poll: Duration,
}

/// Per-target flags shared with its worker.
#[derive(Default)]
struct Slot {
    running: AtomicBool,
    passes: AtomicU64,
}

/// Window id to run state. Cloned into workers and the hotkey listener.
#[derive(Default, Clone)]
struct RunFlags(Arc<Mutex<HashMap<WindowId, Arc<Slot>>>>);

impl RunFlags {
    fn lock(&self) -> MutexGuard<'_, HashMap<WindowId, Arc<Slot>>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, id: WindowId) -> Option<Arc<Slot>> {
        self.lock().get(&id).cloned()
    }

    fn set_all(&self, running: bool) {
        for slot in self.lock().values() {
            slot.running.store(running, Ordering::Release);
        }
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    actions: Arc<[ActionNode]>,
    targets: Vec<Target>,
    timing: Timing,
    hotkeys: Option<HotkeyBindings>,
    flags: RunFlags,
    workers: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    /// `actions` is frozen here; later edits to the caller's copy are not seen.
    pub fn new(
        engine: Arc<Engine>,
        actions: Vec<ActionNode>,
        targets: Vec<Target>,
        timing: Timing,
        hotkeys: Option<HotkeyBindings>,
    ) -> Self {
        for t in &targets {
            logger::register_prefix(&t.tag(), logger::COLOR_BLUE);
        }
        Self {
            engine,
            actions: actions.into(),
            targets,
            timing,
            hotkeys,
            flags: RunFlags::default(),
            workers: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a worker for every target that has none yet, then the hotkey
    /// listener if it is not running.
    pub fn start(&self) {
        for idx in 0..self.targets.len() {
            self.start_target(idx);
        }
        self.start_listener();
    }

    fn start_target(&self, idx: usize) {
        let Some(target) = self.targets.get(idx).cloned() else { return };
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        let slot = {
            let mut flags = self.flags.lock();
            if flags.contains_key(&target.window_id) {
                return;
            }
            let slot = Arc::new(Slot { running: AtomicBool::new(true), ..Default::default() });
            flags.insert(target.window_id, slot.clone());
            slot
        };

        let engine = self.engine.clone();
        let actions = self.actions.clone();
        let stop = self.stop.clone();
        let timing = self.timing;
        let tag = target.tag();
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", tag))
            .spawn(move || worker_loop(engine, actions, target, slot, stop, timing));

        match spawned {
            Ok(handle) => self.lock_workers().push(handle),
            Err(e) => {
                logger::error_p(&tag, &format!("failed to start worker: {}", e));
                self.flags.lock().remove(&self.targets[idx].window_id);
            }
        }
    }

    fn start_listener(&self) {
        let Some(keys) = self.hotkeys else { return };
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener.is_some() {
            return;
        }
        let (pause, resume) = (self.flags.clone(), self.flags.clone());
        *listener = start_hotkey_listener(
            self.engine.platform.clone(),
            keys,
            self.timing.idle_poll,
            self.stop.clone(),
            move || pause.set_all(false),
            move || resume.set_all(true),
        );
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pause_all(&self) {
        logger::info("pausing all targets");
        self.flags.set_all(false);
    }

    pub fn resume_all(&self) {
        logger::info("resuming all targets");
        self.flags.set_all(true);
    }

    /// Returns false when the target has no worker.
    pub fn set_running(&self, id: WindowId, running: bool) -> bool {
        match self.flags.get(id) {
            Some(slot) => {
                slot.running.store(running, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: WindowId) -> bool {
        self.flags.get(id).is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    /// Flip the target at `idx`, starting its worker if it has none.
    pub fn toggle(&self, idx: usize) {
        let Some(target) = self.targets.get(idx) else { return };
        let id = target.window_id;
        if !self.set_running(id, !self.is_running(id)) {
            self.start_target(idx);
        }
        logger::info_p(&target.tag(), if self.is_running(id) { "running" } else { "paused" });
    }

    pub fn targets(&self) -> Vec<TargetStatus> {
        self.targets
            .iter()
            .map(|t| {
                let (state, passes) = match self.flags.get(t.window_id) {
                    Some(slot) if slot.running.load(Ordering::Acquire) => {
                        (WorkerState::Running, slot.passes.load(Ordering::Acquire))
                    }
                    Some(slot) => (WorkerState::Paused, slot.passes.load(Ordering::Acquire)),
                    None => (WorkerState::Idle, 0),
                };
                TargetStatus { target: t.clone(), state, passes }
            })
            .collect()
    }

    /// Stop every thread at its next poll and wait for it. A worker inside a
    /// long node finishes that node first.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let workers: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        for w in workers {
            w.join().ok();
        }
        if let Some(l) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            l.join().ok();
        }
        logger::info("scheduler stopped");
    }
}

impl Scheduler {
    /// Apply one command. Returns false after `Quit`.
    pub fn apply(&self, cmd: Command) -> bool {
        match cmd {
            Command::Start => self.start(),
            Command::PauseAll => self.pause_all(),
            Command::ResumeAll => self.resume_all(),
            Command::Toggle(idx) => self.toggle(idx),
            Command::Quit => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    /// Apply commands until `Quit` arrives or every sender is gone.
    pub fn serve(&self, rx: mpsc::Receiver<Command>) {
        while let Ok(cmd) = rx.recv() {
            if !self.apply(cmd) {
                return;
            }
        }
        self.shutdown();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Sleep up to `total`, waking early when `stop` is raised.
fn nap(total: Duration, step: Duration, stop: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && !stop.load(Ordering::Acquire) {
        let d = left.min(step);
        thread::sleep(d);
        left -= d;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

fn worker_loop(
    engine: Arc<Engine>,
    actions: Arc<[ActionNode]>,
    target: Target,
    slot: Arc<Slot>,
    stop: Arc<AtomicBool>,
    timing: Timing,
) {
    let tag = target.tag();
    let mut window = engine.platform.create_window(target.window_id);
    logger::info_p(&tag, &format!("worker started for \"{}\"", target.name));

    while !stop.load(Ordering::Acquire) {
        if !slot.running.load(Ordering::Acquire) {
            thread::sleep(timing.idle_poll);
            continue;
        }
        if actions.is_empty() {
            nap(timing.pass_interval, timing.idle_poll, &stop);
            continue;
        }

        let running = || slot.running.load(Ordering::Acquire) && !stop.load(Ordering::Acquire);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_pass(&engine, window.as_mut(), &actions, &running, &tag)
        }));
        match outcome {
            Ok(PassOutcome::Completed) => {
                slot.passes.fetch_add(1, Ordering::AcqRel);
            }
            Ok(PassOutcome::Paused) => logger::info_p(&tag, "pass interrupted by pause"),
            Ok(_) => {}
            Err(payload) => {
                logger::error_p(&tag, &format!("pass panicked: {}", panic_message(payload.as_ref())));
            }
        }
        nap(timing.pass_interval, timing.idle_poll, &stop);
    }
    logger::info_p(&tag, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::action::Action;
    use crate::testing::*;

    fn click(x: i32, y: i32) -> ActionNode {
        ActionNode::new(Action::LeftClick { x, y })
    }

    const TIMING: Timing = Timing {
        pass_interval: Duration::from_millis(10),
        idle_poll: Duration::from_millis(5),
    };

    fn scheduler(log: &Log, actions: Vec<ActionNode>, targets: Vec<Target>) -> Scheduler {
        Scheduler::new(Arc::new(engine(log, "")), actions, targets, TIMING, None)
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn pause_lets_current_node_finish_but_not_the_next() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let actions = vec![click(1, 1), ActionNode::new(Action::Delay { ms: 150 }), click(2, 2)];
        let sched = scheduler(&log, actions, vec![Target::new("game", 7)]);
        sched.start();

        wait_until("first click", || clicks(&log).contains(&(1, 1)));
        sched.pause_all();
        assert!(!sched.is_running(7));
        thread::sleep(Duration::from_millis(300));
        assert!(!clicks(&log).contains(&(2, 2)));
        assert_eq!(sched.targets()[0].state, WorkerState::Paused);

        sched.resume_all();
        wait_until("second click", || clicks(&log).contains(&(2, 2)));
        sched.shutdown();

        // the interrupted pass restarts from the top
        let seen = clicks(&log);
        assert_eq!(&seen[..3], &[(1, 1), (1, 1), (2, 2)]);
    }

    #[test]
    fn passes_repeat_and_are_counted() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler(&log, vec![click(3, 3)], vec![Target::new("a", 1)]);
        assert_eq!(sched.targets()[0].state, WorkerState::Idle);
        sched.start();
        wait_until("three passes", || sched.targets()[0].passes >= 3);
        assert_eq!(sched.targets()[0].state, WorkerState::Running);
        sched.shutdown();
        assert!(clicks(&log).len() >= 3);
    }

    #[test]
    fn targets_are_independent() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler(&log, vec![click(1, 1)], vec![Target::new("a", 10), Target::new("b", 20)]);
        sched.start();
        assert!(sched.set_running(10, false));
        assert!(!sched.is_running(10));
        assert!(sched.is_running(20));
        assert!(!sched.set_running(99, true));

        sched.toggle(0);
        assert!(sched.is_running(10));
        sched.toggle(1);
        assert!(!sched.is_running(20));
        sched.shutdown();
    }

    #[test]
    fn start_twice_keeps_one_worker_per_target() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler(&log, vec![click(1, 1)], vec![Target::new("a", 1)]);
        sched.start();
        sched.start();
        assert_eq!(sched.lock_workers().len(), 1);
        sched.shutdown();
        assert!(sched.lock_workers().is_empty());
    }

    #[test]
    fn serve_applies_commands_until_quit() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler(&log, vec![click(1, 1)], vec![Target::new("a", 1)]);
        let (tx, rx) = mpsc::channel();
        tx.send(Command::Start).unwrap();
        tx.send(Command::PauseAll).unwrap();
        tx.send(Command::Toggle(0)).unwrap();
        tx.send(Command::Quit).unwrap();
        tx.send(Command::PauseAll).unwrap();
        sched.serve(rx);

        // the command after Quit is never applied
        assert!(sched.is_running(1));
        assert!(sched.lock_workers().is_empty());
    }

    #[test]
    fn toggle_starts_missing_worker() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler(&log, vec![click(1, 1)], vec![Target::new("a", 1), Target::new("b", 2)]);
        sched.toggle(1);
        assert!(sched.is_running(2));
        assert_eq!(sched.targets()[0].state, WorkerState::Idle);
        sched.shutdown();
    }
}
