//! Emulation worker thread and the quiesce barrier.
//!
//! The host thread grants the worker a budget of cycles once per tick; the
//! worker runs the emulator in slices until the budget is spent or a
//! cancellation is requested, then goes idle. [`Quiesce::wait`] blocks until
//! the worker holds no budget and is not executing, which is the only point
//! at which the host may read or mutate emulation state.
//!
//! Call sites that quiesce: device load and swap, stop, suspend, finalize,
//! record save, and removable-media changes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::emulator::Emulator;
use crate::error::Fault;
use crate::terminal::Terminal;

#[derive(Debug, Default)]
struct Control {
    granted: u64,
    busy: bool,
    running: bool,
    exit: bool,
    executed: u64,
    fault: Option<Fault>,
}

#[derive(Debug, Default)]
struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    idle: Condvar,
    cancel: AtomicBool,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut ctl = self.control();
        while ctl.busy || (ctl.granted > 0 && ctl.running) {
            ctl = self.idle.wait(ctl).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Barrier handle that waits for a machine's worker to go idle.
///
/// Cheap to clone; devices receive one when attached so they can wait
/// before touching state the emulation may be using.
#[derive(Debug, Clone)]
pub struct Quiesce {
    shared: Arc<Shared>,
}

impl Quiesce {
    /// Blocks until the worker has no granted work and is not executing.
    pub fn wait(&self) {
        self.shared.wait_idle();
    }

    /// Whether the worker is idle right now.
    pub fn is_idle(&self) -> bool {
        let ctl = self.shared.control();
        !ctl.busy && ctl.granted == 0
    }
}

/// Owner of the emulation and the thread executing it.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    emulator: Arc<Mutex<Box<dyn Emulator>>>,
    terminal: Arc<Terminal>,
    slice: u64,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("control", &*self.shared.control())
            .field("slice", &self.slice)
            .field("spawned", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub(crate) fn new(emulator: Box<dyn Emulator>, terminal: Arc<Terminal>, slice: u64) -> Self {
        Self {
            shared: Arc::default(),
            emulator: Arc::new(Mutex::new(emulator)),
            terminal,
            slice: slice.max(1),
            thread: None,
        }
    }

    pub(crate) fn quiesce_handle(&self) -> Quiesce {
        Quiesce {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn quiesce(&self) {
        self.shared.wait_idle();
    }

    /// Spawns the worker thread unless one is already alive.
    pub(crate) fn start(&mut self) -> io::Result<()> {
        {
            let mut ctl = self.shared.control();
            if ctl.running {
                return Ok(());
            }
            ctl.running = true;
            ctl.exit = false;
        }
        if let Some(dead) = self.thread.take() {
            join(dead);
        }

        let shared = Arc::clone(&self.shared);
        let emulator = Arc::clone(&self.emulator);
        let terminal = Arc::clone(&self.terminal);
        let slice = self.slice;
        let spawned = thread::Builder::new()
            .name("vbus-worker".into())
            .spawn(move || work(shared, emulator, terminal, slice));
        match spawned {
            Ok(handle) => {
                debug!("emulation worker spawned");
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.control().running = false;
                Err(e)
            }
        }
    }

    /// Hands the worker `cycles` to execute. Refused while previous work is
    /// still outstanding or no thread is running.
    pub(crate) fn grant(&self, cycles: u64) -> bool {
        let mut ctl = self.shared.control();
        if !ctl.running || ctl.busy || ctl.granted > 0 || cycles == 0 {
            return false;
        }
        ctl.granted = cycles;
        drop(ctl);
        self.shared.wake.notify_one();
        true
    }

    pub(crate) fn is_idle(&self) -> bool {
        let ctl = self.shared.control();
        !ctl.busy && ctl.granted == 0
    }

    /// Cooperatively stops outstanding work: the current slice finishes,
    /// nothing after it runs. A fault raised by the cancelled work is
    /// discarded with it.
    pub(crate) fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.control().granted = 0;
        self.quiesce();
        self.shared.cancel.store(false, Ordering::Release);
        if let Some(fault) = self.take_fault() {
            debug!(%fault, "fault of cancelled work discarded");
        }
    }

    pub(crate) fn take_fault(&self) -> Option<Fault> {
        self.shared.control().fault.take()
    }

    /// Total cycles executed since creation.
    pub(crate) fn executed(&self) -> u64 {
        self.shared.control().executed
    }

    /// Cancels outstanding work and joins the thread.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shared.cancel.store(true, Ordering::Release);
        {
            let mut ctl = self.shared.control();
            ctl.exit = true;
            ctl.granted = 0;
        }
        self.shared.wake.notify_all();
        join(handle);
        self.shared.cancel.store(false, Ordering::Release);
        let mut ctl = self.shared.control();
        ctl.running = false;
        ctl.exit = false;
    }

    /// Quiesces, then runs `f` with exclusive access to the emulator.
    pub(crate) fn with_emulator<R>(&self, f: impl FnOnce(&mut dyn Emulator) -> R) -> R {
        self.quiesce();
        let mut emulator = self.emulator.lock().unwrap_or_else(PoisonError::into_inner);
        f(emulator.as_mut())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("emulation worker panicked");
    }
}

/// Marks the worker dead when its thread ends, including by panic, so that
/// nobody waits on it forever.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut ctl = self.0.control();
        if thread::panicking() {
            ctl.fault
                .get_or_insert_with(|| Fault::new("emulation worker panicked"));
        }
        ctl.busy = false;
        ctl.running = false;
        ctl.granted = 0;
        drop(ctl);
        self.0.idle.notify_all();
    }
}

fn work(
    shared: Arc<Shared>,
    emulator: Arc<Mutex<Box<dyn Emulator>>>,
    terminal: Arc<Terminal>,
    slice: u64,
) {
    let _guard = ExitGuard(Arc::clone(&shared));
    loop {
        let mut budget = {
            let mut ctl = shared.control();
            while ctl.granted == 0 && !ctl.exit {
                ctl = shared.wake.wait(ctl).unwrap_or_else(PoisonError::into_inner);
            }
            if ctl.exit {
                return;
            }
            ctl.busy = true;
            std::mem::take(&mut ctl.granted)
        };

        let mut executed = 0;
        let mut outcome = Ok(());
        {
            let mut emu = emulator.lock().unwrap_or_else(PoisonError::into_inner);
            while budget > 0 && !shared.cancel.load(Ordering::Acquire) {
                let step = budget.min(slice);
                if let Err(fault) = emu.run(step, &terminal) {
                    outcome = Err(fault);
                    break;
                }
                budget -= step;
                executed += step;
            }
        }

        let mut ctl = shared.control();
        ctl.busy = false;
        ctl.executed += executed;
        if let Err(fault) = outcome {
            ctl.fault = Some(fault);
        }
        drop(ctl);
        shared.idle.notify_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::context::DeviceMap;

    /// Emulator that counts cycles and fails once a limit is reached.
    #[derive(Debug, Default)]
    pub(crate) struct Counter {
        pub cycles: u64,
        pub fail_after: Option<u64>,
    }

    impl Emulator for Counter {
        fn install(&mut self, _map: &DeviceMap) -> Result<(), Fault> {
            Ok(())
        }

        fn run(&mut self, cycles: u64, console: &Terminal) -> Result<(), Fault> {
            if self.fail_after.is_some_and(|limit| self.cycles >= limit) {
                return Err(Fault::new("illegal instruction"));
            }
            self.cycles += cycles;
            console.write(b".");
            Ok(())
        }

        fn reset(&mut self) {
            self.cycles = 0;
        }

        fn save(&self) -> Vec<u8> {
            self.cycles.to_le_bytes().to_vec()
        }

        fn restore(&mut self, blob: &[u8]) -> Result<(), Fault> {
            let bytes: [u8; 8] = blob.try_into().map_err(|_| Fault::new("bad blob"))?;
            self.cycles = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    fn worker(emu: Counter) -> Worker {
        let terminal = Arc::new(Terminal::new(TerminalConfig::default()));
        Worker::new(Box::new(emu), terminal, 10)
    }

    #[test]
    fn grant_runs_in_slices() {
        let mut w = worker(Counter::default());
        assert!(!w.grant(25), "no thread yet");
        w.start().unwrap();
        assert!(w.grant(25));
        w.quiesce();
        assert!(w.is_idle());
        assert_eq!(w.executed(), 25);
        assert_eq!(w.with_emulator(|e| e.save()), 25u64.to_le_bytes().to_vec());
        assert_eq!(w.terminal.take_output().unwrap(), b"...");
    }

    #[test]
    fn fault_is_reported_once() {
        let mut w = worker(Counter {
            fail_after: Some(10),
            ..Counter::default()
        });
        w.start().unwrap();
        w.grant(30);
        w.quiesce();
        assert_eq!(w.take_fault().unwrap().message(), "illegal instruction");
        assert!(w.take_fault().is_none());
        assert_eq!(w.executed(), 10);
    }

    #[test]
    fn shutdown_is_idempotent_and_restartable() {
        let mut w = worker(Counter::default());
        w.start().unwrap();
        w.shutdown();
        w.shutdown();
        assert!(!w.grant(5));
        w.start().unwrap();
        assert!(w.grant(5));
        w.quiesce();
        assert_eq!(w.executed(), 5);
    }

    #[test]
    fn cancel_without_work_returns() {
        let mut w = worker(Counter::default());
        w.cancel();
        w.start().unwrap();
        w.cancel();
        assert!(w.quiesce_handle().is_idle());
    }

    #[test]
    fn cancel_discards_pending_fault() {
        let mut w = worker(Counter {
            fail_after: Some(0),
            ..Counter::default()
        });
        w.start().unwrap();
        w.grant(10);
        w.quiesce();
        w.cancel();
        assert!(w.take_fault().is_none());
    }
}
