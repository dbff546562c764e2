use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, MutexGuard};
use strum::Display;
use tracing::{debug, warn};

use crate::organizer::transaction::{Intent, ShortcutInfo};
use crate::organizer::{WmCore, WmLock};

/// Outcome of handing a start request to the activity side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StartResult {
    Success,
    IntentNotResolved,
    PermissionDenied,
    Canceled,
}

impl StartResult {
    pub fn is_success(self) -> bool { self == StartResult::Success }
}

/// The activity-management side of the system: resolves intents and runs
/// app starts. Implementations must not touch the window hierarchy lock.
pub trait ActivityLauncher: Send + Sync {
    fn start_activity(&self, intent: &Intent) -> StartResult;
    fn start_task(&self, options: Option<&serde_json::Value>) -> StartResult;
    fn send_intent(&self, intent: &Intent) -> StartResult;
    fn start_shortcut(&self, shortcut: &ShortcutInfo) -> StartResult;
}

/// Launcher that resolves every request successfully. Stands in when no
/// activity manager is attached.
pub struct ImmediateLauncher;

impl ActivityLauncher for ImmediateLauncher {
    fn start_activity(&self, intent: &Intent) -> StartResult {
        debug!(action = %intent.action, "starting activity");
        StartResult::Success
    }

    fn start_task(&self, _options: Option<&serde_json::Value>) -> StartResult {
        StartResult::Success
    }

    fn send_intent(&self, intent: &Intent) -> StartResult {
        debug!(action = %intent.action, "sending intent");
        StartResult::Success
    }

    fn start_shortcut(&self, shortcut: &ShortcutInfo) -> StartResult {
        debug!(package = %shortcut.package, id = %shortcut.shortcut_id, "starting shortcut");
        StartResult::Success
    }
}

struct StartJob {
    run: Box<dyn FnOnce() -> StartResult + Send>,
    slot: Arc<Mutex<Option<StartResult>>>,
}

/// Runs activity starts on a dedicated worker so the hierarchy lock is not
/// held across them, while the posting thread blocks until the result is
/// back.
///
/// The waiting thread parks on the lock's condvar, which releases the
/// hierarchy lock for the duration; the worker grabs the lock only to
/// publish its wakeup, so the two sides cannot deadlock.
pub struct ActivityStarter {
    lock: Arc<WmLock>,
    tx: Sender<StartJob>,
}

impl ActivityStarter {
    pub fn new(lock: Arc<WmLock>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<StartJob>();
        let worker_lock = Arc::clone(&lock);
        std::thread::Builder::new()
            .name("activity-starter".into())
            .spawn(move || {
                for job in rx {
                    let result = (job.run)();
                    *job.slot.lock() = Some(result);
                    // Take the hierarchy lock before notifying so the waiter
                    // is either parked or has already seen the slot.
                    let _guard = worker_lock.core.lock();
                    worker_lock.starters.notify_all();
                }
            })
            .expect("failed to spawn activity starter thread");
        ActivityStarter { lock, tx }
    }

    /// Posts `run` to the worker and waits for its result. `guard` must be
    /// the caller's hold on this starter's hierarchy lock; it is released
    /// while waiting and reacquired before returning.
    pub fn post_and_wait(
        &self,
        guard: &mut MutexGuard<'_, WmCore>,
        run: Box<dyn FnOnce() -> StartResult + Send>,
    ) -> StartResult {
        let slot = Arc::new(Mutex::new(None));
        if self.tx.send(StartJob { run, slot: Arc::clone(&slot) }).is_err() {
            warn!("activity starter worker is gone");
            return StartResult::Canceled;
        }
        loop {
            if let Some(result) = slot.lock().take() {
                return result;
            }
            self.lock.starters.wait(guard);
        }
    }
}
