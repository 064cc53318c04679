//! Lifecycle state machine for long-lived components.
//!
//! A component moves through
//! `NotInitialized -> Initialized -> Started -> Running -> Stopping -> Stopped -> Destroyed`.
//! Every transition goes through [`Lifecycle::change_state`] or
//! [`Lifecycle::change_state_if`], which bracket the
//! change with `before_transition`/`after_transition` callbacks on all registered
//! listeners, in registration order.
//!
//! Stopping is cooperative: [`Lifecycle::stop`] only raises a flag that long
//! running loops are expected to poll with [`Lifecycle::is_stop_requested`].
//!
//! The state word and listener notification are synchronized, caller-side
//! sequencing is not. Two threads starting and stopping the same component must
//! serialize externally.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{KitError, KitResult};

/// Default time `destroy` waits for a stopping component to reach `Stopped`.
pub const DEFAULT_DESTROY_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    NotInitialized,
    Initialized,
    Started,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

/// Observer of lifecycle transitions.
///
/// Callbacks run while the state lock is held, so they must not call back
/// into the same [`Lifecycle`].
pub trait LifecycleListener: Send + Sync {
    fn before_transition(&self, from: ComponentState, to: ComponentState);
    fn after_transition(&self, from: ComponentState, to: ComponentState);
}

pub struct Lifecycle {
    state: Mutex<ComponentState>,
    changed: Condvar,
    stop_requested: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
    destroy_wait: Duration,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            state: Mutex::new(ComponentState::NotInitialized),
            changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            destroy_wait: DEFAULT_DESTROY_WAIT,
        }
    }

    /// How long `destroy` waits for a stopping component.
    pub fn with_destroy_wait(self, wait: Duration) -> Self {
        let mut this = self;
        this.destroy_wait = wait;
        this
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.lock().push(listener);
    }

    /// Remove a listener previously added (compared by pointer).
    pub fn remove_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn create(&self) -> KitResult<()> {
        let state = self.state();
        if state != ComponentState::NotInitialized && state != ComponentState::Destroyed {
            return Err(KitError::Lifecycle {
                state,
                operation: "create",
            });
        }
        self.change_state(ComponentState::Initialized);
        Ok(())
    }

    pub fn start(&self) -> KitResult<()> {
        let state = self.state();
        if !matches!(state, ComponentState::Initialized | ComponentState::Stopped) {
            return Err(KitError::Lifecycle {
                state,
                operation: "start",
            });
        }
        self.stop_requested.store(false, Ordering::Release);
        self.change_state(ComponentState::Started);
        Ok(())
    }

    /// Request the component to stop. A no-op outside `Started`/`Running`.
    pub fn stop(&self) {
        let listeners = self.listeners.lock().clone();
        let mut state = self.state.lock();
        if !matches!(*state, ComponentState::Started | ComponentState::Running) {
            debug!("stop ignored in state {:?}", *state);
            return;
        }
        self.stop_requested.store(true, Ordering::Release);
        transition(&listeners, &mut state, ComponentState::Stopping);
        drop(state);
        self.changed.notify_all();
    }

    /// Move to `Destroyed`. Legal from `Stopped`, or from `Stopping` if
    /// `Stopped` is reached within the configured wait. On failure the state
    /// is left as it was.
    pub fn destroy(&self) -> KitResult<()> {
        let mut state = self.state();
        if state == ComponentState::Stopping
            && self.wait_for_state(ComponentState::Stopped, self.destroy_wait)
        {
            state = ComponentState::Stopped;
        }
        if state != ComponentState::Stopped {
            return Err(KitError::Lifecycle {
                state,
                operation: "destroy",
            });
        }
        self.change_state(ComponentState::Destroyed);
        Ok(())
    }

    /// Transition to `new`, notifying listeners before and after the change.
    pub fn change_state(&self, new: ComponentState) {
        let listeners = self.listeners.lock().clone();
        let mut state = self.state.lock();
        transition(&listeners, &mut state, new);
        drop(state);
        self.changed.notify_all();
    }

    /// Transition from `from` to `to`, unless the state has moved on. The
    /// check and the change happen under the state lock. Returns whether
    /// the transition took place.
    pub fn change_state_if(&self, from: ComponentState, to: ComponentState) -> bool {
        let listeners = self.listeners.lock().clone();
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        transition(&listeners, &mut state, to);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Block until the component reaches `target`. A zero timeout waits forever.
    /// Returns whether the state was reached.
    pub fn wait_for_state(&self, target: ComponentState, timeout: Duration) -> bool {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        let mut state = self.state.lock();
        while *state != target {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return *state == target;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }
}

fn transition(
    listeners: &[Arc<dyn LifecycleListener>],
    state: &mut ComponentState,
    new: ComponentState,
) {
    let old = *state;
    for l in listeners {
        l.before_transition(old, new);
    }
    *state = new;
    trace!("lifecycle {:?} -> {:?}", old, new);
    for l in listeners {
        l.after_transition(old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Recorder(Mutex<Vec<String>>);

    impl LifecycleListener for Recorder {
        fn before_transition(&self, from: ComponentState, to: ComponentState) {
            self.0.lock().push(format!("before {from:?}->{to:?}"));
        }
        fn after_transition(&self, from: ComponentState, to: ComponentState) {
            self.0.lock().push(format!("after {from:?}->{to:?}"));
        }
    }

    #[test]
    fn destroy_after_create_fails() {
        let lc = Lifecycle::new();
        lc.create().unwrap();
        assert!(matches!(
            lc.destroy(),
            Err(KitError::Lifecycle {
                state: ComponentState::Initialized,
                ..
            })
        ));
        assert_eq!(lc.state(), ComponentState::Initialized);
    }

    #[test]
    fn destroy_from_stopping_waits_for_stopped() {
        let lc = Arc::new(Lifecycle::new().with_destroy_wait(Duration::from_secs(5)));
        lc.create().unwrap();
        lc.start().unwrap();
        lc.stop();
        assert!(lc.is_stop_requested());
        assert_eq!(lc.state(), ComponentState::Stopping);

        let lc2 = lc.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            lc2.change_state(ComponentState::Stopped);
        });
        lc.destroy().unwrap();
        assert_eq!(lc.state(), ComponentState::Destroyed);
        t.join().unwrap();
    }

    #[test]
    fn destroy_from_stopping_times_out() {
        let lc = Lifecycle::new().with_destroy_wait(Duration::from_millis(10));
        lc.create().unwrap();
        lc.start().unwrap();
        lc.stop();
        assert!(lc.destroy().is_err());
        assert_eq!(lc.state(), ComponentState::Stopping);
    }

    #[test]
    fn start_clears_stop_flag() {
        let lc = Lifecycle::new();
        lc.create().unwrap();
        lc.start().unwrap();
        lc.stop();
        lc.change_state(ComponentState::Stopped);
        lc.start().unwrap();
        assert!(!lc.is_stop_requested());
    }

    #[test]
    fn listeners_bracket_transitions_in_order() {
        let lc = Lifecycle::new();
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        lc.add_listener(rec.clone());
        lc.create().unwrap();
        lc.start().unwrap();
        assert_eq!(
            *rec.0.lock(),
            vec![
                "before NotInitialized->Initialized",
                "after NotInitialized->Initialized",
                "before Initialized->Started",
                "after Initialized->Started",
            ]
        );
        let l: Arc<dyn LifecycleListener> = rec.clone();
        lc.remove_listener(&l);
        lc.stop();
        assert_eq!(rec.0.lock().len(), 4);
    }

    #[test]
    fn wait_for_state_timeout() {
        let lc = Lifecycle::new();
        assert!(!lc.wait_for_state(ComponentState::Running, Duration::from_millis(5)));
        assert!(lc.wait_for_state(ComponentState::NotInitialized, Duration::ZERO));
        assert!(lc.wait_for_state(ComponentState::NotInitialized, Duration::MAX));
    }

    #[test]
    fn conditional_transition_loses_to_stop() {
        let lc = Lifecycle::new();
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        lc.create().unwrap();
        lc.start().unwrap();
        lc.add_listener(rec.clone());
        lc.stop();
        assert!(!lc.change_state_if(ComponentState::Started, ComponentState::Running));
        assert_eq!(lc.state(), ComponentState::Stopping);
        assert!(lc.change_state_if(ComponentState::Stopping, ComponentState::Stopped));
        assert_eq!(
            *rec.0.lock(),
            vec![
                "before Started->Stopping",
                "after Started->Stopping",
                "before Stopping->Stopped",
                "after Stopping->Stopped",
            ]
        );
    }
}
