use std::sync::{Mutex, MutexGuard, PoisonError};

/// A generic state machine wrapper ensuring thread-safe state transitions.
///
/// The state lives behind a `Mutex`; [`StateMachine::transition`] runs a closure
/// with exclusive access so that check-then-set sequences are atomic.
///
/// # Example
///
/// ```rust
/// use xcbridge_common::state_machine::StateMachine;
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum State {
///     Starting,
///     Active,
/// }
///
/// let machine = StateMachine::new(State::Starting);
///
/// let moved = machine.transition(|state| match state {
///     State::Starting => {
///         *state = State::Active;
///         true
///     }
///     State::Active => false,
/// });
///
/// assert!(moved);
/// assert_eq!(machine.get(), State::Active);
/// ```
#[derive(Debug)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a new `StateMachine` in the given initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Access the underlying state directly.
    ///
    /// A panic in another holder does not leave the state unusable; the guard
    /// is recovered from the poisoned lock.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Perform an atomic transition on the state.
    ///
    /// The closure `f` is called with a mutable reference to the current state
    /// and the lock is held for the duration of the closure.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        f(&mut *state)
    }

    /// Unconditionally replace the state, returning the previous one.
    pub fn replace(&self, next: S) -> S {
        std::mem::replace(&mut *self.lock(), next)
    }
}

impl<S: Copy> StateMachine<S> {
    /// Copy out the current state.
    pub fn get(&self) -> S {
        *self.lock()
    }
}
