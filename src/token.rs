use std::fmt;
use std::sync::{Arc, Mutex};

use crate::wire::Session;
use crate::Error;

/// One delivered datagram, exclusively owned by the receiver. Dropping it
/// releases the buffer.
#[derive(Debug)]
pub struct ReceivedDatagram {
    pub session: Session,
    /// Arrival time, in milliseconds since the service was created.
    pub timestamp_ms: u64,
    pub payload: Box<[u8]>,
}

/// The outcome stored in a completed token.
#[derive(Debug)]
pub enum Completion {
    Transmit(Result<(), Error>),
    Receive(Result<ReceivedDatagram, Error>),
}

enum State {
    Idle,
    Pending,
    Complete(Completion),
}

/// A caller-allocated handle representing one outstanding transmit or
/// receive request.
///
/// Clones of a token are the same token; identity is the shared allocation,
/// so two handles backed by the same completion state match the same
/// outstanding request. A token may be submitted again once its completion
/// has been taken (or immediately after it completes).
pub struct Token {
    state: Arc<Mutex<State>>,
}

impl Token {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Idle)),
        }
    }

    /// Returns true while the token is submitted and not yet completed.
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Pending)
    }

    /// Returns true once the token has completed and the result has not been
    /// taken yet.
    pub fn is_complete(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Complete(_))
    }

    /// Takes the completion out of the token, resetting it for reuse.
    pub fn take_completion(&self) -> Option<Completion> {
        let mut state = self.state.lock().unwrap();

        if let State::Complete(_) = &*state {
            if let State::Complete(completion) = std::mem::replace(&mut *state, State::Idle) {
                return Some(completion);
            }
        }

        None
    }

    /// Marks the token submitted. Fails if it is already outstanding.
    pub(crate) fn submit(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if let State::Pending = &*state {
            return Err(Error::AccessDenied);
        }

        *state = State::Pending;

        Ok(())
    }

    /// Stores the completion and signals the token.
    pub(crate) fn complete(&self, completion: Completion) {
        *self.state.lock().unwrap() = State::Complete(completion);
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Token {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token").finish()
    }
}
