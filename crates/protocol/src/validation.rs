//! Data channel validation challenge/response state machine.
//!
//! After the data channel opens, the device sends a validation message with a
//! challenge string. The client answers with
//! `base64(md5("UnitreeGo2_" + challenge))` and the device confirms with
//! [`VALIDATION_OK`]. Anything else arriving on the validation type is treated
//! as a fresh challenge; the device decides whether the answer is correct.

use serde_json::Value;

use crate::crypto::validation_response;
use crate::messages::{ChannelMessage, VALIDATION_OK};

/// Progress of the validation exchange.
///
/// Transitions only move forward: `Pending < Challenged < Validated`, and
/// `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationState {
    /// No challenge received yet.
    Pending,
    /// A challenge was answered; waiting for confirmation.
    Challenged,
    /// The device accepted the response.
    Validated,
    /// The exchange could not be completed (e.g. the channel closed mid-way).
    Failed,
}

impl ValidationState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_advance_to(self, next: ValidationState) -> bool {
        match self {
            ValidationState::Failed | ValidationState::Validated => false,
            _ => next > self,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ValidationState::Validated | ValidationState::Failed)
    }
}

/// What the engine must do after an inbound validation message.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationStep {
    /// Send this response; state becomes `Challenged`.
    Respond(ChannelMessage),
    /// The device confirmed; state becomes `Validated`.
    Validated,
}

/// Classifies an inbound validation payload.
///
/// String payloads equal to the success literal confirm; any other payload is
/// answered as a challenge (non-string data is hashed as its JSON text).
pub fn next_step(data: &Value) -> ValidationStep {
    match data {
        Value::String(text) if text == VALIDATION_OK => ValidationStep::Validated,
        Value::String(challenge) => respond_to(challenge),
        other => respond_to(&other.to_string()),
    }
}

fn respond_to(challenge: &str) -> ValidationStep {
    ValidationStep::Respond(ChannelMessage::validation(validation_response(challenge)))
}

/// Owns the validation state and enforces forward-only transitions.
#[derive(Debug)]
pub struct ValidationMachine {
    state: ValidationState,
}

impl Default for ValidationMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationMachine {
    /// Creates a machine in `Pending`.
    pub fn new() -> Self {
        Self {
            state: ValidationState::Pending,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ValidationState {
        self.state
    }

    /// Moves to `next` if that is a forward transition.
    ///
    /// Returns whether the state changed.
    pub fn advance(&mut self, next: ValidationState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Handles an inbound validation payload.
    ///
    /// Returns the response to send, if any. Challenges keep being answered
    /// in any non-terminal state without the state regressing.
    pub fn on_message(&mut self, data: &Value) -> Option<ChannelMessage> {
        if self.state.is_terminal() {
            return None;
        }
        match next_step(data) {
            ValidationStep::Validated => {
                self.advance(ValidationState::Validated);
                None
            }
            ValidationStep::Respond(response) => {
                self.advance(ValidationState::Challenged);
                Some(response)
            }
        }
    }
}
