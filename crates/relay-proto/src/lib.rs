//! relay-proto - wire protocol types for the relay gateway IPC broker
//!
//! This crate defines the length-prefixed [`frame::Frame`] the broker and
//! backends exchange over TCP, plus the [`envelope::Envelope`]/
//! [`envelope::DispatchError`] types that carry a call between the HTTP
//! front-door and the dispatcher. It has no knowledge of sockets, the
//! registry, or pending-request bookkeeping — those live in `relay-broker`.

pub mod envelope;
pub mod frame;

pub use envelope::{DispatchError, Envelope, EnvelopeResponse};
pub use frame::{Frame, FrameError, FrameType, MAX_FIELD_LEN, MAX_FRAME_SIZE};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The JSON body of a REGISTER frame's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPayload {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
