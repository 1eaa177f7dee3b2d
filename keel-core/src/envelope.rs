//! Envelope - the durable unit of message data.

use crate::{new_message_id, MessageId, QueueUri, Timestamp};
use serde::{Deserialize, Serialize};

/// Message type carried by placeholder envelopes.
pub const PING_MESSAGE_TYPE: &str = "keel-ping";

/// A message with identity, payload and optional timing metadata.
///
/// Whichever table currently holds the envelope owns it. The serialized form
/// of the whole envelope is stored in the `body` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub message_type: String,
    /// Application payload, opaque to the queue engine
    pub data: Vec<u8>,
    /// Expiry; rows past this instant are garbage
    pub keep_until: Option<Timestamp>,
    /// Execution time for delayed delivery
    pub scheduled_time: Option<Timestamp>,
    pub destination: Option<QueueUri>,
    pub attempts: i32,
}

impl Envelope {
    /// Create a new envelope with a fresh id.
    pub fn new(message_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: new_message_id(),
            message_type: message_type.into(),
            data,
            keep_until: None,
            scheduled_time: None,
            destination: None,
            attempts: 0,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_keep_until(mut self, keep_until: Timestamp) -> Self {
        self.keep_until = Some(keep_until);
        self
    }

    pub fn with_scheduled_time(mut self, time: Timestamp) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    pub fn with_destination(mut self, destination: QueueUri) -> Self {
        self.destination = Some(destination);
        self
    }

    /// True when delivery should wait for the scheduled table sweep.
    pub fn is_scheduled_for_later(&self, now: Timestamp) -> bool {
        self.scheduled_time.is_some_and(|time| time > now)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.keep_until.is_some_and(|keep_until| keep_until <= now)
    }

    /// Innocuous stand-in for a payload that could not be read.
    pub fn for_ping(destination: QueueUri) -> Self {
        Self::new(PING_MESSAGE_TYPE, Vec::new()).with_destination(destination)
    }

    pub fn is_ping(&self) -> bool {
        self.message_type == PING_MESSAGE_TYPE
    }
}
