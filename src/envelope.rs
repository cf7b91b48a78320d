use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Durable record of one message travelling through the outbox.
///
/// An `Envelope` is created by the [`Store`](crate::Store) when the
/// application dispatches a message, persisted by a storage backend and later
/// claimed by a [`Worker`](crate::Worker) which hands it to the provider
/// registered for its `driver_name`.
///
/// ## Lifecycle
///
/// ```text
/// PENDING ──claim──▶ IN_PROGRESS ──ack──▶ SUCCEEDED
///                        │   ▲
///                        │   └── stale claim re-offered
///                        └──dead-letter──▶ FAILED
/// ```
///
/// The core only ever builds `PENDING` envelopes; every later transition is
/// performed by the storage backend on behalf of a worker.
///
/// ## Example
///
/// ```rust
/// use pigeonhole::{Envelope, EnvelopeId, EnvelopeState, Payload};
///
/// let envelope = Envelope::pending(EnvelopeId::new(), "email", Payload::from("hi"));
/// assert_eq!(envelope.state, EnvelopeState::Pending);
/// assert_eq!(envelope.number_of_attempts, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, assigned when the message is buffered.
    pub id: EnvelopeId,
    /// Routing key selecting the provider.
    pub driver_name: String,
    /// Opaque serialized message content.
    pub payload: Payload,
    pub state: EnvelopeState,
    pub created_at: DateTime<Utc>,
    /// Set by the storage backend when a worker claims the envelope.
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub number_of_attempts: u32,
    /// Reason of the last failed dispatch attempt, if any.
    pub error: Option<String>,
}

impl Envelope {
    /// Build a fresh `PENDING` envelope stamped with the current time.
    pub fn pending(id: EnvelopeId, driver_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id,
            driver_name: driver_name.into(),
            payload,
            state: EnvelopeState::Pending,
            created_at: Utc::now(),
            locked_at: None,
            locked_by: None,
            last_attempted_at: None,
            number_of_attempts: 0,
            error: None,
        }
    }
}

/// Envelope identifier.
///
/// A time-ordered UUID (version 7). Ids generated in one process are strictly
/// increasing, and ids from different processes do not collide, so producers
/// never need to coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EnvelopeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<EnvelopeId> for Uuid {
    fn from(value: EnvelopeId) -> Self {
        value.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Processing state of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeState {
    /// Buffered or persisted, not claimed by any worker.
    Pending,
    /// Claimed by a worker, awaiting acknowledgement.
    InProgress,
    /// Handled and acknowledged. Terminal.
    Succeeded,
    /// Given up on by a dead-letter policy. Terminal.
    Failed,
}

impl EnvelopeState {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeState::Pending => "PENDING",
            EnvelopeState::InProgress => "IN_PROGRESS",
            EnvelopeState::Succeeded => "SUCCEEDED",
            EnvelopeState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EnvelopeState::Succeeded | EnvelopeState::Failed)
    }

    /// Whether `self → next` is a legal step of the envelope state machine.
    ///
    /// `IN_PROGRESS → IN_PROGRESS` is allowed so that a stale claim can be
    /// taken over by another worker.
    pub fn can_transition_to(self, next: EnvelopeState) -> bool {
        use EnvelopeState::*;

        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
        )
    }
}

impl fmt::Display for EnvelopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EnvelopeState::Pending),
            "IN_PROGRESS" => Ok(EnvelopeState::InProgress),
            "SUCCEEDED" => Ok(EnvelopeState::Succeeded),
            "FAILED" => Ok(EnvelopeState::Failed),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

/// Returned when parsing an unrecognised envelope state.
#[derive(Debug)]
pub struct UnknownState(String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown envelope state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

/// Opaque message content.
///
/// The outbox never looks inside a payload. [`Payload::json`] and
/// [`Payload::decode`] are conveniences for the common case where both the
/// application and the provider speak JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Serialize a message into a JSON payload.
    pub fn json<T: Serialize + ?Sized>(message: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(message).map(Self)
    }

    /// Deserialize a JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}
