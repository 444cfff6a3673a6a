//! Announcements produced by the lifecycle engine.

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};

use crate::{EventEntry, JobId, JobState};

/// One state transition: `[job_id, "STATE", timestamp]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StateTransition(pub JobId, pub JobState, pub f64);

impl StateTransition {
    pub fn job_id(&self) -> JobId {
        self.0
    }

    pub fn state(&self) -> JobState {
        self.1
    }

    pub fn timestamp(&self) -> f64 {
        self.2
    }
}

impl Serialize for StateTransition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.0)?;
        tuple.serialize_element(self.1.as_str())?;
        tuple.serialize_element(&self.2)?;
        tuple.end()
    }
}

/// Payload published once per committed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionBatch {
    pub transitions: Vec<StateTransition>,
}

impl TransitionBatch {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }
}

/// An entry handed to live journal consumers before it is sequenced.
///
/// `seq` is `None` for entries that never get a durable sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub job_id: JobId,
    pub seq: Option<u64>,
    pub name: String,
    pub entry: EventEntry,
}

impl JournalEntry {
    /// Short description for logging.
    pub fn description(&self) -> String {
        match self.seq {
            Some(seq) => format!("Job {} event {} (seq {})", self.job_id, self.name, seq),
            None => format!("Job {} event {} (unsequenced)", self.job_id, self.name),
        }
    }
}
