//! Message history
//!
//! Conversation history is owned by the host application. The session coordinator
//! only appends to it through [`MessageLog`]; `MemoryMessageLog` is the in-process
//! implementation used by tests and simple hosts.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::LogError;
use crate::types::{Direction, Timestamp};

/// One delivered or sent message as the history stores it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub text: String,
    pub timestamp: Timestamp,
    pub direction: Direction,
}

impl MessageRecord {
    pub fn new(text: impl Into<String>, timestamp: Timestamp, direction: Direction) -> Self {
        Self {
            text: text.into(),
            timestamp,
            direction,
        }
    }

    pub fn outbound(text: impl Into<String>) -> Self {
        Self::new(text, Timestamp::now(), Direction::Outbound)
    }

    pub fn inbound(text: impl Into<String>) -> Self {
        Self::new(text, Timestamp::now(), Direction::Inbound)
    }
}

/// Append-only message history
pub trait MessageLog: Send + Sync {
    /// Persist one record
    fn append(&self, record: MessageRecord) -> Result<(), LogError>;

    /// All records in timestamp order; records with equal timestamps keep insertion order
    fn list_all(&self) -> Result<Vec<MessageRecord>, LogError>;
}

/// In-memory message log
#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    records: RwLock<Vec<MessageRecord>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageLog for MemoryMessageLog {
    fn append(&self, record: MessageRecord) -> Result<(), LogError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| LogError::WriteFailed("message log lock poisoned".to_string()))?;
        records.push(record);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<MessageRecord>, LogError> {
        let records = self
            .records
            .read()
            .map_err(|_| LogError::Unavailable("message log lock poisoned".to_string()))?;
        let mut sorted = records.clone();
        // Stable sort keeps insertion order for equal timestamps
        sorted.sort_by_key(|record| record.timestamp);
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_all_orders_by_timestamp() {
        let log = MemoryMessageLog::new();
        assert!(log.is_empty());

        log.append(MessageRecord::new("late", Timestamp::new(30), Direction::Inbound))
            .unwrap();
        log.append(MessageRecord::new("first", Timestamp::new(10), Direction::Outbound))
            .unwrap();
        log.append(MessageRecord::new("second", Timestamp::new(10), Direction::Inbound))
            .unwrap();

        let texts: Vec<_> = log
            .list_all()
            .unwrap()
            .into_iter()
            .map(|record| record.text)
            .collect();
        assert_eq!(texts, vec!["first", "second", "late"]);
        assert_eq!(log.len(), 3);
    }
}
