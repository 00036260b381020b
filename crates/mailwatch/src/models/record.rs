//! Correlated records produced by the sync engine

use serde::Serialize;

use super::{Message, MessageId};

/// Correlation id minted once per inbound notification or poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchToken(pub u64);

impl std::fmt::Display for BatchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Result of resolving one history entry
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// The message was fetched and satisfied the filter
    Matched { message: Message },
    /// The message was fetched but the filter rejected it
    Filtered { message: Message },
    /// Fetching or decoding failed; siblings are unaffected
    Failed {
        message_id: Option<MessageId>,
        reason: String,
    },
}

/// One resolved history entry
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecord {
    /// History id of the change-stream entry this record came from
    pub history_id: u64,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

impl ProcessedRecord {
    pub fn matched(history_id: u64, message: Message) -> Self {
        Self {
            history_id,
            outcome: RecordOutcome::Matched { message },
        }
    }

    pub fn filtered(history_id: u64, message: Message) -> Self {
        Self {
            history_id,
            outcome: RecordOutcome::Filtered { message },
        }
    }

    pub fn failed(history_id: u64, message_id: Option<MessageId>, reason: impl Into<String>) -> Self {
        Self {
            history_id,
            outcome: RecordOutcome::Failed {
                message_id,
                reason: reason.into(),
            },
        }
    }

    /// Filtered and failed records are both excluded from the matched set
    pub fn is_filtered(&self) -> bool {
        !matches!(self.outcome, RecordOutcome::Matched { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RecordOutcome::Failed { .. })
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.outcome {
            RecordOutcome::Matched { message } | RecordOutcome::Filtered { message } => {
                Some(message)
            }
            RecordOutcome::Failed { .. } => None,
        }
    }

    /// Change-stream position of the entry that introduced the record
    ///
    /// The message's own history id is not used: later label changes can
    /// push it past the window, and advancing to it would skip messages
    /// added in between.
    pub fn watermark(&self) -> u64 {
        self.history_id
    }
}

/// A processed record tagged with the batch it was derived from
#[derive(Debug, Clone, Serialize)]
pub struct InboundRecord {
    pub batch_id: BatchToken,
    #[serde(flatten)]
    pub record: ProcessedRecord,
}

/// All records derived from one notification or one poll cycle, in
/// ascending history-id order
#[derive(Debug, Clone, Serialize)]
pub struct RecordBatch {
    pub token: BatchToken,
    pub records: Vec<InboundRecord>,
}

impl RecordBatch {
    pub fn new(token: BatchToken, records: impl IntoIterator<Item = ProcessedRecord>) -> Self {
        Self {
            token,
            records: records
                .into_iter()
                .map(|record| InboundRecord {
                    batch_id: token,
                    record,
                })
                .collect(),
        }
    }

    pub fn empty(token: BatchToken) -> Self {
        Self {
            token,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Messages that passed the filter
    pub fn matched(&self) -> impl Iterator<Item = &Message> {
        self.records
            .iter()
            .filter(|r| !r.record.is_filtered())
            .filter_map(|r| r.record.message())
    }

    pub fn errors(&self) -> impl Iterator<Item = &InboundRecord> {
        self.records.iter().filter(|r| r.record.is_error())
    }

    /// Highest record watermark in the batch
    pub fn max_watermark(&self) -> Option<u64> {
        self.records.iter().map(|r| r.record.watermark()).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_tags_every_record() {
        let records = vec![
            ProcessedRecord::matched(120, Message::builder("a").history_id(121).build()),
            ProcessedRecord::filtered(145, Message::builder("b").history_id(145).build()),
            ProcessedRecord::failed(150, Some(MessageId::new("c")), "boom"),
        ];
        let batch = RecordBatch::new(BatchToken(7), records);

        assert!(batch.records.iter().all(|r| r.batch_id == BatchToken(7)));
        assert_eq!(batch.matched().count(), 1);
        assert_eq!(batch.errors().count(), 1);
        assert_eq!(batch.max_watermark(), Some(150));
    }

    #[test]
    fn test_record_serializes_with_status_tag() {
        let record = ProcessedRecord::failed(3, None, "bad payload");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["history_id"], 3);
        assert_eq!(json["reason"], "bad payload");
    }
}
