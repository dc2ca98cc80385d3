//! Per-replica operation records and the master-record merge.
//!
//! Replicas add inconsistent operations to their record as TENTATIVE and mark
//! them FINALIZED once they execute. Consensus operations are TENTATIVE with
//! the result of local execution, then FINALIZED once the coordinator's
//! decided result arrives. During a view change the leader merges the records
//! it collects into a master record that replicas synchronize from.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ir::types::Operation;

/// Lifecycle phase of a record entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPhase {
    #[serde(rename = "TENTATIVE")]
    Tentative,
    #[serde(rename = "FINALIZED")]
    Finalized,
}

/// Outcome of executing an operation at one replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(rename = "readValues", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read_values: BTreeMap<String, String>,
}

/// One record entry, keyed by transaction id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub op: Operation,
    pub phase: RecordPhase,
    #[serde(rename = "localResult", default, skip_serializing_if = "Option::is_none")]
    pub local_result: Option<OpResult>,
    #[serde(
        rename = "consensusResult",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub consensus_result: Option<OpResult>,
}

impl RecordEntry {
    pub fn tentative(op: Operation, local_result: Option<OpResult>) -> Self {
        Self {
            op,
            phase: RecordPhase::Tentative,
            local_result,
            consensus_result: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == RecordPhase::Finalized
    }

    /// The result that should win when this entry is replicated: the
    /// consensus result if one was decided, the local result otherwise.
    pub fn effective_result(&self) -> Option<&OpResult> {
        self.consensus_result.as_ref().or(self.local_result.as_ref())
    }
}

/// A replica's record: every operation it has seen, by transaction id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    entries: BTreeMap<String, RecordEntry>,
}

impl Record {
    pub fn from_entries(entries: BTreeMap<String, RecordEntry>) -> Self {
        Self { entries }
    }

    pub fn into_entries(self) -> BTreeMap<String, RecordEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, transaction_id: &str) -> Option<&RecordEntry> {
        self.entries.get(transaction_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RecordEntry)> {
        self.entries.iter()
    }

    /// Add a TENTATIVE entry for `transaction_id`. Re-proposals of an entry
    /// that already finalized are ignored.
    pub fn add_tentative(
        &mut self,
        transaction_id: &str,
        op: Operation,
        local_result: Option<OpResult>,
    ) {
        match self.entries.entry(transaction_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(RecordEntry::tentative(op, local_result));
            }
            Entry::Occupied(mut slot) => {
                if !slot.get().is_finalized() {
                    slot.insert(RecordEntry::tentative(op, local_result));
                }
            }
        }
    }

    /// Flip an entry to FINALIZED. A finalize without a preceding tentative
    /// entry is a protocol error and is reported to the caller.
    pub fn finalize(
        &mut self,
        transaction_id: &str,
        consensus_result: Option<OpResult>,
    ) -> Result<(), UnknownTransaction> {
        let entry = self
            .entries
            .get_mut(transaction_id)
            .ok_or_else(|| UnknownTransaction(transaction_id.to_string()))?;
        entry.phase = RecordPhase::Finalized;
        if consensus_result.is_some() {
            entry.consensus_result = consensus_result;
        }
        Ok(())
    }

    /// Merge records collected during a view change into a master record.
    ///
    /// Entry union by transaction id; a FINALIZED copy always wins over a
    /// TENTATIVE one, and the first finalized consensus result encountered is
    /// kept (records iterate in the order supplied, the leader's own first).
    pub fn merge(records: impl IntoIterator<Item = Record>) -> Record {
        let mut master: BTreeMap<String, RecordEntry> = BTreeMap::new();
        for record in records {
            for (txn_id, entry) in record.entries {
                match master.entry(txn_id) {
                    Entry::Vacant(slot) => {
                        slot.insert(entry);
                    }
                    Entry::Occupied(mut slot) => {
                        if entry.is_finalized() && !slot.get().is_finalized() {
                            slot.insert(entry);
                        }
                    }
                }
            }
        }
        Record { entries: master }
    }
}

/// Finalize was requested for a transaction this record never saw.
#[derive(Debug, thiserror::Error)]
#[error("no tentative record entry for transaction {0}")]
pub struct UnknownTransaction(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::CasWrite;

    fn write_op(key: &str, value: &str) -> Operation {
        Operation {
            read_set: Vec::new(),
            write_set: BTreeMap::from([(key.to_string(), value.to_string())]),
            write_cset: BTreeMap::new(),
        }
    }

    #[test]
    fn finalize_requires_a_tentative_entry() {
        let mut record = Record::default();
        assert!(record.finalize("txn-1", None).is_err());

        record.add_tentative("txn-1", write_op("a", "1"), None);
        assert_eq!(record.get("txn-1").unwrap().phase, RecordPhase::Tentative);

        record.finalize("txn-1", None).unwrap();
        assert!(record.get("txn-1").unwrap().is_finalized());
    }

    #[test]
    fn reproposal_does_not_demote_a_finalized_entry() {
        let mut record = Record::default();
        record.add_tentative("txn-1", write_op("a", "1"), None);
        record.finalize("txn-1", None).unwrap();

        record.add_tentative("txn-1", write_op("a", "other"), None);
        let entry = record.get("txn-1").unwrap();
        assert!(entry.is_finalized());
        assert_eq!(entry.op.write_set["a"], "1");
    }

    #[test]
    fn merge_prefers_finalized_entries() {
        let mut tentative = Record::default();
        tentative.add_tentative("txn-1", write_op("a", "1"), None);

        let mut finalized = Record::default();
        finalized.add_tentative(
            "txn-1",
            write_op("a", "1"),
            Some(OpResult {
                success: true,
                read_values: BTreeMap::new(),
            }),
        );
        finalized.finalize("txn-1", None).unwrap();
        finalized.add_tentative("txn-2", write_op("b", "2"), None);

        let master = Record::merge([tentative, finalized]);
        assert_eq!(master.len(), 2);
        assert!(master.get("txn-1").unwrap().is_finalized());
        assert!(!master.get("txn-2").unwrap().is_finalized());
    }

    #[test]
    fn effective_result_prefers_consensus() {
        let mut entry = RecordEntry::tentative(
            write_op("a", "1"),
            Some(OpResult {
                success: false,
                read_values: BTreeMap::new(),
            }),
        );
        assert!(!entry.effective_result().unwrap().success);

        entry.consensus_result = Some(OpResult {
            success: true,
            read_values: BTreeMap::new(),
        });
        assert!(entry.effective_result().unwrap().success);
    }

    #[test]
    fn record_entries_round_trip_as_json() {
        let op = Operation {
            read_set: vec!["a".into()],
            write_set: BTreeMap::new(),
            write_cset: BTreeMap::from([(
                "a".to_string(),
                CasWrite {
                    previous: String::new(),
                    proposed: "x".into(),
                },
            )]),
        };
        let entry = RecordEntry {
            op,
            phase: RecordPhase::Finalized,
            local_result: Some(OpResult {
                success: true,
                read_values: BTreeMap::from([("a".to_string(), String::new())]),
            }),
            consensus_result: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"FINALIZED\""));
        let back: RecordEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
