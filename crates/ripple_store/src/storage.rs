//! Transactional bucket store backed by a fjall keyspace.
//!
//! Three partitions are reserved: client data, the system record (tentative
//! and finalized operations), and the master record written during view
//! changes. Client transactions track their read and write sets in memory;
//! writes are applied as one atomic engine batch at commit.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use uuid::Uuid;

use ripple_ir::record::{Record, RecordEntry};
use ripple_ir::types::ViewId;

/// Bucket holding client key/value data.
pub const DATA_BUCKET: &str = "client_data";
/// Bucket holding per-transaction record entries.
pub const SYSTEM_BUCKET: &str = "system_record";
/// Bucket holding the authoritative merged record for the current view.
pub const MASTER_BUCKET: &str = "master_record";

const MASTER_RECORD_KEY: &str = "record";
const MASTER_VIEW_KEY: &str = "view";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("client {client_id} has no active transaction {transaction_id}")]
    UnknownTx {
        client_id: String,
        transaction_id: String,
    },
    #[error("bucket {name} is unavailable")]
    BucketMissing {
        name: &'static str,
        #[source]
        source: fjall::Error,
    },
    #[error("storage engine error: {0}")]
    Engine(#[from] fjall::Error),
    #[error("stored record entry is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Handle identifying one client transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxRef {
    pub client_id: String,
    pub transaction_id: String,
}

struct ClientTx {
    read_set: Vec<String>,
    write_set: BTreeMap<String, String>,
}

/// Durable store plus the in-memory transaction table. All transaction
/// operations are serialized by one facade-wide mutex.
pub struct BucketStore {
    keyspace: Keyspace,
    data: PartitionHandle,
    system: PartitionHandle,
    master: PartitionHandle,
    txs: Mutex<HashMap<TxRef, ClientTx>>,
}

impl BucketStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let keyspace = fjall::Config::new(path).open()?;
        let data = open_bucket(&keyspace, DATA_BUCKET)?;
        let system = open_bucket(&keyspace, SYSTEM_BUCKET)?;
        let master = open_bucket(&keyspace, MASTER_BUCKET)?;
        Ok(Self {
            keyspace,
            data,
            system,
            master,
            txs: Mutex::new(HashMap::new()),
        })
    }

    /// Start a transaction for `client_id` and return its handle.
    pub fn begin(&self, client_id: &str) -> TxRef {
        let tx_ref = TxRef {
            client_id: client_id.to_string(),
            transaction_id: Uuid::new_v4().to_string(),
        };
        self.txs.lock().unwrap().insert(
            tx_ref.clone(),
            ClientTx {
                read_set: Vec::new(),
                write_set: BTreeMap::new(),
            },
        );
        tx_ref
    }

    /// Read `key` inside a transaction, appending it to the read set. A key
    /// written earlier in the same transaction reads its buffered value; a
    /// key absent from the store reads as the empty string.
    pub fn get(&self, tx_ref: &TxRef, key: &str) -> Result<String, StorageError> {
        let mut txs = self.txs.lock().unwrap();
        let tx = txs.get_mut(tx_ref).ok_or_else(|| unknown_tx(tx_ref))?;
        tx.read_set.push(key.to_string());
        if let Some(buffered) = tx.write_set.get(key) {
            return Ok(buffered.clone());
        }
        read_value(&self.data, key)
    }

    /// Record `key -> value` in the transaction's write set.
    pub fn put(&self, tx_ref: &TxRef, key: &str, value: &str) -> Result<(), StorageError> {
        let mut txs = self.txs.lock().unwrap();
        let tx = txs.get_mut(tx_ref).ok_or_else(|| unknown_tx(tx_ref))?;
        tx.write_set.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Apply the transaction's writes as one atomic batch and drop the
    /// in-memory tracking.
    pub fn commit(&self, tx_ref: &TxRef) -> Result<(), StorageError> {
        let tx = self
            .txs
            .lock()
            .unwrap()
            .remove(tx_ref)
            .ok_or_else(|| unknown_tx(tx_ref))?;
        if tx.write_set.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for (key, value) in &tx.write_set {
            batch.insert(&self.data, key.as_bytes(), value.as_bytes());
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Discard the transaction without touching the engine.
    pub fn rollback(&self, tx_ref: &TxRef) -> Result<(), StorageError> {
        self.txs
            .lock()
            .unwrap()
            .remove(tx_ref)
            .map(|_| ())
            .ok_or_else(|| unknown_tx(tx_ref))
    }

    /// Read the committed value of `key` outside any transaction.
    pub fn read_committed(&self, key: &str) -> Result<String, StorageError> {
        read_value(&self.data, key)
    }

    /// Apply writes directly to the data bucket, bypassing transaction
    /// tracking. Used when synchronizing from a master record.
    pub fn apply_writes<'a>(
        &self,
        writes: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<(), StorageError> {
        let mut batch = self.keyspace.batch();
        let mut queued = false;
        for (key, value) in writes {
            batch.insert(&self.data, key.as_bytes(), value.as_bytes());
            queued = true;
        }
        if queued {
            batch.commit()?;
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    /// Persist one record entry in the system bucket, keyed by transaction.
    pub fn save_record_entry(
        &self,
        transaction_id: &str,
        entry: &RecordEntry,
    ) -> Result<(), StorageError> {
        let body = serde_json::to_vec(entry)?;
        self.system.insert(transaction_id.as_bytes(), body)?;
        Ok(())
    }

    /// Load a single record entry by transaction id.
    pub fn load_record_entry(
        &self,
        transaction_id: &str,
    ) -> Result<Option<RecordEntry>, StorageError> {
        match self.system.get(transaction_id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load the replica's full record from the system bucket.
    pub fn load_record(&self) -> Result<Record, StorageError> {
        let mut entries = BTreeMap::new();
        for item in self.system.iter() {
            let (key, value) = item?;
            let txn_id = String::from_utf8_lossy(&key).into_owned();
            let entry: RecordEntry = serde_json::from_slice(&value)?;
            entries.insert(txn_id, entry);
        }
        Ok(Record::from_entries(entries))
    }

    /// Replace the system bucket's contents with `record`.
    pub fn replace_record(&self, record: &Record) -> Result<(), StorageError> {
        let mut batch = self.keyspace.batch();
        for item in self.system.iter() {
            let (key, _) = item?;
            batch.remove(&self.system, key);
        }
        for (txn_id, entry) in record.iter() {
            batch.insert(&self.system, txn_id.as_bytes(), serde_json::to_vec(entry)?);
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Store the authoritative master record for `view_id`.
    pub fn save_master_record(&self, view_id: ViewId, record: &Record) -> Result<(), StorageError> {
        let mut batch = self.keyspace.batch();
        batch.insert(
            &self.master,
            MASTER_RECORD_KEY.as_bytes(),
            serde_json::to_vec(record)?,
        );
        batch.insert(
            &self.master,
            MASTER_VIEW_KEY.as_bytes(),
            view_id.to_be_bytes().to_vec(),
        );
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Load the stored master record, if any view change ever completed.
    pub fn load_master_record(&self) -> Result<Option<(ViewId, Record)>, StorageError> {
        let Some(raw_view) = self.master.get(MASTER_VIEW_KEY.as_bytes())? else {
            return Ok(None);
        };
        let mut view_bytes = [0u8; 8];
        if raw_view.len() != 8 {
            return Ok(None);
        }
        view_bytes.copy_from_slice(&raw_view);
        let view_id = ViewId::from_be_bytes(view_bytes);

        let Some(raw_record) = self.master.get(MASTER_RECORD_KEY.as_bytes())? else {
            return Ok(None);
        };
        let record: Record = serde_json::from_slice(&raw_record)?;
        Ok(Some((view_id, record)))
    }
}

fn open_bucket(keyspace: &Keyspace, name: &'static str) -> Result<PartitionHandle, StorageError> {
    keyspace
        .open_partition(name, PartitionCreateOptions::default())
        .map_err(|source| StorageError::BucketMissing { name, source })
}

fn read_value(partition: &PartitionHandle, key: &str) -> Result<String, StorageError> {
    match partition.get(key.as_bytes())? {
        Some(slice) => Ok(String::from_utf8_lossy(&slice).into_owned()),
        None => Ok(String::new()),
    }
}

fn unknown_tx(tx_ref: &TxRef) -> StorageError {
    StorageError::UnknownTx {
        client_id: tx_ref.client_id.clone(),
        transaction_id: tx_ref.transaction_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_ir::record::{OpResult, RecordPhase};
    use ripple_ir::types::Operation;

    fn open_store() -> (tempfile::TempDir, BucketStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn committed_writes_are_visible_to_later_transactions() {
        let (_dir, store) = open_store();

        let tx = store.begin("client-1");
        store.put(&tx, "a", "1").unwrap();
        store.commit(&tx).unwrap();

        let tx = store.begin("client-1");
        assert_eq!(store.get(&tx, "a").unwrap(), "1");
        store.rollback(&tx).unwrap();
    }

    #[test]
    fn transactions_read_their_own_buffered_writes() {
        let (_dir, store) = open_store();

        let tx = store.begin("client-1");
        assert_eq!(store.get(&tx, "a").unwrap(), "");
        store.put(&tx, "a", "1").unwrap();
        assert_eq!(store.get(&tx, "a").unwrap(), "1");
        // Nothing is durable until commit.
        assert_eq!(store.read_committed("a").unwrap(), "");
        store.commit(&tx).unwrap();
        assert_eq!(store.read_committed("a").unwrap(), "1");
    }

    #[test]
    fn rolled_back_writes_never_reach_the_engine() {
        let (_dir, store) = open_store();

        let tx = store.begin("client-1");
        store.put(&tx, "a", "1").unwrap();
        store.rollback(&tx).unwrap();
        assert_eq!(store.read_committed("a").unwrap(), "");
    }

    #[test]
    fn operations_on_a_finished_transaction_fail_typed() {
        let (_dir, store) = open_store();

        let tx = store.begin("client-1");
        store.commit(&tx).unwrap();
        match store.get(&tx, "a") {
            Err(StorageError::UnknownTx { client_id, .. }) => {
                assert_eq!(client_id, "client-1");
            }
            other => panic!("expected UnknownTx, got {other:?}"),
        }
        assert!(matches!(
            store.commit(&tx),
            Err(StorageError::UnknownTx { .. })
        ));
    }

    #[test]
    fn record_entries_survive_a_store_round_trip() {
        let (_dir, store) = open_store();

        let entry = RecordEntry {
            op: Operation {
                read_set: vec!["a".into()],
                write_set: BTreeMap::from([("b".to_string(), "2".to_string())]),
                write_cset: BTreeMap::new(),
            },
            phase: RecordPhase::Tentative,
            local_result: Some(OpResult {
                success: true,
                read_values: BTreeMap::from([("a".to_string(), String::new())]),
            }),
            consensus_result: None,
        };
        store.save_record_entry("txn-1", &entry).unwrap();

        let record = store.load_record().unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("txn-1").unwrap(), &entry);
    }

    #[test]
    fn master_record_round_trips_with_its_view() {
        let (_dir, store) = open_store();
        assert!(store.load_master_record().unwrap().is_none());

        let mut record = Record::default();
        record.add_tentative("txn-1", Operation::default(), None);
        record.finalize("txn-1", None).unwrap();
        store.save_master_record(7, &record).unwrap();

        let (view_id, loaded) = store.load_master_record().unwrap().unwrap();
        assert_eq!(view_id, 7);
        assert_eq!(loaded, record);
    }

    #[test]
    fn replace_record_swaps_the_system_bucket() {
        let (_dir, store) = open_store();
        store
            .save_record_entry("stale", &RecordEntry::tentative(Operation::default(), None))
            .unwrap();

        let mut master = Record::default();
        master.add_tentative("fresh", Operation::default(), None);
        store.replace_record(&master).unwrap();

        let record = store.load_record().unwrap();
        assert!(record.get("stale").is_none());
        assert!(record.get("fresh").is_some());
    }
}
