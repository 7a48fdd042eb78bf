//! SQLite persistence for the synchronized state.
//!
//! All reads go through [`StoreReader`], implemented by both the store
//! itself and the transactional writer, so handler code and the
//! user-state read model share one query surface. All writes during event
//! processing go through [`StoreTx`], handed out by
//! [`SyncStore::transaction`]; a handler error rolls the whole event back.

pub mod models;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use unirep_common::Field;

use crate::chain::LogPosition;
use crate::error::SynchronizerError;
use models::{
    AttestationRecord, CursorRecord, EpochRecord, GstLeafRecord, NullifierRecord, ProofEventKind,
    ProofRecord, UserSignUpRecord,
};

/// Monotonic schema version; bumped on any breaking schema change.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS epochs (
        number INTEGER PRIMARY KEY,
        sealed INTEGER NOT NULL DEFAULT 0,
        epoch_root TEXT
    );

    CREATE TABLE IF NOT EXISTS gst_leaves (
        epoch INTEGER NOT NULL,
        leaf_index INTEGER NOT NULL,
        hash TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        PRIMARY KEY (epoch, leaf_index)
    );
    CREATE INDEX IF NOT EXISTS idx_gst_leaves_hash ON gst_leaves(epoch, hash);

    CREATE TABLE IF NOT EXISTS gst_roots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        epoch INTEGER NOT NULL,
        root TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_gst_roots_lookup ON gst_roots(epoch, root);

    CREATE TABLE IF NOT EXISTS epoch_keys (
        epoch INTEGER NOT NULL,
        key TEXT NOT NULL,
        PRIMARY KEY (epoch, key)
    );

    CREATE TABLE IF NOT EXISTS attestations (
        event_index INTEGER PRIMARY KEY,
        epoch INTEGER NOT NULL,
        epoch_key TEXT NOT NULL,
        attester TEXT NOT NULL,
        proof_index INTEGER NOT NULL,
        attester_id TEXT NOT NULL,
        pos_rep TEXT NOT NULL,
        neg_rep TEXT NOT NULL,
        graffiti TEXT NOT NULL,
        sign_up TEXT NOT NULL,
        hash TEXT NOT NULL,
        valid INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_attestations_key
        ON attestations(epoch, epoch_key, event_index);

    CREATE TABLE IF NOT EXISTS nullifiers (
        nullifier TEXT PRIMARY KEY,
        epoch INTEGER NOT NULL,
        confirmed INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS proofs (
        proof_index INTEGER PRIMARY KEY,
        event TEXT NOT NULL,
        epoch INTEGER,
        public_signals TEXT NOT NULL,
        proof TEXT NOT NULL,
        valid INTEGER,
        spent INTEGER NOT NULL DEFAULT 0,
        global_state_tree TEXT,
        blinded_user_state TEXT,
        blinded_hash_chain TEXT,
        output_blinded_user_state TEXT,
        output_blinded_hash_chain TEXT,
        input_blinded_user_state TEXT,
        proof_index_records TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS user_signups (
        epoch INTEGER NOT NULL,
        commitment TEXT NOT NULL,
        attester_id TEXT NOT NULL,
        airdrop TEXT NOT NULL,
        leaf_index INTEGER NOT NULL,
        PRIMARY KEY (epoch, commitment)
    );
    CREATE INDEX IF NOT EXISTS idx_user_signups_commitment
        ON user_signups(commitment);

    CREATE TABLE IF NOT EXISTS sync_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        latest_processed_block INTEGER NOT NULL DEFAULT 0,
        latest_processed_transaction_index INTEGER NOT NULL DEFAULT 0,
        latest_processed_event_index INTEGER NOT NULL DEFAULT 0,
        latest_complete_block INTEGER NOT NULL DEFAULT 0
    );
    INSERT OR IGNORE INTO sync_state (id) VALUES (1);

    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
"#;

/// Durable store for the synchronized state.
pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, SynchronizerError> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self { conn };
        store.init_schema()?;
        info!("opened synchronizer store at {:?}", path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, SynchronizerError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), SynchronizerError> {
        self.conn.execute_batch(SCHEMA)?;
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version {
            None => {
                self.conn.execute(
                    "INSERT INTO schema_meta (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(SynchronizerError::Config(format!(
                    "store schema version {v} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Run `f` against a batched writer; commits atomically, rolls back on
    /// any error. This is the only path that mutates persistent state
    /// during event processing.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&StoreTx<'_>) -> Result<T, SynchronizerError>,
    ) -> Result<T, SynchronizerError> {
        let tx = self.conn.transaction()?;
        let writer = StoreTx { tx };
        match f(&writer) {
            Ok(value) => {
                writer.tx.commit()?;
                Ok(value)
            }
            // Dropping the transaction rolls it back.
            Err(err) => Err(err),
        }
    }

    /// Drop every synchronized row, returning the store to genesis. Used
    /// when the persisted cursor no longer resolves to a chain log.
    pub fn reset(&mut self) -> Result<(), SynchronizerError> {
        self.conn.execute_batch(
            r#"
            DELETE FROM epochs;
            DELETE FROM gst_leaves;
            DELETE FROM gst_roots;
            DELETE FROM epoch_keys;
            DELETE FROM attestations;
            DELETE FROM nullifiers;
            DELETE FROM proofs;
            DELETE FROM user_signups;
            UPDATE sync_state SET
                latest_processed_block = 0,
                latest_processed_transaction_index = 0,
                latest_processed_event_index = 0,
                latest_complete_block = 0
            WHERE id = 1;
            "#,
        )?;
        info!("store reset to genesis");
        Ok(())
    }
}

impl StoreReader for SyncStore {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// The transactional writer handed to handlers. Derefs every read through
/// the same query surface as the store.
pub struct StoreTx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl StoreReader for StoreTx<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl StoreTx<'_> {
    /// Create the epoch row if it does not exist yet (unsealed).
    pub fn ensure_epoch(&self, number: u64) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO epochs (number, sealed) VALUES (?, 0)",
            params![number as i64],
        )?;
        Ok(())
    }

    /// Seal an epoch with its final epoch-tree root.
    pub fn seal_epoch(&self, number: u64, root: &Field) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "UPDATE epochs SET sealed = 1, epoch_root = ? WHERE number = ?",
            params![root.to_decimal(), number as i64],
        )?;
        debug!(epoch = number, "sealed epoch");
        Ok(())
    }

    pub fn insert_gst_leaf(&self, leaf: &GstLeafRecord) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "INSERT INTO gst_leaves (epoch, leaf_index, hash, tx_hash) VALUES (?, ?, ?, ?)",
            params![
                leaf.epoch as i64,
                leaf.index as i64,
                leaf.hash.to_decimal(),
                leaf.tx_hash
            ],
        )?;
        debug!(epoch = leaf.epoch, index = leaf.index, "inserted GST leaf");
        Ok(())
    }

    pub fn insert_gst_root(&self, epoch: u64, root: &Field) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "INSERT INTO gst_roots (epoch, root) VALUES (?, ?)",
            params![epoch as i64, root.to_decimal()],
        )?;
        Ok(())
    }

    pub fn upsert_epoch_key(&self, epoch: u64, key: &Field) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO epoch_keys (epoch, key) VALUES (?, ?)",
            params![epoch as i64, key.to_decimal()],
        )?;
        Ok(())
    }

    pub fn insert_attestation(&self, att: &AttestationRecord) -> Result<(), SynchronizerError> {
        self.conn().execute(
            r#"
            INSERT INTO attestations
                (event_index, epoch, epoch_key, attester, proof_index, attester_id,
                 pos_rep, neg_rep, graffiti, sign_up, hash, valid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                att.event_index as i64,
                att.epoch as i64,
                att.epoch_key.to_decimal(),
                att.attester,
                att.proof_index as i64,
                att.attester_id.to_decimal(),
                att.pos_rep.to_decimal(),
                att.neg_rep.to_decimal(),
                att.graffiti.to_decimal(),
                att.sign_up.to_decimal(),
                att.hash.to_decimal(),
                att.valid.map(i64::from)
            ],
        )?;
        Ok(())
    }

    pub fn set_attestation_valid(
        &self,
        event_index: u64,
        valid: bool,
    ) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "UPDATE attestations SET valid = ? WHERE event_index = ?",
            params![valid as i64, event_index as i64],
        )?;
        Ok(())
    }

    /// Record a nullifier, overwriting any previous (necessarily
    /// unconfirmed) row for the same value.
    pub fn put_nullifier(
        &self,
        epoch: u64,
        nullifier: &Field,
        confirmed: bool,
    ) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO nullifiers (nullifier, epoch, confirmed) VALUES (?, ?, ?)",
            params![nullifier.to_decimal(), epoch as i64, confirmed as i64],
        )?;
        Ok(())
    }

    /// Reserve a nullifier without clobbering an existing row.
    pub fn reserve_nullifier(&self, epoch: u64, nullifier: &Field) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO nullifiers (nullifier, epoch, confirmed) VALUES (?, ?, 0)",
            params![nullifier.to_decimal(), epoch as i64],
        )?;
        Ok(())
    }

    pub fn delete_unconfirmed_nullifier(&self, nullifier: &Field) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "DELETE FROM nullifiers WHERE nullifier = ? AND confirmed = 0",
            params![nullifier.to_decimal()],
        )?;
        Ok(())
    }

    pub fn insert_proof(&self, proof: &ProofRecord) -> Result<(), SynchronizerError> {
        self.conn().execute(
            r#"
            INSERT INTO proofs
                (proof_index, event, epoch, public_signals, proof, valid, spent,
                 global_state_tree, blinded_user_state, blinded_hash_chain,
                 output_blinded_user_state, output_blinded_hash_chain,
                 input_blinded_user_state, proof_index_records)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                proof.index as i64,
                proof.event.as_str(),
                proof.epoch.map(|e| e as i64),
                encode_fields(&proof.public_signals),
                encode_fields(&proof.proof),
                proof.valid.map(i64::from),
                proof.spent as i64,
                proof.global_state_tree.as_ref().map(Field::to_decimal),
                proof.blinded_user_state.as_ref().map(Field::to_decimal),
                proof.blinded_hash_chain.as_ref().map(Field::to_decimal),
                proof
                    .output_blinded_user_state
                    .as_ref()
                    .map(Field::to_decimal),
                proof
                    .output_blinded_hash_chain
                    .as_ref()
                    .map(Field::to_decimal),
                proof
                    .input_blinded_user_state
                    .as_ref()
                    .map(Field::to_decimal),
                serde_json::to_string(&proof.proof_index_records)
                    .map_err(|e| SynchronizerError::Decode(e.to_string()))?,
            ],
        )?;
        debug!(
            index = proof.index,
            event = proof.event.as_str(),
            valid = ?proof.valid,
            "persisted proof"
        );
        Ok(())
    }

    pub fn set_proof_spent(&self, index: u64) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "UPDATE proofs SET spent = 1 WHERE proof_index = ?",
            params![index as i64],
        )?;
        Ok(())
    }

    pub fn insert_user_signup(&self, signup: &UserSignUpRecord) -> Result<(), SynchronizerError> {
        self.conn().execute(
            r#"
            INSERT INTO user_signups (epoch, commitment, attester_id, airdrop, leaf_index)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                signup.epoch as i64,
                signup.commitment.to_decimal(),
                signup.attester_id.to_decimal(),
                signup.airdrop.to_decimal(),
                signup.leaf_index as i64
            ],
        )?;
        Ok(())
    }

    /// Advance the per-log cursor. Called inside the same transaction as
    /// the handler so a rolled-back event is re-fetched.
    pub fn advance_cursor(&self, position: LogPosition) -> Result<(), SynchronizerError> {
        self.conn().execute(
            r#"
            UPDATE sync_state SET
                latest_processed_block = ?,
                latest_processed_transaction_index = ?,
                latest_processed_event_index = ?
            WHERE id = 1
            "#,
            params![
                position.block_number as i64,
                position.transaction_index as i64,
                position.log_index as i64
            ],
        )?;
        Ok(())
    }

    /// Record the batch high-water mark after a drain.
    pub fn set_latest_complete_block(&self, block: u64) -> Result<(), SynchronizerError> {
        self.conn().execute(
            "UPDATE sync_state SET latest_complete_block = ? WHERE id = 1",
            params![block as i64],
        )?;
        Ok(())
    }
}

fn encode_fields(fields: &[Field]) -> String {
    // Vec<Field> serializes as a JSON array of decimal strings; infallible.
    serde_json::to_string(fields).expect("field vectors always serialize")
}

fn decode_fields(raw: &str) -> Result<Vec<Field>, SynchronizerError> {
    serde_json::from_str(raw).map_err(|e| SynchronizerError::Decode(e.to_string()))
}

fn parse_field(raw: String) -> Result<Field, SynchronizerError> {
    Field::from_decimal(&raw).map_err(|e| SynchronizerError::Decode(e.to_string()))
}

/// Indexed read queries, shared by the store and the transactional writer.
pub trait StoreReader {
    #[doc(hidden)]
    fn conn(&self) -> &Connection;

    fn epoch(&self, number: u64) -> Result<Option<EpochRecord>, SynchronizerError> {
        self.conn()
            .query_row(
                "SELECT number, sealed, epoch_root FROM epochs WHERE number = ?",
                params![number as i64],
                map_epoch,
            )
            .optional()?
            .map(post_epoch)
            .transpose()
    }

    /// The highest-numbered epoch row.
    fn current_epoch(&self) -> Result<Option<EpochRecord>, SynchronizerError> {
        self.conn()
            .query_row(
                "SELECT number, sealed, epoch_root FROM epochs ORDER BY number DESC LIMIT 1",
                [],
                map_epoch,
            )
            .optional()?
            .map(post_epoch)
            .transpose()
    }

    fn epochs(&self) -> Result<Vec<EpochRecord>, SynchronizerError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT number, sealed, epoch_root FROM epochs ORDER BY number ASC")?;
        let rows = stmt.query_map([], map_epoch)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(post_epoch)
            .collect()
    }

    fn unsealed_epoch_count(&self) -> Result<u64, SynchronizerError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM epochs WHERE sealed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_gst_leaves(&self, epoch: u64) -> Result<u64, SynchronizerError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM gst_leaves WHERE epoch = ?",
            params![epoch as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All leaves of an epoch in insertion order.
    fn gst_leaves(&self, epoch: u64) -> Result<Vec<GstLeafRecord>, SynchronizerError> {
        let mut stmt = self.conn().prepare(
            "SELECT epoch, leaf_index, hash, tx_hash FROM gst_leaves
             WHERE epoch = ? ORDER BY leaf_index ASC",
        )?;
        let rows = stmt.query_map(params![epoch as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(epoch, index, hash, tx_hash)| {
                Ok(GstLeafRecord {
                    epoch: epoch as u64,
                    index: index as u64,
                    hash: parse_field(hash)?,
                    tx_hash,
                })
            })
            .collect()
    }

    fn find_gst_leaf_by_hash(
        &self,
        epoch: u64,
        hash: &Field,
    ) -> Result<Option<GstLeafRecord>, SynchronizerError> {
        let row = self
            .conn()
            .query_row(
                "SELECT leaf_index, tx_hash FROM gst_leaves WHERE epoch = ? AND hash = ?
                 ORDER BY leaf_index DESC LIMIT 1",
                params![epoch as i64, hash.to_decimal()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(index, tx_hash)| GstLeafRecord {
            epoch,
            index: index as u64,
            hash: hash.clone(),
            tx_hash,
        }))
    }

    /// Membership test for any historic GST root of an epoch.
    fn gst_root_exists(&self, epoch: u64, root: &Field) -> Result<bool, SynchronizerError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM gst_roots WHERE epoch = ? AND root = ?",
            params![epoch as i64, root.to_decimal()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn latest_gst_root(&self, epoch: u64) -> Result<Option<Field>, SynchronizerError> {
        self.conn()
            .query_row(
                "SELECT root FROM gst_roots WHERE epoch = ? ORDER BY id DESC LIMIT 1",
                params![epoch as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(parse_field)
            .transpose()
    }

    fn epoch_keys(&self, epoch: u64) -> Result<Vec<Field>, SynchronizerError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT key FROM epoch_keys WHERE epoch = ? ORDER BY key ASC")?;
        let rows = stmt.query_map(params![epoch as i64], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(parse_field)
            .collect()
    }

    fn epoch_key_exists(&self, epoch: u64, key: &Field) -> Result<bool, SynchronizerError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM epoch_keys WHERE epoch = ? AND key = ?",
            params![epoch as i64, key.to_decimal()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Attestations for one epoch key in event order; `valid_only` keeps
    /// the rows whose proof chain checked out.
    fn attestations_for_key(
        &self,
        epoch: u64,
        key: &Field,
        valid_only: bool,
    ) -> Result<Vec<AttestationRecord>, SynchronizerError> {
        let sql = if valid_only {
            "SELECT event_index, epoch, epoch_key, attester, proof_index, attester_id,
                    pos_rep, neg_rep, graffiti, sign_up, hash, valid
             FROM attestations WHERE epoch = ? AND epoch_key = ? AND valid = 1
             ORDER BY event_index ASC"
        } else {
            "SELECT event_index, epoch, epoch_key, attester, proof_index, attester_id,
                    pos_rep, neg_rep, graffiti, sign_up, hash, valid
             FROM attestations WHERE epoch = ? AND epoch_key = ?
             ORDER BY event_index ASC"
        };
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![epoch as i64, key.to_decimal()], map_attestation_raw)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(post_attestation)
            .collect()
    }

    fn nullifier(&self, nullifier: &Field) -> Result<Option<NullifierRecord>, SynchronizerError> {
        let row = self
            .conn()
            .query_row(
                "SELECT epoch, confirmed FROM nullifiers WHERE nullifier = ?",
                params![nullifier.to_decimal()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(epoch, confirmed)| NullifierRecord {
            epoch: epoch as u64,
            nullifier: nullifier.clone(),
            confirmed: confirmed != 0,
        }))
    }

    fn nullifier_confirmed(&self, nullifier: &Field) -> Result<bool, SynchronizerError> {
        Ok(self
            .nullifier(nullifier)?
            .map(|n| n.confirmed)
            .unwrap_or(false))
    }

    fn count_confirmed_nullifiers(&self) -> Result<u64, SynchronizerError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM nullifiers WHERE confirmed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn proof(&self, index: u64) -> Result<Option<ProofRecord>, SynchronizerError> {
        self.conn()
            .query_row(
                "SELECT proof_index, event, epoch, public_signals, proof, valid, spent,
                        global_state_tree, blinded_user_state, blinded_hash_chain,
                        output_blinded_user_state, output_blinded_hash_chain,
                        input_blinded_user_state, proof_index_records
                 FROM proofs WHERE proof_index = ?",
                params![index as i64],
                map_proof_raw,
            )
            .optional()?
            .map(post_proof)
            .transpose()
    }

    fn user_signups_for(
        &self,
        commitment: &Field,
    ) -> Result<Vec<UserSignUpRecord>, SynchronizerError> {
        let mut stmt = self.conn().prepare(
            "SELECT epoch, commitment, attester_id, airdrop, leaf_index
             FROM user_signups WHERE commitment = ? ORDER BY epoch ASC",
        )?;
        let rows = stmt.query_map(params![commitment.to_decimal()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(epoch, commitment, attester_id, airdrop, leaf_index)| {
                Ok(UserSignUpRecord {
                    epoch: epoch as u64,
                    commitment: parse_field(commitment)?,
                    attester_id: parse_field(attester_id)?,
                    airdrop: parse_field(airdrop)?,
                    leaf_index: leaf_index as u64,
                })
            })
            .collect()
    }

    fn cursor(&self) -> Result<CursorRecord, SynchronizerError> {
        let cursor = self.conn().query_row(
            "SELECT latest_processed_block, latest_processed_transaction_index,
                    latest_processed_event_index, latest_complete_block
             FROM sync_state WHERE id = 1",
            [],
            |row| {
                Ok(CursorRecord {
                    latest_processed_block: row.get::<_, i64>(0)? as u64,
                    latest_processed_transaction_index: row.get::<_, i64>(1)? as u64,
                    latest_processed_event_index: row.get::<_, i64>(2)? as u64,
                    latest_complete_block: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(cursor)
    }
}

type EpochRow = (i64, i64, Option<String>);

fn map_epoch(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpochRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn post_epoch((number, sealed, root): EpochRow) -> Result<EpochRecord, SynchronizerError> {
    Ok(EpochRecord {
        number: number as u64,
        sealed: sealed != 0,
        epoch_root: root.map(parse_field).transpose()?,
    })
}

type AttestationRow = (
    i64,
    i64,
    String,
    String,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
);

fn map_attestation_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttestationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn post_attestation(raw: AttestationRow) -> Result<AttestationRecord, SynchronizerError> {
    let (
        event_index,
        epoch,
        epoch_key,
        attester,
        proof_index,
        attester_id,
        pos_rep,
        neg_rep,
        graffiti,
        sign_up,
        hash,
        valid,
    ) = raw;
    Ok(AttestationRecord {
        event_index: event_index as u64,
        epoch: epoch as u64,
        epoch_key: parse_field(epoch_key)?,
        attester,
        proof_index: proof_index as u64,
        attester_id: parse_field(attester_id)?,
        pos_rep: parse_field(pos_rep)?,
        neg_rep: parse_field(neg_rep)?,
        graffiti: parse_field(graffiti)?,
        sign_up: parse_field(sign_up)?,
        hash: parse_field(hash)?,
        valid: valid.map(|v| v != 0),
    })
}

#[allow(clippy::type_complexity)]
fn map_proof_raw(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(
    i64,
    String,
    Option<i64>,
    String,
    String,
    Option<i64>,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

#[allow(clippy::type_complexity)]
fn post_proof(
    raw: (
        i64,
        String,
        Option<i64>,
        String,
        String,
        Option<i64>,
        i64,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
    ),
) -> Result<ProofRecord, SynchronizerError> {
    let (
        index,
        event,
        epoch,
        public_signals,
        proof,
        valid,
        spent,
        global_state_tree,
        blinded_user_state,
        blinded_hash_chain,
        output_blinded_user_state,
        output_blinded_hash_chain,
        input_blinded_user_state,
        proof_index_records,
    ) = raw;
    let event = ProofEventKind::parse(&event)
        .ok_or_else(|| SynchronizerError::Decode(format!("unknown proof event '{event}'")))?;
    Ok(ProofRecord {
        index: index as u64,
        event,
        epoch: epoch.map(|e| e as u64),
        public_signals: decode_fields(&public_signals)?,
        proof: decode_fields(&proof)?,
        valid: valid.map(|v| v != 0),
        spent: spent != 0,
        global_state_tree: global_state_tree.map(parse_field).transpose()?,
        blinded_user_state: blinded_user_state.map(parse_field).transpose()?,
        blinded_hash_chain: blinded_hash_chain.map(parse_field).transpose()?,
        output_blinded_user_state: output_blinded_user_state.map(parse_field).transpose()?,
        output_blinded_hash_chain: output_blinded_hash_chain.map(parse_field).transpose()?,
        input_blinded_user_state: input_blinded_user_state.map(parse_field).transpose()?,
        proof_index_records: serde_json::from_str(&proof_index_records)
            .map_err(|e| SynchronizerError::Decode(e.to_string()))?,
    })
}
