//! The event ingestor and dispatcher.
//!
//! A single-writer loop: poll the chain head, fetch the filtered logs
//! past the persisted cursor, order them by `(block, txIndex, logIndex)`,
//! and run each through its handler inside one store transaction that
//! also advances the cursor. Observers are notified strictly after the
//! commit, so nothing external ever sees an event before its state
//! changes are durable.

mod handlers;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use unirep_common::{hash2, reputation_hash, seal_hash_chain, Field, UnirepConfig, SMT_ONE_LEAF};

use crate::chain::{ChainReader, LogFilter, RawLog};
use crate::error::SynchronizerError;
use crate::events::{decode_log, topic_union};
use crate::prover::Prover;
use crate::store::{StoreReader, SyncStore};
use crate::trees::{IncrementalTree, SparseTree};
use handlers::HandlerCtx;

/// Root of a user-state tree with no reputation written to it.
pub fn empty_ust_root(cfg: &UnirepConfig) -> Field {
    SparseTree::new(cfg.ust_depth, Field::zero()).root()
}

/// The GST zero leaf: `hash2(0, emptyUSTRoot)`.
pub fn default_gst_leaf(cfg: &UnirepConfig) -> Field {
    hash2(&Field::zero(), &empty_ust_root(cfg))
}

/// User-state-tree root at signup. An airdropping attester seeds the
/// user's leaf for that attester with the airdrop and the sign-up flag;
/// without an airdrop the tree is empty.
pub fn compute_init_ust_root(cfg: &UnirepConfig, attester_id: &Field, airdrop: &Field) -> Field {
    let mut tree = SparseTree::new(cfg.ust_depth, Field::zero());
    if !airdrop.is_zero() && !attester_id.is_zero() {
        let leaf = reputation_hash(airdrop, &Field::zero(), &Field::zero(), &Field::one());
        tree.update(attester_id, leaf);
    }
    tree.root()
}

/// Rebuild the global state tree of an epoch by replaying its persisted
/// leaves in index order.
pub fn gen_gst_tree(
    reader: &impl StoreReader,
    cfg: &UnirepConfig,
    epoch: u64,
) -> Result<IncrementalTree, SynchronizerError> {
    let mut tree = IncrementalTree::new(cfg.gst_depth, default_gst_leaf(cfg));
    for leaf in reader.gst_leaves(epoch)? {
        let index = tree.insert(leaf.hash);
        if index != leaf.index {
            return Err(SynchronizerError::Protocol(format!(
                "GST leaf indices for epoch {epoch} are not dense: expected {index}, found {}",
                leaf.index
            )));
        }
    }
    Ok(tree)
}

/// Build the epoch tree of an epoch from its attested keys: each key's
/// valid attestations fold into a hash chain in event order, sealed with
/// `hash2(1, chain)`.
pub fn gen_epoch_tree(
    reader: &impl StoreReader,
    cfg: &UnirepConfig,
    epoch: u64,
) -> Result<SparseTree, SynchronizerError> {
    let mut tree = SparseTree::new(cfg.epoch_tree_depth, SMT_ONE_LEAF.clone());
    for key in reader.epoch_keys(epoch)? {
        let mut chain = Field::zero();
        for attestation in reader.attestations_for_key(epoch, &key, true)? {
            chain = hash2(&attestation.hash, &chain);
        }
        tree.update(&key, seal_hash_chain(&chain));
    }
    Ok(tree)
}

/// Observer invoked with the topic hash of each event, strictly after its
/// transaction commits.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, topic: [u8; 32]);
}

/// Cooperative stop signal, checked between events and between polls.
#[derive(Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The off-chain mirror of the on-chain reputation state.
pub struct Synchronizer<C, P> {
    store: SyncStore,
    chain: C,
    prover: P,
    config: UnirepConfig,
    filter: LogFilter,
    /// In-memory GST for the current epoch, owned exclusively by the
    /// ingestor. Rebuildable from persisted leaves at any time.
    gst: IncrementalTree,
    current_epoch: u64,
    /// Head hint raised by the block-subscription side channel.
    noted_block: AtomicU64,
    observers: Vec<Arc<dyn SyncObserver>>,
    stop: StopHandle,
    /// `(packed position, attempts)` of the log currently failing store
    /// transactions.
    retry: Option<(u64, u32)>,
}

impl<C: ChainReader, P: Prover> Synchronizer<C, P> {
    /// Wire up a synchronizer over an opened store. Creates the genesis
    /// epoch on first use and rebuilds the in-memory GST from persisted
    /// leaves on restart.
    pub fn new(
        mut store: SyncStore,
        chain: C,
        prover: P,
        config: UnirepConfig,
    ) -> Result<Self, SynchronizerError> {
        config.validate()?;

        let current_epoch = match store.current_epoch()? {
            Some(epoch) => epoch.number,
            None => {
                let empty_root =
                    IncrementalTree::new(config.gst_depth, default_gst_leaf(&config)).root();
                store.transaction(|tx| {
                    tx.ensure_epoch(1)?;
                    tx.insert_gst_root(1, &empty_root)
                })?;
                1
            }
        };
        let gst = gen_gst_tree(&store, &config, current_epoch)?;
        let filter = LogFilter {
            address: config.contract_address.clone(),
            topics: topic_union(),
        };
        info!(current_epoch, "synchronizer initialized");
        Ok(Self {
            store,
            chain,
            prover,
            config,
            filter,
            gst,
            current_epoch,
            noted_block: AtomicU64::new(0),
            observers: Vec::new(),
            stop: StopHandle::default(),
            retry: None,
        })
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    /// Tear down the synchronizer, handing the store back (e.g. to reset
    /// it after a failed cursor validation).
    pub fn into_store(self) -> SyncStore {
        self.store
    }

    /// Per-identity read model over this synchronizer's store.
    pub fn user_state(&self, identity: unirep_common::Identity) -> crate::UserState<'_, SyncStore> {
        crate::UserState::new(&self.store, identity, self.config.clone())
    }

    pub fn config(&self) -> &UnirepConfig {
        &self.config
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Root of the ingestor-owned GST for the current epoch.
    pub fn gst_root(&self) -> Field {
        self.gst.root()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SyncObserver>) {
        self.observers.push(observer);
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Block-subscription side channel: raise the poll target without
    /// touching any state.
    pub fn note_new_block(&self, block: u64) {
        self.noted_block.fetch_max(block, Ordering::Relaxed);
    }

    /// Verify the persisted cursor still resolves to a real chain log.
    /// A store whose cursor cannot be found (a pruned or different chain)
    /// must be [`SyncStore::reset`] and resynced from genesis.
    pub async fn validate_cursor(&self) -> Result<(), SynchronizerError> {
        let cursor = self.store.cursor()?;
        if cursor.latest_processed_block == 0 {
            return Ok(());
        }
        let logs = Self::rpc(
            self.config.rpc_timeout,
            self.chain.query_filter(
                &self.filter,
                cursor.latest_processed_block,
                cursor.latest_processed_block,
            ),
        )
        .await?;
        let position = cursor.position();
        if logs.iter().any(|log| log.position() == position) {
            Ok(())
        } else {
            Err(SynchronizerError::ResyncRequired)
        }
    }

    /// Run until stopped: drain, then sleep for the poll interval.
    pub async fn start(&mut self) -> Result<(), SynchronizerError> {
        info!("synchronizer started");
        loop {
            if self.stop.is_stopped() {
                info!("synchronizer stopped");
                return Ok(());
            }
            match self.poll_once().await {
                Ok(0) => {}
                Ok(processed) => debug!(processed, "drained batch"),
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient failure; retrying next poll")
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One drain pass: fetch everything past the cursor up to the chain
    /// head and process it in order. Returns the number of events
    /// committed.
    pub async fn poll_once(&mut self) -> Result<usize, SynchronizerError> {
        let tip = Self::rpc(self.config.rpc_timeout, self.chain.get_block_number())
            .await?
            .max(self.noted_block.load(Ordering::Relaxed));

        let cursor = self.store.cursor()?;
        if cursor.latest_complete_block >= tip {
            return Ok(0);
        }

        let from = cursor.latest_complete_block + 1;
        let logs = Self::rpc(
            self.config.rpc_timeout,
            self.chain.query_filter(&self.filter, from, tip),
        )
        .await?;

        let cursor_position = cursor.position();
        let mut batch: Vec<RawLog> = logs
            .into_iter()
            .filter(|log| log.position() > cursor_position)
            .collect();
        batch.sort_by_key(|log| log.position());

        let mut processed = 0;
        for log in &batch {
            if self.stop.is_stopped() {
                return Ok(processed);
            }
            self.process_log(log)?;
            processed += 1;
        }

        self.store
            .transaction(|tx| tx.set_latest_complete_block(tip))?;
        Ok(processed)
    }

    /// Decode and handle one log inside a store transaction that also
    /// advances the cursor; notify observers after the commit.
    fn process_log(&mut self, log: &RawLog) -> Result<(), SynchronizerError> {
        let event = decode_log(log, &self.config)?;
        let position = log.position();
        let topic = log.topics[0];

        let Synchronizer {
            store,
            gst,
            current_epoch,
            prover,
            config,
            ..
        } = self;
        let result = store.transaction(|tx| {
            let mut ctx = HandlerCtx {
                tx,
                gst,
                current_epoch,
                cfg: config,
                prover,
                position,
                tx_hash: &log.transaction_hash,
            };
            handlers::dispatch(&mut ctx, &event)?;
            tx.advance_cursor(position)
        });

        match result {
            Ok(()) => {
                self.retry = None;
                debug!(%position, event = event.name(), "event committed");
                for observer in &self.observers {
                    observer.on_event(topic);
                }
                Ok(())
            }
            Err(err) => {
                // The transaction rolled back; the in-memory mirrors may
                // have been half-mutated by the handler.
                self.resync_memory()?;
                if let SynchronizerError::Store(_) = &err {
                    let packed = position.packed();
                    let attempts = match self.retry {
                        Some((pos, n)) if pos == packed => n + 1,
                        _ => 1,
                    };
                    self.retry = Some((packed, attempts));
                    if attempts > self.config.max_event_retries {
                        return Err(SynchronizerError::StoreRetriesExhausted {
                            position: packed,
                            attempts,
                        });
                    }
                }
                Err(err)
            }
        }
    }

    /// Reload the epoch cursor and GST from the store after a rollback.
    fn resync_memory(&mut self) -> Result<(), SynchronizerError> {
        self.current_epoch = self
            .store
            .current_epoch()?
            .map(|epoch| epoch.number)
            .unwrap_or(1);
        self.gst = gen_gst_tree(&self.store, &self.config, self.current_epoch)?;
        Ok(())
    }

    async fn rpc<T>(
        timeout: std::time::Duration,
        call: impl std::future::Future<Output = Result<T, SynchronizerError>>,
    ) -> Result<T, SynchronizerError> {
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| SynchronizerError::ChainTimeout(timeout))?
    }
}
