//! Per-topic event handlers.
//!
//! Every handler runs inside the store transaction opened for its log.
//! Protocol violations (invalid proof chains, duplicate nullifiers,
//! out-of-range epoch keys) are logged and turn the event into a no-op:
//! the event still counts as processed and the cursor advances past it,
//! matching the on-chain semantics where the contract indexed a bad
//! submission. Only internal invariant violations (a referenced proof
//! row that was never written) abort the transaction.

use tracing::{debug, warn};
use unirep_common::{attestation_hash, hash2, Field, UnirepConfig};

use crate::chain::LogPosition;
use crate::error::SynchronizerError;
use crate::events::{
    AttestationSubmittedEvent, EpochEndedEvent, EpochKeyProofEvent,
    ProcessedAttestationsProofEvent, ReputationProofEvent, SignUpProofEvent,
    StartedTransitionProofEvent, UnirepEvent, UserSignedUpEvent, UserStateTransitionProofEvent,
    UserStateTransitionedEvent,
};
use crate::prover::{Circuit, Prover, UstPublicSignals};
use crate::store::models::{
    AttestationRecord, GstLeafRecord, ProofEventKind, ProofRecord, UserSignUpRecord,
};
use crate::store::{StoreReader, StoreTx};
use crate::synchronizer::{compute_init_ust_root, default_gst_leaf, gen_epoch_tree};
use crate::trees::IncrementalTree;

/// Everything a handler may touch. The transaction writer is the only
/// mutation path for persistent state; the tree and epoch cursor are the
/// ingestor-owned in-memory mirrors.
pub(crate) struct HandlerCtx<'a, P> {
    pub tx: &'a StoreTx<'a>,
    pub gst: &'a mut IncrementalTree,
    pub current_epoch: &'a mut u64,
    pub cfg: &'a UnirepConfig,
    pub prover: &'a P,
    pub position: LogPosition,
    pub tx_hash: &'a str,
}

pub(crate) fn dispatch<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    event: &UnirepEvent,
) -> Result<(), SynchronizerError> {
    match event {
        UnirepEvent::UserSignedUp(ev) => user_signed_up(ctx, ev),
        UnirepEvent::UserStateTransitioned(ev) => user_state_transitioned(ctx, ev),
        UnirepEvent::AttestationSubmitted(ev) => attestation_submitted(ctx, ev),
        UnirepEvent::EpochEnded(ev) => epoch_ended(ctx, ev),
        UnirepEvent::IndexedEpochKeyProof(ev) => epoch_key_proof(ctx, ev),
        UnirepEvent::IndexedReputationProof(ev) => reputation_proof(ctx, ev),
        UnirepEvent::IndexedUserSignedUpProof(ev) => signup_proof(ctx, ev),
        UnirepEvent::IndexedStartedTransitionProof(ev) => started_transition_proof(ctx, ev),
        UnirepEvent::IndexedProcessedAttestationsProof(ev) => {
            processed_attestations_proof(ctx, ev)
        }
        UnirepEvent::IndexedUserStateTransitionProof(ev) => ust_proof(ctx, ev),
    }
}

fn epoch_key_in_range(key: &Field, depth: usize) -> bool {
    *key == key.truncate_bits(depth)
}

fn user_signed_up<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &UserSignedUpEvent,
) -> Result<(), SynchronizerError> {
    if ev.epoch != *ctx.current_epoch {
        warn!(
            event_epoch = ev.epoch,
            current_epoch = *ctx.current_epoch,
            "signup for non-current epoch ignored"
        );
        return Ok(());
    }

    let init_ust_root = compute_init_ust_root(ctx.cfg, &ev.attester_id, &ev.airdrop_amount);
    let leaf = hash2(&ev.identity_commitment, &init_ust_root);

    let index = ctx.tx.count_gst_leaves(ev.epoch)?;
    if ctx.gst.len() != index {
        return Err(SynchronizerError::Protocol(format!(
            "in-memory GST holds {} leaves but the store holds {index} for epoch {}",
            ctx.gst.len(),
            ev.epoch
        )));
    }
    ctx.gst.insert(leaf.clone());

    ctx.tx.insert_gst_leaf(&GstLeafRecord {
        epoch: ev.epoch,
        index,
        hash: leaf,
        tx_hash: ctx.tx_hash.to_string(),
    })?;
    ctx.tx.insert_gst_root(ev.epoch, &ctx.gst.root())?;
    ctx.tx.insert_user_signup(&UserSignUpRecord {
        epoch: ev.epoch,
        commitment: ev.identity_commitment.clone(),
        attester_id: ev.attester_id.clone(),
        airdrop: ev.airdrop_amount.clone(),
        leaf_index: index,
    })?;
    debug!(epoch = ev.epoch, index, "user signed up");
    Ok(())
}

fn attestation_submitted<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &AttestationSubmittedEvent,
) -> Result<(), SynchronizerError> {
    if ev.epoch != *ctx.current_epoch {
        warn!(
            event_epoch = ev.epoch,
            current_epoch = *ctx.current_epoch,
            "attestation for non-current epoch ignored"
        );
        return Ok(());
    }
    if !epoch_key_in_range(&ev.epoch_key, ctx.cfg.epoch_tree_depth) {
        warn!(epoch_key = %ev.epoch_key, "attestation epoch key exceeds tree depth; ignored");
        return Ok(());
    }

    let event_index = ctx.position.packed();
    let hash = attestation_hash(
        &ev.attester_id,
        &ev.pos_rep,
        &ev.neg_rep,
        &ev.graffiti,
        &ev.sign_up,
    );
    ctx.tx.insert_attestation(&AttestationRecord {
        event_index,
        epoch: ev.epoch,
        epoch_key: ev.epoch_key.clone(),
        attester: ev.attester.clone(),
        proof_index: ev.to_proof_index,
        attester_id: ev.attester_id.clone(),
        pos_rep: ev.pos_rep.clone(),
        neg_rep: ev.neg_rep.clone(),
        graffiti: ev.graffiti.clone(),
        sign_up: ev.sign_up.clone(),
        hash,
        valid: None,
    })?;

    let to_proof = ctx.tx.proof(ev.to_proof_index)?.ok_or_else(|| {
        SynchronizerError::Protocol(format!(
            "attestation at {} references missing proof {}",
            ctx.position, ev.to_proof_index
        ))
    })?;
    if to_proof.valid != Some(true) {
        warn!(
            proof_index = ev.to_proof_index,
            "attestation targets an invalid proof"
        );
        ctx.tx.set_attestation_valid(event_index, false)?;
        return Ok(());
    }

    if ev.from_proof_index != 0 {
        let from_proof = ctx.tx.proof(ev.from_proof_index)?.ok_or_else(|| {
            SynchronizerError::Protocol(format!(
                "attestation at {} spends missing proof {}",
                ctx.position, ev.from_proof_index
            ))
        })?;
        if from_proof.valid != Some(true) || from_proof.spent {
            warn!(
                proof_index = ev.from_proof_index,
                spent = from_proof.spent,
                "attestation spends an invalid or already spent proof"
            );
            ctx.tx.set_attestation_valid(event_index, false)?;
            return Ok(());
        }
        ctx.tx.set_proof_spent(ev.from_proof_index)?;
    }

    ctx.tx.set_attestation_valid(event_index, true)?;
    ctx.tx.upsert_epoch_key(ev.epoch, &ev.epoch_key)?;
    debug!(epoch = ev.epoch, epoch_key = %ev.epoch_key, "attestation recorded");
    Ok(())
}

fn epoch_ended<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &EpochEndedEvent,
) -> Result<(), SynchronizerError> {
    if ev.epoch != *ctx.current_epoch {
        warn!(
            event_epoch = ev.epoch,
            current_epoch = *ctx.current_epoch,
            "epoch end for non-current epoch ignored"
        );
        return Ok(());
    }

    let epoch_tree = gen_epoch_tree(ctx.tx, ctx.cfg, ev.epoch)?;
    let root = epoch_tree.root();
    ctx.tx.seal_epoch(ev.epoch, &root)?;

    let next = ev.epoch + 1;
    ctx.tx.ensure_epoch(next)?;
    *ctx.gst = IncrementalTree::new(ctx.cfg.gst_depth, default_gst_leaf(ctx.cfg));
    ctx.tx.insert_gst_root(next, &ctx.gst.root())?;
    *ctx.current_epoch = next;

    debug!(sealed = ev.epoch, next, epoch_root = %root, "epoch transitioned");
    Ok(())
}

/// Shared skip for re-emitted proof indexes. Proof rows are written once
/// per on-chain index; a duplicate is a replayed log, not an error.
fn proof_already_recorded<P: Prover>(
    ctx: &HandlerCtx<'_, P>,
    index: u64,
) -> Result<bool, SynchronizerError> {
    if ctx.tx.proof(index)?.is_some() {
        warn!(proof_index = index, "proof index already recorded; ignored");
        return Ok(true);
    }
    Ok(false)
}

fn epoch_key_proof<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &EpochKeyProofEvent,
) -> Result<(), SynchronizerError> {
    if proof_already_recorded(ctx, ev.proof_index)? {
        return Ok(());
    }
    let verified = ctx
        .prover
        .verify(Circuit::VerifyEpochKey, &ev.public_signals, &ev.proof)?;
    let root_ok = ctx.tx.gst_root_exists(ev.epoch, &ev.global_state_tree)?;
    let key_ok = epoch_key_in_range(&ev.epoch_key, ctx.cfg.epoch_tree_depth);

    let mut record = ProofRecord::new(
        ev.proof_index,
        ProofEventKind::IndexedEpochKeyProof,
        ev.public_signals.clone(),
        ev.proof.clone(),
    );
    record.epoch = Some(ev.epoch);
    record.valid = Some(verified && root_ok && key_ok);
    record.global_state_tree = Some(ev.global_state_tree.clone());
    ctx.tx.insert_proof(&record)?;
    if record.valid != Some(true) {
        warn!(
            proof_index = ev.proof_index,
            verified, root_ok, key_ok, "epoch key proof rejected"
        );
    }
    Ok(())
}

fn reputation_proof<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &ReputationProofEvent,
) -> Result<(), SynchronizerError> {
    if proof_already_recorded(ctx, ev.proof_index)? {
        return Ok(());
    }
    let verified = ctx
        .prover
        .verify(Circuit::ProveReputation, &ev.public_signals, &ev.proof)?;
    let root_ok = ctx.tx.gst_root_exists(ev.epoch, &ev.global_state_tree)?;
    let key_ok = epoch_key_in_range(&ev.epoch_key, ctx.cfg.epoch_tree_depth);

    let mut duplicate = false;
    for nullifier in ev.rep_nullifiers.iter().filter(|n| !n.is_zero()) {
        if ctx.tx.nullifier_confirmed(nullifier)? {
            warn!(%nullifier, "reputation proof reuses a spent nullifier");
            duplicate = true;
        }
    }

    let valid = verified && root_ok && key_ok && !duplicate;
    let mut record = ProofRecord::new(
        ev.proof_index,
        ProofEventKind::IndexedReputationProof,
        ev.public_signals.clone(),
        ev.proof.clone(),
    );
    record.epoch = Some(ev.epoch);
    record.valid = Some(valid);
    record.global_state_tree = Some(ev.global_state_tree.clone());
    ctx.tx.insert_proof(&record)?;

    if valid {
        // Spent reputation is final once the proof lands on chain.
        for nullifier in ev.rep_nullifiers.iter().filter(|n| !n.is_zero()) {
            ctx.tx.put_nullifier(ev.epoch, nullifier, true)?;
        }
    } else {
        warn!(
            proof_index = ev.proof_index,
            verified, root_ok, key_ok, duplicate, "reputation proof rejected"
        );
    }
    Ok(())
}

fn signup_proof<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &SignUpProofEvent,
) -> Result<(), SynchronizerError> {
    if proof_already_recorded(ctx, ev.proof_index)? {
        return Ok(());
    }
    let verified = ctx
        .prover
        .verify(Circuit::ProveUserSignUp, &ev.public_signals, &ev.proof)?;
    let root_ok = ctx.tx.gst_root_exists(ev.epoch, &ev.global_state_tree)?;
    let key_ok = epoch_key_in_range(&ev.epoch_key, ctx.cfg.epoch_tree_depth);

    let mut record = ProofRecord::new(
        ev.proof_index,
        ProofEventKind::IndexedUserSignedUpProof,
        ev.public_signals.clone(),
        ev.proof.clone(),
    );
    record.epoch = Some(ev.epoch);
    record.valid = Some(verified && root_ok && key_ok);
    record.global_state_tree = Some(ev.global_state_tree.clone());
    ctx.tx.insert_proof(&record)?;
    if record.valid != Some(true) {
        warn!(
            proof_index = ev.proof_index,
            verified, root_ok, key_ok, "sign-up proof rejected"
        );
    }
    Ok(())
}

fn started_transition_proof<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &StartedTransitionProofEvent,
) -> Result<(), SynchronizerError> {
    if proof_already_recorded(ctx, ev.proof_index)? {
        return Ok(());
    }
    let verified = ctx
        .prover
        .verify(Circuit::StartTransition, &ev.public_signals, &ev.proof)?;

    let mut record = ProofRecord::new(
        ev.proof_index,
        ProofEventKind::IndexedStartedTransitionProof,
        ev.public_signals.clone(),
        ev.proof.clone(),
    );
    record.valid = Some(verified);
    record.global_state_tree = Some(ev.global_state_tree.clone());
    record.blinded_user_state = Some(ev.blinded_user_state.clone());
    record.blinded_hash_chain = Some(ev.blinded_hash_chain.clone());
    ctx.tx.insert_proof(&record)?;
    if !verified {
        warn!(proof_index = ev.proof_index, "start transition proof rejected");
    }
    Ok(())
}

fn processed_attestations_proof<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &ProcessedAttestationsProofEvent,
) -> Result<(), SynchronizerError> {
    if proof_already_recorded(ctx, ev.proof_index)? {
        return Ok(());
    }
    let verified =
        ctx.prover
            .verify(Circuit::ProcessAttestations, &ev.public_signals, &ev.proof)?;

    let mut record = ProofRecord::new(
        ev.proof_index,
        ProofEventKind::IndexedProcessedAttestationsProof,
        ev.public_signals.clone(),
        ev.proof.clone(),
    );
    record.valid = Some(verified);
    record.input_blinded_user_state = Some(ev.input_blinded_user_state.clone());
    record.output_blinded_user_state = Some(ev.output_blinded_user_state.clone());
    record.output_blinded_hash_chain = Some(ev.output_blinded_hash_chain.clone());
    ctx.tx.insert_proof(&record)?;
    if !verified {
        warn!(
            proof_index = ev.proof_index,
            "processed attestations proof rejected"
        );
    }
    Ok(())
}

fn ust_proof<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &UserStateTransitionProofEvent,
) -> Result<(), SynchronizerError> {
    if proof_already_recorded(ctx, ev.proof_index)? {
        return Ok(());
    }
    let verified =
        ctx.prover
            .verify(Circuit::UserStateTransition, &ev.public_signals, &ev.proof)?;
    let root_ok = ctx
        .tx
        .gst_root_exists(ev.transition_from_epoch, &ev.from_global_state_tree)?;

    let valid = verified && root_ok;
    let mut record = ProofRecord::new(
        ev.proof_index,
        ProofEventKind::IndexedUserStateTransitionProof,
        ev.public_signals.clone(),
        ev.proof.clone(),
    );
    record.epoch = Some(ev.transition_from_epoch);
    record.valid = Some(valid);
    record.global_state_tree = Some(ev.from_global_state_tree.clone());
    record.proof_index_records = ev.proof_index_records.clone();
    ctx.tx.insert_proof(&record)?;

    if valid {
        // Reserve the nullifiers a pending transition would consume; the
        // execution event confirms them.
        for nullifier in ev.epk_nullifiers.iter().filter(|n| !n.is_zero()) {
            ctx.tx
                .reserve_nullifier(ev.transition_from_epoch, nullifier)?;
        }
    } else {
        warn!(
            proof_index = ev.proof_index,
            verified, root_ok, "user state transition proof rejected"
        );
    }
    Ok(())
}

fn user_state_transitioned<P: Prover>(
    ctx: &mut HandlerCtx<'_, P>,
    ev: &UserStateTransitionedEvent,
) -> Result<(), SynchronizerError> {
    if ev.epoch != *ctx.current_epoch {
        warn!(
            event_epoch = ev.epoch,
            current_epoch = *ctx.current_epoch,
            "user state transition for non-current epoch ignored"
        );
        return Ok(());
    }

    // 1. The transition proof itself.
    let proof = ctx.tx.proof(ev.proof_index)?.ok_or_else(|| {
        SynchronizerError::Protocol(format!(
            "transition at {} references missing proof {}",
            ctx.position, ev.proof_index
        ))
    })?;
    if proof.event != ProofEventKind::IndexedUserStateTransitionProof
        || proof.valid != Some(true)
    {
        warn!(
            proof_index = ev.proof_index,
            event = proof.event.as_str(),
            "transition references a non-UST or invalid proof"
        );
        return Ok(());
    }
    let signals = UstPublicSignals::parse(
        &proof.public_signals,
        ctx.cfg.num_epoch_key_nonce_per_epoch as usize,
    )?;
    if ev.hashed_leaf != signals.new_gst_leaf {
        warn!(
            proof_index = ev.proof_index,
            "transition leaf does not match the proof's new GST leaf"
        );
        return Ok(());
    }

    // 2. The start-transition proof must open the chain.
    let Some(&start_index) = proof.proof_index_records.first() else {
        warn!(
            proof_index = ev.proof_index,
            "transition carries no sub-proof records"
        );
        return Ok(());
    };
    let start = ctx.tx.proof(start_index)?.ok_or_else(|| {
        SynchronizerError::Protocol(format!(
            "transition at {} references missing start proof {start_index}",
            ctx.position
        ))
    })?;
    if start.event != ProofEventKind::IndexedStartedTransitionProof || start.valid != Some(true) {
        warn!(start_index, "start transition proof missing or invalid");
        return Ok(());
    }
    if start.blinded_user_state.as_ref() != Some(&signals.blinded_user_states[0])
        || start.global_state_tree.as_ref() != Some(&signals.from_global_state_tree)
    {
        warn!(
            start_index,
            "start transition proof does not share the transition's blinded state or GST root"
        );
        return Ok(());
    }

    // 3. Chain the processed-attestations proofs through their blinded
    //    user states.
    let mut chain_outputs: Vec<Field> = Vec::new();
    if let Some(bhc) = start.blinded_hash_chain.clone() {
        chain_outputs.push(bhc);
    }
    let mut current_blinded_user_state = signals.blinded_user_states[0].clone();
    for &record_index in &proof.proof_index_records[1..] {
        let sub = ctx.tx.proof(record_index)?.ok_or_else(|| {
            SynchronizerError::Protocol(format!(
                "transition at {} references missing sub-proof {record_index}",
                ctx.position
            ))
        })?;
        if sub.event != ProofEventKind::IndexedProcessedAttestationsProof
            || sub.valid != Some(true)
        {
            warn!(record_index, "sub-proof missing, wrong kind or invalid");
            return Ok(());
        }
        if sub.input_blinded_user_state.as_ref() != Some(&current_blinded_user_state) {
            warn!(
                record_index,
                "sub-proof input does not continue the blinded user state chain"
            );
            return Ok(());
        }
        current_blinded_user_state = sub.output_blinded_user_state.clone().ok_or_else(|| {
            SynchronizerError::Protocol(format!(
                "processed attestations proof {record_index} has no output blinded user state"
            ))
        })?;
        if let Some(bhc) = sub.output_blinded_hash_chain.clone() {
            chain_outputs.push(bhc);
        }
    }

    // 4. Every blinded hash chain must be produced by one of the
    //    referenced sub-proofs.
    for blinded_hash_chain in &signals.blinded_hash_chains {
        if !chain_outputs.contains(blinded_hash_chain) {
            warn!(
                %blinded_hash_chain,
                "no referenced sub-proof produced this blinded hash chain"
            );
            return Ok(());
        }
    }

    // 5. Historic roots of the source epoch.
    if !ctx.tx.gst_root_exists(
        signals.transition_from_epoch,
        &signals.from_global_state_tree,
    )? {
        warn!(
            from_epoch = signals.transition_from_epoch,
            "transition's source GST root was never observed"
        );
        return Ok(());
    }
    let from_epoch = match ctx.tx.epoch(signals.transition_from_epoch)? {
        Some(epoch) => epoch,
        None => {
            warn!(
                from_epoch = signals.transition_from_epoch,
                "transition from an unknown epoch"
            );
            return Ok(());
        }
    };
    if !from_epoch.sealed || from_epoch.epoch_root.as_ref() != Some(&signals.from_epoch_tree) {
        warn!(
            from_epoch = from_epoch.number,
            sealed = from_epoch.sealed,
            "transition's epoch tree root does not match the sealed epoch"
        );
        return Ok(());
    }

    // 6. Nullifier freshness.
    let nullifiers: Vec<&Field> = signals
        .epk_nullifiers
        .iter()
        .filter(|n| !n.is_zero())
        .collect();
    for &nullifier in &nullifiers {
        if ctx.tx.nullifier_confirmed(nullifier)? {
            warn!(%nullifier, "transition reuses a confirmed nullifier");
            return Ok(());
        }
    }

    // 7. Commit: confirm nullifiers and append the new GST leaf.
    for &nullifier in &nullifiers {
        ctx.tx.delete_unconfirmed_nullifier(nullifier)?;
        ctx.tx
            .put_nullifier(signals.transition_from_epoch, nullifier, true)?;
    }

    let index = ctx.tx.count_gst_leaves(ev.epoch)?;
    if ctx.gst.len() != index {
        return Err(SynchronizerError::Protocol(format!(
            "in-memory GST holds {} leaves but the store holds {index} for epoch {}",
            ctx.gst.len(),
            ev.epoch
        )));
    }
    ctx.gst.insert(signals.new_gst_leaf.clone());
    ctx.tx.insert_gst_leaf(&GstLeafRecord {
        epoch: ev.epoch,
        index,
        hash: signals.new_gst_leaf.clone(),
        tx_hash: ctx.tx_hash.to_string(),
    })?;
    ctx.tx.insert_gst_root(ev.epoch, &ctx.gst.root())?;

    debug!(
        epoch = ev.epoch,
        index,
        from_epoch = signals.transition_from_epoch,
        "user state transitioned"
    );
    Ok(())
}
