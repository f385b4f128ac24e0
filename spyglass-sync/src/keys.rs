//! Wallet key elements and the byte patterns scanned for

use std::collections::HashMap;

use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKSIG};
use bitcoin::script::Builder;
use bitcoin::{OutPoint, PublicKey, ScriptBuf};
use getset::{CopyGetters, Getters};

/// One generated key slot of a subchain.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct KeyElement {
    /// Index of the slot within its subchain.
    #[getset(get_copy = "pub")]
    index: u32,
    /// The slot's public key.
    #[getset(get = "pub")]
    pubkey: PublicKey,
    /// Cosigner keys for multisig script forms, if the subchain uses them.
    #[getset(get = "pub")]
    cosigners: Vec<PublicKey>,
}

impl KeyElement {
    /// Creates a new key element from parts.
    pub fn from_parts(index: u32, pubkey: PublicKey, cosigners: Vec<PublicKey>) -> Self {
        Self {
            index,
            pubkey,
            cosigners,
        }
    }

    /// Every script form this element can appear on chain as: P2PK, P2PKH,
    /// P2WPKH (compressed keys only), and 1-of-3 P2MS when two cosigners are
    /// present.
    pub fn scripts(&self) -> Vec<ScriptBuf> {
        let mut scripts = Vec::with_capacity(4);

        scripts.push(
            Builder::new()
                .push_key(&self.pubkey)
                .push_opcode(OP_CHECKSIG)
                .into_script(),
        );
        scripts.push(ScriptBuf::new_p2pkh(&self.pubkey.pubkey_hash()));
        if let Ok(wpkh) = self.pubkey.wpubkey_hash() {
            scripts.push(ScriptBuf::new_p2wpkh(&wpkh));
        }
        if self.cosigners.len() == 2 {
            let mut builder = Builder::new().push_int(1).push_key(&self.pubkey);
            for cosigner in &self.cosigners {
                builder = builder.push_key(cosigner);
            }
            scripts.push(builder.push_int(3).push_opcode(OP_CHECKMULTISIG).into_script());
        }

        scripts
    }
}

/// A tracked unspent output belonging to the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackedOutput {
    pub(crate) element_index: u32,
    pub(crate) script_pubkey: ScriptBuf,
    pub(crate) height: i64,
}

/// The full set of byte patterns one subchain scans for.
///
/// Kept behind an `Arc` by the aggregate root; matching stages receive
/// immutable snapshots, mutation goes through `Arc::make_mut`.
#[derive(Debug, Clone, Default)]
pub(crate) struct TargetSet {
    scripts: HashMap<ScriptBuf, u32>,
    outpoints: HashMap<OutPoint, TrackedOutput>,
    last_indexed: Option<u32>,
}

impl TargetSet {
    pub(crate) fn last_indexed(&self) -> Option<u32> {
        self.last_indexed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Registers every script form of an element and advances the indexed
    /// watermark.
    pub(crate) fn add_element(&mut self, element: &KeyElement) {
        for script in element.scripts() {
            self.scripts.insert(script, element.index());
        }
        self.last_indexed = Some(
            self.last_indexed
                .map_or(element.index(), |last| last.max(element.index())),
        );
    }

    /// Begins watching an outpoint confirmed to pay the wallet.
    pub(crate) fn track_outpoint(
        &mut self,
        outpoint: OutPoint,
        element_index: u32,
        script_pubkey: ScriptBuf,
        height: i64,
    ) {
        self.outpoints.insert(
            outpoint,
            TrackedOutput {
                element_index,
                script_pubkey,
                height,
            },
        );
    }

    /// Drops outpoints confirmed above the reorg ancestor.
    pub(crate) fn truncate_outpoints(&mut self, max_height: i64) {
        self.outpoints.retain(|_, output| output.height <= max_height);
    }

    pub(crate) fn element_for_script(&self, script: &ScriptBuf) -> Option<u32> {
        self.scripts.get(script).copied()
    }

    pub(crate) fn is_tracked(&self, outpoint: &OutPoint) -> bool {
        self.outpoints.contains_key(outpoint)
    }

    /// First-pass patterns: the flattened element scripts plus serialized
    /// tracked outpoints.
    pub(crate) fn patterns(&self) -> Vec<Vec<u8>> {
        let mut patterns: Vec<Vec<u8>> = self
            .scripts
            .keys()
            .map(|script| script.as_bytes().to_vec())
            .collect();
        patterns.extend(
            self.outpoints
                .keys()
                .map(|outpoint| bitcoin::consensus::encode::serialize(outpoint)),
        );

        patterns
    }

    /// Second-pass patterns: the first pass refined with the scripts of
    /// already-tracked UTXOs.
    pub(crate) fn refined_patterns(&self) -> Vec<Vec<u8>> {
        let mut patterns = self.patterns();
        patterns.extend(
            self.outpoints
                .values()
                .map(|output| output.script_pubkey.as_bytes().to_vec()),
        );

        patterns
    }
}
