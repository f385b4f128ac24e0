//! In-memory collaborators and synthetic chains for tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use bitcoin::absolute::LockTime;
use bitcoin::bip158::{BlockFilter, FilterHeader};
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};

use crate::client::{BlockResponse, BlockSource};
use crate::error::StorageError;
use crate::interface::{HeaderOracle, SyncStorage, WalletSubaccount};
use crate::keys::KeyElement;
use crate::primitives::{
    ConfirmedTransaction, FilterType, Position, SubchainKey, SubchainKind,
};

// generator point multiples; any fixed valid compressed keys work
const PUBKEYS: [&str; 3] = [
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
    "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5",
    "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9",
];

pub(crate) fn test_pubkey(index: usize) -> PublicKey {
    let bytes = hex::decode(PUBKEYS[index % PUBKEYS.len()]).unwrap();
    PublicKey::from_slice(&bytes).unwrap()
}

pub(crate) fn test_key() -> SubchainKey {
    SubchainKey::from_parts(
        "nym-alice".into(),
        "account-0".into(),
        SubchainKind::External,
        FilterType::Basic,
    )
}

/// The P2PKH form of an element, used when paying it in synthetic blocks.
pub(crate) fn element_script(element: &KeyElement) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&element.pubkey().pubkey_hash())
}

/// A coinbase-shaped transaction with a single output.
pub(crate) fn test_transaction(script_pubkey: ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey,
        }],
    }
}

pub(crate) fn test_block(prev: BlockHash, txdata: Vec<Transaction>) -> Block {
    let merkle_root = txdata
        .first()
        .map(|tx| TxMerkleNode::from_byte_array(tx.compute_txid().to_byte_array()))
        .unwrap_or_else(TxMerkleNode::all_zeros);

    Block {
        header: Header {
            version: BlockVersion::ONE,
            prev_blockhash: prev,
            merkle_root,
            time: 0,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            nonce: 0,
        },
        txdata,
    }
}

// OP_RETURN outputs are excluded from BIP-158 filters, so markers make
// blocks unique without polluting the pattern space
fn coinbase_marker(height: i64, seed: u32) -> Transaction {
    let mut data = height.to_le_bytes().to_vec();
    data.extend(seed.to_le_bytes());
    let marker = PushBytesBuf::try_from(data).unwrap();

    test_transaction(ScriptBuf::new_op_return(&marker), height as u64 + 1)
}

/// A hash-linked synthetic chain with heights equal to block indices.
#[derive(Debug, Clone)]
pub(crate) struct TestChain {
    pub(crate) blocks: Vec<Block>,
}

impl TestChain {
    pub(crate) fn build(len: usize) -> Self {
        Self::generate(len, 0, None)
    }

    /// A chain whose block at `pay_height` pays the element's P2PKH script.
    pub(crate) fn build_with_payment(len: usize, pay_height: i64, element: &KeyElement) -> Self {
        Self::generate(len, 0, Some((pay_height, element_script(element))))
    }

    fn generate(len: usize, seed: u32, payment: Option<(i64, ScriptBuf)>) -> Self {
        let mut blocks = Vec::with_capacity(len);
        let mut prev = BlockHash::all_zeros();

        for height in 0..len as i64 {
            let mut txdata = vec![coinbase_marker(height, seed)];
            if let Some((pay_height, script)) = &payment {
                if *pay_height == height {
                    txdata.push(test_transaction(script.clone(), 50_000));
                }
            }
            let block = test_block(prev, txdata);
            prev = block.block_hash();
            blocks.push(block);
        }

        Self { blocks }
    }

    /// A competing branch sharing this chain up to `ancestor` with `extra`
    /// fresh blocks above it.
    pub(crate) fn fork_at(&self, ancestor: i64, extra: usize) -> Self {
        let mut blocks: Vec<Block> = self.blocks[..=ancestor as usize].to_vec();
        let mut prev = blocks
            .last()
            .expect("fork ancestor must exist")
            .block_hash();

        for offset in 0..extra as i64 {
            let block = test_block(prev, vec![coinbase_marker(ancestor + 1 + offset, 0xf0)]);
            prev = block.block_hash();
            blocks.push(block);
        }

        Self { blocks }
    }

    pub(crate) fn hash(&self, height: i64) -> BlockHash {
        self.blocks[height as usize].block_hash()
    }

    pub(crate) fn position(&self, height: i64) -> Position {
        Position::from_parts(height, self.hash(height))
    }
}

#[derive(Debug, Default)]
struct OracleInner {
    hashes: Vec<BlockHash>,
    fork_point: Option<Position>,
}

/// Header oracle over a [`TestChain`], with branch swapping for reorg tests.
#[derive(Debug, Default)]
pub(crate) struct MockOracle {
    inner: Mutex<OracleInner>,
}

impl MockOracle {
    pub(crate) fn from_chain(chain: &TestChain) -> Self {
        Self {
            inner: Mutex::new(OracleInner {
                hashes: chain.blocks.iter().map(|block| block.block_hash()).collect(),
                fork_point: None,
            }),
        }
    }

    /// Switches the best chain to `chain`, remembering the fork point as the
    /// common parent for positions on the abandoned branch.
    pub(crate) fn adopt(&self, chain: &TestChain, fork_height: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.hashes = chain.blocks.iter().map(|block| block.block_hash()).collect();
        inner.fork_point = Some(chain.position(fork_height));
    }
}

impl HeaderOracle for MockOracle {
    fn best_hash(&self, height: i64) -> Option<BlockHash> {
        if height < 0 {
            return None;
        }
        self.inner.lock().unwrap().hashes.get(height as usize).copied()
    }

    fn best_tip(&self) -> Position {
        let inner = self.inner.lock().unwrap();
        let tip = inner.hashes.last().expect("oracle chain is empty");
        Position::from_parts(inner.hashes.len() as i64 - 1, *tip)
    }

    fn common_parent(&self, position: &Position) -> Position {
        let inner = self.inner.lock().unwrap();
        let on_best = inner.hashes.get(position.height() as usize) == Some(&position.hash());
        if on_best {
            return *position;
        }

        inner
            .fork_point
            .unwrap_or_else(|| Position::from_parts(0, inner.hashes[0]))
    }

    fn is_in_best_chain(&self, position: &Position) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.hashes.get(position.height() as usize) == Some(&position.hash())
    }
}

#[derive(Debug, Default)]
struct StorageInner {
    filters: HashMap<(FilterType, BlockHash), Vec<u8>>,
    headers: HashMap<(FilterType, BlockHash), FilterHeader>,
    filter_tips: HashMap<FilterType, Position>,
    output_scripts: HashMap<OutPoint, ScriptBuf>,
    last_scanned: HashMap<SubchainKey, Option<Position>>,
    confirmed: HashMap<SubchainKey, HashMap<i64, Vec<ConfirmedTransaction>>>,
    mempool: HashMap<SubchainKey, Vec<ConfirmedTransaction>>,
    last_indexed: HashMap<SubchainKey, u32>,
}

/// Fully in-memory [`SyncStorage`].
#[derive(Debug, Default)]
pub(crate) struct MemoryStorage {
    inner: Mutex<StorageInner>,
}

impl MemoryStorage {
    pub(crate) fn insert_pair(&self, filter_type: FilterType, hash: BlockHash, header: FilterHeader) {
        let mut inner = self.inner.lock().unwrap();
        inner.filters.insert((filter_type, hash), vec![0]);
        inner.headers.insert((filter_type, hash), header);
    }

    pub(crate) fn insert_header_only(
        &self,
        filter_type: FilterType,
        hash: BlockHash,
        header: FilterHeader,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.headers.insert((filter_type, hash), header);
    }

    pub(crate) fn remove_filter(&self, filter_type: FilterType, hash: &BlockHash) {
        let mut inner = self.inner.lock().unwrap();
        inner.filters.remove(&(filter_type, *hash));
    }

    pub(crate) fn confirmed_count(&self, key: &SubchainKey, position: &Position) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .confirmed
            .get(key)
            .and_then(|by_height| by_height.get(&position.height()))
            .map_or(0, Vec::len)
    }

    pub(crate) fn mempool_count(&self, key: &SubchainKey) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.mempool.get(key).map_or(0, Vec::len)
    }
}

impl SyncStorage for MemoryStorage {
    fn load_filter(
        &self,
        filter_type: FilterType,
        hash: &BlockHash,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .filters
            .get(&(filter_type, *hash))
            .cloned())
    }

    fn load_filter_header(
        &self,
        filter_type: FilterType,
        hash: &BlockHash,
    ) -> Result<Option<FilterHeader>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .headers
            .get(&(filter_type, *hash))
            .copied())
    }

    fn store_filters(
        &self,
        filter_type: FilterType,
        tip: &Position,
        headers: &[(BlockHash, FilterHeader)],
        filters: &[(BlockHash, Vec<u8>)],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        for (hash, header) in headers {
            inner.headers.insert((filter_type, *hash), *header);
        }
        for (hash, filter) in filters {
            inner.filters.insert((filter_type, *hash), filter.clone());
        }
        inner.filter_tips.insert(filter_type, *tip);

        Ok(())
    }

    fn filter_tip(&self, filter_type: FilterType) -> Result<Option<Position>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .filter_tips
            .get(&filter_type)
            .copied())
    }

    fn load_output_script(&self, outpoint: &OutPoint) -> Result<Option<ScriptBuf>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .output_scripts
            .get(outpoint)
            .cloned())
    }

    fn last_scanned(&self, key: &SubchainKey) -> Result<Option<Position>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .last_scanned
            .get(key)
            .copied()
            .flatten())
    }

    fn set_last_scanned(
        &self,
        key: &SubchainKey,
        position: Option<&Position>,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .last_scanned
            .insert(key.clone(), position.copied());

        Ok(())
    }

    fn add_confirmed_transactions(
        &self,
        key: &SubchainKey,
        position: &Position,
        transactions: &[ConfirmedTransaction],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .confirmed
            .entry(key.clone())
            .or_default()
            .entry(position.height())
            .or_default();
        for transaction in transactions {
            if !stored.iter().any(|known| known.txid() == transaction.txid()) {
                stored.push(transaction.clone());
            }
        }

        Ok(())
    }

    fn add_mempool_transaction(
        &self,
        key: &SubchainKey,
        transaction: &ConfirmedTransaction,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .mempool
            .entry(key.clone())
            .or_default()
            .push(transaction.clone());

        Ok(())
    }

    fn last_indexed(&self, key: &SubchainKey) -> Result<Option<u32>, StorageError> {
        Ok(self.inner.lock().unwrap().last_indexed.get(key).copied())
    }

    fn add_elements(&self, key: &SubchainKey, elements: &[KeyElement]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let watermark = inner.last_indexed.entry(key.clone()).or_insert(0);
        for element in elements {
            *watermark = (*watermark).max(element.index());
        }

        Ok(())
    }
}

/// Computes and stores real BIP-158 filters and chained headers for every
/// block of a chain.
pub(crate) fn index_all_filters(storage: &MemoryStorage, chain: &TestChain) {
    let mut previous_header = FilterHeader::all_zeros();
    let mut tip = None;

    for (height, block) in chain.blocks.iter().enumerate() {
        let filter = BlockFilter::new_script_filter(
            block,
            |outpoint| -> Result<ScriptBuf, bitcoin::bip158::Error> {
                Err(bitcoin::bip158::Error::UtxoMissing(*outpoint))
            },
        )
        .expect("synthetic blocks never spend");
        let header = filter.filter_header(&previous_header);
        let hash = block.block_hash();

        let mut inner = storage.inner.lock().unwrap();
        inner
            .filters
            .insert((FilterType::Basic, hash), filter.content.clone());
        inner.headers.insert((FilterType::Basic, hash), header);
        drop(inner);

        previous_header = header;
        tip = Some(Position::from_parts(height as i64, hash));
    }

    if let Some(tip) = tip {
        storage
            .inner
            .lock()
            .unwrap()
            .filter_tips
            .insert(FilterType::Basic, tip);
    }
}

/// Block supplier serving a fixed set of blocks; anything else resolves as a
/// shutdown response.
#[derive(Debug)]
pub(crate) struct ScriptedSource {
    by_hash: HashMap<BlockHash, Block>,
    tip: Position,
}

impl ScriptedSource {
    pub(crate) fn new(blocks: Vec<Block>) -> Self {
        let tip = blocks
            .last()
            .map(|block| Position::from_parts(blocks.len() as i64 - 1, block.block_hash()))
            .unwrap_or_else(|| Position::from_parts(0, BlockHash::all_zeros()));

        Self {
            by_hash: blocks
                .into_iter()
                .map(|block| (block.block_hash(), block))
                .collect(),
            tip,
        }
    }
}

impl BlockSource for ScriptedSource {
    fn block(&mut self, hash: BlockHash) -> impl Future<Output = BlockResponse> + Send {
        let response = match self.by_hash.get(&hash) {
            Some(block) => BlockResponse::Block(Box::new(block.clone())),
            None => BlockResponse::ShuttingDown,
        };
        async move { response }
    }

    fn tip(&mut self) -> impl Future<Output = Position> + Send {
        let tip = self.tip;
        async move { tip }
    }
}

/// Wallet with a fixed element list shared by every subchain kind.
#[derive(Debug, Default)]
pub(crate) struct MemoryWallet {
    elements: Vec<KeyElement>,
}

impl MemoryWallet {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn with_elements(elements: Vec<KeyElement>) -> Self {
        Self { elements }
    }
}

impl WalletSubaccount for MemoryWallet {
    fn last_generated(&self, _subchain: SubchainKind) -> Option<u32> {
        self.elements.iter().map(KeyElement::index).max()
    }

    fn balance_element(&self, _subchain: SubchainKind, index: u32) -> Option<KeyElement> {
        self.elements
            .iter()
            .find(|element| element.index() == index)
            .cloned()
    }
}
