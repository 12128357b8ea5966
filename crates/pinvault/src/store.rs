//! hash tree store - durable, integrity checked leaf storage
//!
//! on-disk layout of one store directory:
//!
//! ```text
//! <dir>/root            root record: geometry, root hash, counter, pending write
//! <dir>/hashcache       every node hash of the tree, leaf level first
//! <dir>/leaves/<n>.leaf fixed-size record for provisioned label n
//! ```
//!
//! a write goes: journal the label's previous leaf hash in the root record,
//! replace the leaf file, write the changed path into the hashcache, bump
//! the anti-replay counter, commit the new root. a crash anywhere in between
//! leaves the previous root committed; on reopen the journal restores the
//! label's previous hash, so only that label fails verification while every
//! other label still checks out against the committed root.
//!
//! the root record is authenticated with a key derived from the caller's
//! root key, so a restored snapshot cannot be relabelled with the current
//! counter value. the hashcache is only a cache: if its leaf level no longer
//! reproduces the committed root, the leaf level is recomputed from the
//! leaf files and the hashcache rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::counter::MonotonicCounter;
use crate::crypto::{ct_eq, derive_key, mac, sha256, Hash};
use crate::encoding;
use crate::error::{HashTreeError, HashTreeResult};
use crate::tree::{HashTree, InclusionProof, TreeGeometry, EMPTY_HASH};

/// size of every leaf record on disk
pub const LEAF_SIZE: usize = 2048;

const LEAF_MAGIC: &[u8; 4] = b"PVLF";
const LEAF_VERSION: u8 = 1;
const LEAF_HEADER_LEN: usize = 4 + 1 + 3 + 8 + 4 + 32;

/// largest payload a leaf record can carry
pub const MAX_LEAF_PAYLOAD: usize = LEAF_SIZE - LEAF_HEADER_LEN;

const ROOT_FILE: &str = "root";
const HASHCACHE_FILE: &str = "hashcache";
const LEAVES_DIR: &str = "leaves";
const ROOT_VERSION: u32 = 1;
const ROOT_MAC_INFO: &[u8] = b"hash-tree-root";
const ROOT_MAC_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootRecord {
    version: u32,
    geometry: TreeGeometry,
    root: Hash,
    counter: u64,
    pending: Option<PendingWrite>,
}

/// label being rewritten and the leaf hash it had under the committed root
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PendingWrite {
    label: u64,
    prev_leaf_hash: Hash,
}

/// a verified leaf and its path to the committed root
#[derive(Debug, Clone)]
pub struct LoadedLeaf {
    pub payload: Vec<u8>,
    pub proof: InclusionProof,
}

pub struct HashTreeStore {
    dir: PathBuf,
    tree: HashTree,
    counter: Box<dyn MonotonicCounter>,
    committed_counter: u64,
    root_mac_key: Zeroizing<[u8; 32]>,
    /// set when a write failed halfway; the store must be reopened
    poisoned: bool,
}

impl std::fmt::Debug for HashTreeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTreeStore")
            .field("dir", &self.dir)
            .field("geometry", self.tree.geometry())
            .field("committed_counter", &self.committed_counter)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl HashTreeStore {
    /// open the store in `dir`, creating an empty tree if the directory is new
    ///
    /// `root_key` authenticates the root record. it has to stay out of reach
    /// of whoever can write the store directory, or rollback detection is
    /// only as strong as the filesystem permissions.
    pub fn open(
        dir: impl AsRef<Path>,
        geometry: TreeGeometry,
        counter: impl MonotonicCounter + 'static,
        root_key: &[u8; 32],
    ) -> HashTreeResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(LEAVES_DIR))?;
        let counter: Box<dyn MonotonicCounter> = Box::new(counter);
        let root_mac_key = derive_key(root_key, b"pinvault", ROOT_MAC_INFO);

        let root_path = dir.join(ROOT_FILE);
        if !root_path.exists() {
            if fs::read_dir(dir.join(LEAVES_DIR))?.next().is_some() {
                return Err(HashTreeError::TreeCorrupted("leaves present without a root record".into()));
            }
            return Self::init(dir, geometry, counter, root_mac_key);
        }

        let record = read_root_record(&root_path, &root_mac_key)?;
        if record.version != ROOT_VERSION {
            return Err(HashTreeError::TreeCorrupted(format!(
                "unsupported root record version {}",
                record.version
            )));
        }
        if record.geometry != geometry {
            return Err(HashTreeError::InvalidGeometry(format!(
                "store was created with {:?}, opened with {:?}",
                record.geometry, geometry
            )));
        }

        let current = counter.read()?;
        let allowed = if record.pending.is_some() { record.counter + 1 } else { record.counter };
        if current > allowed {
            return Err(HashTreeError::Rollback { root: record.counter, counter: current });
        }
        if current < record.counter {
            return Err(HashTreeError::TreeCorrupted(format!(
                "anti-replay counter {} behind committed root counter {}",
                current, record.counter
            )));
        }

        if let Some(pending) = record.pending {
            if !geometry.contains(pending.label) {
                return Err(HashTreeError::TreeCorrupted("pending write names an invalid label".into()));
            }
        }
        let with_pending = |leaves: Vec<Hash>| {
            let mut tree = HashTree::from_leaf_hashes(geometry, &leaves);
            if let Some(pending) = record.pending {
                tree.set_leaf(pending.label, pending.prev_leaf_hash);
            }
            tree
        };

        let cached = match read_hashcache(&dir.join(HASHCACHE_FILE), &geometry) {
            Ok(nodes) => {
                let tree = with_pending(nodes[..geometry.level_len(0)].to_vec());
                let stale = tree.nodes() != nodes.as_slice();
                Some((tree, stale))
            }
            Err(e) => {
                warn!(error = %e, "hashcache unreadable");
                None
            }
        };
        let (tree, rewrite_cache) = match cached.filter(|(t, _)| t.root() == record.root) {
            Some((tree, stale)) => (tree, stale),
            None => {
                let tree = with_pending(hash_leaf_files(&dir.join(LEAVES_DIR), &geometry)?);
                if tree.root() != record.root {
                    return Err(HashTreeError::TreeCorrupted(
                        "recomputed root does not match committed root".into(),
                    ));
                }
                warn!("hashcache out of step with the committed root, rebuilt from leaf files");
                (tree, true)
            }
        };

        let mut store = Self {
            dir,
            tree,
            counter,
            committed_counter: record.counter,
            root_mac_key,
            poisoned: false,
        };

        if let Some(pending) = record.pending {
            warn!(label = pending.label, "recovering from interrupted hash tree write");
            store.write_hashcache_full()?;
            store.committed_counter = current;
            store.write_root(None)?;
        } else if rewrite_cache {
            store.write_hashcache_full()?;
        }

        info!(
            dir = %store.dir.display(),
            leaves = store.provisioned_labels().len(),
            "opened hash tree store"
        );
        Ok(store)
    }

    fn init(
        dir: PathBuf,
        geometry: TreeGeometry,
        counter: Box<dyn MonotonicCounter>,
        root_mac_key: Zeroizing<[u8; 32]>,
    ) -> HashTreeResult<Self> {
        let committed_counter = counter.read()?;
        let store = Self {
            dir,
            tree: HashTree::empty(geometry),
            counter,
            committed_counter,
            root_mac_key,
            poisoned: false,
        };
        store.write_hashcache_full()?;
        store.write_root(None)?;
        info!(dir = %store.dir.display(), leaves = geometry.num_leaves(), "created hash tree store");
        Ok(store)
    }

    pub fn geometry(&self) -> &TreeGeometry {
        self.tree.geometry()
    }

    /// currently committed root hash
    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    pub fn is_free(&self, label: u64) -> bool {
        self.tree.geometry().contains(label) && self.tree.leaf_hash(label) == EMPTY_HASH
    }

    /// lowest free label, if any
    pub fn first_free_label(&self) -> Option<u64> {
        self.tree
            .leaf_hashes()
            .iter()
            .position(|h| *h == EMPTY_HASH)
            .map(|i| i as u64)
    }

    pub fn provisioned_labels(&self) -> Vec<u64> {
        self.tree
            .leaf_hashes()
            .iter()
            .enumerate()
            .filter(|(_, h)| **h != EMPTY_HASH)
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// read and verify the leaf for `label`
    pub fn load(&self, label: u64) -> HashTreeResult<LoadedLeaf> {
        self.check_usable()?;
        self.check_label(label)?;

        let expected = self.tree.leaf_hash(label);
        let path = self.leaf_path(label);
        if expected == EMPTY_HASH {
            if path.exists() {
                warn!(label, "leaf file present for a free label");
                return Err(HashTreeError::Corrupted(label));
            }
            return Err(HashTreeError::NotFound(label));
        }

        let record = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(label, "leaf file missing for a provisioned label");
                return Err(HashTreeError::Corrupted(label));
            }
            Err(e) => return Err(e.into()),
        };

        if record.len() != LEAF_SIZE || sha256(&[&record]) != expected {
            warn!(label, "leaf does not match the committed tree");
            return Err(HashTreeError::Corrupted(label));
        }
        let payload = decode_leaf_record(label, &record).ok_or(HashTreeError::Corrupted(label))?;

        let proof = self.tree.proof(label);
        if !proof.verify(&expected, &self.tree.root()) {
            return Err(HashTreeError::Corrupted(label));
        }

        Ok(LoadedLeaf { payload, proof })
    }

    /// write `payload` as the leaf for `label`
    pub fn store(&mut self, label: u64, payload: &[u8]) -> HashTreeResult<()> {
        self.check_usable()?;
        self.check_label(label)?;
        let record = encode_leaf_record(label, payload)?;
        self.commit(label, Some(record))?;
        debug!(label, "stored leaf");
        Ok(())
    }

    /// erase the leaf for `label` and mark it free
    ///
    /// also accepted for a label that fails verification, so it can be
    /// reclaimed.
    pub fn remove(&mut self, label: u64) -> HashTreeResult<()> {
        self.check_usable()?;
        self.check_label(label)?;
        if self.is_free(label) && !self.leaf_path(label).exists() {
            return Err(HashTreeError::NotFound(label));
        }
        self.commit(label, None)?;
        debug!(label, "removed leaf");
        Ok(())
    }

    fn commit(&mut self, label: u64, record: Option<Vec<u8>>) -> HashTreeResult<()> {
        let prev_leaf_hash = self.tree.leaf_hash(label);
        let new_leaf_hash = record.as_ref().map(|r| sha256(&[r])).unwrap_or(EMPTY_HASH);

        self.write_root(Some(PendingWrite { label, prev_leaf_hash }))?;

        let result = self.commit_inner(label, record.as_deref(), new_leaf_hash);
        if let Err(e) = &result {
            warn!(label, error = %e, "hash tree write failed, store needs reopening");
            self.poisoned = true;
        }
        result
    }

    fn commit_inner(&mut self, label: u64, record: Option<&[u8]>, new_leaf_hash: Hash) -> HashTreeResult<()> {
        let path = self.leaf_path(label);
        match record {
            Some(bytes) => atomic_write(&path, bytes)?,
            None => match fs::remove_file(&path) {
                Ok(()) => sync_dir(&self.dir.join(LEAVES_DIR))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }

        let touched = self.tree.set_leaf(label, new_leaf_hash);
        self.write_hashcache_nodes(&touched)?;

        self.committed_counter = self.counter.increment()?;
        self.write_root(None)
    }

    fn check_usable(&self) -> HashTreeResult<()> {
        if self.poisoned {
            return Err(HashTreeError::TreeCorrupted("a previous write failed; reopen the store".into()));
        }
        Ok(())
    }

    fn check_label(&self, label: u64) -> HashTreeResult<()> {
        if !self.tree.geometry().contains(label) {
            return Err(HashTreeError::InvalidLabel(label));
        }
        Ok(())
    }

    fn leaf_path(&self, label: u64) -> PathBuf {
        self.dir.join(LEAVES_DIR).join(format!("{}.leaf", label))
    }

    fn write_root(&self, pending: Option<PendingWrite>) -> HashTreeResult<()> {
        let record = RootRecord {
            version: ROOT_VERSION,
            geometry: *self.tree.geometry(),
            root: self.tree.root(),
            counter: self.committed_counter,
            pending,
        };
        let mut bytes = encoding::encode(&record)
            .ok_or_else(|| HashTreeError::TreeCorrupted("failed to encode root record".into()))?;
        let tag = mac(self.root_mac_key.as_slice(), &[&bytes]);
        bytes.extend_from_slice(&tag);
        atomic_write(&self.dir.join(ROOT_FILE), &bytes)
    }

    fn write_hashcache_full(&self) -> HashTreeResult<()> {
        let bytes: Vec<u8> = self.tree.nodes().iter().flatten().copied().collect();
        atomic_write(&self.dir.join(HASHCACHE_FILE), &bytes)
    }

    fn write_hashcache_nodes(&self, indices: &[usize]) -> HashTreeResult<()> {
        let mut f = OpenOptions::new().write(true).open(self.dir.join(HASHCACHE_FILE))?;
        for &i in indices {
            f.seek(SeekFrom::Start((i * 32) as u64))?;
            f.write_all(&self.tree.nodes()[i])?;
        }
        f.sync_all()?;
        Ok(())
    }
}

fn read_root_record(path: &Path, mac_key: &[u8; 32]) -> HashTreeResult<RootRecord> {
    let bytes = fs::read(path)?;
    if bytes.len() < ROOT_MAC_LEN {
        return Err(HashTreeError::TreeCorrupted("root record truncated".into()));
    }
    let (body, tag) = bytes.split_at(bytes.len() - ROOT_MAC_LEN);
    if !ct_eq(&mac(mac_key, &[body]), tag) {
        return Err(HashTreeError::TreeCorrupted("root record failed authentication".into()));
    }
    encoding::decode(body).ok_or_else(|| HashTreeError::TreeCorrupted("root record undecodable".into()))
}

/// every node hash in the hashcache, leaf level first
fn read_hashcache(path: &Path, geometry: &TreeGeometry) -> HashTreeResult<Vec<Hash>> {
    let mut f = File::open(path)?;
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes)?;
    if bytes.len() != geometry.total_nodes() * 32 {
        return Err(HashTreeError::TreeCorrupted("hashcache has wrong size".into()));
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|c| {
            let mut h = [0u8; 32];
            h.copy_from_slice(c);
            h
        })
        .collect())
}

/// leaf level recomputed from the leaf files themselves
fn hash_leaf_files(leaves_dir: &Path, geometry: &TreeGeometry) -> HashTreeResult<Vec<Hash>> {
    let mut leaves = vec![EMPTY_HASH; geometry.level_len(0)];
    for entry in fs::read_dir(leaves_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(label) = name
            .to_str()
            .and_then(|n| n.strip_suffix(".leaf"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        if !geometry.contains(label) {
            warn!(label, "leaf file outside the tree");
            continue;
        }
        leaves[label as usize] = sha256(&[&fs::read(entry.path())?]);
    }
    Ok(leaves)
}

fn encode_leaf_record(label: u64, payload: &[u8]) -> HashTreeResult<Vec<u8>> {
    if payload.len() > MAX_LEAF_PAYLOAD {
        return Err(HashTreeError::LeafTooLarge { len: payload.len(), max: MAX_LEAF_PAYLOAD });
    }
    let mut record = Vec::with_capacity(LEAF_SIZE);
    record.extend_from_slice(LEAF_MAGIC);
    record.push(LEAF_VERSION);
    record.extend_from_slice(&[0u8; 3]);
    record.extend_from_slice(&label.to_le_bytes());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&sha256(&[payload]));
    record.extend_from_slice(payload);
    record.resize(LEAF_SIZE, 0);
    Ok(record)
}

fn decode_leaf_record(label: u64, record: &[u8]) -> Option<Vec<u8>> {
    if record.len() != LEAF_SIZE || &record[..4] != LEAF_MAGIC || record[4] != LEAF_VERSION {
        return None;
    }
    if record[5..8] != [0u8; 3] {
        return None;
    }
    let stored_label = u64::from_le_bytes(record[8..16].try_into().ok()?);
    if stored_label != label {
        return None;
    }
    let len = u32::from_le_bytes(record[16..20].try_into().ok()?) as usize;
    if len > MAX_LEAF_PAYLOAD {
        return None;
    }
    let cover = &record[20..LEAF_HEADER_LEN];
    let payload = &record[LEAF_HEADER_LEN..LEAF_HEADER_LEN + len];
    if sha256(&[payload]).as_slice() != cover {
        return None;
    }
    if record[LEAF_HEADER_LEN + len..].iter().any(|b| *b != 0) {
        return None;
    }
    Some(payload.to_vec())
}

/// write to a temp file, fsync, rename over `path`, fsync the directory
fn atomic_write(path: &Path, bytes: &[u8]) -> HashTreeResult<()> {
    let tmp = path.with_extension("tmp");
    let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> HashTreeResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
