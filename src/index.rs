//! Vector index and passage metadata, persisted as a pair.
//!
//! The store keeps three files under the data directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `index.bin` | flat inner-product index: header, `count × dims` f32 rows, SHA-256 trailer |
//! | `metadata.json` | JSON array of [`Passage`] records, row `i` describes vector `i` |
//! | `manifest.json` | `{version, dims, count, generation}` of the last complete write |
//!
//! Every `add` and `search` runs under one lock, so the vector rows and the
//! metadata rows can never interleave across writers and a reader always sees
//! a complete state. Files are replaced by write-to-temp + rename, index
//! first and manifest last; a crash between the renames leaves counts that
//! disagree, which the next load reports as [`RagError::Corrupt`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DataConfig;
use crate::embedding::dot;
use crate::error::{RagError, Result};
use crate::mirror::Mirror;
use crate::models::{NewPassage, Passage, ScoredPassage};

const INDEX_MAGIC: &[u8; 4] = b"DQIX";
const INDEX_VERSION: u32 = 1;
const MANIFEST_VERSION: u32 = 1;
/// magic + version + dims + count
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const DIGEST_LEN: usize = 32;

/// Id reported for result slots the index could not fill.
pub const NO_MATCH: i64 = -1;

const INDEX_FILE: &str = "index.bin";
const METADATA_FILE: &str = "metadata.json";
const MANIFEST_FILE: &str = "manifest.json";

// ============ Flat index ============

/// Exhaustive inner-product index over fixed-dimension vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dims: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn count(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dims..(i + 1) * self.dims]
    }

    /// Append rows. The whole batch is checked before anything is appended.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: bad.len(),
            });
        }
        self.data.reserve(vectors.len() * self.dims);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    /// The `k` best rows by inner product, best first.
    ///
    /// Always returns `k` slots; when the index holds fewer than `k` rows the
    /// tail is padded with `(f32::NEG_INFINITY, NO_MATCH)`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(f32, i64)>> {
        if query.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        let mut scored: Vec<(f32, i64)> = (0..self.count())
            .map(|i| (dot(self.row(i), query), i as i64))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);
        scored.resize(k, (f32::NEG_INFINITY, NO_MATCH));
        Ok(scored)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 4 + DIGEST_LEN);
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.dims as u32).to_le_bytes());
        out.extend_from_slice(&(self.count() as u64).to_le_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + DIGEST_LEN || &bytes[..4] != INDEX_MAGIC {
            return Err(RagError::Corrupt("index file has no valid header".to_string()));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(RagError::Corrupt("index file checksum mismatch".to_string()));
        }

        let version = u32::from_le_bytes(read_array(&body[4..8]));
        if version != INDEX_VERSION {
            return Err(RagError::Corrupt(format!(
                "unsupported index version {}",
                version
            )));
        }
        let dims = u32::from_le_bytes(read_array(&body[8..12])) as usize;
        let count = u64::from_le_bytes(read_array(&body[12..20])) as usize;

        let payload = &body[HEADER_LEN..];
        if payload.len() != count * dims * 4 {
            return Err(RagError::Corrupt(format!(
                "index header declares {} x {} floats but payload has {} bytes",
                count,
                dims,
                payload.len()
            )));
        }
        let data = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(read_array(c)))
            .collect();
        Ok(Self { dims, data })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

// ============ Manifest ============

/// Summary of the last complete write, stored next to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    pub dims: usize,
    pub count: usize,
    /// Incremented on every successful `add`.
    pub generation: u64,
}

/// Counts reported by [`IndexStore::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub passages: usize,
    pub documents: usize,
    pub dims: Option<usize>,
    pub generation: u64,
}

// ============ Store ============

/// The paired vector index and metadata sequence, guarded by one lock.
pub struct IndexStore {
    index_path: PathBuf,
    metadata_path: PathBuf,
    manifest_path: PathBuf,
    lock: Mutex<()>,
    mirror: Option<Arc<dyn Mirror>>,
    restore_attempted: AtomicBool,
    uploads: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Generation of the last complete upload. Held across an upload.
    mirrored: Arc<Mutex<u64>>,
}

struct Loaded {
    index: Option<FlatIndex>,
    metadata: Vec<Passage>,
    generation: u64,
}

impl IndexStore {
    pub fn new(data: &DataConfig) -> Self {
        Self {
            index_path: data.index_path(),
            metadata_path: data.metadata_path(),
            manifest_path: data.manifest_path(),
            lock: Mutex::new(()),
            mirror: None,
            restore_attempted: AtomicBool::new(false),
            uploads: std::sync::Mutex::new(Vec::new()),
            mirrored: Arc::new(Mutex::new(0)),
        }
    }

    /// Attach a remote mirror that receives a copy of every write.
    pub fn with_mirror(mut self, mirror: Arc<dyn Mirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Append passages and their vectors.
    ///
    /// Ids continue from the current metadata length. Both files are on disk
    /// before this returns. A vector whose length disagrees with the index
    /// rejects the whole batch and leaves the store untouched.
    pub async fn add(&self, passages: &[NewPassage], vectors: &[Vec<f32>]) -> Result<Vec<Passage>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        if passages.len() != vectors.len() {
            return Err(RagError::InvalidInput(format!(
                "{} passages but {} vectors",
                passages.len(),
                vectors.len()
            )));
        }

        let guard = self.lock.lock().await;
        self.restore_from_mirror().await;

        let Loaded {
            index,
            mut metadata,
            generation,
        } = self.load()?;
        let mut index = index.unwrap_or_else(|| FlatIndex::new(vectors[0].len()));
        index.add(vectors)?;

        let start_id = metadata.len() as u64;
        let added: Vec<Passage> = passages
            .iter()
            .enumerate()
            .map(|(i, p)| Passage {
                id: start_id + i as u64,
                doc_id: p.doc_id.clone(),
                source: p.source.clone(),
                text: p.text.clone(),
            })
            .collect();
        metadata.extend(added.iter().cloned());

        let manifest = IndexManifest {
            version: MANIFEST_VERSION,
            dims: index.dims(),
            count: index.count(),
            generation: generation + 1,
        };
        let files = [
            (INDEX_FILE, index.to_bytes()),
            (METADATA_FILE, serde_json::to_vec_pretty(&metadata)?),
            (MANIFEST_FILE, serde_json::to_vec_pretty(&manifest)?),
        ];
        for (name, bytes) in &files {
            write_atomic(&self.path_for(name), bytes)?;
        }
        self.push_to_mirror(manifest.generation, files);
        drop(guard);

        debug!(
            added = added.len(),
            total = manifest.count,
            generation = manifest.generation,
            "index updated"
        );
        Ok(added)
    }

    /// The `k` passages most similar to `query`, best first.
    ///
    /// Returns an empty list without reading the index file when no passage
    /// has been stored yet.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredPassage>> {
        let _guard = self.lock.lock().await;
        self.restore_from_mirror().await;

        let metadata = read_metadata(&self.metadata_path)?;
        if metadata.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let loaded = self.load_index_for(metadata)?;
        let index = match loaded.index {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };

        let hits = index.search(query, k)?;
        Ok(hits
            .into_iter()
            .filter(|(_, id)| *id != NO_MATCH)
            .filter_map(|(score, id)| {
                loaded
                    .metadata
                    .get(id as usize)
                    .map(|p| ScoredPassage {
                        score,
                        passage: p.clone(),
                    })
            })
            .collect())
    }

    /// Current sizes of the index and metadata.
    pub async fn stats(&self) -> Result<IndexStats> {
        let _guard = self.lock.lock().await;
        let loaded = self.load()?;
        let documents = loaded
            .metadata
            .iter()
            .map(|p| p.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        Ok(IndexStats {
            vectors: loaded.index.as_ref().map(|i| i.count()).unwrap_or(0),
            passages: loaded.metadata.len(),
            documents,
            dims: loaded.index.as_ref().map(|i| i.dims()),
            generation: loaded.generation,
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        match name {
            INDEX_FILE => self.index_path.clone(),
            METADATA_FILE => self.metadata_path.clone(),
            _ => self.manifest_path.clone(),
        }
    }

    fn load(&self) -> Result<Loaded> {
        let metadata = read_metadata(&self.metadata_path)?;
        self.load_index_for(metadata)
    }

    /// Load the index and check it against already-read metadata.
    fn load_index_for(&self, metadata: Vec<Passage>) -> Result<Loaded> {
        let index = if self.index_path.exists() {
            Some(FlatIndex::from_bytes(&std::fs::read(&self.index_path)?)?)
        } else {
            None
        };

        let manifest: Option<IndexManifest> = if self.manifest_path.exists() {
            Some(serde_json::from_slice(&std::fs::read(&self.manifest_path)?)?)
        } else {
            None
        };

        check_consistent(index.as_ref(), metadata.len(), manifest.as_ref())?;

        Ok(Loaded {
            index,
            metadata,
            generation: manifest.map(|m| m.generation).unwrap_or(0),
        })
    }

    /// Pull the index files from the mirror once, if none exist locally.
    ///
    /// The remote copy is written only when all three files are present and
    /// agree with each other. Anything else leaves the store empty.
    async fn restore_from_mirror(&self) {
        let mirror = match self.mirror {
            Some(ref m) => m,
            None => return,
        };
        if self.restore_attempted.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.index_path.exists() || self.metadata_path.exists() {
            return;
        }

        let mut downloaded = Vec::new();
        for name in [INDEX_FILE, METADATA_FILE, MANIFEST_FILE] {
            match mirror.download(name).await {
                Ok(Some(bytes)) => downloaded.push((name, bytes)),
                Ok(None) => {}
                Err(e) => {
                    warn!(mirror = %mirror.describe(), file = name, error = %e, "mirror download failed");
                    return;
                }
            }
        }
        if downloaded.is_empty() {
            return;
        }
        if downloaded.len() != 3 {
            warn!(
                mirror = %mirror.describe(),
                files = downloaded.len(),
                "mirror copy is incomplete, starting with an empty index"
            );
            return;
        }

        let manifest = match validate_remote_copy(
            &downloaded[0].1,
            &downloaded[1].1,
            &downloaded[2].1,
        ) {
            Ok(m) => m,
            Err(e) => {
                warn!(mirror = %mirror.describe(), error = %e, "mirror copy is inconsistent, starting with an empty index");
                return;
            }
        };

        for (name, bytes) in &downloaded {
            if let Err(e) = write_atomic(&self.path_for(name), bytes) {
                warn!(file = name, error = %e, "failed to write restored file");
                for (name, _) in &downloaded {
                    let _ = std::fs::remove_file(self.path_for(name));
                }
                return;
            }
        }
        info!(
            mirror = %mirror.describe(),
            passages = manifest.count,
            generation = manifest.generation,
            "restored index from mirror"
        );
    }

    /// Upload the freshly written files without blocking the caller.
    ///
    /// Uploads run one at a time. A write older than the last complete upload
    /// is skipped, and the first failed file ends that write's upload.
    fn push_to_mirror(&self, generation: u64, files: [(&'static str, Vec<u8>); 3]) {
        let mirror = match self.mirror {
            Some(ref m) => m.clone(),
            None => return,
        };
        let mirrored = self.mirrored.clone();
        let handle = tokio::spawn(async move {
            let mut last = mirrored.lock().await;
            if generation <= *last {
                debug!(generation, last = *last, "skipping stale mirror upload");
                return;
            }
            for (name, bytes) in files {
                if let Err(e) = mirror.upload(name, bytes).await {
                    warn!(mirror = %mirror.describe(), file = name, generation, error = %e, "mirror upload failed");
                    return;
                }
            }
            *last = generation;
        });
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        uploads.retain(|h| !h.is_finished());
        uploads.push(handle);
    }

    /// Wait for mirror uploads started by earlier `add` calls.
    ///
    /// Short-lived processes call this before exiting so the runtime does not
    /// drop uploads that are still in flight.
    pub async fn wait_for_mirror(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
            uploads.drain(..).collect()
        };
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "mirror upload task failed");
            }
        }
    }
}

/// Vectors, passages and manifest must describe the same rows.
fn check_consistent(
    index: Option<&FlatIndex>,
    passages: usize,
    manifest: Option<&IndexManifest>,
) -> Result<()> {
    let vectors = index.map(|i| i.count()).unwrap_or(0);
    if vectors != passages {
        return Err(RagError::Corrupt(format!(
            "index holds {} vectors but metadata holds {} passages",
            vectors, passages
        )));
    }
    if let (Some(m), Some(i)) = (manifest, index) {
        if m.count != i.count() || m.dims != i.dims() {
            return Err(RagError::Corrupt(format!(
                "manifest (count {}, dims {}) disagrees with index (count {}, dims {})",
                m.count,
                m.dims,
                i.count(),
                i.dims()
            )));
        }
    }
    Ok(())
}

/// Parse a downloaded file set and check that its parts agree.
fn validate_remote_copy(index: &[u8], metadata: &[u8], manifest: &[u8]) -> Result<IndexManifest> {
    let index = FlatIndex::from_bytes(index)?;
    let metadata: Vec<Passage> = serde_json::from_slice(metadata)?;
    let manifest: IndexManifest = serde_json::from_slice(manifest)?;
    check_consistent(Some(&index), metadata.len(), Some(&manifest))?;
    Ok(manifest)
}

fn read_metadata(path: &Path) -> Result<Vec<Passage>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
