//! Persistent storage of generated tiles so they don't have to be rebuilt on the next run.
//!
//! Records are content addressed: the key contains a hash of everything that went into building the tile, so a key
//! always maps to the same data & stale entries are simply never looked up again.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::{fs, io};

use bevy::prelude::{debug, error, info, warn};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    off_mesh_connections::OffMeshConnection, recast_mesh::RecastMesh, tiles::PreparedNavMeshData,
    AgentBounds, TileBuildParameters, TilePosition, NAV_MESH_FORMAT_VERSION,
};

const RECORD_MAGIC: [u8; 4] = *b"TNAV";
const RECORD_EXTENSION: &str = "navmesh";

#[derive(Debug, Error)]
pub enum NavMeshDbError {
    #[error("Nav-mesh database io error")]
    Io(#[from] io::Error),
    #[error("Failed to encode nav-mesh record")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode nav-mesh record")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Not a nav-mesh record")]
    BadMagic,
    #[error("Nav-mesh record has format version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("Nav-mesh record belongs to a different key")]
    KeyMismatch,
}

/// Key of a stored tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavMeshDbKey {
    pub worldspace: String,
    pub agent_bounds: AgentBounds,
    pub tile: [i32; 2],
    /// See [`compute_input_hash`].
    pub input_hash: [u8; 32],
}

impl NavMeshDbKey {
    pub fn new(
        worldspace: &str,
        agent_bounds: AgentBounds,
        tile: TilePosition,
        input_hash: [u8; 32],
    ) -> Self {
        Self {
            worldspace: worldspace.to_owned(),
            agent_bounds,
            tile: tile.to_array(),
            input_hash,
        }
    }

    /// Hex encoded SHA-256 of the key & the format version. Used as the storage name of the record.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(NAV_MESH_FORMAT_VERSION.to_le_bytes());
        hasher.update((self.worldspace.len() as u64).to_le_bytes());
        hasher.update(self.worldspace.as_bytes());
        hasher.update(self.agent_bounds.radius.to_bits().to_le_bytes());
        hasher.update(self.agent_bounds.half_height.to_bits().to_le_bytes());
        hasher.update(self.tile[0].to_le_bytes());
        hasher.update(self.tile[1].to_le_bytes());
        hasher.update(self.input_hash);

        to_hex(&hasher.finalize())
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // Writing to a String can't fail.
        let _ = write!(hex, "{byte:02x}");
    }

    hex
}

/// Hashes every input of a tile build.
pub fn compute_input_hash(
    recast_mesh: &RecastMesh,
    off_mesh_connections: &[OffMeshConnection],
    parameters: &TileBuildParameters,
) -> Result<[u8; 32], NavMeshDbError> {
    let bytes = bincode::serde::encode_to_vec(
        (recast_mesh, off_mesh_connections, parameters),
        bincode::config::standard(),
    )?;

    let mut hasher = Sha256::new();
    hasher.update(NAV_MESH_FORMAT_VERSION.to_le_bytes());
    hasher.update(bytes);

    Ok(hasher.finalize().into())
}

#[derive(Serialize, Deserialize)]
struct Record {
    key: NavMeshDbKey,
    data: PreparedNavMeshData,
}

/// Encodes a record: magic, format version & the gzip compressed bincode payload.
pub fn encode_record(
    key: &NavMeshDbKey,
    data: &PreparedNavMeshData,
) -> Result<Vec<u8>, NavMeshDbError> {
    #[derive(Serialize)]
    struct RecordRef<'a> {
        key: &'a NavMeshDbKey,
        data: &'a PreparedNavMeshData,
    }

    let payload =
        bincode::serde::encode_to_vec(RecordRef { key, data }, bincode::config::standard())?;

    let mut bytes = Vec::with_capacity(payload.len() / 2 + 8);
    bytes.extend_from_slice(&RECORD_MAGIC);
    bytes.extend_from_slice(&NAV_MESH_FORMAT_VERSION.to_le_bytes());

    let mut gz = GzEncoder::new(bytes, Compression::default());
    gz.write_all(&payload)?;

    Ok(gz.finish()?)
}

/// Decodes a record written by [`encode_record`] & verifies it belongs to ``key``.
pub fn decode_record(
    key: &NavMeshDbKey,
    bytes: &[u8],
) -> Result<PreparedNavMeshData, NavMeshDbError> {
    let Some((magic, rest)) = bytes.split_first_chunk::<4>() else {
        return Err(NavMeshDbError::BadMagic);
    };
    if *magic != RECORD_MAGIC {
        return Err(NavMeshDbError::BadMagic);
    }
    let Some((version, compressed)) = rest.split_first_chunk::<4>() else {
        return Err(NavMeshDbError::BadMagic);
    };
    let version = u32::from_le_bytes(*version);
    if version != NAV_MESH_FORMAT_VERSION {
        return Err(NavMeshDbError::VersionMismatch {
            found: version,
            expected: NAV_MESH_FORMAT_VERSION,
        });
    }

    let mut gz = GzDecoder::new(compressed);
    let mut payload = Vec::new();
    gz.read_to_end(&mut payload)?;

    let (record, _len): (Record, usize) =
        bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
    if record.key != *key {
        return Err(NavMeshDbError::KeyMismatch);
    }

    Ok(record.data)
}

/// Key-value storage of encoded tile records.
///
/// Reads happen concurrently from every worker thread, writes only ever from one thread.
pub trait NavMeshDb: Send + Sync {
    fn get(&self, key: &NavMeshDbKey) -> Result<Option<Vec<u8>>, NavMeshDbError>;

    fn put(&self, key: &NavMeshDbKey, bytes: &[u8]) -> Result<(), NavMeshDbError>;

    /// Total size of stored records in bytes.
    fn size(&self) -> u64;
}

/// Stores every record as a file named after the key digest.
pub struct FileNavMeshDb {
    root: PathBuf,
    size: AtomicU64,
}

impl FileNavMeshDb {
    /// Opens or creates a database in ``root``.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, NavMeshDbError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut size = 0;
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|extension| extension == RECORD_EXTENSION) {
                size += entry.metadata()?.len();
            } else if path.extension().is_some_and(|extension| extension == "tmp") {
                // Left over from an interrupted write.
                let _ = fs::remove_file(&path);
            }
        }

        info!(
            "Opened nav-mesh database at {} ({} bytes).",
            root.display(),
            size
        );

        Ok(Self {
            root,
            size: AtomicU64::new(size),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &NavMeshDbKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", key.digest(), RECORD_EXTENSION))
    }
}

impl NavMeshDb for FileNavMeshDb {
    fn get(&self, key: &NavMeshDbKey) -> Result<Option<Vec<u8>>, NavMeshDbError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn put(&self, key: &NavMeshDbKey, bytes: &[u8]) -> Result<(), NavMeshDbError> {
        let path = self.path(key);
        let previous_size = fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0);

        let temporary = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temporary)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Err(error) = fs::rename(&temporary, &path) {
            let _ = fs::remove_file(&temporary);
            return Err(error.into());
        }

        self.size.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        self.size.fetch_sub(previous_size, Ordering::AcqRel);

        Ok(())
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

/// Keeps records in memory. Useful for tests & tools.
#[derive(Default)]
pub struct MemoryNavMeshDb {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryNavMeshDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the stored bytes of ``key`` without any encoding.
    pub fn put_raw(&self, key: &NavMeshDbKey, bytes: Vec<u8>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.digest(), bytes);
    }
}

impl NavMeshDb for MemoryNavMeshDb {
    fn get(&self, key: &NavMeshDbKey) -> Result<Option<Vec<u8>>, NavMeshDbError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.digest())
            .cloned())
    }

    fn put(&self, key: &NavMeshDbKey, bytes: &[u8]) -> Result<(), NavMeshDbError> {
        self.put_raw(key, bytes.to_vec());

        Ok(())
    }

    fn size(&self) -> u64 {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|bytes| bytes.len() as u64)
            .sum()
    }
}

impl<T: NavMeshDb + ?Sized> NavMeshDb for Arc<T> {
    fn get(&self, key: &NavMeshDbKey) -> Result<Option<Vec<u8>>, NavMeshDbError> {
        (**self).get(key)
    }

    fn put(&self, key: &NavMeshDbKey, bytes: &[u8]) -> Result<(), NavMeshDbError> {
        (**self).put(key, bytes)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavMeshDbStats {
    pub reads: u64,
    pub hits: u64,
    /// Records that couldn't be read or decoded.
    pub read_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub writes_enabled: bool,
    pub size: u64,
}

#[derive(Default)]
struct DbCounters {
    reads: AtomicU64,
    hits: AtomicU64,
    read_failures: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

struct WriteRequest {
    key: NavMeshDbKey,
    data: Arc<PreparedNavMeshData>,
}

/// Shared access to the database for the update workers. Reads happen on the calling thread, writes are handed to a
/// single background writer.
pub(crate) struct DbWorker {
    db: Arc<dyn NavMeshDb>,
    read_enabled: bool,
    writes_enabled: Arc<AtomicBool>,
    counters: Arc<DbCounters>,
    sender: Option<Sender<WriteRequest>>,
    writer: Option<JoinHandle<()>>,
}

impl DbWorker {
    pub(crate) fn new(
        db: Arc<dyn NavMeshDb>,
        read_enabled: bool,
        write_enabled: bool,
        max_size: u64,
    ) -> io::Result<Self> {
        let writes_enabled = Arc::new(AtomicBool::new(write_enabled));
        let counters = Arc::new(DbCounters::default());

        let (sender, writer) = if write_enabled {
            let (sender, receiver) = mpsc::channel();
            let writer = {
                let db = db.clone();
                let writes_enabled = writes_enabled.clone();
                let counters = counters.clone();
                std::thread::Builder::new()
                    .name("nav-mesh-db-writer".into())
                    .spawn(move || run_writer(receiver, db, writes_enabled, counters, max_size))?
            };

            (Some(sender), Some(writer))
        } else {
            (None, None)
        };

        Ok(Self {
            db,
            read_enabled,
            writes_enabled,
            counters,
            sender,
            writer,
        })
    }

    /// Looks up a tile. Anything that can't be read is treated as a miss.
    pub(crate) fn get(&self, key: &NavMeshDbKey) -> Option<PreparedNavMeshData> {
        if !self.read_enabled {
            return None;
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        let bytes = match self.db.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(error) => {
                warn!("Failed to read nav-mesh tile {:?} from database: {}", key.tile, error);
                self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match decode_record(key, &bytes) {
            Ok(data) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            Err(error) => {
                warn!("Ignoring unreadable nav-mesh tile {:?} in database: {}", key.tile, error);
                self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Queues a tile for writing. Never blocks.
    pub(crate) fn put(&self, key: NavMeshDbKey, data: Arc<PreparedNavMeshData>) {
        if !self.writes_enabled.load(Ordering::Acquire) {
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };

        if sender.send(WriteRequest { key, data }).is_err() {
            error!("Nav-mesh database writer has stopped.");
        }
    }

    pub(crate) fn stats(&self) -> NavMeshDbStats {
        NavMeshDbStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            read_failures: self.counters.read_failures.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            writes_enabled: self.writes_enabled.load(Ordering::Acquire),
            size: self.db.size(),
        }
    }
}

impl Drop for DbWorker {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish what's queued & exit.
        self.sender = None;
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                error!("Nav-mesh database writer panicked.");
            }
        }
    }
}

fn run_writer(
    receiver: Receiver<WriteRequest>,
    db: Arc<dyn NavMeshDb>,
    writes_enabled: Arc<AtomicBool>,
    counters: Arc<DbCounters>,
    max_size: u64,
) {
    for request in receiver {
        if !writes_enabled.load(Ordering::Acquire) {
            continue;
        }

        let bytes = match encode_record(&request.key, &request.data) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("Failed to encode nav-mesh tile {:?}: {}", request.key.tile, error);
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        if db.size() + bytes.len() as u64 > max_size {
            warn!(
                "Nav-mesh database reached its maximum size of {} bytes, no more tiles will be written.",
                max_size
            );
            writes_enabled.store(false, Ordering::Release);
            continue;
        }

        match db.put(&request.key, &bytes) {
            Ok(()) => {
                counters.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Wrote nav-mesh tile {:?} to database.", request.key.tile);
            }
            Err(error) => {
                warn!("Failed to write nav-mesh tile {:?} to database: {}", request.key.tile, error);
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
