//! Information shared by all entities of a single torrent (piece store,
//! peer sessions, swarm manager) without requiring them to hold a reference
//! back to the swarm manager itself (see the cyclic ownership note in
//! `DESIGN.md`).

use crate::{storage_info::StorageInfo, PeerId, Sha1Hash, TorrentId};

/// Immutable (for the lifetime of the torrent) information about a torrent,
/// shared via `Arc` by the swarm manager, all of its peer sessions, and the
/// piece store.
#[derive(Debug)]
pub(crate) struct SharedStatus {
    /// The torrent's unique id within this engine instance.
    pub id: TorrentId,
    /// The torrent's content-derived fingerprint.
    pub info_hash: Sha1Hash,
    /// This client's peer id, sent in the handshake and to the tracker.
    pub client_id: PeerId,
    /// The torrent's storage layout (piece length, file list, etc).
    pub storage: StorageInfo,
    /// The base URL of the torrent's tracker.
    pub tracker_url: String,
}

impl SharedStatus {
    pub fn new(
        id: TorrentId,
        info_hash: Sha1Hash,
        client_id: PeerId,
        storage: StorageInfo,
        tracker_url: String,
    ) -> Self {
        Self { id, info_hash, client_id, storage, tracker_url }
    }
}
