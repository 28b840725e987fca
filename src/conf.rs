//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
                listen_addr: "0.0.0.0:6881".parse().unwrap(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The address on which the swarm manager's acceptor listens for inbound
    /// peer connections. Defaults to `0.0.0.0:6881`.
    pub listen_addr: SocketAddr,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing at this interval.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The number of blocks we keep outstanding per peer session by default,
    /// before a bandwidth-delay-product based value takes over.
    pub max_in_flight_per_peer: usize,

    /// How long we wait for a block we requested before considering it lost
    /// and rolling the piece back to `Missing`.
    pub request_timeout: Duration,

    /// How long a session may go without receiving any frame from its peer
    /// before it's considered dead and closed.
    pub peer_idle_timeout: Duration,

    /// The deadline for receiving the peer's handshake frame after we've
    /// sent ours (or after accepting the connection).
    pub peer_handshake_timeout: Duration,

    /// How long a session may go without sending any frame before it must
    /// send a keep-alive.
    pub keepalive_interval: Duration,

    /// The progress fraction (in `[0, 1]`) at which a torrent enters
    /// end-game mode, allowing the same piece to be requested from multiple
    /// peers simultaneously.
    pub endgame_threshold: f64,

    /// How often the swarm manager's connector loop scans for peers to
    /// (re)dial.
    pub connector_interval: Duration,

    /// After this many consecutive dial failures, a peer is skipped for
    /// `connector_backoff` before being retried.
    pub connector_backoff_threshold: usize,

    /// How long a repeatedly-failing peer is skipped by the connector.
    pub connector_backoff: Duration,

    /// How often the end-game loop re-evaluates missing pieces and issues
    /// duplicate requests.
    pub endgame_interval: Duration,

    /// When no rarity index is available to the selection policy, fall back
    /// to uniform-random piece selection instead of refusing to pick. This
    /// must be explicitly enabled; the degenerate behavior is never silent.
    pub rarest_first_fallback: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(30),
            tracker_error_threshold: 15,
            max_in_flight_per_peer: 10,
            request_timeout: Duration::from_secs(60),
            peer_idle_timeout: Duration::from_secs(120),
            peer_handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(120),
            endgame_threshold: 0.95,
            connector_interval: Duration::from_secs(5),
            connector_backoff_threshold: 3,
            connector_backoff: Duration::from_secs(60),
            endgame_interval: Duration::from_secs(5),
            rarest_first_fallback: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pin the documented defaults so they don't silently drift.
    #[test]
    fn defaults_match_spec_constants() {
        let conf = TorrentConf::new("/tmp/downloads");
        assert_eq!(conf.max_in_flight_per_peer, 10);
        assert_eq!(conf.request_timeout, Duration::from_secs(60));
        assert_eq!(conf.peer_idle_timeout, Duration::from_secs(120));
        assert_eq!(conf.peer_handshake_timeout, Duration::from_secs(10));
        assert_eq!(conf.keepalive_interval, Duration::from_secs(120));
        assert_eq!(conf.endgame_threshold, 0.95);
        assert_eq!(conf.connector_interval, Duration::from_secs(5));
        assert_eq!(conf.connector_backoff_threshold, 3);
        assert_eq!(conf.connector_backoff, Duration::from_secs(60));
        assert_eq!(conf.announce_interval, Duration::from_secs(30));
        assert!(!conf.rarest_first_fallback);
    }

    #[test]
    fn engine_conf_has_default_listen_addr() {
        let conf = Conf::new("/tmp/downloads");
        assert_eq!(conf.engine.listen_addr.port(), 6881);
    }
}
