//! The per-torrent swarm manager (`spec.md` §4.5): owns the piece store,
//! the live peer sessions, and drives the acceptor, connector, announce and
//! end-game loops.
//!
//! Grounded on `examples/original_source/node/transfer.py`'s
//! `ConnectionManager` (`_connection_loop`, `_start_server`,
//! `_announce_loop`, `_end_game_loop`), restructured around the teacher's
//! `select!`-loop idiom (`peer.rs::run`) in place of asyncio tasks.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{select, stream::Fuse, FutureExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time::interval,
};
use url::Url;

use crate::{
    conf::TorrentConf,
    error::*,
    peer::{self, PeerSession, SessionAlert, SessionAlertReceiver, SessionStats},
    piece_picker::PiecePicker,
    piece_store::PieceStore,
    torrent::SharedStatus,
    tracker::{Event, TrackerClient},
    TorrentId,
};

/// Events the swarm manager publishes for the engine to react to, following
/// the same one-way channel discipline as peer sessions' `SessionAlert`
/// (the manager never holds a reference back to the engine).
pub(crate) enum SwarmAlert {
    PeerStats { torrent_id: TorrentId, addr: SocketAddr, stats: SessionStats },
    TorrentError { torrent_id: TorrentId, error: Error },
    Completed { torrent_id: TorrentId },
}

pub(crate) type SwarmAlertSender = UnboundedSender<SwarmAlert>;
pub(crate) type SwarmAlertReceiver = UnboundedReceiver<SwarmAlert>;

pub(crate) enum Command {
    Shutdown,
    Pause,
    Resume,
}

pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Per-peer retry bookkeeping for the connector loop.
struct ReconnectState {
    last_attempt: Instant,
    consecutive_failures: usize,
}

/// Owns one torrent's swarm: its live peer sessions, the piece store and
/// picker they share, and the reconnect/tracker bookkeeping that keeps the
/// swarm populated.
pub(crate) struct SwarmManager {
    torrent: Arc<SharedStatus>,
    conf: Arc<TorrentConf>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    piece_store: Arc<PieceStore>,
    listen_addr: SocketAddr,
    tracker: TrackerClient,
    alert_chan: SwarmAlertSender,
    cmd_port: Fuse<Receiver>,

    sessions: HashMap<SocketAddr, peer::Sender>,
    known_peers: HashMap<SocketAddr, ReconnectState>,
    peer_stats: HashMap<SocketAddr, SessionStats>,
    paused: bool,
    announced_completed: bool,
    next_announce_at: Instant,
    tracker_failures: usize,
    tracker_disabled: bool,
}

impl SwarmManager {
    pub fn new(
        torrent: Arc<SharedStatus>,
        conf: Arc<TorrentConf>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        piece_store: Arc<PieceStore>,
        listen_addr: SocketAddr,
        alert_chan: SwarmAlertSender,
    ) -> Result<(Self, Sender)> {
        let tracker_url = Url::parse(&torrent.tracker_url)
            .map_err(|e| Error::TrackerUnavailable(e.to_string()))?;
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrent,
                conf,
                piece_picker,
                piece_store,
                listen_addr,
                tracker: TrackerClient::new(tracker_url),
                alert_chan,
                cmd_port: cmd_port.fuse(),
                sessions: HashMap::new(),
                known_peers: HashMap::new(),
                peer_stats: HashMap::new(),
                paused: false,
                announced_completed: false,
                next_announce_at: Instant::now(),
                tracker_failures: 0,
                tracker_disabled: false,
            },
            cmd_chan,
        ))
    }

    /// Runs the acceptor, connector, announce and end-game loops until a
    /// [`Command::Shutdown`] is received.
    pub async fn run(mut self) -> Result<()> {
        let mut listener = TcpListener::bind(self.listen_addr).await?;
        log::info!(
            "Torrent {} listening for peers on {}",
            self.torrent.id,
            self.listen_addr
        );

        let (session_alert_chan, session_alerts): (
            peer::SessionAlertSender,
            SessionAlertReceiver,
        ) = mpsc::unbounded_channel();
        let mut session_alerts = session_alerts.fuse();

        self.announce(Event::Started, &session_alert_chan).await;

        let mut connector_ticker = interval(self.conf.connector_interval).fuse();
        let mut announce_ticker = interval(Duration::from_secs(5)).fuse();
        let mut endgame_ticker = interval(self.conf.endgame_interval).fuse();

        loop {
            select! {
                accepted = listener.accept().fuse() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            self.spawn_inbound(socket, addr, &session_alert_chan);
                        }
                        Err(e) => log::warn!("Failed to accept connection: {}", e),
                    }
                }
                alert = session_alerts.select_next_some() => {
                    self.handle_session_alert(alert);
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down torrent {} swarm", self.torrent.id);
                            self.announce(Event::Stopped, &session_alert_chan).await;
                            for sender in self.sessions.values() {
                                let _ = sender.send(peer::Command::Shutdown);
                            }
                            while !self.sessions.is_empty() {
                                match session_alerts.next().await {
                                    Some(alert) => self.handle_session_alert(alert),
                                    None => break,
                                }
                            }
                            break;
                        }
                        Command::Pause => {
                            self.paused = true;
                            self.announce(Event::Stopped, &session_alert_chan).await;
                        }
                        Command::Resume => {
                            self.paused = false;
                            self.announce(Event::Started, &session_alert_chan).await;
                        }
                    }
                }
                _ = connector_ticker.select_next_some() => {
                    if !self.paused {
                        self.run_connector(&session_alert_chan);
                    }
                }
                _ = announce_ticker.select_next_some() => {
                    if !self.paused && !self.tracker_disabled
                        && Instant::now() >= self.next_announce_at
                    {
                        self.announce(Event::Empty, &session_alert_chan).await;
                    }
                    if !self.announced_completed && self.piece_store.progress() >= 1.0 {
                        self.announced_completed = true;
                        self.announce(Event::Completed, &session_alert_chan).await;
                        let _ = self.alert_chan.send(SwarmAlert::Completed {
                            torrent_id: self.torrent.id,
                        });
                    }
                }
                _ = endgame_ticker.select_next_some() => {
                    if !self.paused {
                        self.run_endgame().await;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_session_alert(&mut self, alert: SessionAlert) {
        match alert {
            SessionAlert::PieceComplete { from, index } => {
                log::debug!("Broadcasting have({}) from {}", index, from);
                let is_endgame = self.piece_store.progress() >= self.conf.endgame_threshold;
                for (addr, sender) in self.sessions.iter() {
                    if *addr == from {
                        continue;
                    }
                    let _ = sender.send(peer::Command::Have(index));
                    if is_endgame {
                        let _ = sender.send(peer::Command::CancelPiece(index));
                    }
                }
            }
            SessionAlert::Stats { addr, stats } => {
                self.peer_stats.insert(addr, stats);
                let _ = self.alert_chan.send(SwarmAlert::PeerStats {
                    torrent_id: self.torrent.id,
                    addr,
                    stats,
                });
            }
            SessionAlert::Closed { addr, result } => {
                log::info!("Session with {} closed: {:?}", addr, result.is_ok());
                self.sessions.remove(&addr);
                self.peer_stats.remove(&addr);
                let now = Instant::now();
                let state = self.known_peers.entry(addr).or_insert_with(|| {
                    ReconnectState { last_attempt: now, consecutive_failures: 0 }
                });
                state.last_attempt = now;
                if result.is_err() {
                    state.consecutive_failures += 1;
                } else {
                    state.consecutive_failures = 0;
                }
            }
        }
    }

    /// Dials every known peer we're not currently connected to, skipping
    /// ones in backoff, up to the configured connection cap.
    fn run_connector(&mut self, session_alert_chan: &peer::SessionAlertSender) {
        let capacity =
            self.conf.max_connected_peer_count.saturating_sub(self.sessions.len());
        if capacity == 0 {
            return;
        }

        let now = Instant::now();
        let candidates: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .filter(|(addr, state)| {
                !self.sessions.contains_key(addr)
                    && (state.consecutive_failures < self.conf.connector_backoff_threshold
                        || now.duration_since(state.last_attempt)
                            >= self.conf.connector_backoff)
            })
            .map(|(addr, _)| *addr)
            .take(capacity)
            .collect();

        for addr in candidates {
            self.spawn_outbound(addr, session_alert_chan);
        }
    }

    fn spawn_inbound(
        &mut self,
        socket: TcpStream,
        addr: SocketAddr,
        session_alert_chan: &peer::SessionAlertSender,
    ) {
        if self.sessions.contains_key(&addr)
            || self.sessions.len() >= self.conf.max_connected_peer_count
        {
            return;
        }
        let (mut session, sender) = PeerSession::inbound(
            self.torrent.clone(),
            self.piece_picker.clone(),
            self.piece_store.clone(),
            self.conf.clone(),
            addr,
            session_alert_chan.clone(),
        );
        self.sessions.insert(addr, sender);
        tokio::spawn(async move {
            let _ = session.start_inbound(socket).await;
        });
    }

    fn spawn_outbound(
        &mut self,
        addr: SocketAddr,
        session_alert_chan: &peer::SessionAlertSender,
    ) {
        self.known_peers.entry(addr).and_modify(|s| s.last_attempt = Instant::now());
        let (mut session, sender) = PeerSession::outbound(
            self.torrent.clone(),
            self.piece_picker.clone(),
            self.piece_store.clone(),
            self.conf.clone(),
            addr,
            session_alert_chan.clone(),
        );
        self.sessions.insert(addr, sender);
        tokio::spawn(async move {
            let _ = session.start_outbound().await;
        });
    }

    /// Toggles end-game mode once progress crosses the configured
    /// threshold. The actual duplicate requesting happens on each session's
    /// own request-loop tick, which re-consults the picker every 5 s and
    /// now finds already-`Requested` pieces eligible again.
    async fn run_endgame(&mut self) {
        let progress = self.piece_store.progress();
        let should_be_endgame =
            progress >= self.conf.endgame_threshold && progress < 1.0;
        let mut picker = self.piece_picker.write().await;
        if should_be_endgame && !picker.is_endgame() {
            log::info!(
                "Torrent {} entering end-game at {:.1}% complete",
                self.torrent.id,
                progress * 100.0
            );
            picker.set_endgame(true);
        } else if !should_be_endgame && picker.is_endgame() {
            picker.set_endgame(false);
        }
    }

    async fn announce(&mut self, event: Event, _session_alert_chan: &peer::SessionAlertSender) {
        if self.tracker_disabled {
            return;
        }

        let uploaded: u64 = self.peer_stats.values().map(|s| s.uploaded_bytes).sum();
        let downloaded: u64 = self.peer_stats.values().map(|s| s.downloaded_bytes).sum();
        let progress = self.piece_store.progress();
        let left =
            ((1.0 - progress) * self.torrent.storage.download_len as f64) as u64;

        match self
            .tracker
            .announce(
                self.torrent.info_hash,
                self.torrent.client_id,
                self.listen_addr,
                uploaded,
                downloaded,
                left,
                event,
            )
            .await
        {
            Ok((peers, interval)) => {
                self.tracker_failures = 0;
                let effective =
                    if interval.as_secs() == 0 { self.conf.announce_interval } else { interval };
                self.next_announce_at = Instant::now() + effective;
                let now = Instant::now();
                let initial_last_attempt = now - self.conf.connector_backoff;
                for addr in peers {
                    if addr == self.listen_addr {
                        continue;
                    }
                    self.known_peers.entry(addr).or_insert_with(|| ReconnectState {
                        last_attempt: initial_last_attempt,
                        consecutive_failures: 0,
                    });
                }
            }
            Err(e) => {
                log::warn!("Announce to tracker failed: {}", e);
                self.tracker_failures += 1;
                self.next_announce_at = Instant::now() + self.conf.announce_interval;
                if self.tracker_failures >= self.conf.tracker_error_threshold {
                    log::warn!(
                        "Torrent {} giving up on tracker after {} consecutive failures",
                        self.torrent.id,
                        self.tracker_failures
                    );
                    self.tracker_disabled = true;
                }
                let _ = self.alert_chan.send(SwarmAlert::TorrentError {
                    torrent_id: self.torrent.id,
                    error: e,
                });
            }
        }
    }
}
