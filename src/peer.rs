mod codec;

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            RwLock,
        },
        time::{interval, timeout},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        conf::TorrentConf, download::PieceDownload, error::*,
        piece_picker::PiecePicker, piece_store::PieceStore,
        torrent::SharedStatus, Bitfield, BlockInfo, PeerId, PieceIndex,
    },
    codec::*,
};

/// Events a peer session publishes for the swarm manager to react to.
///
/// Sessions never hold a reference back to the manager -- per the one-way
/// channel discipline in `spec.md` §9's Design Notes, they only ever push
/// onto this channel, which the manager drains.
pub(crate) enum SessionAlert {
    /// We verified a piece. The manager broadcasts `have` to this torrent's
    /// other sessions and, during end-game, may cancel their outstanding
    /// requests for the same piece.
    PieceComplete { from: SocketAddr, index: PieceIndex },
    /// A snapshot of the session's counters, for the operator-facing status
    /// surface (`spec.md` §4.5/§6).
    Stats { addr: SocketAddr, stats: SessionStats },
    /// The session has ended; the manager should drop its command sender.
    Closed { addr: SocketAddr, result: Result<()> },
}

pub(crate) type SessionAlertSender = UnboundedSender<SessionAlert>;
pub(crate) type SessionAlertReceiver = UnboundedReceiver<SessionAlert>;

/// A point-in-time snapshot of a session's counters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SessionStats {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub is_choked: bool,
    pub is_peer_choked: bool,
    pub is_interested: bool,
    pub is_peer_interested: bool,
    pub piece_count: usize,
}

/// A full-duplex connection to a single peer: requests blocks we're missing
/// and serves blocks we have, per `spec.md` §4.4.
///
/// Generalized from the teacher's download-only `PeerSession`, which
/// required the remote to be a seed and only ever issued `interested`; this
/// version treats both directions symmetrically.
pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    piece_store: Arc<PieceStore>,
    conf: Arc<TorrentConf>,
    alert_chan: SessionAlertSender,
    cmd_port: Fuse<Receiver>,
    addr: SocketAddr,
    status: Status,
    /// Active piece downloads this session is participating in.
    downloads: Vec<PieceDownload>,
    /// Blocks we've requested and are waiting to receive, with the instant
    /// each was sent, for request-timeout tracking.
    outgoing_requests: Vec<(BlockInfo, Instant)>,
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        piece_store: Arc<PieceStore>,
        conf: Arc<TorrentConf>,
        addr: SocketAddr,
        alert_chan: SessionAlertSender,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                piece_store,
                conf,
                alert_chan,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
                peer_info: None,
            },
            cmd_chan,
        )
    }

    /// Creates a session that will dial `addr` itself and send the first
    /// handshake.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        piece_store: Arc<PieceStore>,
        conf: Arc<TorrentConf>,
        addr: SocketAddr,
        alert_chan: SessionAlertSender,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, piece_store, conf, addr, alert_chan)
    }

    /// Creates a session over a socket the swarm manager's acceptor loop has
    /// already accepted; the peer sends the first handshake.
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        piece_store: Arc<PieceStore>,
        conf: Arc<TorrentConf>,
        addr: SocketAddr,
        alert_chan: SessionAlertSender,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, piece_store, conf, addr, alert_chan)
    }

    /// Dials the peer, exchanges handshakes as the initiator, and runs the
    /// session until it ends.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        let result = self.handshake(socket, true).await;
        self.finish(result).await
    }

    /// Runs the session over a socket that has already been TCP-accepted by
    /// the swarm manager, waiting for the peer's handshake first.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        log::info!("Accepted connection from peer {}", self.addr);
        let result = self.handshake(socket, false).await;
        self.finish(result).await
    }

    async fn finish(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            log::warn!("Peer {} session ended: {}", self.addr, e);
        }
        if let Some(peer_info) = &self.peer_info {
            if let Some(pieces) = &peer_info.pieces {
                self.piece_picker.write().await.unregister_availability(pieces);
            }
        }
        let _ = self.alert_chan.send(SessionAlert::Closed {
            addr: self.addr,
            result: match &result {
                Ok(()) => Ok(()),
                Err(_) => Err(Error::ConnectionLost),
            },
        });
        result
    }

    /// Exchanges handshakes and, on success, hands off to [`Self::run`].
    async fn handshake(
        &mut self,
        socket: TcpStream,
        initiator: bool,
    ) -> Result<()> {
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let ours = Handshake::new(self.torrent.info_hash, self.torrent.client_id);

        let deadline = self.conf.peer_handshake_timeout;
        let theirs = if initiator {
            socket.send(ours.clone()).await.map_err(|_| Error::HandshakeError)?;
            read_handshake(&mut socket, deadline).await?
        } else {
            let theirs = read_handshake(&mut socket, deadline).await?;
            if theirs.info_hash != self.torrent.info_hash {
                return Err(Error::InvalidPeerInfoHash);
            }
            socket.send(ours.clone()).await.map_err(|_| Error::HandshakeError)?;
            theirs
        };

        if theirs.info_hash != self.torrent.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }

        self.peer_info = Some(PeerInfo {
            peer_id: theirs.peer_id,
            pieces: Some(
                std::iter::repeat(false)
                    .take(self.torrent.storage.piece_count)
                    .collect(),
            ),
        });

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::Connected;
        log::info!("Peer {} handshake complete", self.addr);
        self.run(socket).await
    }

    /// The session's main loop: dispatches inbound messages, applies
    /// commands from the swarm manager, and drives the periodic keep-alive,
    /// request-timeout and stats ticks.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut ticker = interval(Duration::from_secs(5)).fuse();
        let mut last_activity = Instant::now();
        let mut last_outbound = Instant::now();

        self.send_bitfield(&mut sink, &mut last_outbound).await?;

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    last_activity = Instant::now();
                    log::debug!(
                        "Received {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    self.handle_msg(&mut sink, &mut last_outbound, msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                        Command::Have(index) => {
                            sink.send(Message::Have { piece_index: index })
                                .await?;
                            last_outbound = Instant::now();
                        }
                        Command::CancelPiece(index) => {
                            self.cancel_piece(index, &mut sink, &mut last_outbound)
                                .await?;
                        }
                    }
                }
                _ = ticker.select_next_some() => {
                    if last_activity.elapsed() >= self.conf.peer_idle_timeout {
                        log::warn!("Peer {} timed out, closing session", self.addr);
                        return Err(Error::SessionTimeout);
                    }
                    if last_outbound.elapsed() >= self.conf.keepalive_interval {
                        sink.send(Message::KeepAlive).await?;
                        last_outbound = Instant::now();
                    }
                    self.check_request_timeouts().await;
                    self.make_requests(&mut sink, &mut last_outbound).await?;
                    self.report_stats();
                }
            }
        }

        Ok(())
    }

    async fn send_bitfield(
        &mut self,
        sink: &mut Sink,
        last_outbound: &mut Instant,
    ) -> Result<()> {
        let bitfield = self.piece_store.bitfield();
        sink.send(Message::Bitfield(bitfield)).await?;
        *last_outbound = Instant::now();
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut Sink,
        last_outbound: &mut Instant,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.outgoing_requests.clear();
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink, last_outbound).await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
                if self.status.is_peer_choked {
                    log::info!("Unchoking peer {}", self.addr);
                    self.status.is_peer_choked = false;
                    sink.send(Message::Unchoke).await?;
                    *last_outbound = Instant::now();
                }
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                let became_interesting =
                    self.piece_picker.write().await.register_have(piece_index)?;
                if let Some(peer_info) = &mut self.peer_info {
                    if let Some(pieces) = &mut peer_info.pieces {
                        if piece_index < pieces.len() {
                            pieces.set(piece_index, true);
                        }
                    }
                }
                if became_interesting && !self.status.is_interested {
                    self.status.is_interested = true;
                    sink.send(Message::Interested).await?;
                    *last_outbound = Instant::now();
                }
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.torrent.storage.piece_count, false);
                let interested =
                    self.piece_picker.write().await.register_availability(&bitfield)?;
                if let Some(peer_info) = &mut self.peer_info {
                    peer_info.pieces = Some(bitfield);
                }
                if interested && !self.status.is_interested {
                    self.status.is_interested = true;
                    sink.send(Message::Interested).await?;
                    *last_outbound = Instant::now();
                }
            }
            Message::Request(block) => {
                self.handle_request(sink, last_outbound, block).await?;
            }
            Message::Cancel(_) => {
                // We serve requests synchronously as they arrive, so there's
                // never a queued-but-unsent response to drop.
            }
            Message::Block { piece_index, offset, data } => {
                self.handle_block_msg(
                    BlockInfo { piece_index, offset, len: data.len() as u32 },
                    data,
                )
                .await?;
                self.make_requests(sink, last_outbound).await?;
            }
        }

        Ok(())
    }

    /// Serves a peer's `request` if we're not choking them and the piece is
    /// verified, per `spec.md` §4.2's `request` semantics. Any violation is
    /// silently dropped rather than answered with an error.
    async fn handle_request(
        &mut self,
        sink: &mut Sink,
        last_outbound: &mut Instant,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            return Ok(());
        }
        if block.len > MAX_BLOCK_LEN {
            return Ok(());
        }
        let data = match self.piece_store.read_block(
            block.piece_index,
            block.offset,
            block.len,
        ) {
            Ok(data) => data,
            Err(_) => return Ok(()),
        };
        self.status.uploaded_bytes += data.len() as u64;
        sink.send(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        })
        .await?;
        *last_outbound = Instant::now();
        Ok(())
    }

    /// Fills the outgoing request pipeline up to the configured in-flight
    /// limit, continuing active downloads before starting new ones.
    async fn make_requests(
        &mut self,
        sink: &mut Sink,
        last_outbound: &mut Instant,
    ) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }

        let mut blocks = Vec::new();
        for download in self.downloads.iter_mut() {
            let capacity = self
                .conf
                .max_in_flight_per_peer
                .saturating_sub(self.outgoing_requests.len() + blocks.len());
            if capacity == 0 {
                break;
            }
            download.pick_blocks(capacity, &mut blocks);
        }

        let peer_has = match self.peer_info.as_ref().and_then(|p| p.pieces.as_ref()) {
            Some(pieces) => pieces.clone(),
            None => return Ok(()),
        };

        loop {
            let capacity = self
                .conf
                .max_in_flight_per_peer
                .saturating_sub(self.outgoing_requests.len() + blocks.len());
            if capacity == 0 {
                break;
            }
            let exclude: HashSet<PieceIndex> =
                self.downloads.iter().map(|d| d.piece_index()).collect();
            let picked = {
                let mut picker = self.piece_picker.write().await;
                picker.pick_piece(&peer_has, &exclude)
            };
            let index = match picked {
                Some(index) => index,
                None => break,
            };
            self.piece_store.mark_requested(index);
            let piece_len = self.torrent.storage.piece_len(index)?;
            let mut download = PieceDownload::new(index, piece_len);
            download.pick_blocks(capacity, &mut blocks);
            self.downloads.push(download);
        }

        if blocks.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        for block in &blocks {
            self.outgoing_requests.push((*block, now));
        }
        for block in blocks {
            sink.send(Message::Request(block)).await?;
        }
        *last_outbound = Instant::now();

        Ok(())
    }

    /// Accepts an inbound block: matches it against outstanding requests,
    /// feeds it to the piece store, and reconciles the picker and our own
    /// download bookkeeping once a piece completes.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let pos = match self
            .outgoing_requests
            .iter()
            .position(|(b, _)| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent unrequested block: {:?}",
                    self.addr,
                    block_info
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);

        if let Some(download_pos) =
            self.downloads.iter().position(|d| d.piece_index() == block_info.piece_index)
        {
            self.downloads[download_pos].received_block(block_info);
        }

        self.status.downloaded_bytes += block_info.len as u64;

        match self.piece_store.accept_block(
            block_info.piece_index,
            block_info.offset,
            data,
        )? {
            crate::piece_store::BlockOutcome::Accepted => {}
            crate::piece_store::BlockOutcome::Rejected => {
                log::warn!(
                    "Piece {} rejected, will be re-requested",
                    block_info.piece_index
                );
                self.piece_picker.write().await.reclaim(block_info.piece_index);
                self.downloads.retain(|d| d.piece_index() != block_info.piece_index);
                self.outgoing_requests
                    .retain(|(b, _)| b.piece_index != block_info.piece_index);
            }
            crate::piece_store::BlockOutcome::PieceComplete => {
                log::info!(
                    "Piece {} complete via peer {}",
                    block_info.piece_index,
                    self.addr
                );
                self.piece_picker.write().await.received_piece(block_info.piece_index);
                self.downloads.retain(|d| d.piece_index() != block_info.piece_index);
                let _ = self.alert_chan.send(SessionAlert::PieceComplete {
                    from: self.addr,
                    index: block_info.piece_index,
                });
            }
        }

        Ok(())
    }

    /// Drops outstanding requests for `index` (we've learned the piece was
    /// completed by a different session during end-game) and sends `cancel`
    /// for any already in flight.
    async fn cancel_piece(
        &mut self,
        index: PieceIndex,
        sink: &mut Sink,
        last_outbound: &mut Instant,
    ) -> Result<()> {
        let cancelled: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(b, _)| b.piece_index == index)
            .map(|(b, _)| *b)
            .collect();
        if cancelled.is_empty() {
            return Ok(());
        }
        for block in &cancelled {
            sink.send(Message::Cancel(*block)).await?;
        }
        *last_outbound = Instant::now();
        self.outgoing_requests.retain(|(b, _)| b.piece_index != index);
        self.downloads.retain(|d| d.piece_index() != index);
        Ok(())
    }

    /// Scans for requests that have been outstanding past the configured
    /// timeout, reclaiming the block (and the whole piece, if nothing of it
    /// has arrived yet) so it can be re-requested elsewhere.
    async fn check_request_timeouts(&mut self) {
        let deadline = self.conf.request_timeout;
        let now = Instant::now();
        let mut timed_out = Vec::new();
        self.outgoing_requests.retain(|(block, sent_at)| {
            if now.duration_since(*sent_at) >= deadline {
                timed_out.push(*block);
                false
            } else {
                true
            }
        });

        for block in timed_out {
            log::warn!(
                "Request for {:?} to peer {} timed out",
                block,
                self.addr
            );
            if let Some(pos) =
                self.downloads.iter().position(|d| d.piece_index() == block.piece_index)
            {
                self.downloads[pos].reclaim_block(block);
                if self.downloads[pos].is_untouched() {
                    self.piece_picker.write().await.reclaim(block.piece_index);
                    self.piece_store.reclaim(block.piece_index);
                    self.downloads.remove(pos);
                }
            }
        }
    }

    fn report_stats(&self) {
        let piece_count = self
            .peer_info
            .as_ref()
            .and_then(|p| p.pieces.as_ref())
            .map(|pieces| pieces.count_ones())
            .unwrap_or(0);
        let _ = self.alert_chan.send(SessionAlert::Stats {
            addr: self.addr,
            stats: SessionStats {
                downloaded_bytes: self.status.downloaded_bytes,
                uploaded_bytes: self.status.uploaded_bytes,
                is_choked: self.status.is_choked,
                is_peer_choked: self.status.is_peer_choked,
                is_interested: self.status.is_interested,
                is_peer_interested: self.status.is_peer_interested,
                piece_count,
            },
        });
    }
}

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

async fn read_handshake(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
    deadline: Duration,
) -> Result<Handshake> {
    match timeout(deadline, socket.next()).await {
        Ok(Some(handshake)) => handshake.map_err(|_| Error::HandshakeError),
        Ok(None) => Err(Error::HandshakeError),
        Err(_) => Err(Error::HandshakeError),
    }
}

/// The channel on which the swarm manager sends commands to a peer session.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// Announce that we now have `PieceIndex`, per a sibling session's
    /// completed download.
    Have(PieceIndex),
    /// Drop any outstanding requests for `PieceIndex` because another
    /// session completed it first (end-game).
    CancelPiece(PieceIndex),
}

/// The status of a peer session. By default both sides start choked and not
/// interested in each other, per the protocol's default state.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    /// If true, peer is not allowing us to request blocks from them.
    is_choked: bool,
    /// If true, peer has pieces we don't have.
    is_interested: bool,
    /// If true, we are not allowing peer to request blocks from us.
    is_peer_choked: bool,
    /// If true, peer wants to download pieces we have.
    is_peer_interested: bool,
    downloaded_bytes: u64,
    uploaded_bytes: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer learned from the handshake and subsequent
/// availability messages.
struct PeerInfo {
    peer_id: PeerId,
    pieces: Option<Bitfield>,
}
