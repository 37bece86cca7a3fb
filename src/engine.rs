//! The torrent controller: owns the torrent records and peer handles,
//! drives the 2 Hz tick, and composes tracker, scheduler, storage and
//! reactor into an actual download.

use crate::config::{Config, SPEED_DELTA, UPLOAD_PEERS};
use crate::error::Result;
use crate::peer::message::Message;
use crate::peer::session::{Direction, PeerSession};
use crate::picker;
use crate::reactor::{bind_listener, Command, Reactor, ReactorHandle};
use crate::storage;
use crate::torrent::Torrent;
use crate::tracker::client::{Announce, Event, Tracker};
use anyhow::Context;
use mio::net::TcpStream;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(500);

/// Percent of the selected data downloaded, against the endgame threshold.
fn endgame_reached(downloaded: u64, length: u64, endgame_percent: f64) -> bool {
    if length == 0 {
        return false;
    }
    100.0 * downloaded as f64 / length as f64 > endgame_percent
}

/// More peers are wanted while the aggregate rate sits below the limit
/// (plus margin); no limit means always.
fn need_peers(speed_limit: f64, speed: f64) -> bool {
    speed_limit == 0.0 || speed < speed_limit + SPEED_DELTA
}

/// Uploading proceeds unless a limit is set and the upload rate is within
/// the margin of it. -1 means unlimited.
fn can_upload(upload_limit: f64, upspeed: f64) -> bool {
    upload_limit == -1.0 || upspeed < upload_limit - SPEED_DELTA
}

/// One torrent under management: the record plus its swarm bookkeeping.
struct TorrentSession {
    torrent: Torrent,
    peers: Vec<Arc<PeerSession>>,
    backup_peers: Vec<SocketAddr>,
    inbound_queue: Vec<TcpStream>,
    trackers: Vec<Tracker>,
    upload_peers: usize,
    start_time: Instant,
}

impl TorrentSession {
    /// Step 1-3 of the tick: reap the dead, adopt queued inbound sockets,
    /// and replenish from backup and trackers while peers are wanted.
    fn update_peer_list(&mut self, need_peers: bool, config: &Config, handle: &ReactorHandle) {
        let dead_uploaders = self
            .peers
            .iter()
            .filter(|p| !p.is_alive() && p.is_upload())
            .count();
        self.upload_peers -= dead_uploaders.min(self.upload_peers);
        self.peers.retain(|p| p.alive());

        while self.upload_peers < UPLOAD_PEERS {
            let stream = match self.inbound_queue.pop() {
                Some(stream) => stream,
                None => break,
            };
            let addr = match stream.peer_addr() {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            let session = Arc::new(PeerSession::new(
                addr,
                Direction::Inbound,
                self.torrent.handshake.clone(),
                config.max_request,
                config.peer_timeout,
            ));
            handle.send(Command::AddPeer(stream, session.clone()));
            self.peers.push(session);
            self.upload_peers += 1;
        }

        if !need_peers {
            return;
        }
        while !self.backup_peers.is_empty() && self.peers.len() < config.max_peers {
            let addr = self.backup_peers.remove(0);
            self.connect_outbound(addr, config, handle);
        }
        let uploaded = self.torrent.uploaded;
        let downloaded = self.torrent.downloaded;
        let left = self.torrent.left();
        let mut new_addrs = Vec::new();
        for tracker in self.trackers.iter_mut().filter(|t| t.can_reannounce()) {
            tracker.update_progress(uploaded, downloaded, left);
            new_addrs.extend(tracker.get_peers());
        }
        for addr in new_addrs {
            if self.peers.len() < config.max_peers {
                self.connect_outbound(addr, config, handle);
            } else {
                self.backup_peers.push(addr);
            }
        }
    }

    fn connect_outbound(&mut self, addr: SocketAddr, config: &Config, handle: &ReactorHandle) {
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                log::debug!("connect to {} failed: {}", addr, err);
                return;
            }
        };
        let session = Arc::new(PeerSession::new(
            addr,
            Direction::Outbound,
            self.torrent.handshake.clone(),
            config.max_request,
            config.peer_timeout,
        ));
        handle.send(Command::AddPeer(stream, session.clone()));
        self.peers.push(session);
    }

    /// Steps 4-5: freeze near the limit, schedule requests, harvest
    /// completed pieces.
    fn check_peers(&mut self, endgame: bool, speed_limit: f64) -> Vec<(u32, Vec<u8>)> {
        let speed: f64 = self.peers.iter().map(|p| p.download_rate()).sum();
        if speed_limit > 0.0 && speed_limit - speed < SPEED_DELTA {
            for peer in &self.peers {
                peer.set_frozen(true);
            }
        }
        let mut completed = Vec::new();
        if speed_limit > 0.0 && speed >= speed_limit {
            return completed;
        }
        for peer in &self.peers {
            if peer.can_request() || (endgame && peer.unchoked()) {
                picker::make_requests(&mut self.torrent, peer, endgame);
                completed.extend(peer.take_completed());
            }
        }
        completed
    }

    /// Step 6: verify, write, broadcast `have`, cancel in endgame.
    fn insert_pieces(&mut self, completed: Vec<(u32, Vec<u8>)>, endgame: bool) -> Result<()> {
        for (index, data) in completed {
            if !storage::commit_piece(&mut self.torrent, index as usize, &data)? {
                continue;
            }
            let size = self.torrent.pieces[index as usize].size;
            for peer in &self.peers {
                if endgame {
                    peer.send_cancel(index, size);
                }
                peer.send_have(index);
            }
        }
        Ok(())
    }

    /// Step 7: answer bitfield and block requests, gated on the upload
    /// limit.
    fn send_blocks_to_peers(&mut self, upload_limit: f64) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f64().max(0.1);
        let upspeed = self.torrent.uploaded as f64 / 1024.0 / elapsed;
        let bitfield = self.torrent.construct_bitfield();
        for peer in &self.peers {
            if peer.needs_bitfield() {
                peer.send_bitfield(&bitfield);
            }
            if !can_upload(upload_limit, upspeed) {
                return Ok(());
            }
            for (index, blocks) in peer.take_pending_uploads() {
                if index as usize >= self.torrent.pieces.len() {
                    continue;
                }
                let data = storage::read_piece(&self.torrent, index as usize)?;
                for (offset, length) in blocks {
                    let end = offset as usize + length as usize;
                    if end > data.len() {
                        continue;
                    }
                    self.torrent.uploaded += length as u64;
                    peer.send_message(&Message::Piece(
                        index,
                        offset,
                        data[offset as usize..end].to_vec(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn close_downloading_peers(&self) {
        for peer in self.peers.iter().filter(|p| !p.is_upload()) {
            peer.close();
        }
    }
}

pub struct Engine {
    config: Config,
    alive: Arc<AtomicBool>,
    handle: ReactorHandle,
    reactor_thread: Option<JoinHandle<()>>,
    torrents: Vec<TorrentSession>,
    /// KB/s; 0 means unlimited.
    speed_limit: f64,
    /// KB/s; -1 means unlimited.
    upload_limit: f64,
}

impl Engine {
    pub fn new(
        config: Config,
        speed_limit: f64,
        upload_limit: f64,
        alive: Arc<AtomicBool>,
    ) -> anyhow::Result<Engine> {
        let (reactor, handle) =
            Reactor::new(alive.clone(), config.max_request as usize).context("reactor setup")?;
        let reactor_thread = std::thread::Builder::new()
            .name("reactor".into())
            .spawn(move || reactor.run())
            .context("spawning the I/O thread")?;
        Ok(Engine {
            config,
            alive,
            handle,
            reactor_thread: Some(reactor_thread),
            torrents: Vec::new(),
            speed_limit,
            upload_limit,
        })
    }

    /// Register a torrent: bind its seed listener and build its tracker
    /// list. The first announce carries `started`.
    pub fn add_torrent(&mut self, torrent: Torrent, tracker_urls: Vec<String>) -> anyhow::Result<()> {
        let (sock, port) = bind_listener().context("binding the seed listener")?;
        log::info!("torrent '{}' listening on port {}", torrent.name, port);
        self.handle.send(Command::AddListener(sock, self.torrents.len()));
        let payload = Announce {
            info_hash: torrent.info_hash,
            peer_id: self.config.peer_id,
            port,
            uploaded: 0,
            downloaded: torrent.downloaded,
            left: torrent.left(),
            numwant: 500,
            key: self.config.key,
            event: Some(Event::Started),
        };
        let trackers = tracker_urls
            .into_iter()
            .map(|url| Tracker::new(url, payload.clone(), self.config.port))
            .collect();
        self.torrents.push(TorrentSession {
            torrent,
            peers: Vec::new(),
            backup_peers: Vec::new(),
            inbound_queue: Vec::new(),
            trackers,
            upload_peers: 0,
            start_time: Instant::now(),
        });
        Ok(())
    }

    fn totals(&self) -> (u64, u64) {
        let downloaded = self.torrents.iter().map(|t| t.torrent.downloaded).sum();
        let length = self.torrents.iter().map(|t| t.torrent.length).sum();
        (downloaded, length)
    }

    fn drain_accepted(&mut self) {
        while let Ok((torrent, stream)) = self.handle.accepted.try_recv() {
            if let Some(session) = self.torrents.get_mut(torrent) {
                session.inbound_queue.push(stream);
            }
        }
    }

    /// Run until completion or interruption; with `seed`, keep uploading
    /// after completion until interrupted.
    pub fn run(mut self, seed: bool) -> anyhow::Result<()> {
        let (downloaded, length) = self.totals();
        if downloaded >= length && !seed {
            println!("All files have already been downloaded.");
            return self.shutdown();
        }
        println!("Connecting to peers...");
        if let Err(err) = self.download(length) {
            let _ = self.shutdown();
            return Err(err);
        }
        if seed && self.alive.load(Ordering::SeqCst) {
            println!("\nDownload completed\nStart seeding");
            for session in &self.torrents {
                session.close_downloading_peers();
            }
            self.seed_forever()?;
            println!("\nSeeding stopped");
        } else {
            println!("\nDownload completed");
        }
        self.shutdown()
    }

    fn download(&mut self, length: u64) -> anyhow::Result<()> {
        println!("Download started");
        let start_time = Instant::now();
        let torrents_count = self.torrents.len().max(1) as f64;
        let (mut downloaded, _) = self.totals();
        let mut endgame = endgame_reached(downloaded, length, self.config.endgame_percent);
        let mut speed = 0.0;
        while downloaded < length && self.alive.load(Ordering::SeqCst) {
            self.drain_accepted();
            let want_peers = need_peers(self.speed_limit, speed);
            let mut got = 0u64;
            let mut uploaded = 0u64;
            let mut peers = 0usize;
            downloaded = 0;
            for index in 0..self.torrents.len() {
                let session = &mut self.torrents[index];
                session.update_peer_list(want_peers, &self.config, &self.handle);
                let completed = session.check_peers(endgame, self.speed_limit);
                session.insert_pieces(completed, endgame)?;
                session.send_blocks_to_peers(self.upload_limit)?;
                got += session.torrent.got;
                uploaded += session.torrent.uploaded;
                peers += session.peers.len();
                downloaded += session.torrent.downloaded;
            }
            self.handle.wake();
            let elapsed = start_time.elapsed().as_secs_f64().max(0.1);
            let perc = if length == 0 {
                100.0
            } else {
                100.0 * downloaded as f64 / length as f64
            };
            speed = got as f64 / torrents_count / 1024.0 / elapsed;
            let upspeed = uploaded as f64 / torrents_count / 1024.0 / elapsed;
            endgame = endgame_reached(downloaded, length, self.config.endgame_percent);
            print!(
                "\r{:<5.2}% downloaded. Speed {:<7.2} KB/s. {} peers. Upload speed: {:<7.2} KB/s ",
                perc, speed, peers, upspeed
            );
            let _ = std::io::stdout().flush();
            std::thread::sleep(TICK);
        }
        Ok(())
    }

    fn seed_forever(&mut self) -> anyhow::Result<()> {
        println!("Seeding started. Press Ctrl+C to interrupt.");
        let start_time = Instant::now();
        let torrents_count = self.torrents.len().max(1) as f64;
        while self.alive.load(Ordering::SeqCst) {
            self.drain_accepted();
            let mut uploaded = 0u64;
            let mut peers = 0usize;
            for index in 0..self.torrents.len() {
                let session = &mut self.torrents[index];
                session.update_peer_list(false, &self.config, &self.handle);
                session.send_blocks_to_peers(self.upload_limit)?;
                uploaded += session.torrent.uploaded;
                peers += session.peers.len();
            }
            self.handle.wake();
            let elapsed = start_time.elapsed().as_secs_f64().max(0.1);
            let upspeed = uploaded as f64 / torrents_count / 1024.0 / elapsed;
            print!("\rUpload speed: {:<7.2} KB/s. {} peers. ", upspeed, peers);
            let _ = std::io::stdout().flush();
            std::thread::sleep(TICK);
        }
        Ok(())
    }

    /// Stop the reactor, then tell every reachable tracker we are gone.
    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.handle.wake();
        if let Some(thread) = self.reactor_thread.take() {
            let _ = thread.join();
        }
        for session in self.torrents.iter_mut() {
            let uploaded = session.torrent.uploaded;
            let downloaded = session.torrent.downloaded;
            let left = session.torrent.left();
            for tracker in session.trackers.iter_mut().filter(|t| t.reachable) {
                tracker.update_progress(uploaded, downloaded, left);
                tracker.send_stopped();
            }
        }
        Ok(())
    }
}
