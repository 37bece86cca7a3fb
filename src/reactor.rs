//! The socket reactor: one thread multiplexing every listener and peer
//! socket with mio. Peer reads are parsed here and handed to the sessions;
//! writes drain each session's buffer. The controller talks to the reactor
//! through a command channel and a waker.

use crate::peer::session::{PeerSession, StreamParser};
use bytes::Buf;
use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use rand::Rng;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAKER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_secs(3);

pub enum Command {
    /// Start accepting inbound connections for torrent `usize`.
    AddListener(TcpListener, usize),
    /// Drive a (connecting or accepted) peer socket.
    AddPeer(TcpStream, Arc<PeerSession>),
}

/// Controller-side endpoints of a running reactor.
pub struct ReactorHandle {
    pub commands: Sender<Command>,
    /// Accepted inbound sockets, tagged with their torrent.
    pub accepted: Receiver<(usize, TcpStream)>,
    pub waker: Arc<Waker>,
}

impl ReactorHandle {
    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_ok() {
            let _ = self.waker.wake();
        }
    }

    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

enum Entry {
    Listener { sock: TcpListener, torrent: usize },
    Peer(PeerIo),
}

/// Reactor-owned half of a peer: the socket and the read-side parser. The
/// shared state lives in the session.
struct PeerIo {
    stream: TcpStream,
    session: Arc<PeerSession>,
    parser: StreamParser,
    read_chunk: Box<[u8]>,
}

impl PeerIo {
    fn new(stream: TcpStream, session: Arc<PeerSession>, chunk_size: usize) -> PeerIo {
        PeerIo {
            stream,
            session,
            parser: StreamParser::new(),
            read_chunk: vec![0u8; chunk_size].into_boxed_slice(),
        }
    }

    /// SO_ERROR check on the first readiness after a non-blocking connect.
    fn check_connection(&mut self) {
        if self.session.is_connected() {
            return;
        }
        match self.stream.take_error() {
            Ok(None) => self.session.mark_connected(),
            Ok(Some(err)) => {
                log::debug!("connect to {} failed: {}", self.session.addr, err);
                self.session.close();
            }
            Err(err) => {
                log::debug!("connect to {} failed: {}", self.session.addr, err);
                self.session.close();
            }
        }
    }

    fn on_readable(&mut self) {
        self.check_connection();
        while self.session.alive() {
            match self.stream.read(&mut self.read_chunk) {
                Ok(0) => {
                    self.session.close();
                    return;
                }
                Ok(n) => {
                    self.session.update_max_requests();
                    let chunk = &self.read_chunk[..n];
                    match self.parser.feed(chunk) {
                        Ok(events) => {
                            for event in events {
                                self.session.handle_event(event);
                            }
                        }
                        Err(_) => {
                            self.session.close();
                            return;
                        }
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("read from {} failed: {}", self.session.addr, err);
                    self.session.close();
                    return;
                }
            }
        }
    }

    fn on_writable(&mut self) {
        self.check_connection();
        self.flush();
    }

    /// Drain the session write buffer into the socket until it empties or
    /// the socket pushes back.
    fn flush(&mut self) {
        let stream = &mut self.stream;
        let session = self.session.clone();
        session.with_write_buf(|buf| {
            while !buf.is_empty() {
                match stream.write(buf) {
                    Ok(0) => {
                        session.close();
                        return;
                    }
                    Ok(n) => buf.advance(n),
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::debug!("write to {} failed: {}", session.addr, err);
                        session.close();
                        return;
                    }
                }
            }
        });
    }
}

pub struct Reactor {
    poll: Poll,
    entries: HashMap<Token, Entry>,
    next_token: usize,
    commands: Receiver<Command>,
    accepted: Sender<(usize, TcpStream)>,
    alive: Arc<AtomicBool>,
    chunk_size: usize,
}

impl Reactor {
    pub fn new(alive: Arc<AtomicBool>, chunk_size: usize) -> io::Result<(Reactor, ReactorHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (command_tx, command_rx) = unbounded();
        let (accepted_tx, accepted_rx) = unbounded();
        let reactor = Reactor {
            poll,
            entries: HashMap::new(),
            next_token: 1,
            commands: command_rx,
            accepted: accepted_tx,
            alive,
            chunk_size,
        };
        let handle = ReactorHandle {
            commands: command_tx,
            accepted: accepted_rx,
            waker,
        };
        Ok((reactor, handle))
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        while self.alive.load(Ordering::SeqCst) {
            self.drain_commands();
            self.sweep_dead();
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() != ErrorKind::Interrupted {
                    log::error!("poll failed: {}", err);
                    break;
                }
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                match self.entries.get_mut(&token) {
                    Some(Entry::Listener { torrent, sock }) => {
                        let torrent = *torrent;
                        accept_all(sock, torrent, &self.accepted);
                    }
                    Some(Entry::Peer(io)) => {
                        if event.is_error() {
                            io.session.close();
                            continue;
                        }
                        // reads drain before writes
                        if event.is_readable() {
                            io.on_readable();
                        }
                        if event.is_writable() && io.session.alive() {
                            io.on_writable();
                        }
                    }
                    None => {}
                }
            }
            // the controller queues bytes between polls; push them out now
            for entry in self.entries.values_mut() {
                if let Entry::Peer(io) = entry {
                    if io.session.alive() && io.session.is_connected() {
                        io.flush();
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // dropping the entries closes every socket
        self.entries.clear();
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let token = Token(self.next_token);
            self.next_token += 1;
            match command {
                Command::AddListener(mut sock, torrent) => {
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut sock, token, Interest::READABLE)
                    {
                        log::error!("listener registration failed: {}", err);
                        continue;
                    }
                    self.entries.insert(token, Entry::Listener { sock, torrent });
                }
                Command::AddPeer(mut stream, session) => {
                    match self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        Ok(()) => {
                            self.entries
                                .insert(token, Entry::Peer(PeerIo::new(stream, session, self.chunk_size)));
                        }
                        Err(err) => {
                            log::debug!("peer registration failed: {}", err);
                            session.close();
                        }
                    }
                }
            }
        }
    }

    /// Remove dead peers before polling; deregistering drops the socket.
    fn sweep_dead(&mut self) {
        let dead: Vec<Token> = self
            .entries
            .iter()
            .filter_map(|(token, entry)| match entry {
                Entry::Peer(io) if !io.session.alive() => Some(*token),
                _ => None,
            })
            .collect();
        for token in dead {
            if let Some(Entry::Peer(mut io)) = self.entries.remove(&token) {
                let _ = self.poll.registry().deregister(&mut io.stream);
            }
        }
    }
}

fn accept_all(sock: &mut TcpListener, torrent: usize, accepted: &Sender<(usize, TcpStream)>) {
    loop {
        match sock.accept() {
            Ok((stream, addr)) => {
                log::info!("accepted inbound peer {}", addr);
                if accepted.send((torrent, stream)).is_err() {
                    return;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) => {
                log::debug!("accept failed: {}", err);
                return;
            }
        }
    }
}

/// Bind the seed listener on a random port in [32000, 33001).
pub fn bind_listener() -> io::Result<(TcpListener, u16)> {
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..64 {
        let port: u16 = rng.gen_range(32000..33001);
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
        match TcpListener::bind(addr) {
            Ok(sock) => return Ok((sock, port)),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| ErrorKind::AddrInUse.into()))
}
