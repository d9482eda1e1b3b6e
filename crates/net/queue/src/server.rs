// Copyright 2020-2026 Simserve developers.
// This file is part of Simserve.

// Simserve is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Simserve is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Simserve.  If not, see <http://www.gnu.org/licenses/>.

use std::{
    collections::VecDeque,
    io::{self, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;

use crate::frame;

/// How long an accepted connection gets to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a server-side request execution went wrong.
pub enum HandlerError {
    /// Transport-level trouble; the connection is aborted and the client
    /// will retransmit after reconnecting.
    Io(io::Error),
    /// The request itself failed. The message travels back in the
    /// acknowledgment and the request is not retried.
    Failed(String),
}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        HandlerError::Io(err)
    }
}

/// Decodes and performs requests for one client node.
pub trait RequestHandler: Send + 'static {
    fn perform_request(&mut self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Server-side queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Number of recent acknowledgments kept for duplicate replay. Must
    /// cover the client's sent window.
    pub window: usize,
    /// Acknowledgments between checkpoints of the highest processed
    /// seqno. The default checkpoints after every ack.
    pub checkpoint_interval: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            window: 100,
            checkpoint_interval: 1,
        }
    }
}

struct ServerState {
    last_seqno: i32,
    /// Ring of `(seqno, failure)` for the most recent acks.
    acks: VecDeque<(i32, Option<String>)>,
    current: Option<TcpStream>,
    service: Option<JoinHandle<()>>,
    generation: u64,
    acks_since_checkpoint: u32,
}

struct ServerCore {
    node_id: i64,
    config: ServerConfig,
    handler: Mutex<Box<dyn RequestHandler>>,
    checkpoint: Box<dyn Fn(i32) + Send + Sync>,
    state: Mutex<ServerState>,
}

/// The server half of the request channel for a single client node.
///
/// Requests are performed strictly in seqno order. A request whose seqno
/// has already been processed (a retransmission after a reconnect) is
/// answered from the ack ring without executing again. The highest
/// processed seqno is handed to the checkpoint callback so a restarted
/// server can resume without re-executing committed requests.
pub struct RequestQueueServer {
    core: Arc<ServerCore>,
}

impl RequestQueueServer {
    /// Creates the server for `node_id`. `restored_seqno` is the last
    /// checkpointed seqno, or 0 for a fresh node.
    pub fn new(
        node_id: i64,
        handler: Box<dyn RequestHandler>,
        restored_seqno: i32,
        config: ServerConfig,
        checkpoint: Box<dyn Fn(i32) + Send + Sync>,
    ) -> Self {
        RequestQueueServer {
            core: Arc::new(ServerCore {
                node_id,
                config,
                handler: Mutex::new(handler),
                checkpoint,
                state: Mutex::new(ServerState {
                    last_seqno: restored_seqno,
                    acks: VecDeque::new(),
                    current: None,
                    service: None,
                    generation: 0,
                    acks_since_checkpoint: 0,
                }),
            }),
        }
    }

    pub fn node_id(&self) -> i64 {
        self.core.node_id
    }

    /// Takes over servicing of a freshly handshaken socket, replacing
    /// and tearing down any previous connection for this node.
    pub fn handle_connection(&self, stream: TcpStream) {
        let (old_stream, old_service, generation) = {
            let mut state = self.core.state.lock();
            state.generation += 1;
            let old_stream = state.current.take();
            let old_service = state.service.take();
            state.current = stream.try_clone().ok();
            (old_stream, old_service, state.generation)
        };
        if let Some(old) = old_stream {
            debug!(target: "reqqueue", "replacing connection for node {}", self.core.node_id);
            old.shutdown(Shutdown::Both).ok();
        }
        if let Some(service) = old_service {
            service.join().ok();
        }
        let service = {
            let core = self.core.clone();
            thread::Builder::new()
                .name(format!("request-queue-server-{}", self.core.node_id))
                .spawn(move || run_service(core, stream, generation))
                .expect("failed to spawn request queue service")
        };
        let mut state = self.core.state.lock();
        // a newer connection may have raced in while we spawned
        if state.generation == generation {
            state.service = Some(service);
        }
    }

    /// The last seqno whose request has been performed.
    pub fn last_seqno(&self) -> i32 {
        self.core.state.lock().last_seqno
    }

    fn disconnect(&self) {
        let (stream, service) = {
            let mut state = self.core.state.lock();
            state.generation += 1;
            (state.current.take(), state.service.take())
        };
        if let Some(stream) = stream {
            stream.shutdown(Shutdown::Both).ok();
        }
        if let Some(service) = service {
            service.join().ok();
        }
    }
}

impl Drop for RequestQueueServer {
    fn drop(&mut self) {
        trace!(target: "shutdown", "[RequestQueueServer {}] closing", self.core.node_id);
        self.disconnect();
        trace!(target: "shutdown", "[RequestQueueServer {}] closed", self.core.node_id);
    }
}

fn run_service(core: Arc<ServerCore>, stream: TcpStream, generation: u64) {
    let mut reader = match stream.try_clone() {
        Ok(reader) => BufReader::new(reader),
        Err(_) => return,
    };
    loop {
        let (seqno, payload) = match frame::read_request(&mut reader) {
            Ok(request) => request,
            Err(e) => {
                debug!(target: "reqqueue", "node {} request stream ended: {e}", core.node_id);
                break;
            }
        };

        // a retransmission of something already processed is answered
        // from the ack ring without executing again
        enum Disposition {
            Replay(i32, Option<String>),
            Perform,
            Abort(String),
        }
        let disposition = {
            let state = core.state.lock();
            if state.generation != generation {
                return;
            }
            if seqno <= state.last_seqno {
                match state.acks.iter().find(|(acked, _)| *acked == seqno) {
                    Some((acked, failure)) => Disposition::Replay(*acked, failure.clone()),
                    None => Disposition::Abort(format!(
                        "duplicate request {seqno} is outside the ack window"
                    )),
                }
            } else if seqno != state.last_seqno.wrapping_add(1) {
                Disposition::Abort(format!(
                    "request {seqno} leaves a gap after {}",
                    state.last_seqno
                ))
            } else {
                Disposition::Perform
            }
        };
        match disposition {
            Disposition::Abort(reason) => {
                warn!(target: "reqqueue", "node {}: {reason}; dropping connection", core.node_id);
                break;
            }
            Disposition::Replay(seqno, failure) => {
                trace!(target: "reqqueue", "node {} replaying ack {seqno}", core.node_id);
                if write_ack(&stream, seqno, failure.as_deref()).is_err() {
                    break;
                }
                continue;
            }
            Disposition::Perform => {}
        }

        let result = {
            let mut handler = core.handler.lock();
            handler.perform_request(&payload)
        };
        let failure = match result {
            Ok(()) => None,
            Err(HandlerError::Failed(message)) => {
                debug!(target: "reqqueue", "node {} request {seqno} failed: {message}", core.node_id);
                Some(message)
            }
            Err(HandlerError::Io(e)) => {
                debug!(target: "reqqueue", "node {} request {seqno} hit io error: {e}; dropping connection", core.node_id);
                break;
            }
        };

        // record before acking, and even if a newer connection took
        // over, so the request is never executed twice
        let (stale, checkpoint_due) = {
            let mut state = core.state.lock();
            state.last_seqno = seqno;
            state.acks.push_back((seqno, failure.clone()));
            while state.acks.len() > core.config.window {
                state.acks.pop_front();
            }
            state.acks_since_checkpoint += 1;
            let due = state.acks_since_checkpoint >= core.config.checkpoint_interval;
            if due {
                state.acks_since_checkpoint = 0;
            }
            (state.generation != generation, due)
        };
        if checkpoint_due {
            (core.checkpoint)(seqno);
        }
        if stale {
            return;
        }
        if write_ack(&stream, seqno, failure.as_deref()).is_err() {
            break;
        }
    }
}

fn write_ack(stream: &TcpStream, seqno: i32, failure: Option<&str>) -> io::Result<()> {
    let mut framed = Vec::new();
    frame::write_ack(&mut framed, seqno, failure).expect("writing to a buffer cannot fail");
    (&mut &*stream).write_all(&framed)
}

/// Finds the per-node server for an accepted connection.
pub trait ServerDispatcher: Send + Sync + 'static {
    fn server_for_node(&self, node_id: i64) -> Option<Arc<RequestQueueServer>>;
}

/// Accepts connections, reads each one's node handshake, and hands the
/// socket to that node's server.
pub struct RequestQueueListener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl RequestQueueListener {
    pub fn bind(addr: SocketAddr, dispatcher: Arc<dyn ServerDispatcher>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("request-queue-listener-{local_addr}"))
                .spawn(move || run_listener(listener, dispatcher, shutdown))
                .expect("failed to spawn request queue listener")
        };
        info!(target: "reqqueue", "request queue listening on {local_addr}");
        Ok(RequestQueueListener {
            local_addr,
            shutdown,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        if !self.shutdown.swap(true, AtomicOrdering::SeqCst) {
            // poke the accept loop awake so it can observe the flag
            TcpStream::connect(self.local_addr).ok();
        }
        if let Some(accept) = self.accept.take() {
            accept.join().ok();
        }
    }
}

impl Drop for RequestQueueListener {
    fn drop(&mut self) {
        trace!(target: "shutdown", "[RequestQueueListener] closing");
        self.shutdown();
        trace!(target: "shutdown", "[RequestQueueListener] closed");
    }
}

fn run_listener(
    listener: TcpListener,
    dispatcher: Arc<dyn ServerDispatcher>,
    shutdown: Arc<AtomicBool>,
) {
    for connection in listener.incoming() {
        if shutdown.load(AtomicOrdering::SeqCst) {
            break;
        }
        let stream = match connection {
            Ok(stream) => stream,
            Err(e) => {
                debug!(target: "reqqueue", "accept failed: {e}");
                continue;
            }
        };
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
        let node_id = match frame::read_handshake(&mut (&stream)) {
            Ok(node_id) => node_id,
            Err(e) => {
                debug!(target: "reqqueue", "dropping connection without handshake: {e}");
                continue;
            }
        };
        stream.set_read_timeout(None).ok();
        match dispatcher.server_for_node(node_id) {
            Some(server) => {
                debug!(target: "reqqueue", "connection accepted for node {node_id}");
                server.handle_connection(stream);
            }
            None => {
                warn!(target: "reqqueue", "rejecting connection for unknown node {node_id}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use parking_lot::Mutex;
    use std::io::BufReader;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    struct RecordingHandler {
        performed: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RequestHandler for RecordingHandler {
        fn perform_request(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
            if payload == &b"fail"[..] {
                return Err(HandlerError::Failed("boom".into()));
            }
            self.performed.lock().push(payload.to_vec());
            Ok(())
        }
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn server_with_recorder() -> (RequestQueueServer, Arc<Mutex<Vec<Vec<u8>>>>) {
        let _ = ::env_logger::builder().is_test(true).try_init();
        let performed = Arc::new(Mutex::new(Vec::new()));
        let handler = RecordingHandler {
            performed: performed.clone(),
        };
        let server = RequestQueueServer::new(
            7,
            Box::new(handler),
            0,
            ServerConfig::default(),
            Box::new(|_| {}),
        );
        (server, performed)
    }

    fn send(client: &TcpStream, seqno: i32, payload: &[u8]) {
        let mut framed = Vec::new();
        frame::write_request(&mut framed, seqno, payload).unwrap();
        (&mut &*client).write_all(&framed).unwrap();
    }

    #[test]
    fn performs_requests_in_order_and_acks() {
        let (server, performed) = server_with_recorder();
        let (client, served) = socket_pair();
        server.handle_connection(served);

        let mut acks = BufReader::new(client.try_clone().unwrap());
        send(&client, 1, b"alpha");
        send(&client, 2, b"beta");
        assert_eq!(frame::read_ack(&mut acks).unwrap(), (1, None));
        assert_eq!(frame::read_ack(&mut acks).unwrap(), (2, None));
        assert_eq!(*performed.lock(), vec![b"alpha".to_vec(), b"beta".to_vec()]);
        assert_eq!(server.last_seqno(), 2);
    }

    #[test]
    fn failed_requests_are_acked_and_not_retried() {
        let (server, performed) = server_with_recorder();
        let (client, served) = socket_pair();
        server.handle_connection(served);

        let mut acks = BufReader::new(client.try_clone().unwrap());
        send(&client, 1, b"fail");
        send(&client, 2, b"after");
        assert_eq!(
            frame::read_ack(&mut acks).unwrap(),
            (1, Some("boom".to_string()))
        );
        assert_eq!(frame::read_ack(&mut acks).unwrap(), (2, None));
        assert_eq!(*performed.lock(), vec![b"after".to_vec()]);
    }

    #[test]
    fn retransmissions_replay_acks_without_reexecution() {
        let (server, performed) = server_with_recorder();

        let (client, served) = socket_pair();
        server.handle_connection(served);
        let mut acks = BufReader::new(client.try_clone().unwrap());
        send(&client, 1, b"alpha");
        send(&client, 2, b"fail");
        assert_eq!(frame::read_ack(&mut acks).unwrap(), (1, None));
        assert_eq!(
            frame::read_ack(&mut acks).unwrap(),
            (2, Some("boom".to_string()))
        );
        drop(acks);
        drop(client);

        // reconnect and retransmit the unacknowledged window from 2 on,
        // as a client that lost the acks would
        let (client, served) = socket_pair();
        server.handle_connection(served);
        let mut acks = BufReader::new(client.try_clone().unwrap());
        send(&client, 2, b"fail");
        send(&client, 3, b"gamma");
        assert_eq!(
            frame::read_ack(&mut acks).unwrap(),
            (2, Some("boom".to_string()))
        );
        assert_eq!(frame::read_ack(&mut acks).unwrap(), (3, None));
        // alpha and gamma each ran once; the replayed failure did not rerun
        assert_eq!(*performed.lock(), vec![b"alpha".to_vec(), b"gamma".to_vec()]);
        assert_eq!(server.last_seqno(), 3);
    }

    #[test]
    fn gaps_abort_the_connection() {
        let (server, _performed) = server_with_recorder();
        let (client, served) = socket_pair();
        server.handle_connection(served);

        let mut acks = BufReader::new(client.try_clone().unwrap());
        send(&client, 5, b"skipped ahead");
        // server drops the connection without acking
        assert!(frame::read_ack(&mut acks).is_err());
        assert_eq!(server.last_seqno(), 0);
    }

    #[test]
    fn checkpoints_follow_the_configured_interval() {
        let _ = ::env_logger::builder().is_test(true).try_init();
        let checkpoints = Arc::new(Mutex::new(Vec::new()));
        let recorded = checkpoints.clone();
        let performed = Arc::new(Mutex::new(Vec::new()));
        let server = RequestQueueServer::new(
            7,
            Box::new(RecordingHandler { performed }),
            0,
            ServerConfig {
                window: 100,
                checkpoint_interval: 2,
            },
            Box::new(move |seqno| recorded.lock().push(seqno)),
        );
        let (client, served) = socket_pair();
        server.handle_connection(served);

        let mut acks = BufReader::new(client.try_clone().unwrap());
        for seqno in 1..=4 {
            send(&client, seqno, b"x");
            frame::read_ack(&mut acks).unwrap();
        }
        assert_eq!(*checkpoints.lock(), vec![2, 4]);
    }
}
