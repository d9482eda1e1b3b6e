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
    io::{BufReader, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{frame, now_millis, Config, Error};

/// How often the sender rechecks the progress deadline while parked.
const PROGRESS_POLL: Duration = Duration::from_millis(250);

/// A unit of work shipped over the queue.
///
/// The payload is opaque to the channel; the server's handler decodes
/// it. `completed` is invoked exactly once, in sequence-number order
/// relative to the node's other requests, with the outcome of the last
/// server-side execution.
pub trait Request: Send + 'static {
    fn payload(&self) -> Vec<u8>;
    fn completed(self: Box<Self>, result: Result<(), Error>);
}

/// Opens the transport to the server node.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> std::io::Result<TcpStream>;
}

/// Connects to a fixed socket address.
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        TcpConnector { addr }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.addr)
    }
}

struct Outbound {
    /// Assigned at first transmission and reused verbatim on
    /// retransmission, so the server can recognize replays.
    seqno: Option<i32>,
    request: Box<dyn Request>,
}

struct ClientState {
    pending: VecDeque<Outbound>,
    sent: VecDeque<(i32, Box<dyn Request>)>,
    next_seqno: i32,
    shutdown: bool,
    failed: bool,
    conn_generation: u64,
    conn_broken: bool,
    /// Millis of the last acknowledgment (or of the moment work resumed
    /// after an idle period). The progress deadline is measured from
    /// here.
    last_progress: u64,
}

struct ClientCore {
    node_id: i64,
    config: Config,
    connector: Box<dyn Connector>,
    failure_reporter: Box<dyn Fn(Error) + Send + Sync>,
    state: Mutex<ClientState>,
    /// Signalled on new work, acknowledgments, connection events, and
    /// shutdown; the sender parks here.
    work: Condvar,
    /// Signalled when the pending queue frees a slot; `add_request`
    /// parks here.
    space: Condvar,
}

/// The client half of the request channel.
///
/// One background sender thread owns the socket; a receiver thread per
/// live connection drains acknowledgments. Dropping the client shuts it
/// down, cancelling whatever is still queued.
pub struct RequestQueueClient {
    core: Arc<ClientCore>,
    sender: Option<JoinHandle<()>>,
}

impl RequestQueueClient {
    /// Creates the client for the node identified by `node_id` and
    /// starts its sender thread. The failure reporter is invoked, once,
    /// if the peer is declared down.
    pub fn new(
        node_id: i64,
        connector: Box<dyn Connector>,
        config: Config,
        failure_reporter: Box<dyn Fn(Error) + Send + Sync>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let core = Arc::new(ClientCore {
            node_id,
            config,
            connector,
            failure_reporter,
            state: Mutex::new(ClientState {
                pending: VecDeque::new(),
                sent: VecDeque::new(),
                next_seqno: 1,
                shutdown: false,
                failed: false,
                conn_generation: 0,
                conn_broken: false,
                last_progress: now_millis(),
            }),
            work: Condvar::new(),
            space: Condvar::new(),
        });
        let sender = {
            let core = core.clone();
            thread::Builder::new()
                .name(format!("request-queue-client-{node_id}"))
                .spawn(move || run_sender(core))
                .expect("failed to spawn request queue sender")
        };
        Ok(RequestQueueClient {
            core,
            sender: Some(sender),
        })
    }

    /// Queues a request for transmission, blocking while the pending
    /// queue is at capacity. Fails once the queue has shut down or the
    /// peer has been declared down.
    pub fn add_request(&self, request: Box<dyn Request>) -> Result<(), Error> {
        let mut state = self.core.state.lock();
        loop {
            if state.shutdown {
                return Err(Error::Shutdown);
            }
            if state.failed {
                return Err(Error::PeerDown);
            }
            if state.pending.len() < self.core.config.queue_size {
                break;
            }
            self.core.space.wait(&mut state);
        }
        if state.pending.is_empty() && state.sent.is_empty() {
            // work resumes after an idle stretch; restart the progress clock
            state.last_progress = now_millis();
        }
        state.pending.push_back(Outbound {
            seqno: None,
            request,
        });
        self.core.work.notify_all();
        Ok(())
    }

    /// Stops the sender: pending requests are transmitted best-effort,
    /// the socket is closed, and everything still unacknowledged is
    /// completed with [`Error::Cancelled`].
    pub fn shutdown(&mut self) {
        {
            let mut state = self.core.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.core.work.notify_all();
        self.core.space.notify_all();
        if let Some(handle) = self.sender.take() {
            handle.join().ok();
        }
    }
}

impl Drop for RequestQueueClient {
    fn drop(&mut self) {
        trace!(target: "shutdown", "[RequestQueueClient {}] closing", self.core.node_id);
        self.shutdown();
        trace!(target: "shutdown", "[RequestQueueClient {}] closed", self.core.node_id);
    }
}

fn run_sender(core: Arc<ClientCore>) {
    loop {
        {
            let mut state = core.state.lock();
            while !state.shutdown
                && !state.failed
                && state.pending.is_empty()
                && state.sent.is_empty()
            {
                core.work.wait(&mut state);
            }
            if state.failed || (state.shutdown && state.pending.is_empty() && state.sent.is_empty())
            {
                break;
            }
        }
        let stream = match connect_with_retry(&core) {
            Some(stream) => stream,
            None => break,
        };
        service_connection(&core, stream);
        {
            let mut state = core.state.lock();
            if state.shutdown || state.failed {
                break;
            }
            core.work
                .wait_for(&mut state, Duration::from_millis(core.config.retry_wait));
        }
    }
    finish(&core);
}

/// Opens and handshakes a connection, sleeping `retry.wait` between
/// attempts. Gives up on shutdown, or by declaring the peer down once
/// the progress deadline passes.
fn connect_with_retry(core: &Arc<ClientCore>) -> Option<TcpStream> {
    loop {
        if core.state.lock().failed {
            return None;
        }
        match core.connector.connect() {
            Ok(stream) => {
                let mut handshake = Vec::new();
                frame::write_handshake(&mut handshake, core.node_id)
                    .expect("writing to a buffer cannot fail");
                if (&stream).write_all(&handshake).is_ok() {
                    stream.set_nodelay(true).ok();
                    debug!(target: "reqqueue", "node {} connected to server", core.node_id);
                    return Some(stream);
                }
            }
            Err(e) => {
                debug!(target: "reqqueue", "node {} connect failed: {e}", core.node_id);
            }
        }
        let mut state = core.state.lock();
        if state.shutdown {
            return None;
        }
        if past_progress_deadline(core, &mut state) {
            return None;
        }
        core.work
            .wait_for(&mut state, Duration::from_millis(core.config.retry_wait));
        if state.shutdown {
            return None;
        }
    }
}

/// Runs one connection: spawns the acknowledgment receiver, streams
/// pending requests into the sent window, and on any failure tears the
/// connection down and requeues the unacknowledged window for
/// retransmission.
fn service_connection(core: &Arc<ClientCore>, stream: TcpStream) {
    let generation = {
        let mut state = core.state.lock();
        state.conn_broken = false;
        state.conn_generation += 1;
        state.conn_generation
    };
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(_) => return,
    };
    let receiver = {
        let core = core.clone();
        thread::Builder::new()
            .name(format!("request-queue-recv-{}", core.node_id))
            .spawn(move || run_receiver(core, reader, generation))
            .expect("failed to spawn request queue receiver")
    };

    enum Next {
        Send(i32, Box<dyn Request>),
        Close,
    }

    loop {
        let next = {
            let mut state = core.state.lock();
            loop {
                if state.conn_broken || state.failed {
                    break Next::Close;
                }
                if past_progress_deadline(core, &mut state) {
                    break Next::Close;
                }
                if state.shutdown && state.pending.is_empty() {
                    break Next::Close;
                }
                if !state.pending.is_empty() && state.sent.len() < core.config.sent_queue_size {
                    let outbound = state.pending.pop_front().expect("pending is not empty");
                    let seqno = match outbound.seqno {
                        Some(seqno) => seqno,
                        None => {
                            let seqno = state.next_seqno;
                            state.next_seqno = state
                                .next_seqno
                                .checked_add(1)
                                .expect("sequence numbers exhausted");
                            seqno
                        }
                    };
                    core.space.notify_all();
                    break Next::Send(seqno, outbound.request);
                }
                core.work.wait_for(&mut state, PROGRESS_POLL);
            }
        };
        match next {
            Next::Close => break,
            Next::Send(seqno, request) => {
                let payload = request.payload();
                core.state.lock().sent.push_back((seqno, request));
                let mut framed = Vec::with_capacity(payload.len() + 8);
                frame::write_request(&mut framed, seqno, &payload)
                    .expect("writing to a buffer cannot fail");
                trace!(target: "reqqueue", "node {} sending request {seqno}", core.node_id);
                if (&stream).write_all(&framed).is_err() {
                    let mut state = core.state.lock();
                    state.conn_broken = true;
                    break;
                }
            }
        }
    }

    stream.shutdown(Shutdown::Both).ok();
    receiver.join().ok();

    // whatever the server did not acknowledge goes back to the head of
    // the pending queue, in the original order, keeping its seqnos
    let mut state = core.state.lock();
    while let Some((seqno, request)) = state.sent.pop_back() {
        state.pending.push_front(Outbound {
            seqno: Some(seqno),
            request,
        });
    }
}

/// Drains acknowledgments for one connection. Each ack releases every
/// sent request up to its seqno: earlier ones complete successfully, the
/// acknowledged one completes with the ack's own outcome.
fn run_receiver(core: Arc<ClientCore>, stream: TcpStream, generation: u64) {
    let mut reader = BufReader::new(stream);
    loop {
        match frame::read_ack(&mut reader) {
            Ok((seqno, failure)) => {
                let completions = {
                    let mut state = core.state.lock();
                    if state.conn_generation != generation {
                        return;
                    }
                    let mut done: Vec<(Box<dyn Request>, Result<(), Error>)> = Vec::new();
                    loop {
                        match state.sent.front() {
                            Some((head, _)) if *head <= seqno => {
                                let (head, request) =
                                    state.sent.pop_front().expect("sent is not empty");
                                let result = if head == seqno {
                                    match &failure {
                                        None => Ok(()),
                                        Some(msg) => Err(Error::RequestFailed(msg.clone())),
                                    }
                                } else {
                                    Ok(())
                                };
                                done.push((request, result));
                            }
                            _ => break,
                        }
                    }
                    trace!(target: "reqqueue", "node {} acked through {seqno}", core.node_id);
                    state.last_progress = now_millis();
                    core.work.notify_all();
                    core.space.notify_all();
                    done
                };
                for (request, result) in completions {
                    request.completed(result);
                }
            }
            Err(e) => {
                let mut state = core.state.lock();
                if state.conn_generation == generation {
                    debug!(target: "reqqueue", "node {} ack stream ended: {e}", core.node_id);
                    state.conn_broken = true;
                    core.work.notify_all();
                }
                return;
            }
        }
    }
}

/// True, after marking the client failed, when there is outstanding work
/// and no acknowledgment has arrived within `max.retry` milliseconds.
fn past_progress_deadline(core: &Arc<ClientCore>, state: &mut ClientState) -> bool {
    if state.pending.is_empty() && state.sent.is_empty() {
        return false;
    }
    if now_millis().saturating_sub(state.last_progress) < core.config.max_retry {
        return false;
    }
    error!(
        target: "reqqueue",
        "no progress from server for node {} in {} ms; declaring peer down",
        core.node_id, core.config.max_retry
    );
    state.failed = true;
    core.work.notify_all();
    core.space.notify_all();
    true
}

/// Final accounting once the sender exits: report a dead peer, then
/// complete everything still queued, in order.
fn finish(core: &Arc<ClientCore>) {
    let (requests, error) = {
        let mut state = core.state.lock();
        let error = if state.failed {
            Error::PeerDown
        } else {
            Error::Cancelled
        };
        let mut requests: Vec<Box<dyn Request>> = Vec::new();
        for (_, request) in state.sent.drain(..) {
            requests.push(request);
        }
        for outbound in state.pending.drain(..) {
            requests.push(outbound.request);
        }
        core.space.notify_all();
        (requests, error)
    };
    if error == Error::PeerDown {
        (core.failure_reporter)(Error::PeerDown);
    }
    if !requests.is_empty() {
        debug!(
            target: "reqqueue",
            "node {} completing {} outstanding requests with {:?}",
            core.node_id,
            requests.len(),
            error
        );
    }
    for request in requests {
        request.completed(Err(error.clone()));
    }
}
