// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Local stream sockets: port table, listen/connect/accept, peer channels
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional
//! PUBLIC API: ShutdownMode; (crate) SocketCb, PortMap, open/listen/accept/connect/shutdown
//! DEPENDS_ON: pipe, stream, sync::CondVar
//! INVARIANTS: A port maps to at most one listener; a socket is freed only once its
//!             handle is closed and no accept/connect still references it;
//!             a request is admitted at most once
//!
//! A connected pair is two pipes wired crosswise: the connecting socket reads A
//! and writes B, the accepted socket reads B and writes A.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, warn};

use crate::arena::arena_key;
use crate::error::{fatal, KResult, KernelError};
use crate::kernel::{KernelGuard, KernelState};
use crate::pipe::{self, PipeId};
use crate::stream::{self, FcbId, StreamOps};
use crate::sync::CondVar;
use crate::types::{Fid, Pid, Port, NOPORT};

arena_key!(pub(crate) SocketId);
arena_key!(pub(crate) RequestId);

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Directions closed by `ShutDown`.
    pub struct ShutdownMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const BOTH = Self::READ.bits() | Self::WRITE.bits();
    }
}

pub(crate) enum SocketKind {
    Unbound,
    Listener { queue: VecDeque<RequestId>, req_available: CondVar },
    Peer { peer: SocketId, read_pipe: PipeId, write_pipe: PipeId },
}

/// Socket control block.
pub(crate) struct SocketCb {
    fcb: FcbId,
    port: Port,
    /// Accept and connect calls in flight against this socket.
    refcount: usize,
    closed: bool,
    kind: SocketKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pending,
    Admitted,
    Refused,
}

/// A connect waiting in a listener's queue.
pub(crate) struct ConnectionRequest {
    socket: SocketId,
    admission: Admission,
    connected: CondVar,
}

/// Port number to listening socket.
pub(crate) struct PortMap {
    slots: Vec<Option<SocketId>>,
}

impl PortMap {
    pub fn new(max_port: Port) -> Self {
        Self { slots: vec![None; max_port as usize + 1] }
    }

    fn max_port(&self) -> Port {
        (self.slots.len() - 1) as Port
    }

    fn listener(&self, port: Port) -> Option<SocketId> {
        self.slots.get(port as usize).copied().flatten()
    }

    fn bindable(&self, port: Port) -> bool {
        port != NOPORT && port <= self.max_port()
    }
}

fn socket<'a>(k: &'a KernelGuard<'_>, id: SocketId) -> KResult<&'a SocketCb> {
    k.sockets.get(id).filter(|sock| !sock.closed).ok_or(KernelError::BadFileDescriptor)
}

fn socket_mut<'a>(k: &'a mut KernelGuard<'_>, id: SocketId) -> &'a mut SocketCb {
    match k.sockets.get_mut(id) {
        Some(sock) => sock,
        None => fatal!("socket {:?} vanished while referenced", id),
    }
}

/// `Socket(port)`: a new unbound socket in the caller's FIDT.
pub(crate) fn open(k: &mut KernelGuard<'_>, pid: Pid, port: Port) -> KResult<Fid> {
    open_socket(k, pid, port).map(|(fid, _)| fid)
}

fn open_socket(k: &mut KernelGuard<'_>, pid: Pid, port: Port) -> KResult<(Fid, SocketId)> {
    if port > k.ports.max_port() {
        return Err(KernelError::InvalidArgument);
    }
    let (fid, fcb) = stream::reserve(k, pid, 1)?[0];
    let cb = SocketCb { fcb, port, refcount: 0, closed: false, kind: SocketKind::Unbound };
    let id = match k.sockets.insert(cb) {
        Ok(id) => id,
        Err(_) => fatal!("socket arena exhausted"),
    };
    stream::install(k, fcb, Arc::new(SocketStream(id)));
    debug!(target: "kobj::socket", "pid {} socket {:?} port={}", pid, id, port);
    Ok((fid, id))
}

/// `Listen`: binds the socket's port and turns it into a listener.
pub(crate) fn listen(k: &mut KernelGuard<'_>, id: SocketId) -> KResult<()> {
    let sock = socket(k, id)?;
    let port = sock.port;
    if !k.ports.bindable(port) {
        return Err(KernelError::InvalidArgument);
    }
    if k.ports.listener(port).is_some() {
        return Err(KernelError::AlreadyInUse);
    }
    match sock.kind {
        SocketKind::Unbound => {}
        SocketKind::Listener { .. } => return Err(KernelError::AlreadyInUse),
        SocketKind::Peer { .. } => return Err(KernelError::InvalidArgument),
    }
    socket_mut(k, id).kind =
        SocketKind::Listener { queue: VecDeque::new(), req_available: CondVar::new() };
    k.ports.slots[port as usize] = Some(id);
    debug!(target: "kobj::socket", "socket {:?} listening on {}", id, port);
    Ok(())
}

fn listener_queue<'a>(k: &'a mut KernelGuard<'_>, id: SocketId) -> &'a mut VecDeque<RequestId> {
    match &mut socket_mut(k, id).kind {
        SocketKind::Listener { queue, .. } => queue,
        _ => fatal!("socket {:?} is not a listener", id),
    }
}

/// `Accept`: takes the oldest live request and returns a handle to the new
/// peer socket. Blocks while the queue is empty.
pub(crate) fn accept(k: &mut KernelGuard<'_>, pid: Pid, lsock: SocketId) -> KResult<Fid> {
    let sock = socket(k, lsock)?;
    let req_available = match &sock.kind {
        SocketKind::Listener { req_available, .. } => req_available.clone(),
        _ => return Err(KernelError::NotListening),
    };
    let port = sock.port;
    socket_mut(k, lsock).refcount += 1;
    let outcome = accept_inner(k, pid, lsock, port, &req_available);
    decref(k, lsock);
    outcome
}

fn accept_inner(
    k: &mut KernelGuard<'_>,
    pid: Pid,
    lsock: SocketId,
    port: Port,
    req_available: &CondVar,
) -> KResult<Fid> {
    loop {
        req_available.wait_while(k, |state| {
            state.ports.listener(port) == Some(lsock)
                && state.sockets.get(lsock).is_some_and(|sock| {
                    matches!(&sock.kind, SocketKind::Listener { queue, .. } if queue.is_empty())
                })
        });
        if k.ports.listener(port) != Some(lsock) {
            return Err(KernelError::ListenerClosed);
        }
        let Some(req) = listener_queue(k, lsock).pop_front() else { continue };
        let Some(request) = k.requests.get(req) else { continue };
        let peer = request.socket;
        let peer_ready = k
            .sockets
            .get(peer)
            .is_some_and(|sock| !sock.closed && matches!(sock.kind, SocketKind::Unbound));
        if !peer_ready {
            warn!(target: "kobj::socket", "dropping request {:?}: connector gone", req);
            refuse(k, req);
            continue;
        }

        let (fid, new_sock) = match open_socket(k, pid, port) {
            Ok(opened) => opened,
            Err(err) => {
                listener_queue(k, lsock).push_front(req);
                return Err(err);
            }
        };
        wire_peers(k, peer, new_sock);
        if let Some(request) = k.requests.get_mut(req) {
            request.admission = Admission::Admitted;
            request.connected.signal();
        }
        debug!(target: "kobj::socket", "port {} accepted {:?} <-> {:?}", port, peer, new_sock);
        return Ok(fid);
    }
}

fn wire_peers(k: &mut KernelGuard<'_>, connector: SocketId, accepted: SocketId) {
    let connector_fcb = socket_mut(k, connector).fcb;
    let accepted_fcb = socket_mut(k, accepted).fcb;
    let pipe_a = pipe::create(k, connector_fcb, accepted_fcb);
    let pipe_b = pipe::create(k, accepted_fcb, connector_fcb);
    socket_mut(k, connector).kind =
        SocketKind::Peer { peer: accepted, read_pipe: pipe_a, write_pipe: pipe_b };
    socket_mut(k, accepted).kind =
        SocketKind::Peer { peer: connector, read_pipe: pipe_b, write_pipe: pipe_a };
}

fn refuse(k: &mut KernelGuard<'_>, req: RequestId) {
    if let Some(request) = k.requests.get_mut(req) {
        request.admission = Admission::Refused;
        request.connected.signal();
    }
}

/// `Connect`: queues a request at the listener on `port` and waits up to
/// `timeout` for an accept to admit it.
pub(crate) fn connect(
    k: &mut KernelGuard<'_>,
    id: SocketId,
    port: Port,
    timeout: Duration,
) -> KResult<()> {
    if !k.ports.bindable(port) {
        return Err(KernelError::InvalidArgument);
    }
    if !matches!(socket(k, id)?.kind, SocketKind::Unbound) {
        return Err(KernelError::InvalidArgument);
    }
    let Some(listener) = k.ports.listener(port) else {
        return Err(KernelError::ConnectFailed);
    };
    let req_available = match &socket_mut(k, listener).kind {
        SocketKind::Listener { req_available, .. } => req_available.clone(),
        _ => fatal!("port {} maps to a non-listening socket", port),
    };

    let connected = CondVar::new();
    let request = ConnectionRequest {
        socket: id,
        admission: Admission::Pending,
        connected: connected.clone(),
    };
    let req = match k.requests.insert(request) {
        Ok(req) => req,
        Err(_) => fatal!("request arena exhausted"),
    };
    socket_mut(k, listener).refcount += 1;
    listener_queue(k, listener).push_back(req);
    req_available.signal();

    let pending = |state: &KernelState| {
        state.requests.get(req).is_some_and(|r| r.admission == Admission::Pending)
    };
    // A timeout past the clock's range waits without a deadline.
    match Instant::now().checked_add(timeout) {
        Some(deadline) => {
            connected.wait_while_until(k, deadline, pending);
        }
        None => connected.wait_while(k, pending),
    }

    let admission = k.requests.remove(req).map_or(Admission::Refused, |r| r.admission);
    if admission == Admission::Pending {
        if let Some(SocketCb { kind: SocketKind::Listener { queue, .. }, .. }) =
            k.sockets.get_mut(listener)
        {
            queue.retain(|queued| *queued != req);
        }
    }
    decref(k, listener);

    match admission {
        Admission::Admitted => Ok(()),
        Admission::Refused => Err(KernelError::ConnectFailed),
        Admission::Pending => {
            debug!(target: "kobj::socket", "connect to port {} timed out", port);
            Err(KernelError::Timeout)
        }
    }
}

/// `ShutDown`: closes one or both directions of a connected socket.
pub(crate) fn shutdown(k: &mut KernelGuard<'_>, id: SocketId, mode: ShutdownMode) -> KResult<()> {
    if mode.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let (read_pipe, write_pipe) = match socket(k, id)?.kind {
        SocketKind::Peer { read_pipe, write_pipe, .. } => (read_pipe, write_pipe),
        _ => return Err(KernelError::NotConnected),
    };
    if mode.contains(ShutdownMode::READ) {
        pipe::close_reader(k, read_pipe);
    }
    if mode.contains(ShutdownMode::WRITE) {
        pipe::close_writer(k, write_pipe);
    }
    Ok(())
}

fn decref(k: &mut KernelGuard<'_>, id: SocketId) {
    let sock = socket_mut(k, id);
    sock.refcount -= 1;
    release_if_unreferenced(k, id);
}

fn release_if_unreferenced(k: &mut KernelGuard<'_>, id: SocketId) {
    if k.sockets.get(id).is_some_and(|sock| sock.closed && sock.refcount == 0) {
        k.sockets.remove(id);
        debug!(target: "kobj::socket", "socket {:?} released", id);
    }
}

/// Last handle gone: tears down whatever the socket's state owns.
fn close(k: &mut KernelGuard<'_>, id: SocketId) {
    let Some(sock) = k.sockets.get_mut(id) else { return };
    if sock.closed {
        return;
    }
    sock.closed = true;
    let port = sock.port;
    match std::mem::replace(&mut sock.kind, SocketKind::Unbound) {
        SocketKind::Unbound => {}
        SocketKind::Listener { queue, req_available } => {
            if k.ports.listener(port) == Some(id) {
                k.ports.slots[port as usize] = None;
            }
            for req in queue {
                refuse(k, req);
            }
            req_available.broadcast();
            debug!(target: "kobj::socket", "listener on {} closed", port);
        }
        SocketKind::Peer { peer, read_pipe, write_pipe } => {
            pipe::close_writer(k, write_pipe);
            pipe::close_reader(k, read_pipe);
            debug!(target: "kobj::socket", "socket {:?} left peer {:?}", id, peer);
        }
    }
    release_if_unreferenced(k, id);
}

struct SocketStream(SocketId);

impl SocketStream {
    fn pipes(&self, k: &KernelGuard<'_>) -> KResult<(PipeId, PipeId)> {
        match socket(k, self.0)?.kind {
            SocketKind::Peer { read_pipe, write_pipe, .. } => Ok((read_pipe, write_pipe)),
            _ => Err(KernelError::NotConnected),
        }
    }
}

impl StreamOps for SocketStream {
    fn read(&self, k: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        let (read_pipe, _) = self.pipes(k)?;
        pipe::read(k, read_pipe, buf)
    }

    fn write(&self, k: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        let (_, write_pipe) = self.pipes(k)?;
        pipe::write(k, write_pipe, buf)
    }

    fn close(&self, k: &mut KernelGuard<'_>) {
        close(k, self.0);
    }

    fn as_socket(&self) -> Option<SocketId> {
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    fn socket_of(k: &KernelGuard<'_>, fid: Fid) -> SocketId {
        stream::get(k, Pid::IDLE, fid).unwrap().as_socket().unwrap()
    }

    #[test]
    fn port_bounds_are_checked() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let max = k.config.max_port;
        assert!(open(&mut k, Pid::IDLE, NOPORT).is_ok());
        assert!(open(&mut k, Pid::IDLE, max).is_ok());
        assert_eq!(open(&mut k, Pid::IDLE, max + 1), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn noport_socket_cannot_listen() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let fid = open(&mut k, Pid::IDLE, NOPORT).unwrap();
        let id = socket_of(&k, fid);
        assert_eq!(listen(&mut k, id), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn one_listener_per_port() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let first = open(&mut k, Pid::IDLE, 80).unwrap();
        let second = open(&mut k, Pid::IDLE, 80).unwrap();
        let (first, second) = (socket_of(&k, first), socket_of(&k, second));
        listen(&mut k, first).expect("listen");
        assert_eq!(listen(&mut k, first), Err(KernelError::AlreadyInUse));
        assert_eq!(listen(&mut k, second), Err(KernelError::AlreadyInUse));
    }

    #[test]
    fn closing_listener_frees_the_port() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let fid = open(&mut k, Pid::IDLE, 81).unwrap();
        let id = socket_of(&k, fid);
        listen(&mut k, id).expect("listen");
        stream::close(&mut k, Pid::IDLE, fid).expect("close");
        assert!(k.sockets.get(id).is_none());
        let again = open(&mut k, Pid::IDLE, 81).unwrap();
        let again = socket_of(&k, again);
        listen(&mut k, again).expect("port reusable");
    }

    #[test]
    fn connect_with_zero_timeout_leaves_queue_empty() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let lfid = open(&mut k, Pid::IDLE, 90).unwrap();
        let listener = socket_of(&k, lfid);
        listen(&mut k, listener).expect("listen");
        let cfid = open(&mut k, Pid::IDLE, NOPORT).unwrap();
        let client = socket_of(&k, cfid);

        assert_eq!(connect(&mut k, client, 90, Duration::ZERO), Err(KernelError::Timeout));
        assert!(listener_queue(&mut k, listener).is_empty());
        assert_eq!(k.requests.len(), 0);
        assert_eq!(k.sockets.get(listener).map(|s| s.refcount), Some(0));
    }

    #[test]
    fn connect_to_unbound_port_fails() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let cfid = open(&mut k, Pid::IDLE, NOPORT).unwrap();
        let client = socket_of(&k, cfid);
        assert_eq!(
            connect(&mut k, client, 100, Duration::from_millis(5)),
            Err(KernelError::ConnectFailed)
        );
        assert_eq!(connect(&mut k, client, NOPORT, Duration::ZERO), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn unconnected_socket_rejects_io_and_shutdown() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let fid = open(&mut k, Pid::IDLE, NOPORT).unwrap();
        let id = socket_of(&k, fid);
        let stream = stream::get(&k, Pid::IDLE, fid).unwrap();
        assert_eq!(stream.read(&mut k, &mut [0u8; 4]), Err(KernelError::NotConnected));
        assert_eq!(stream.write(&mut k, b"x"), Err(KernelError::NotConnected));
        assert_eq!(shutdown(&mut k, id, ShutdownMode::BOTH), Err(KernelError::NotConnected));
        assert_eq!(shutdown(&mut k, id, ShutdownMode::empty()), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn accept_on_unbound_socket_is_rejected() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let fid = open(&mut k, Pid::IDLE, 5).unwrap();
        let id = socket_of(&k, fid);
        assert_eq!(accept(&mut k, Pid::IDLE, id), Err(KernelError::NotListening));
    }
}
