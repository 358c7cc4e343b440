//! Receive side of phase one: one [`NetIn`] state machine per peer connection, all driven by a single
//! readiness-polling thread in [`Receiver`].

use crate::block::BucketBuffer;
use crate::error::{Error, ProtocolError, Result};
use crate::node::NodeContext;
use crate::partition::PartitionMap;
use crate::record::RECORD_SIZE;
use crate::wire::{FrameHeader, Preamble, HEADER_SIZE};

use crossbeam_channel::Sender;
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

/// Where received bytes go: the disk writer queue of each bucket's disk.
pub struct Router {
    map: PartitionMap,
    node: usize,
    disks: Vec<Sender<BucketBuffer>>,
    block_bytes: usize,
}

impl Router {
    pub fn new(
        map: PartitionMap,
        node: usize,
        disks: Vec<Sender<BucketBuffer>>,
        block_bytes: usize,
    ) -> Self {
        debug_assert_eq!(disks.len(), map.disks());
        debug_assert!(block_bytes > 0 && block_bytes % RECORD_SIZE == 0);
        Self {
            map,
            node,
            disks,
            block_bytes,
        }
    }

    fn owns(&self, bucket: u16) -> bool {
        (bucket as usize) < self.map.buckets() && self.map.owner_node(bucket) == self.node
    }

    /// Blocks while the disk's queue is full. This is what stops the poll loop from draining sockets when a disk
    /// falls behind.
    fn dispatch(&self, buffer: BucketBuffer) -> Result<()> {
        self.disks[self.map.owner_disk(buffer.bucket)]
            .send(buffer)
            .map_err(|_| Error::Disconnected("disk writer"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WireState {
    /// Between frames.
    Idle,
    /// Accumulating the fixed-size header.
    Header,
    /// A complete header is buffered.
    Parse,
    /// Copying `remaining` body bytes of `bucket`.
    Body { bucket: u16, remaining: u64 },
    /// Every owned bucket has been closed by this peer.
    Done,
}

/// The state of one inbound connection. Reads resume wherever the previous readiness callback left off.
pub struct NetIn<S> {
    peer: u16,
    stream: S,
    state: WireState,
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    /// Buffer being filled for the current frame; handed off when full or when the frame ends.
    pending: Option<BucketBuffer>,
    /// Indexed by the bucket's local id.
    closed: Vec<bool>,
    buckets_live: usize,
    bytes: u64,
}

impl<S: Read> NetIn<S> {
    pub fn new(peer: u16, stream: S, buckets_per_node: usize) -> Self {
        Self {
            peer,
            stream,
            state: WireState::Idle,
            header: [0; HEADER_SIZE],
            header_filled: 0,
            pending: None,
            closed: vec![false; buckets_per_node],
            buckets_live: buckets_per_node,
            bytes: 0,
        }
    }

    pub fn peer(&self) -> u16 {
        self.peer
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    pub fn is_done(&self) -> bool {
        self.state == WireState::Done
    }

    /// Consumes everything currently readable. Returns `false` once the peer has closed all of this node's buckets.
    pub fn read(&mut self, router: &Router) -> Result<bool> {
        loop {
            match self.state {
                WireState::Idle => {
                    self.header_filled = 0;
                    self.state = WireState::Header;
                }
                WireState::Header => {
                    let n = match read_some(&mut self.stream, &mut self.header[self.header_filled..])? {
                        Some(n) => n,
                        None => return Ok(true),
                    };
                    if n == 0 {
                        return Err(self.unexpected_eof());
                    }
                    self.header_filled += n;
                    if self.header_filled == HEADER_SIZE {
                        self.state = WireState::Parse;
                    }
                }
                WireState::Parse => {
                    let header = FrameHeader::decode(&self.header);
                    if !router.owns(header.bucket) {
                        return Err(ProtocolError::ForeignBucket(header.bucket).into());
                    }
                    let local = router.map.local_id(header.bucket);
                    if self.closed[local] {
                        return Err(ProtocolError::DuplicateEof(header.bucket).into());
                    }
                    if header.is_eof() {
                        self.closed[local] = true;
                        self.buckets_live -= 1;
                        if self.buckets_live == 0 {
                            self.state = WireState::Done;
                            return Ok(false);
                        }
                        self.state = WireState::Idle;
                    } else {
                        if header.body_len % RECORD_SIZE as u64 != 0 {
                            return Err(ProtocolError::PartialRecordBody(header.body_len).into());
                        }
                        self.state = WireState::Body {
                            bucket: header.bucket,
                            remaining: header.body_len,
                        };
                    }
                }
                WireState::Body { bucket, remaining } => {
                    let block_bytes = router.block_bytes;
                    let pending = self
                        .pending
                        .get_or_insert_with(|| BucketBuffer::with_capacity(bucket, block_bytes));
                    let start = pending.data.len();
                    let want = ((block_bytes - start) as u64).min(remaining) as usize;
                    pending.data.resize(start + want, 0);
                    let read = read_some(&mut self.stream, &mut pending.data[start..]);
                    let n = match read {
                        Ok(Some(n)) => n,
                        Ok(None) => {
                            pending.data.truncate(start);
                            return Ok(true);
                        }
                        Err(e) => return Err(e.into()),
                    };
                    pending.data.truncate(start + n);
                    let filled = pending.data.len();
                    if n == 0 {
                        return Err(self.unexpected_eof());
                    }
                    self.bytes += n as u64;

                    let remaining = remaining - n as u64;
                    if filled == block_bytes || remaining == 0 {
                        if let Some(full) = self.pending.take() {
                            router.dispatch(full)?;
                        }
                    }
                    self.state = if remaining == 0 {
                        WireState::Idle
                    } else {
                        WireState::Body { bucket, remaining }
                    };
                }
                WireState::Done => return Ok(false),
            }
        }
    }

    fn unexpected_eof(&self) -> Error {
        ProtocolError::UnexpectedEof {
            buckets_live: self.buckets_live,
        }
        .into()
    }
}

/// `Ok(None)` when the read would block.
fn read_some(mut stream: impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match stream.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub connections: usize,
    pub bytes: u64,
}

/// Accepts one connection from every node in the cluster, then multiplexes all of them on one thread until each
/// has closed every bucket this node owns.
pub struct Receiver {
    listener: TcpListener,
    router: Router,
    node: usize,
    nodes: usize,
    buckets: u16,
}

impl Receiver {
    pub fn new(listener: TcpListener, ctx: &NodeContext, disks: Vec<Sender<BucketBuffer>>) -> Self {
        let router = Router::new(
            ctx.map().clone(),
            ctx.id(),
            disks,
            ctx.config().disk_block_bytes(),
        );
        Self {
            listener,
            router,
            node: ctx.id(),
            nodes: ctx.nodes(),
            buckets: ctx.map().buckets() as u16,
        }
    }

    /// Accepts exactly one connection per node and checks that each peer partitions the key space the same way.
    pub fn accept_all(&self) -> Result<Vec<NetIn<TcpStream>>> {
        let mut connected = vec![false; self.nodes];
        let mut netins = Vec::with_capacity(self.nodes);
        while netins.len() < self.nodes {
            let (mut stream, addr) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            let preamble = Preamble::read_from(&mut stream)?;
            let peer = preamble.node as usize;
            if peer >= self.nodes || connected[peer] {
                return Err(ProtocolError::UnknownPeer(preamble.node).into());
            }
            if preamble.buckets != self.buckets {
                return Err(ProtocolError::BucketCountMismatch {
                    peer: preamble.node,
                    theirs: preamble.buckets,
                    ours: self.buckets,
                }
                .into());
            }
            connected[peer] = true;
            stream.set_nonblocking(true)?;
            log::info!("Node {}: accepted node {peer} from {addr}", self.node);
            netins.push(NetIn::new(
                preamble.node,
                stream,
                self.router.map.buckets_per_node(),
            ));
        }
        Ok(netins)
    }

    /// Accepts every peer and receives until all of them are done. The disk writer handles are released on return.
    pub fn run(self) -> Result<ReceiverStats> {
        let netins = self.accept_all()?;
        self.receive_loop(netins)
    }

    pub fn receive_loop(self, mut live: Vec<NetIn<TcpStream>>) -> Result<ReceiverStats> {
        let span = tracing::info_span!("receive_loop", node = self.node);
        let _guard = span.enter();

        let mut stats = ReceiverStats {
            connections: live.len(),
            bytes: 0,
        };
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(live.len());
        while !live.is_empty() {
            fds.clear();
            fds.extend(live.iter().map(|netin| libc::pollfd {
                fd: netin.stream().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }));
            // SAFETY: `fds` is a valid, initialized array of `fds.len()` pollfd entries.
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            // Back to front so swap_remove only moves entries that were already visited.
            for i in (0..fds.len()).rev() {
                if fds[i].revents == 0 {
                    continue;
                }
                if !live[i].read(&self.router)? {
                    let done = live.swap_remove(i);
                    stats.bytes += done.bytes_received();
                    log::info!(
                        "Node {}: node {} finished after {} bytes, {} connection(s) left",
                        self.node,
                        done.peer(),
                        done.bytes_received(),
                        live.len()
                    );
                }
            }
        }
        Ok(stats)
    }
}
