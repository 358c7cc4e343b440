use crate::block::BucketBuffer;
use crate::error::{Error, ProtocolError, Result};
use crate::node::NodeContext;
use crate::partition::PartitionMap;
use crate::wire::{write_frame, Preamble};

use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

const ONE_MIB: usize = 1 << 20;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetOutStats {
    pub frames: u64,
    pub bytes: u64,
}

/// The outbound link to one peer (this node included). Every local reader feeds the same bounded queue; a single
/// thread drains it onto the socket.
///
/// Readers each close every bucket they know about. The link only tells the peer a bucket is finished once *all*
/// `readers` have closed it, so the peer sees exactly one end-of-bucket frame per bucket it owns.
pub struct NetOut {
    peer: usize,
    tx: Sender<BucketBuffer>,
    thread_handle: thread::JoinHandle<Result<NetOutStats>>,
}

impl NetOut {
    pub fn connect(ctx: &NodeContext, peer: usize, readers: usize) -> Result<Self> {
        let addr = ctx.addresses()[peer];
        let stream = connect_with_retry(addr, ctx.config().connect_timeout)?;
        stream.set_nodelay(true)?;
        log::info!("Connected to node {peer} at {addr}");

        let mut writer = BufWriter::with_capacity(ONE_MIB, stream);
        Preamble {
            node: ctx.id() as u16,
            buckets: ctx.map().buckets() as u16,
        }
        .write_to(&mut writer)?;
        // The peer reads the preamble before it polls anything, so it can't wait behind a block of data.
        writer.flush()?;

        let (tx, rx) = bounded(ctx.config().net_queue_len);
        let map = ctx.map().clone();
        let thread_handle = thread::spawn(move || {
            let result = run_net_out(&map, peer, readers, rx, writer);
            if let Err(e) = &result {
                log::error!("Link to node {peer} exited with: {e:?}");
            }
            result
        });

        Ok(Self {
            peer,
            tx,
            thread_handle,
        })
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    /// A producer handle. Blocks on `send` while the link's queue is full.
    pub fn sender(&self) -> Sender<BucketBuffer> {
        self.tx.clone()
    }

    /// Waits until every bucket has been closed by every reader and the link is flushed.
    pub fn finish(self) -> Result<NetOutStats> {
        drop(self.tx);
        self.thread_handle
            .join()
            .map_err(|_| Error::WorkerPanicked("network sender"))?
    }
}

pub(crate) fn connect_with_retry(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            // Peers come up at slightly different times; wait for their listener.
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionRefused && Instant::now() < deadline =>
            {
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drains `rx` onto `writer` until every bucket owned by `peer` has been closed by all `readers`.
pub(crate) fn run_net_out<W: Write>(
    map: &PartitionMap,
    peer: usize,
    readers: usize,
    rx: Receiver<BucketBuffer>,
    mut writer: W,
) -> Result<NetOutStats> {
    let span = tracing::info_span!("net_out", peer);
    let _guard = span.enter();

    let owned: Vec<u16> = map.owned_buckets(peer).collect();
    let mut open_readers = vec![readers; owned.len()];
    let mut buckets_live = owned.len();
    let mut stats = NetOutStats::default();

    if readers == 0 {
        for &bucket in &owned {
            write_frame(&mut writer, bucket, &[])?;
            stats.frames += 1;
        }
        buckets_live = 0;
    }

    while buckets_live > 0 {
        let buffer = rx
            .recv()
            .map_err(|_| Error::Disconnected("local reader"))?;
        debug_assert_eq!(map.owner_node(buffer.bucket), peer);
        if buffer.is_eof() {
            let open = &mut open_readers[map.local_id(buffer.bucket)];
            *open = open
                .checked_sub(1)
                .ok_or(ProtocolError::DuplicateEof(buffer.bucket))?;
            if *open == 0 {
                write_frame(&mut writer, buffer.bucket, &[])?;
                stats.frames += 1;
                buckets_live -= 1;
            }
        } else {
            write_frame(&mut writer, buffer.bucket, &buffer.data)?;
            stats.frames += 1;
            stats.bytes += buffer.len() as u64;
        }
    }
    writer.flush()?;

    log::info!(
        "Link to node {peer} done: {} bytes in {} frame(s)",
        stats.bytes,
        stats.frames
    );
    Ok(stats)
}
