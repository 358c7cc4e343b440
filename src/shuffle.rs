//! Phase one: every node reads its input files, range-partitions the records, and streams each bucket to the node
//! that owns it, where it lands in that bucket's file.

use crate::disk_writer::{DiskWriter, DiskWriterStats};
use crate::error::{ConfigError, Error, Result};
use crate::net_in::{Receiver, ReceiverStats};
use crate::net_out::{NetOut, NetOutStats};
use crate::node::NodeContext;
use crate::partitioner::{PartitionStats, Partitioner};

use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::thread;

const COMPLETION_MARKER: &str = "SHUFFLE_COMPLETE";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShuffleStats {
    pub records_read: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_written: u64,
}

/// Proof that phase one finished on this node and every bucket file is durable. Phase two requires one.
#[derive(Debug)]
pub struct ShuffleReceipt {
    node: usize,
    buckets: usize,
    stats: ShuffleStats,
}

impl ShuffleReceipt {
    pub fn node(&self) -> usize {
        self.node
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn stats(&self) -> &ShuffleStats {
        &self.stats
    }

    /// Recovers a receipt from the completion markers of an earlier run, so phase two can run in a new process.
    /// Fails unless every disk has a marker written for this node and partition layout.
    pub fn from_markers(ctx: &NodeContext) -> Result<Self> {
        let expected = marker_contents(ctx);
        for disk in 0..ctx.disks() {
            let path = ctx.bucket_dir(disk).join(COMPLETION_MARKER);
            match fs::read_to_string(&path) {
                Ok(contents) if contents == expected => {}
                _ => return Err(ConfigError::ShuffleIncomplete(path).into()),
            }
        }
        Ok(Self {
            node: ctx.id(),
            buckets: ctx.map().buckets(),
            stats: ShuffleStats::default(),
        })
    }
}

fn marker_contents(ctx: &NodeContext) -> String {
    format!(
        "node={} nodes={} buckets={}\n",
        ctx.id(),
        ctx.nodes(),
        ctx.map().buckets()
    )
}

/// Binds this node's listening socket on all interfaces at the port from the cluster file.
pub fn bind(ctx: &NodeContext) -> Result<TcpListener> {
    let port = ctx.addresses()[ctx.id()].port();
    Ok(TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))?)
}

/// Runs phase one to completion on this node, using an already bound `listener`.
///
/// Returns once every local input has been sent, every peer has closed every bucket this node owns, and every
/// bucket file has been fsynced.
pub fn shuffle(ctx: &NodeContext, listener: TcpListener) -> Result<ShuffleReceipt> {
    let span = tracing::info_span!("shuffle_phase", node = ctx.id());
    let _guard = span.enter();
    log::info!("Node {}: phase one starting", ctx.id());

    // Markers from an earlier run must not vouch for the files about to be truncated.
    for disk in 0..ctx.disks() {
        let marker = ctx.bucket_dir(disk).join(COMPLETION_MARKER);
        if marker.exists() {
            fs::remove_file(marker)?;
        }
    }

    let writers = (0..ctx.disks())
        .map(|disk| DiskWriter::start(ctx, disk))
        .collect::<Result<Vec<_>>>()?;

    let receiver = Receiver::new(listener, ctx, writers.iter().map(DiskWriter::sender).collect());
    let receiver_handle = thread::spawn(move || {
        let result = receiver.run();
        if let Err(e) = &result {
            log::error!("Receiver exited with: {e:?}");
        }
        result
    });

    let (records_read, bytes_sent) = match send_local_inputs(ctx) {
        Ok(sent) => sent,
        // A receiver that already failed usually caused the send failure and knows why. One that is still running
        // may wait on peers that will never connect, so it is left behind.
        Err(send_err) => {
            if receiver_handle.is_finished() {
                if let Ok(Err(recv_err)) = receiver_handle.join() {
                    return Err(recv_err);
                }
            }
            return Err(send_err);
        }
    };

    let received = receiver_handle
        .join()
        .map_err(|_| Error::WorkerPanicked("receiver"));
    // Writers drain whatever they were given even if another stage failed, so no thread outlives this call.
    let written: Vec<Result<DiskWriterStats>> =
        writers.into_iter().map(DiskWriter::finish).collect();

    let ReceiverStats { bytes, .. } = received??;
    let mut bytes_written = 0;
    for w in written {
        bytes_written += w?.bytes;
    }

    for disk in 0..ctx.disks() {
        fs::write(
            ctx.bucket_dir(disk).join(COMPLETION_MARKER),
            marker_contents(ctx),
        )?;
    }

    let stats = ShuffleStats {
        records_read,
        bytes_sent,
        bytes_received: bytes,
        bytes_written,
    };
    log::info!("Node {}: phase one done: {stats:?}", ctx.id());
    Ok(ShuffleReceipt {
        node: ctx.id(),
        buckets: ctx.map().buckets(),
        stats,
    })
}

/// Connects to every peer, reads every local input, and waits until all links are flushed.
fn send_local_inputs(ctx: &NodeContext) -> Result<(u64, u64)> {
    let readers = ctx.inputs().len();
    let links = (0..ctx.nodes())
        .map(|peer| NetOut::connect(ctx, peer, readers))
        .collect::<Result<Vec<_>>>()?;

    let partitioners: Vec<Partitioner> = ctx
        .inputs()
        .iter()
        .map(|path| {
            Partitioner::spawn(
                path.clone(),
                ctx.map().clone(),
                ctx.config().net_block_bytes(),
                links.iter().map(NetOut::sender).collect(),
            )
        })
        .collect();

    let read: Vec<Result<PartitionStats>> =
        partitioners.into_iter().map(Partitioner::finish).collect();
    let sent: Vec<Result<NetOutStats>> = links.into_iter().map(NetOut::finish).collect();

    let mut records = 0;
    for r in read {
        records += r?.records;
    }
    let mut bytes = 0;
    for s in sent {
        bytes += s?.bytes;
    }
    Ok((records, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, Config};
    use crate::error::ProtocolError;
    use crate::record::RECORD_SIZE;
    use crate::wire::Preamble;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn receiver_error_wins_over_the_send_failure_it_causes() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        // Nothing listens at node 1's address, so connecting to it fails once the timeout runs out.
        let unreachable = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let cluster = ClusterConfig::new(vec![listener.local_addr().unwrap(), unreachable]);

        let input = dir.path().join("input");
        fs::write(&input, vec![0u8; 4 * RECORD_SIZE]).unwrap();
        let config = Config {
            buckets_per_node: Some(2),
            connect_timeout: Duration::from_millis(500),
            ..Config::default()
        };
        let ctx = NodeContext::new(0, &cluster, vec![input], vec![dir.path().to_owned()], config).unwrap();

        // A peer that partitions the key space differently is first in the accept queue.
        let mut impostor = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut preamble = Vec::new();
        Preamble {
            node: 1,
            buckets: 8,
        }
        .write_to(&mut preamble)
        .unwrap();
        impostor.write_all(&preamble).unwrap();

        let result = shuffle(&ctx, listener);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::BucketCountMismatch {
                peer: 1,
                theirs: 8,
                ours: 4,
            }))
        ));
        drop(impostor);
        assert!(ShuffleReceipt::from_markers(&ctx).is_err());
    }
}
