//! # Cluster Sort
//!
//! Sort a data set of fixed-size records that is spread over the local disks of many machines. Every record is 100
//! bytes: a 10-byte key compared as unsigned bytes, followed by a 90-byte payload that is carried along untouched.
//!
//! When all nodes are done, each node's disks hold a totally ordered partition of the key space: concatenating the
//! sorted bucket files in bucket order, across all nodes, yields the whole data set in key order.
//!
//! ## Implementation
//!
//! The key space is cut into equal-width ranges ("buckets"), and each bucket is assigned to one (node, disk) pair by a
//! [`PartitionMap`] that every node computes identically.
//!
//! 1. **Shuffle** ([`shuffle()`]). One [`Partitioner`] thread per local input file reads records, sorts them into
//!    per-bucket buffers, and hands full buffers to the [`NetOut`] link of the bucket's owner node. Each link is one
//!    TCP connection drained by one thread. On the other end, a single [`Receiver`] thread polls every inbound
//!    connection, reassembles frames with a [`NetIn`] state machine per connection, and passes the bytes to the
//!    [`DiskWriter`] of the bucket's disk, which appends them to the bucket file and fsyncs on shutdown. A node sends
//!    its own data to itself over the same path.
//! 2. **Sort** ([`Sorter`]). Each local disk loads its buckets one by one, sorts each in memory and saves it to a
//!    separate sorted file, loading the next bucket while the current one is sorted and saved. With
//!    [`Config::client_addr`] set, each disk also streams its sorted records to that client.
//!
//! All stages are connected by bounded queues. A slow disk or link fills its queue and blocks whoever feeds it, all the
//! way back to the input files; that is the only flow control.
//!
//! ## Memory Usage
//!
//! Unless fixed in [`Config::buckets_per_node`], the bucket count is chosen from [`Config::records_per_node`] and
//! [`Config::memory_bytes`] so that two buckets per disk fit in memory at once during the sort. Both are cluster-wide
//! figures: every node must be started with the same values. Buckets are equal-width key ranges, so skewed key distributions make some buckets larger
//! than average.
//!
//! ## Failure Model
//!
//! Nothing is retried. Any I/O or protocol failure ends the stage it happens in, the failure spreads through the closed
//! queues and sockets, and the job must be restarted from scratch. Phase two only runs with a [`ShuffleReceipt`].
//!
//! ## Equal Keys
//!
//! Only the key decides a record's bucket. Records with exactly the same key always land in the same bucket, but no
//! order is defined between them.

mod block;
mod config;
mod disk_writer;
mod error;
mod net_in;
mod net_out;
mod node;
mod partition;
mod partitioner;
mod record;
mod shuffle;
mod sort;
mod wire;

pub use block::BucketBuffer;
pub use config::{ClusterConfig, Config};
pub use disk_writer::{DiskWriter, DiskWriterStats};
pub use error::{ConfigError, Error, ProtocolError, Result};
pub use net_in::{NetIn, Receiver, ReceiverStats, Router};
pub use net_out::{NetOut, NetOutStats};
pub use node::{disk_dirs_for_inputs, NodeContext};
pub use partition::{buckets_per_node, max_sort_records, PartitionMap, MAX_BUCKETS};
pub use partitioner::{count_bucket_distribution, partition_records, PartitionStats, Partitioner};
pub use record::{
    is_sorted, key_with_prefix, records, records_mut, sort_records, Key, Record, KEY_LEN, MAX_KEY,
    PAYLOAD_LEN, RECORD_SIZE,
};
pub use shuffle::{bind, shuffle, ShuffleReceipt, ShuffleStats};
pub use sort::{
    sort_buckets, sort_buckets_to, sort_disk, BucketSorter, ClientSink, DiskSortStats, SortScope, Sorter,
};
pub use wire::{write_frame, FrameHeader, Preamble, HEADER_SIZE, PREAMBLE_SIZE};

use std::net::TcpListener;

/// Runs both phases on one node. Phase two starts only after this node's shuffle completed.
pub fn run(
    ctx: &NodeContext,
    listener: TcpListener,
    scope: SortScope,
) -> Result<(ShuffleReceipt, Vec<DiskSortStats>)> {
    ctx.log_layout();
    let receipt = shuffle(ctx, listener)?;
    let sorted = Sorter::run(ctx, &receipt, scope)?;
    log::info!("Node {}: phase two done", ctx.id());
    Ok((receipt, sorted))
}
