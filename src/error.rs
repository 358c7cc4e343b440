use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Any failure that aborts a sort job. Nothing in this crate retries; the job is expected to be restarted as a whole.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A pipeline stage disappeared while its peers still had work for it.
    #[error("{0} disconnected before the pipeline drained")]
    Disconnected(&'static str),
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
    #[error("input ends {0} bytes into a record")]
    TruncatedRecord(usize),
}

/// Startup-time errors. These are detected before any bucket I/O happens.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cluster must have at least one node")]
    NoNodes,
    #[error("node must have at least one disk")]
    NoDisks,
    #[error("cluster of {0} nodes is too large for 16-bit bucket ids")]
    TooManyNodes(usize),
    #[error("{0} buckets can't be addressed by a 16-bit bucket id")]
    TooManyBuckets(usize),
    #[error("{buckets} buckets don't map cleanly to {nodes} nodes with {disks} disks each")]
    UnevenBuckets {
        buckets: usize,
        nodes: usize,
        disks: usize,
    },
    #[error("node id {id} is not in a cluster of {nodes} nodes")]
    UnknownNode { id: usize, nodes: usize },
    #[error("{available} bytes of memory can't hold a sort buffer after reserving {reserve} bytes")]
    InsufficientMemory { available: u64, reserve: u64 },
    #[error("configured memory of {configured} bytes exceeds the {physical} bytes this node has")]
    MemoryExceedsPhysical { configured: u64, physical: u64 },
    #[error("bucket count needs either buckets_per_node or both records_per_node and memory_bytes")]
    UnsizedBuckets,
    #[error("node holds {local} records, more than the {limit} every node was sized for")]
    TooManyLocalRecords { local: u64, limit: u64 },
    #[error("{path:?} has {available} bytes free but needs {required}")]
    InsufficientDiskSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },
    #[error("{path:?} is {len} bytes, which is not a whole number of records")]
    PartialRecord { path: PathBuf, len: u64 },
    #[error("line {line} of the cluster file is not a host:port address: {text:?}")]
    BadClusterLine { line: usize, text: String },
    #[error("{0:?} has no parent directory to use as a disk")]
    NoParentDir(PathBuf),
    #[error("phase one did not complete on {0:?}")]
    ShuffleIncomplete(PathBuf),
}

/// Violations of the node-to-node wire format. Fatal for the connection they occur on.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("peer {peer} uses {theirs} buckets but this node uses {ours}")]
    BucketCountMismatch { peer: u16, theirs: u16, ours: u16 },
    #[error("peer claims node id {0}, which is not in the cluster")]
    UnknownPeer(u16),
    #[error("frame for bucket {0}, which this node does not own")]
    ForeignBucket(u16),
    #[error("bucket {0} closed twice on one connection")]
    DuplicateEof(u16),
    #[error("frame body of {0} bytes is not a whole number of records")]
    PartialRecordBody(u64),
    #[error("connection closed with {buckets_live} buckets still open")]
    UnexpectedEof { buckets_live: usize },
}
