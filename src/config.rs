use crate::error::{ConfigError, Result};
use crate::record::RECORD_SIZE;

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

const ONE_MIB: u64 = 1 << 20;

/// Tuning parameters shared by both phases.
///
/// Total phase-one buffering is bounded by the queue lengths times the block sizes: roughly
/// `net_queue_len * net_block_records * RECORD_SIZE` per peer link plus
/// `disk_queue_len * disk_block_records * RECORD_SIZE` per local disk. There is one link per node in the cluster, so
/// the network share grows with cluster size; see [`Config::phase_one_buffer_bytes`].
///
/// Every node must be given the same sizing fields (`buckets_per_node`, or `records_per_node` with `memory_bytes`),
/// since all nodes have to agree on the partition map.
#[derive(Clone, Debug)]
pub struct Config {
    /// Records accumulated per bucket by a reader before the buffer is handed to the network.
    pub net_block_records: usize,
    /// Capacity of each peer link's outbound queue, in buffers.
    pub net_queue_len: usize,
    /// Records accumulated per bucket by the receiver before the buffer is handed to a disk writer.
    pub disk_block_records: usize,
    /// Capacity of each disk writer's queue, in buffers.
    pub disk_queue_len: usize,
    /// Lower bound on buckets per disk, whatever the data volume.
    pub min_buckets_per_disk: usize,
    /// Memory left to the OS when sizing sort buffers.
    pub memory_reserve: u64,
    /// Memory of every node available to the sort, before `memory_reserve`. Must not exceed this node's physical
    /// memory.
    pub memory_bytes: Option<u64>,
    /// The most records any single node holds. No node may start with more than this.
    pub records_per_node: Option<u64>,
    /// Fixes the number of buckets per node. Otherwise it is derived from `records_per_node` and `memory_bytes`.
    pub buckets_per_node: Option<usize>,
    /// How long to keep retrying outbound connections while peers start listening.
    pub connect_timeout: Duration,
    /// Refuse to start if a disk can't hold its share of the data twice over.
    pub check_disk_capacity: bool,
    /// Drop a bucket file's pages from the page cache once it has been loaded for sorting.
    pub drop_page_cache: bool,
    /// Phase two also streams the selected records of each sorted bucket to this address, one connection per disk.
    pub client_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            net_block_records: 10240,
            net_queue_len: 64,
            disk_block_records: 1024 * 102,
            disk_queue_len: 200,
            min_buckets_per_disk: 2,
            memory_reserve: 2000 * ONE_MIB,
            memory_bytes: None,
            records_per_node: None,
            buckets_per_node: None,
            connect_timeout: Duration::from_secs(10),
            check_disk_capacity: true,
            drop_page_cache: true,
            client_addr: None,
        }
    }
}

impl Config {
    pub fn net_block_bytes(&self) -> usize {
        self.net_block_records * RECORD_SIZE
    }

    pub fn disk_block_bytes(&self) -> usize {
        self.disk_block_records * RECORD_SIZE
    }

    /// Upper bound on the bytes queued during phase one on a node of a `nodes`-node cluster with `disks` disks.
    pub fn phase_one_buffer_bytes(&self, nodes: usize, disks: usize) -> u64 {
        let links = (nodes * self.net_queue_len * self.net_block_bytes()) as u64;
        let writers = (disks * self.disk_queue_len * self.disk_block_bytes()) as u64;
        links + writers
    }
}

/// Cluster membership: one `host:port` per line, the line index being the node id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    pub addresses: Vec<SocketAddr>,
}

impl ClusterConfig {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses and resolves every line. Blank lines are skipped and do not consume a node id.
    pub fn parse(text: &str) -> Result<Self> {
        let mut addresses = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            let bad_line = || ConfigError::BadClusterLine {
                line: i + 1,
                text: line.to_owned(),
            };
            if !line.contains(':') {
                return Err(bad_line().into());
            }
            let addr = line
                .to_socket_addrs()
                .map_err(|_| bad_line())?
                .next()
                .ok_or_else(bad_line)?;
            addresses.push(addr);
        }
        if addresses.is_empty() {
            return Err(ConfigError::NoNodes.into());
        }
        Ok(Self { addresses })
    }

    pub fn nodes(&self) -> usize {
        self.addresses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn parse_orders_nodes_by_line() {
        let cluster = ClusterConfig::parse("127.0.0.1:9000\r\n127.0.0.1:9001\n\n").unwrap();
        assert_eq!(cluster.nodes(), 2);
        assert_eq!(cluster.addresses[0].port(), 9000);
        assert_eq!(cluster.addresses[1].port(), 9001);
    }

    #[test]
    fn parse_rejects_missing_port() {
        let err = ClusterConfig::parse("127.0.0.1:9000\nlocalhost\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::BadClusterLine { line: 2, .. })
        ));
    }

    #[test]
    fn default_link_buffering_stays_small_per_peer() {
        let config = Config::default();
        let one_link = config.phase_one_buffer_bytes(1, 0);
        assert!(one_link <= 128 * ONE_MIB);
        assert_eq!(config.phase_one_buffer_bytes(10, 0), 10 * one_link);
        assert_eq!(
            config.phase_one_buffer_bytes(2, 3) - config.phase_one_buffer_bytes(2, 0),
            3 * (config.disk_queue_len * config.disk_block_bytes()) as u64
        );
    }

    #[test]
    fn parse_rejects_empty_file() {
        assert!(matches!(
            ClusterConfig::parse("\n"),
            Err(Error::Config(ConfigError::NoNodes))
        ));
    }
}
