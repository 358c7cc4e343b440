use crate::config::{ClusterConfig, Config};
use crate::error::{ConfigError, Result};
use crate::partition::{buckets_per_node, max_sort_records, PartitionMap};
use crate::record::RECORD_SIZE;

use std::ffi::CString;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const BUCKET_DIR: &str = "buckets";
const BUCKET_EXT: &str = "bucket";
const SORTED_PREFIX: &str = "sorted.";

/// Everything a node knows about itself and the cluster. Immutable once built and shared by reference between all
/// worker threads of both phases.
#[derive(Debug)]
pub struct NodeContext {
    id: usize,
    addresses: Vec<SocketAddr>,
    inputs: Vec<PathBuf>,
    disk_dirs: Vec<PathBuf>,
    local_records: u64,
    map: PartitionMap,
    config: Config,
}

impl NodeContext {
    /// Validates the node's inputs and derives the partition map.
    ///
    /// `disk_dirs` are the roots of the node's local disks; bucket files go under `<disk>/buckets/`.
    pub fn new(
        id: usize,
        cluster: &ClusterConfig,
        inputs: Vec<PathBuf>,
        disk_dirs: Vec<PathBuf>,
        config: Config,
    ) -> Result<Self> {
        let nodes = cluster.nodes();
        if nodes == 0 {
            return Err(ConfigError::NoNodes.into());
        }
        if id >= nodes {
            return Err(ConfigError::UnknownNode { id, nodes }.into());
        }
        if disk_dirs.is_empty() {
            return Err(ConfigError::NoDisks.into());
        }

        let mut local_records = 0;
        for path in &inputs {
            let len = fs::metadata(path)?.len();
            if len % RECORD_SIZE as u64 != 0 {
                return Err(ConfigError::PartialRecord {
                    path: path.clone(),
                    len,
                }
                .into());
            }
            local_records += len / RECORD_SIZE as u64;
        }

        let disks = disk_dirs.len();
        if let Some(limit) = config.records_per_node {
            if local_records > limit {
                return Err(ConfigError::TooManyLocalRecords {
                    local: local_records,
                    limit,
                }
                .into());
            }
        }
        // Only cluster-wide figures go into the bucket count, so every node derives the same map.
        let buckets_per_node = match (
            config.buckets_per_node,
            config.records_per_node,
            config.memory_bytes,
        ) {
            (Some(n), _, _) => n,
            (None, Some(records), Some(memory)) => {
                let physical = physical_memory()?;
                if memory > physical {
                    return Err(ConfigError::MemoryExceedsPhysical {
                        configured: memory,
                        physical,
                    }
                    .into());
                }
                let capacity = max_sort_records(memory, config.memory_reserve, disks)?;
                buckets_per_node(records, disks, capacity, config.min_buckets_per_disk)
            }
            _ => return Err(ConfigError::UnsizedBuckets.into()),
        };
        let map = PartitionMap::new(nodes, disks, buckets_per_node)?;

        if config.check_disk_capacity && local_records > 0 {
            // Each disk holds an unsorted and a sorted copy of its share.
            let required = (local_records * RECORD_SIZE as u64).div_ceil(disks as u64) * 2;
            for dir in &disk_dirs {
                let available = free_space(dir)?;
                if available < required {
                    return Err(ConfigError::InsufficientDiskSpace {
                        path: dir.clone(),
                        available,
                        required,
                    }
                    .into());
                }
            }
        }

        Ok(Self {
            id,
            addresses: cluster.addresses.clone(),
            inputs,
            disk_dirs,
            local_records,
            map,
            config,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn nodes(&self) -> usize {
        self.addresses.len()
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn disks(&self) -> usize {
        self.disk_dirs.len()
    }

    pub fn local_records(&self) -> u64 {
        self.local_records
    }

    pub fn map(&self) -> &PartitionMap {
        &self.map
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn my_buckets(&self) -> impl Iterator<Item = u16> + '_ {
        self.map.owned_buckets(self.id)
    }

    pub fn disk_buckets(&self, disk: usize) -> impl Iterator<Item = u16> + '_ {
        self.map.disk_buckets(self.id, disk)
    }

    pub fn bucket_dir(&self, disk: usize) -> PathBuf {
        self.disk_dirs[disk].join(BUCKET_DIR)
    }

    pub fn bucket_path(&self, bucket: u16) -> PathBuf {
        self.bucket_dir(self.map.owner_disk(bucket))
            .join(format!("{bucket}.{BUCKET_EXT}"))
    }

    pub fn sorted_bucket_path(&self, bucket: u16) -> PathBuf {
        self.bucket_dir(self.map.owner_disk(bucket))
            .join(format!("{SORTED_PREFIX}{bucket}.{BUCKET_EXT}"))
    }

    /// Average number of records per local bucket, assuming every node holds a similar amount of data.
    pub fn avg_bucket_records(&self) -> u64 {
        self.local_records / self.map.buckets_per_node() as u64
    }

    /// Size in bytes of every owned bucket, preferring the sorted file when it exists.
    pub fn bucket_sizes(&self) -> Result<Vec<(u16, u64)>> {
        self.my_buckets()
            .map(|bucket| {
                let sorted = self.sorted_bucket_path(bucket);
                let path = if sorted.exists() {
                    sorted
                } else {
                    self.bucket_path(bucket)
                };
                Ok((bucket, fs::metadata(path)?.len()))
            })
            .collect()
    }

    pub fn log_layout(&self) {
        log::info!(
            "Node {} of {}: {} disk(s), {} input file(s), {} local records",
            self.id,
            self.nodes(),
            self.disks(),
            self.inputs.len(),
            self.local_records
        );
        for (disk, dir) in self.disk_dirs.iter().enumerate() {
            log::info!("Disk {disk} at {}", dir.display());
        }
        log::info!(
            "{} buckets in cluster, {} owned by this node",
            self.map.buckets(),
            self.map.buckets_per_node()
        );
        log::info!(
            "Phase one may queue up to {} bytes",
            self.config.phase_one_buffer_bytes(self.nodes(), self.disks())
        );
        for bucket in self.my_buckets() {
            log::debug!(
                "Bucket {bucket} -> local id {}, disk {}",
                self.map.local_id(bucket),
                self.map.owner_disk(bucket)
            );
        }
        for (node, addr) in self.addresses.iter().enumerate() {
            log::debug!("Node {node} at {addr}");
        }
    }
}

/// The distinct parent directories of `inputs`, in first-seen order. Each one is treated as a separate disk.
pub fn disk_dirs_for_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for input in inputs {
        let parent = input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if input.file_name().is_none() {
            return Err(ConfigError::NoParentDir(input.clone()).into());
        }
        if !dirs.contains(&parent) {
            dirs.push(parent);
        }
    }
    Ok(dirs)
}

fn physical_memory() -> io::Result<u64> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages < 0 || page_size < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pages as u64 * page_size as u64)
}

fn free_space(dir: &Path) -> io::Result<u64> {
    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is NUL-terminated and `stat` is a valid out-pointer.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}
