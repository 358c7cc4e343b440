use crate::block::BucketBuffer;
use crate::error::{Error, Result};
use crate::partition::PartitionMap;
use crate::record::{Record, RECORD_SIZE};

use bytemuck::{bytes_of, bytes_of_mut, Zeroable};
use crossbeam_channel::Sender;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::mem;
use std::path::{Path, PathBuf};
use std::thread;

const ONE_MIB: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub records: u64,
    pub buffers: u64,
}

/// Streams one local input file, splits its records by bucket and hands full buffers to the link of each bucket's
/// owner node. Runs on its own thread so local disks are read in parallel.
pub struct Partitioner {
    path: PathBuf,
    thread_handle: thread::JoinHandle<Result<PartitionStats>>,
}

impl Partitioner {
    /// `links[node]` is the queue of the link to `node`.
    pub fn spawn(
        path: PathBuf,
        map: PartitionMap,
        block_bytes: usize,
        links: Vec<Sender<BucketBuffer>>,
    ) -> Self {
        let thread_path = path.clone();
        let thread_handle = thread::spawn(move || {
            let result = File::open(&thread_path)
                .map_err(Error::from)
                .and_then(|file| partition_records(file, &map, block_bytes, &links));
            match &result {
                Ok(stats) => log::info!(
                    "Partitioned {} records from {}",
                    stats.records,
                    thread_path.display()
                ),
                Err(e) => log::error!(
                    "Reader for {} exited with: {e:?}",
                    thread_path.display()
                ),
            }
            result
        });
        Self {
            path,
            thread_handle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(self) -> Result<PartitionStats> {
        self.thread_handle
            .join()
            .map_err(|_| Error::WorkerPanicked("reader"))?
    }
}

/// Partitions every record of `input`. At EOF, flushes each non-empty bucket buffer and then closes every bucket
/// with an end-of-bucket sentinel on its owner's link.
pub fn partition_records(
    input: impl Read,
    map: &PartitionMap,
    block_bytes: usize,
    links: &[Sender<BucketBuffer>],
) -> Result<PartitionStats> {
    let span = tracing::info_span!("partition_file");
    let _guard = span.enter();

    let mut reader = BufReader::with_capacity(ONE_MIB, input);
    let mut buckets: Vec<Vec<u8>> = (0..map.buckets()).map(|_| Vec::new()).collect();
    let mut stats = PartitionStats::default();

    let send = |bucket: u16, buffer: BucketBuffer| -> Result<()> {
        links[map.owner_node(bucket)]
            .send(buffer)
            .map_err(|_| Error::Disconnected("network sender"))
    };

    let mut record = Record::zeroed();
    while read_record(&mut reader, &mut record)? {
        stats.records += 1;
        let bucket = map.bucket_for(&record.key);
        let buf = &mut buckets[bucket as usize];
        if buf.capacity() == 0 {
            buf.reserve_exact(block_bytes);
        }
        buf.extend_from_slice(bytes_of(&record));
        if buf.len() >= block_bytes {
            let data = mem::replace(buf, Vec::with_capacity(block_bytes));
            send(bucket, BucketBuffer { bucket, data })?;
            stats.buffers += 1;
        }
    }

    for (bucket, data) in buckets.into_iter().enumerate() {
        let bucket = bucket as u16;
        if !data.is_empty() {
            send(bucket, BucketBuffer { bucket, data })?;
            stats.buffers += 1;
        }
        send(bucket, BucketBuffer::eof(bucket))?;
    }
    Ok(stats)
}

/// Counts how many records of `path` fall into each bucket, without sending anything.
pub fn count_bucket_distribution(path: impl AsRef<Path>, map: &PartitionMap) -> Result<Vec<u64>> {
    let mut reader = BufReader::with_capacity(ONE_MIB, File::open(path)?);
    let mut counts = vec![0; map.buckets()];
    let mut record = Record::zeroed();
    while read_record(&mut reader, &mut record)? {
        counts[map.bucket_for(&record.key) as usize] += 1;
    }
    Ok(counts)
}

/// Reads the next whole record. `Ok(false)` only at a clean end of input; stopping partway into a record is an error.
fn read_record(mut reader: impl Read, record: &mut Record) -> Result<bool> {
    let buf = bytes_of_mut(record);
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(false),
        RECORD_SIZE => Ok(true),
        partial => Err(Error::TruncatedRecord(partial)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::key_with_prefix;
    use crossbeam_channel::unbounded;
    use std::fs;
    use tempfile::tempdir;

    fn input(prefixes: &[u8]) -> Vec<u8> {
        prefixes
            .iter()
            .flat_map(|&p| {
                let mut r = Record::zeroed();
                r.key = key_with_prefix(&[p]);
                r.payload[0] = p;
                bytes_of(&r).to_vec()
            })
            .collect()
    }

    #[test]
    fn routes_buffers_to_owner_links_and_closes_every_bucket() {
        // 4 buckets over 2 nodes: buckets 0 and 2 go to node 0, 1 and 3 to node 1.
        let map = PartitionMap::new(2, 1, 2).unwrap();
        let (tx0, rx0) = unbounded();
        let (tx1, rx1) = unbounded();
        let data = input(&[0x00, 0x40, 0x10, 0x80, 0xC0, 0x20]);

        // Two records per buffer.
        let stats = partition_records(data.as_slice(), &map, 2 * RECORD_SIZE, &[tx0, tx1]).unwrap();
        assert_eq!(stats.records, 6);

        let node0: Vec<_> = rx0.try_iter().map(|b| (b.bucket, b.len())).collect();
        let node1: Vec<_> = rx1.try_iter().map(|b| (b.bucket, b.len())).collect();
        assert_eq!(
            node0,
            vec![
                (0, 2 * RECORD_SIZE), // filled mid-stream by 0x00 and 0x10
                (0, RECORD_SIZE),     // 0x20 flushed at EOF
                (0, 0),
                (2, RECORD_SIZE),
                (2, 0),
            ]
        );
        assert_eq!(
            node1,
            vec![(1, RECORD_SIZE), (1, 0), (3, RECORD_SIZE), (3, 0)]
        );
        assert_eq!(stats.buffers, 5);
    }

    #[test]
    fn empty_input_still_closes_every_bucket() {
        let map = PartitionMap::new(1, 1, 3).unwrap();
        let (tx, rx) = unbounded();
        partition_records(io::empty(), &map, RECORD_SIZE, &[tx]).unwrap();
        let eofs: Vec<_> = rx.try_iter().map(|b| (b.bucket, b.is_eof())).collect();
        assert_eq!(eofs, vec![(0, true), (1, true), (2, true)]);
    }

    #[test]
    fn dropped_link_stops_the_reader() {
        let map = PartitionMap::new(1, 1, 1).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let result = partition_records(input(&[1]).as_slice(), &map, RECORD_SIZE, &[tx]);
        assert!(matches!(result, Err(Error::Disconnected(_))));
    }

    #[test]
    fn trailing_partial_record_is_an_error() {
        let map = PartitionMap::new(1, 1, 1).unwrap();
        let (tx, _rx) = unbounded();
        let mut data = input(&[0x10, 0x20]);
        data.truncate(RECORD_SIZE + 7);
        let result = partition_records(data.as_slice(), &map, RECORD_SIZE, &[tx]);
        assert!(matches!(result, Err(Error::TruncatedRecord(7))));
    }

    #[test]
    fn records_split_across_reads_are_reassembled() {
        // Hands out at most 3 bytes per read.
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(3).min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let data = input(&[0x00, 0x01, 0x50]);
        let mut record = Record::zeroed();
        let mut reader = Trickle(&data);
        let mut keys = Vec::new();
        while read_record(&mut reader, &mut record).unwrap() {
            keys.push(record.key[0]);
        }
        assert_eq!(keys, vec![0x00, 0x01, 0x50]);
    }

    #[test]
    fn distribution_counts_every_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input");
        fs::write(&path, input(&[0x00, 0x01, 0x50, 0xFF, 0xFF])).unwrap();
        let map = PartitionMap::new(2, 1, 2).unwrap();
        assert_eq!(count_bucket_distribution(&path, &map).unwrap(), vec![2, 1, 0, 2]);
    }
}
