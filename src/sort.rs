//! Phase two: every local disk sorts the buckets it owns, one at a time, loading the next bucket while the current
//! one is sorted and saved.

use crate::error::{ConfigError, Error, Result};
use crate::net_out::connect_with_retry;
use crate::node::NodeContext;
use crate::record::{records_mut, sort_records, RECORD_SIZE};
use crate::shuffle::ShuffleReceipt;

use crossbeam_channel::bounded;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::NamedTempFile;

/// Which buckets phase two sorts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortScope {
    All,
    /// Only buckets that (by average bucket size) start within the first `n` records of the global order.
    FirstRecords(u64),
}

impl SortScope {
    fn includes(&self, bucket: u16, avg_bucket_records: u64) -> bool {
        match *self {
            SortScope::All => true,
            SortScope::FirstRecords(n) => bucket as u64 * avg_bucket_records <= n,
        }
    }

    /// How many of a selected bucket's records fall within scope.
    fn record_limit(&self, bucket: u16, avg_bucket_records: u64) -> u64 {
        match *self {
            SortScope::All => u64::MAX,
            SortScope::FirstRecords(n) => n.saturating_sub(bucket as u64 * avg_bucket_records),
        }
    }
}

/// Receives the in-scope prefix of every sorted bucket of one disk, in bucket order, as raw back-to-back records.
pub struct ClientSink<W> {
    writer: W,
    scope: SortScope,
    avg_bucket_records: u64,
    records: u64,
}

impl<W: Write> ClientSink<W> {
    pub fn new(writer: W, scope: SortScope, avg_bucket_records: u64) -> Self {
        Self {
            writer,
            scope,
            avg_bucket_records,
            records: 0,
        }
    }

    fn send(&mut self, bucket: &BucketSorter) -> Result<u64> {
        let span = tracing::info_span!("send_bucket", bucket = bucket.bucket);
        let _guard = span.enter();

        let limit = self.scope.record_limit(bucket.bucket, self.avg_bucket_records);
        let n = (bucket.len() as u64).min(limit);
        self.writer
            .write_all(&bucket.data[..n as usize * RECORD_SIZE])?;
        self.records += n;
        Ok(n)
    }

    pub fn records_sent(&self) -> u64 {
        self.records
    }

    /// Flushes and returns the writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// One bucket held fully in memory.
pub struct BucketSorter {
    bucket: u16,
    data: Vec<u8>,
}

impl BucketSorter {
    /// Reads the whole bucket file. With `drop_cache`, its pages are evicted afterwards since they won't be read
    /// again.
    pub fn load(bucket: u16, path: &Path, drop_cache: bool) -> Result<Self> {
        let span = tracing::info_span!("load_bucket", bucket);
        let _guard = span.enter();

        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len % RECORD_SIZE as u64 != 0 {
            return Err(ConfigError::PartialRecord {
                path: path.to_owned(),
                len,
            }
            .into());
        }
        let mut data = vec![0; len as usize];
        file.read_exact(&mut data)?;
        if drop_cache {
            drop_page_cache(&file);
        }
        Ok(Self { bucket, data })
    }

    pub fn bucket(&self) -> u16 {
        self.bucket
    }

    pub fn len(&self) -> usize {
        self.data.len() / RECORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sort(&mut self) {
        let span = tracing::info_span!("sort_bucket", bucket = self.bucket);
        span.in_scope(|| sort_records(records_mut(&mut self.data)));
    }

    /// Writes the bucket to `path` atomically and durably: a temporary file next to it is synced, then renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let span = tracing::info_span!("save_bucket", bucket = self.bucket);
        let _guard = span.enter();

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&self.data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn drop_page_cache(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is open for the duration of the call.
    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if ret != 0 {
        log::debug!("posix_fadvise failed with {ret}");
    }
}

#[cfg(not(target_os = "linux"))]
fn drop_page_cache(_file: &File) {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskSortStats {
    pub buckets: usize,
    pub records: u64,
    pub records_sent: u64,
}

/// Sorts `buckets` (loaded from `unsorted(bucket)`, saved to `sorted(bucket)`) in order. A loader thread reads bucket
/// `i + 1` while this thread sorts and saves bucket `i`; the rendezvous channel between them keeps at most two buckets
/// in memory.
pub fn sort_buckets(
    buckets: Vec<u16>,
    unsorted: impl Fn(u16) -> PathBuf + Send,
    sorted: impl Fn(u16) -> PathBuf,
    drop_cache: bool,
) -> Result<DiskSortStats> {
    sort_buckets_to::<io::Sink>(buckets, unsorted, sorted, drop_cache, None)
}

/// Like [`sort_buckets`], and each sorted bucket is also sent to `client` while it is being saved.
pub fn sort_buckets_to<W: Write + Send>(
    buckets: Vec<u16>,
    unsorted: impl Fn(u16) -> PathBuf + Send,
    sorted: impl Fn(u16) -> PathBuf,
    drop_cache: bool,
    mut client: Option<&mut ClientSink<W>>,
) -> Result<DiskSortStats> {
    thread::scope(|s| {
        let (loaded_tx, loaded_rx) = bounded(0);
        let loader = s.spawn(move || -> Result<()> {
            for bucket in buckets {
                let loaded = BucketSorter::load(bucket, &unsorted(bucket), drop_cache)?;
                if loaded_tx.send(loaded).is_err() {
                    // The sorting side failed and stopped listening.
                    break;
                }
            }
            Ok(())
        });

        let mut stats = DiskSortStats::default();
        for mut bucket in loaded_rx {
            bucket.sort();
            let path = sorted(bucket.bucket());
            if let Some(sink) = client.as_deref_mut() {
                let bucket = &bucket;
                stats.records_sent += thread::scope(|s| {
                    let sending = s.spawn(move || sink.send(bucket));
                    let saved = bucket.save(&path);
                    let sent = sending
                        .join()
                        .map_err(|_| Error::WorkerPanicked("client sender"))?;
                    saved?;
                    sent
                })?;
            } else {
                bucket.save(&path)?;
            }
            stats.buckets += 1;
            stats.records += bucket.len() as u64;
            log::debug!("Sorted bucket {} ({} records)", bucket.bucket(), bucket.len());
        }

        loader
            .join()
            .map_err(|_| Error::WorkerPanicked("bucket loader"))??;
        Ok(stats)
    })
}

/// Sorts every selected bucket of one local disk.
pub fn sort_disk(ctx: &NodeContext, disk: usize, scope: SortScope) -> Result<DiskSortStats> {
    let avg = ctx.avg_bucket_records();
    let on_disk: Vec<u16> = ctx.disk_buckets(disk).collect();
    let selected: Vec<u16> = on_disk
        .iter()
        .copied()
        .filter(|&b| scope.includes(b, avg))
        .collect();
    log::info!(
        "Disk {disk}: sorting {} of {} bucket(s)",
        selected.len(),
        on_disk.len()
    );

    let unsorted = |b: u16| ctx.bucket_path(b);
    let sorted = |b: u16| ctx.sorted_bucket_path(b);
    let drop_cache = ctx.config().drop_page_cache;
    let stats = match ctx.config().client_addr {
        Some(addr) if !selected.is_empty() => {
            let stream = connect_with_retry(addr, ctx.config().connect_timeout)?;
            stream.set_nodelay(true)?;
            log::info!("Disk {disk}: streaming sorted records to client at {addr}");
            let mut sink = ClientSink::new(stream, scope, avg);
            let stats = sort_buckets_to(selected, unsorted, sorted, drop_cache, Some(&mut sink))?;
            sink.finish()?.shutdown(Shutdown::Write)?;
            stats
        }
        _ => sort_buckets_to::<TcpStream>(selected, unsorted, sorted, drop_cache, None)?,
    };
    log::info!(
        "Disk {disk}: sorted {} records in {} bucket(s), sent {} to the client",
        stats.records,
        stats.buckets,
        stats.records_sent
    );
    Ok(stats)
}

/// Phase two for the whole node: one sorting pipeline per local disk, all in parallel.
pub struct Sorter;

impl Sorter {
    /// Only runs after a completed shuffle, as witnessed by `receipt`.
    pub fn run(ctx: &NodeContext, receipt: &ShuffleReceipt, scope: SortScope) -> Result<Vec<DiskSortStats>> {
        if receipt.node() != ctx.id() || receipt.buckets() != ctx.map().buckets() {
            return Err(ConfigError::ShuffleIncomplete(ctx.bucket_dir(0)).into());
        }

        let span = tracing::info_span!("sort_phase", node = ctx.id());
        let _guard = span.enter();

        thread::scope(|s| {
            let handles: Vec<_> = (0..ctx.disks())
                .map(|disk| s.spawn(move || sort_disk(ctx, disk, scope)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| Error::WorkerPanicked("disk sorter"))?)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{is_sorted, records, Record};
    use bytemuck::{cast_slice, Zeroable};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::fs;
    use tempfile::tempdir;

    fn random_records(rng: &mut SmallRng, n: usize) -> Vec<Record> {
        (0..n)
            .map(|_| {
                let mut r = Record::zeroed();
                r.key = rng.gen();
                // Plenty of duplicate keys to exercise stability.
                r.key[0] %= 4;
                r.key[1..].iter_mut().for_each(|b| *b %= 2);
                r.payload[..8].copy_from_slice(&rng.gen::<u64>().to_ne_bytes());
                r
            })
            .collect()
    }

    fn unsorted_path(dir: &Path) -> impl Fn(u16) -> PathBuf + Send + '_ {
        move |b| dir.join(format!("{b}.bucket"))
    }

    fn sorted_path(dir: &Path) -> impl Fn(u16) -> PathBuf + '_ {
        move |b| dir.join(format!("sorted.{b}.bucket"))
    }

    #[test]
    fn sorts_each_bucket_by_key() {
        let dir = tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let sizes = [0, 1, 50, 500];
        for (b, &n) in sizes.iter().enumerate() {
            let recs = random_records(&mut rng, n);
            fs::write(unsorted_path(dir.path())(b as u16), cast_slice(&recs)).unwrap();
        }

        let stats = sort_buckets(
            vec![0, 1, 2, 3],
            unsorted_path(dir.path()),
            sorted_path(dir.path()),
            true,
        )
        .unwrap();
        assert_eq!(
            stats,
            DiskSortStats {
                buckets: 4,
                records: 551,
                records_sent: 0
            }
        );

        for (b, &n) in sizes.iter().enumerate() {
            let bytes = fs::read(sorted_path(dir.path())(b as u16)).unwrap();
            let sorted = records(&bytes);
            assert_eq!(sorted.len(), n);
            assert!(is_sorted(sorted));

            let mut original = fs::read(unsorted_path(dir.path())(b as u16)).unwrap();
            let original = records_mut(&mut original);
            original.sort_by(|a, b| a.key.cmp(&b.key));
            assert_eq!(original, sorted);
        }
    }

    #[test]
    fn sorting_sorted_output_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(2);
        let recs = random_records(&mut rng, 1000);
        fs::write(unsorted_path(dir.path())(0), cast_slice(&recs)).unwrap();

        sort_buckets(vec![0], unsorted_path(dir.path()), sorted_path(dir.path()), false).unwrap();
        let once = fs::read(sorted_path(dir.path())(0)).unwrap();

        fs::copy(sorted_path(dir.path())(0), unsorted_path(dir.path())(0)).unwrap();
        sort_buckets(vec![0], unsorted_path(dir.path()), sorted_path(dir.path()), false).unwrap();
        let twice = fs::read(sorted_path(dir.path())(0)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_bucket_fails_the_disk() {
        let dir = tempdir().unwrap();
        fs::write(unsorted_path(dir.path())(0), vec![0u8; RECORD_SIZE]).unwrap();
        let result = sort_buckets(
            vec![0, 1, 2],
            unsorted_path(dir.path()),
            sorted_path(dir.path()),
            false,
        );
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn partial_record_bucket_is_rejected() {
        let dir = tempdir().unwrap();
        let path = unsorted_path(dir.path())(0);
        fs::write(&path, vec![0u8; RECORD_SIZE + 3]).unwrap();
        assert!(matches!(
            BucketSorter::load(0, &path, false),
            Err(Error::Config(ConfigError::PartialRecord { .. }))
        ));
    }

    #[test]
    fn client_receives_in_scope_prefix_of_each_sorted_bucket() {
        let dir = tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        for b in 0..3u16 {
            let recs = random_records(&mut rng, 10);
            fs::write(unsorted_path(dir.path())(b), cast_slice(&recs)).unwrap();
        }

        // 10 records per bucket on average: bucket 0 sends all 10, bucket 1 the first 5, bucket 2 is out of scope.
        let scope = SortScope::FirstRecords(15);
        let selected: Vec<u16> = (0..3).filter(|&b| scope.includes(b, 10)).collect();
        let mut sink = ClientSink::new(Vec::new(), scope, 10);
        let stats = sort_buckets_to(
            selected,
            unsorted_path(dir.path()),
            sorted_path(dir.path()),
            false,
            Some(&mut sink),
        )
        .unwrap();
        assert_eq!(stats.buckets, 2);
        assert_eq!(stats.records_sent, 15);
        assert_eq!(sink.records_sent(), 15);

        let sent = sink.finish().unwrap();
        let mut expected = fs::read(sorted_path(dir.path())(0)).unwrap();
        expected.extend_from_slice(&fs::read(sorted_path(dir.path())(1)).unwrap()[..5 * RECORD_SIZE]);
        assert_eq!(sent, expected);
        assert!(!sorted_path(dir.path())(2).exists());
    }

    #[test]
    fn first_records_scope() {
        assert!(SortScope::All.includes(9, 100));
        assert!(SortScope::FirstRecords(250).includes(2, 100));
        assert!(!SortScope::FirstRecords(250).includes(3, 100));
        assert!(SortScope::FirstRecords(0).includes(0, 100));
        assert_eq!(SortScope::FirstRecords(250).record_limit(2, 100), 50);
        assert_eq!(SortScope::All.record_limit(7, 100), u64::MAX);
    }
}
