use crate::block::BucketBuffer;
use crate::error::{Error, Result};
use crate::node::NodeContext;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::thread;

/// Totals reported by a [`DiskWriter`] once it has drained and synced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskWriterStats {
    pub buffers: u64,
    pub bytes: u64,
}

/// Owns every bucket file of one local disk and appends incoming buffers to them on a dedicated thread.
///
/// Files are created (truncated) up front so a disk's layout is fixed before any data arrives. The writer stops once
/// every [`Sender`] handed out by [`DiskWriter::sender`] (and the writer's own) has been dropped and the queue is
/// empty, then fsyncs every file.
pub struct DiskWriter {
    disk: usize,
    tx: Sender<BucketBuffer>,
    thread_handle: thread::JoinHandle<Result<DiskWriterStats>>,
}

impl DiskWriter {
    pub fn start(ctx: &NodeContext, disk: usize) -> Result<Self> {
        let dir = ctx.bucket_dir(disk);
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        for bucket in ctx.disk_buckets(disk) {
            debug_assert_eq!(ctx.map().disk_local_id(bucket), files.len());
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(ctx.bucket_path(bucket))?;
            files.push(file);
        }
        log::info!(
            "Disk {disk}: writing {} bucket file(s) under {}",
            files.len(),
            dir.display()
        );

        let (tx, rx) = bounded(ctx.config().disk_queue_len);
        let map = ctx.map().clone();
        let thread_handle = thread::spawn(move || {
            let result = run_writer(disk, files, rx, |bucket| map.disk_local_id(bucket));
            if let Err(e) = &result {
                log::error!("Disk writer {disk} exited with: {e:?}");
            }
            result
        });

        Ok(Self {
            disk,
            tx,
            thread_handle,
        })
    }

    pub fn disk(&self) -> usize {
        self.disk
    }

    /// A producer handle. Blocks on `send` while the queue is full.
    pub fn sender(&self) -> Sender<BucketBuffer> {
        self.tx.clone()
    }

    /// Waits for all producers to finish and the queue to drain, then returns once every file is durable.
    pub fn finish(self) -> Result<DiskWriterStats> {
        drop(self.tx);
        self.thread_handle
            .join()
            .map_err(|_| Error::WorkerPanicked("disk writer"))?
    }
}

fn run_writer(
    disk: usize,
    mut files: Vec<File>,
    rx: Receiver<BucketBuffer>,
    file_index: impl Fn(u16) -> usize,
) -> Result<DiskWriterStats> {
    let span = tracing::info_span!("disk_writer", disk);
    let _guard = span.enter();

    let mut stats = DiskWriterStats::default();
    while let Ok(buffer) = rx.recv() {
        // End-of-bucket is settled on the network side; nothing to write.
        if buffer.is_eof() {
            continue;
        }
        let file = files
            .get_mut(file_index(buffer.bucket))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bucket {} is not stored on disk {disk}", buffer.bucket),
                )
            })?;
        file.write_all(&buffer.data)?;
        stats.buffers += 1;
        stats.bytes += buffer.len() as u64;
    }

    for file in &files {
        file.sync_all()?;
    }
    log::info!(
        "Disk {disk}: synced {} bytes in {} buffer(s)",
        stats.bytes,
        stats.buffers
    );
    Ok(stats)
}
