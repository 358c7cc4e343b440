use clap::Parser;
use cluster_sort::{records, RECORD_SIZE};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Instant;

/// Receives the sorted records that nodes stream in phase two (`cluster_node --client`), one connection per disk.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short = 'p', long, default_value = "9100")]
    port: u16,
    /// Total number of disks across the cluster.
    #[clap(short = 'n', long)]
    senders: usize,
}

const READ_BUF: usize = 2 * (1 << 20);

/// Returns the number of records received and whether they arrived in key order.
fn drain(mut stream: TcpStream) -> std::io::Result<(u64, bool)> {
    let mut buf = vec![0; READ_BUF];
    let mut filled = 0;
    let mut received = 0;
    let mut sorted = true;
    let mut last_key = None;
    loop {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        let whole = filled - filled % RECORD_SIZE;
        for r in records(&buf[..whole]) {
            sorted &= last_key.map_or(true, |k| k <= r.key);
            last_key = Some(r.key);
        }
        received += (whole / RECORD_SIZE) as u64;
        buf.copy_within(whole..filled, 0);
        filled -= whole;
    }
    if filled != 0 {
        log::warn!("Connection closed {filled} bytes into a record");
    }
    Ok((received, sorted))
}

fn main() {
    let args = Args::parse();

    env_logger::init();

    let listener = TcpListener::bind(("0.0.0.0", args.port)).unwrap();
    log::info!("Waiting for {} sender(s) on port {}", args.senders, args.port);

    let start = Instant::now();
    let handles: Vec<_> = (0..args.senders)
        .map(|i| {
            let (stream, addr) = listener.accept().unwrap();
            log::info!("Sender {i} connected from {addr}");
            thread::spawn(move || {
                let (received, sorted) = drain(stream).unwrap();
                log::info!("Sender {i} done: {received} records, sorted = {sorted}");
                received
            })
        })
        .collect();

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    log::info!("Received {total} records in {:?}", start.elapsed());
}
