//! Node-to-node framing for phase one.
//!
//! A connection starts with a [`Preamble`] and then carries frames of `[bucket: u16][body_len: u64][body]`. Both ends
//! run on the same cluster, so integers use native byte order. A frame with `body_len == 0` has no body and means the
//! sending node is done with that bucket.

use std::io::{self, Read, Write};

pub const HEADER_SIZE: usize = 2 + 8;
pub const PREAMBLE_SIZE: usize = 2 + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub bucket: u16,
    pub body_len: u64,
}

impl FrameHeader {
    pub fn new(bucket: u16, body_len: u64) -> Self {
        Self { bucket, body_len }
    }

    pub fn is_eof(&self) -> bool {
        self.body_len == 0
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[..2].copy_from_slice(&self.bucket.to_ne_bytes());
        bytes[2..].copy_from_slice(&self.body_len.to_ne_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut bucket = [0; 2];
        let mut body_len = [0; 8];
        bucket.copy_from_slice(&bytes[..2]);
        body_len.copy_from_slice(&bytes[2..]);
        Self {
            bucket: u16::from_ne_bytes(bucket),
            body_len: u64::from_ne_bytes(body_len),
        }
    }
}

/// Writes one data frame. An empty `body` writes an end-of-bucket frame.
pub fn write_frame(mut writer: impl Write, bucket: u16, body: &[u8]) -> io::Result<()> {
    let header = FrameHeader::new(bucket, body.len() as u64);
    writer.write_all(&header.encode())?;
    writer.write_all(body)
}

/// First bytes on every connection: who is sending and how many buckets it thinks the cluster has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble {
    pub node: u16,
    pub buckets: u16,
}

impl Preamble {
    pub fn write_to(&self, mut writer: impl Write) -> io::Result<()> {
        let mut bytes = [0; PREAMBLE_SIZE];
        bytes[..2].copy_from_slice(&self.node.to_ne_bytes());
        bytes[2..].copy_from_slice(&self.buckets.to_ne_bytes());
        writer.write_all(&bytes)
    }

    pub fn read_from(mut reader: impl Read) -> io::Result<Self> {
        let mut bytes = [0; PREAMBLE_SIZE];
        reader.read_exact(&mut bytes)?;
        Ok(Self {
            node: u16::from_ne_bytes([bytes[0], bytes[1]]),
            buckets: u16::from_ne_bytes([bytes[2], bytes[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, 7, &[1, 2, 3]).unwrap();
        assert_eq!(out.len(), HEADER_SIZE + 3);
        assert_eq!(&out[..2], &7u16.to_ne_bytes());
        assert_eq!(&out[2..10], &3u64.to_ne_bytes());
        assert_eq!(&out[10..], &[1, 2, 3]);

        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(&out[..HEADER_SIZE]);
        assert_eq!(FrameHeader::decode(&header), FrameHeader::new(7, 3));
    }

    #[test]
    fn eof_frame_has_no_body() {
        let mut out = Vec::new();
        write_frame(&mut out, 65535, &[]).unwrap();
        assert_eq!(out.len(), HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(&out);
        let decoded = FrameHeader::decode(&header);
        assert!(decoded.is_eof());
        assert_eq!(decoded.bucket, 65535);
    }

    #[test]
    fn preamble_reads_back() {
        let mut out = Vec::new();
        Preamble { node: 3, buckets: 12 }.write_to(&mut out).unwrap();
        assert_eq!(
            Preamble::read_from(out.as_slice()).unwrap(),
            Preamble { node: 3, buckets: 12 }
        );
        assert!(Preamble::read_from(&out[..3]).is_err());
    }
}
