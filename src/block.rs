/// A run of whole records that all belong to one bucket. The unit of data moved through the phase-one pipeline.
///
/// Ownership of the bytes moves with the buffer from stage to stage. An empty buffer is the end-of-bucket sentinel:
/// its producer will send nothing more for `bucket`.
#[derive(Debug, PartialEq, Eq)]
pub struct BucketBuffer {
    pub bucket: u16,
    pub data: Vec<u8>,
}

impl BucketBuffer {
    pub fn with_capacity(bucket: u16, capacity: usize) -> Self {
        Self {
            bucket,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn eof(bucket: u16) -> Self {
        Self {
            bucket,
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }
}
