use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::checksum::{self, StreamingChecksum};
use crate::error::{Error, Result};

/// One slice of a transfer and its integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: u64,
    pub size: u32,
    /// Hex SHA-256 of the chunk bytes.
    pub checksum: String,
    pub is_last: bool,
}

/// Position of a chunk before its bytes are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_id: u64,
    pub offset: u64,
    pub size: u32,
    pub is_last: bool,
}

/// Number of chunks `total` bytes split into.
pub fn chunk_count(total: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total.div_ceil(chunk_size as u64)
}

/// Split `total` bytes into contiguous chunks of at most `chunk_size`.
pub fn chunk_plan(total: u64, chunk_size: u32) -> impl Iterator<Item = ChunkSpan> {
    let count = chunk_count(total, chunk_size);
    (0..count).map(move |chunk_id| {
        let offset = chunk_id * chunk_size as u64;
        let size = (total - offset).min(chunk_size as u64) as u32;
        ChunkSpan {
            chunk_id,
            offset,
            size,
            is_last: chunk_id + 1 == count,
        }
    })
}

/// Reads a source in chunks, hashing each chunk and the whole stream.
pub struct Chunker<R> {
    source: R,
    plan: Box<dyn Iterator<Item = ChunkSpan> + Send>,
    total_size: u64,
    bytes_read: u64,
    file_checksum: StreamingChecksum,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(source: R, total_size: u64, chunk_size: u32) -> Self {
        Self {
            source,
            plan: Box::new(chunk_plan(total_size, chunk_size)),
            total_size,
            bytes_read: 0,
            file_checksum: StreamingChecksum::new(),
        }
    }

    /// Read the next chunk
    pub async fn next_chunk(&mut self) -> Result<Option<(ChunkRecord, Vec<u8>)>> {
        let Some(span) = self.plan.next() else {
            return Ok(None);
        };

        let mut buffer = vec![0u8; span.size as usize];
        self.source.read_exact(&mut buffer).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended after {} of {} bytes",
                        self.bytes_read, self.total_size
                    ),
                ))
            } else {
                Error::Io(e)
            }
        })?;

        self.file_checksum.update(&buffer);
        self.bytes_read += buffer.len() as u64;
        let record = ChunkRecord {
            chunk_id: span.chunk_id,
            size: span.size,
            checksum: checksum::checksum(&buffer),
            is_last: span.is_last,
        };
        Ok(Some((record, buffer)))
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hex SHA-256 of everything read so far.
    pub fn finish(self) -> String {
        self.file_checksum.finalize()
    }
}

/// Writes verified chunks to a sink in order.
pub struct Assembler<W> {
    sink: W,
    bytes_written: u64,
    expected_size: u64,
    next_chunk: u64,
    file_checksum: StreamingChecksum,
}

/// What the assembler did with an incoming chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Written,
    /// Already stored; acknowledged again but not rewritten.
    Duplicate,
    Corrupt { actual: String },
    OutOfOrder { expected: u64 },
}

impl<W: AsyncWrite + Unpin> Assembler<W> {
    pub fn new(sink: W, expected_size: u64) -> Self {
        Self {
            sink,
            bytes_written: 0,
            expected_size,
            next_chunk: 0,
            file_checksum: StreamingChecksum::new(),
        }
    }

    /// Verify `data` against `record` and append it if it is the next chunk.
    pub async fn accept(&mut self, record: &ChunkRecord, data: &[u8]) -> Result<Placement> {
        if record.chunk_id < self.next_chunk {
            return Ok(Placement::Duplicate);
        }
        if record.chunk_id > self.next_chunk {
            return Ok(Placement::OutOfOrder {
                expected: self.next_chunk,
            });
        }
        let actual = checksum::checksum(data);
        if !checksum::matches(&record.checksum, &actual) {
            return Ok(Placement::Corrupt { actual });
        }
        if self.bytes_written + data.len() as u64 > self.expected_size {
            return Err(Error::Protocol(format!(
                "chunk {} overruns the announced {} bytes",
                record.chunk_id, self.expected_size
            )));
        }

        self.sink.write_all(data).await?;
        self.file_checksum.update(data);
        self.bytes_written += data.len() as u64;
        self.next_chunk += 1;
        Ok(Placement::Written)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn chunks_written(&self) -> u64 {
        self.next_chunk
    }

    /// Flush the sink and return the hex SHA-256 of what was written.
    pub async fn finalize(mut self) -> Result<String> {
        self.sink.flush().await?;
        self.sink.shutdown().await?;
        Ok(self.file_checksum.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_plan_boundaries() {
        let plan: Vec<_> = chunk_plan(10 * 1024 * 1024, 1024 * 1024).collect();
        assert_eq!(plan.len(), 10);
        assert!(plan.iter().all(|c| c.size == 1024 * 1024));
        assert!(plan[9].is_last && !plan[8].is_last);

        let plan: Vec<_> = chunk_plan(2500, 1000).collect();
        assert_eq!(
            plan.iter().map(|c| c.size).collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
        assert_eq!(plan[2].offset, 2000);

        assert_eq!(chunk_plan(1024, 1024 * 1024).count(), 1);
        assert_eq!(chunk_plan(0, 1024).count(), 0);
    }

    #[tokio::test]
    async fn test_chunker_assembler() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let test_data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        temp_file.write_all(&test_data).unwrap();
        temp_file.flush().unwrap();

        let source = tokio::fs::File::open(temp_file.path()).await.unwrap();
        let mut chunker = Chunker::new(source, test_data.len() as u64, 4096);
        let output_file = NamedTempFile::new().unwrap();
        let sink = tokio::fs::File::create(output_file.path()).await.unwrap();
        let mut assembler = Assembler::new(sink, test_data.len() as u64);

        let mut ids = Vec::new();
        while let Some((record, data)) = chunker.next_chunk().await.unwrap() {
            ids.push(record.chunk_id);
            assert_eq!(assembler.accept(&record, &data).await.unwrap(), Placement::Written);
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(assembler.bytes_written(), test_data.len() as u64);

        let sent = chunker.finish();
        let received = assembler.finalize().await.unwrap();
        assert_eq!(sent, received);
        assert_eq!(sent, checksum::checksum(&test_data));
        assert_eq!(std::fs::read(output_file.path()).unwrap(), test_data);
    }

    #[tokio::test]
    async fn test_assembler_rejects_bad_chunks() {
        let mut out = Vec::new();
        let mut assembler = Assembler::new(&mut out, 8);
        let good = ChunkRecord {
            chunk_id: 0,
            size: 4,
            checksum: checksum::checksum(b"abcd"),
            is_last: false,
        };

        let placed = assembler.accept(&good, b"abce").await.unwrap();
        assert!(matches!(placed, Placement::Corrupt { .. }));
        assert_eq!(assembler.accept(&good, b"abcd").await.unwrap(), Placement::Written);
        assert_eq!(assembler.accept(&good, b"abcd").await.unwrap(), Placement::Duplicate);

        let skipped = ChunkRecord {
            chunk_id: 2,
            ..good.clone()
        };
        assert_eq!(
            assembler.accept(&skipped, b"abcd").await.unwrap(),
            Placement::OutOfOrder { expected: 1 }
        );
        assert_eq!(assembler.bytes_written(), 4);
        drop(assembler);
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn test_short_source_is_an_error() {
        let mut chunker = Chunker::new(&b"abc"[..], 10, 4);
        assert!(matches!(chunker.next_chunk().await, Err(Error::Io(_))));
    }

    /// Split `data` with a [`Chunker`] and put it back together with an [`Assembler`].
    fn split_and_reassemble(data: &[u8], chunk_size: u32) -> (Vec<ChunkRecord>, Vec<u8>, String, String) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let mut chunker = Chunker::new(data, data.len() as u64, chunk_size);
            let mut out = Vec::new();
            let mut assembler = Assembler::new(&mut out, data.len() as u64);
            let mut records = Vec::new();
            while let Some((record, bytes)) = chunker.next_chunk().await.unwrap() {
                assert_eq!(assembler.accept(&record, &bytes).await.unwrap(), Placement::Written);
                records.push(record);
            }
            let sent = chunker.finish();
            let received = assembler.finalize().await.unwrap();
            (records, out, sent, received)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn plan_covers_every_byte_once(total in 0u64..50_000_000, chunk_size in 1024u32..4_000_000) {
            let plan: Vec<_> = chunk_plan(total, chunk_size).collect();
            prop_assert_eq!(plan.len() as u64, chunk_count(total, chunk_size));
            let mut offset = 0u64;
            for (i, span) in plan.iter().enumerate() {
                prop_assert_eq!(span.chunk_id, i as u64);
                prop_assert_eq!(span.offset, offset);
                prop_assert!(span.size > 0 && span.size <= chunk_size);
                prop_assert_eq!(span.is_last, i + 1 == plan.len());
                offset += span.size as u64;
            }
            prop_assert_eq!(offset, total);
        }

        #[test]
        fn reassembly_reproduces_the_source(
            data in prop::collection::vec(any::<u8>(), 0..8192),
            chunk_size in 1u32..2048,
        ) {
            let (records, out, sent, received) = split_and_reassemble(&data, chunk_size);
            prop_assert_eq!(records.len() as u64, chunk_count(data.len() as u64, chunk_size));
            prop_assert!(records.iter().enumerate().all(|(i, r)| r.chunk_id == i as u64));
            prop_assert_eq!(&out, &data);
            prop_assert_eq!(&sent, &received);
            prop_assert_eq!(sent, checksum::checksum(&data));
        }
    }
}
