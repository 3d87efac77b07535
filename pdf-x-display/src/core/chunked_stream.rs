//! Worker-side assembly of the document bytes from full and range reads.
//!
//! The document is split into fixed-size chunks. Data arrives either
//! progressively from the start of the file (full reader) or as whole
//! ranges (range readers); the stream tracks which chunks are complete.

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;

use super::error::{PDFError, PDFResult};

/// Manages chunk data storage and tracks which chunks are loaded.
pub struct ChunkedStream {
    bytes: BytesMut,
    /// Total length of the data in bytes
    total_length: usize,
    chunk_size: usize,
    num_chunks: usize,
    loaded_chunks: FxHashSet<usize>,
    /// Bytes received by progressive reads, from offset 0
    progressive_data_length: usize,
}

impl ChunkedStream {
    pub fn new(total_length: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        ChunkedStream {
            bytes: BytesMut::zeroed(total_length),
            total_length,
            chunk_size,
            num_chunks: total_length.div_ceil(chunk_size),
            loaded_chunks: FxHashSet::default(),
            progressive_data_length: 0,
        }
    }

    pub fn length(&self) -> usize {
        self.total_length
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn num_chunks_loaded(&self) -> usize {
        self.loaded_chunks.len()
    }

    /// Bytes known to be loaded, for progress reporting.
    pub fn loaded_bytes(&self) -> usize {
        let mut loaded = self.loaded_chunks.len() * self.chunk_size;
        if self.num_chunks > 0 && self.loaded_chunks.contains(&(self.num_chunks - 1)) {
            loaded -= self.num_chunks * self.chunk_size - self.total_length;
        }
        loaded.max(self.progressive_data_length)
    }

    /// Stores a range that starts on a chunk boundary. Only chunks that are
    /// complete after the write are marked loaded, except the last chunk,
    /// which may be short.
    pub fn on_receive_data(&mut self, begin: usize, chunk: &[u8]) -> PDFResult<()> {
        let end = begin + chunk.len();
        if begin % self.chunk_size != 0 || end > self.total_length {
            return Err(PDFError::InvalidByteRange {
                begin: begin as u64,
                end: end as u64,
            });
        }
        self.bytes[begin..end].copy_from_slice(chunk);

        let begin_chunk = begin / self.chunk_size;
        let end_chunk = if end < self.total_length {
            end / self.chunk_size
        } else {
            self.num_chunks
        };
        for chunk_num in begin_chunk..end_chunk {
            self.loaded_chunks.insert(chunk_num);
        }
        Ok(())
    }

    /// Appends bytes delivered in order from the start of the file.
    pub fn on_receive_progressive_data(&mut self, data: &[u8]) -> PDFResult<()> {
        let begin = self.progressive_data_length;
        let end = (begin + data.len()).min(self.total_length);
        if end > begin {
            self.bytes[begin..end].copy_from_slice(&data[..end - begin]);
        }
        self.progressive_data_length = end;

        let begin_chunk = begin / self.chunk_size;
        let end_chunk = if end < self.total_length {
            end / self.chunk_size
        } else {
            self.num_chunks
        };
        for chunk_num in begin_chunk..end_chunk {
            self.loaded_chunks.insert(chunk_num);
        }
        Ok(())
    }

    pub fn has_chunk(&self, chunk: usize) -> bool {
        self.loaded_chunks.contains(&chunk)
    }

    pub fn get_missing_chunks(&self) -> Vec<usize> {
        (0..self.num_chunks)
            .filter(|chunk| !self.loaded_chunks.contains(chunk))
            .collect()
    }

    /// Returns the next unloaded chunk starting from `begin_chunk`, with
    /// wraparound.
    pub fn next_empty_chunk(&self, begin_chunk: usize) -> Option<usize> {
        (0..self.num_chunks)
            .map(|i| (begin_chunk + i) % self.num_chunks)
            .find(|chunk| !self.loaded_chunks.contains(chunk))
    }

    pub fn is_data_loaded(&self) -> bool {
        self.loaded_chunks.len() == self.num_chunks
    }

    /// Byte ranges `[begin, end)` covering the missing chunks, with adjacent
    /// chunks merged and each range at most `max_chunks` chunks long.
    pub fn missing_ranges(&self, max_chunks: usize) -> Vec<(usize, usize)> {
        let max_chunks = max_chunks.max(1);
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut group: Option<(usize, usize)> = None;

        for chunk in self.get_missing_chunks() {
            group = match group {
                Some((first, last)) if chunk == last + 1 && chunk - first < max_chunks => {
                    Some((first, chunk))
                }
                Some(done) => {
                    ranges.push(self.chunk_range(done));
                    Some((chunk, chunk))
                }
                None => Some((chunk, chunk)),
            };
        }
        if let Some(done) = group {
            ranges.push(self.chunk_range(done));
        }
        ranges
    }

    fn chunk_range(&self, (first, last): (usize, usize)) -> (usize, usize) {
        (
            first * self.chunk_size,
            ((last + 1) * self.chunk_size).min(self.total_length),
        )
    }

    /// The assembled document; fails while chunks are still missing.
    pub fn into_bytes(self) -> PDFResult<Bytes> {
        if let Some(chunk) = self.next_empty_chunk(0) {
            return Err(PDFError::StreamError(format!(
                "Chunk {} of {} was never loaded",
                chunk, self.num_chunks
            )));
        }
        Ok(self.bytes.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_creation() {
        let stream = ChunkedStream::new(1024, 65536);
        assert_eq!(stream.length(), 1024);
        assert_eq!(stream.num_chunks(), 1);
        assert!(!stream.is_data_loaded());
    }

    #[test]
    fn test_get_missing_chunks() {
        let mut stream = ChunkedStream::new(300, 100);
        assert_eq!(stream.get_missing_chunks(), vec![0, 1, 2]);

        stream.on_receive_data(100, &[1u8; 100]).unwrap();
        assert_eq!(stream.get_missing_chunks(), vec![0, 2]);
    }

    #[test]
    fn test_next_empty_chunk_wraps() {
        let mut stream = ChunkedStream::new(300, 100);
        stream.on_receive_data(0, &[0u8; 100]).unwrap();
        stream.on_receive_data(200, &[2u8; 100]).unwrap();

        assert_eq!(stream.next_empty_chunk(2), Some(1));

        stream.on_receive_data(100, &[1u8; 100]).unwrap();
        assert_eq!(stream.next_empty_chunk(0), None);
    }

    #[test]
    fn test_short_last_chunk_counts_as_loaded() {
        let mut stream = ChunkedStream::new(250, 100);
        stream.on_receive_data(200, &[9u8; 50]).unwrap();
        assert!(stream.has_chunk(2));
        assert_eq!(stream.loaded_bytes(), 50);
    }

    #[test]
    fn test_misaligned_range_is_rejected() {
        let mut stream = ChunkedStream::new(300, 100);
        assert!(stream.on_receive_data(50, &[0u8; 10]).is_err());
        assert!(stream.on_receive_data(200, &[0u8; 101]).is_err());
    }

    #[test]
    fn test_progressive_data_marks_complete_chunks() {
        let mut stream = ChunkedStream::new(300, 100);
        stream.on_receive_progressive_data(&[1u8; 150]).unwrap();
        assert!(stream.has_chunk(0));
        assert!(!stream.has_chunk(1));

        stream.on_receive_progressive_data(&[2u8; 150]).unwrap();
        assert!(stream.is_data_loaded());

        let bytes = stream.into_bytes().unwrap();
        assert_eq!(bytes[149], 1);
        assert_eq!(bytes[150], 2);
    }

    #[test]
    fn test_missing_ranges_merge_neighbours() {
        let mut stream = ChunkedStream::new(550, 100);
        stream.on_receive_data(200, &[0u8; 100]).unwrap();

        assert_eq!(stream.missing_ranges(8), vec![(0, 200), (300, 550)]);
        assert_eq!(
            stream.missing_ranges(1),
            vec![(0, 100), (100, 200), (300, 400), (400, 500), (500, 550)]
        );
    }

    #[test]
    fn test_incomplete_stream_cannot_be_taken() {
        let stream = ChunkedStream::new(200, 100);
        assert!(stream.into_bytes().is_err());
    }
}
