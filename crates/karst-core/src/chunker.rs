use std::io::Read;

use fastcdc::v2020::{Normalization, StreamCDC};

use karst_types::error::{KarstError, Result};

use crate::config::ChunkingParams;

/// Content-defined chunker over an arbitrary byte stream.
///
/// Yields owned chunks whose concatenation equals the input. Every chunk is
/// within `[min_size, max_size]` except possibly the last one. An empty
/// stream yields exactly one empty chunk so empty files stay addressable.
pub struct Chunker<R: Read> {
    inner: StreamCDC<R>,
    emitted: bool,
    done: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(source: R, params: &ChunkingParams) -> Self {
        let inner = StreamCDC::with_level(
            source,
            params.min_size,
            params.normal_size,
            params.max_size,
            Normalization::Level1,
        );
        Self {
            inner,
            emitted: false,
            done: false,
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.emitted = true;
                Some(Ok(chunk.data))
            }
            Some(Err(fastcdc::v2020::Error::Empty)) | None => {
                self.done = true;
                if self.emitted {
                    None
                } else {
                    // Empty input: one empty chunk.
                    self.emitted = true;
                    Some(Ok(Vec::new()))
                }
            }
            Some(Err(fastcdc::v2020::Error::IoError(e))) => {
                self.done = true;
                Some(Err(KarstError::Io(e)))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(KarstError::Other(format!("chunker: {e:?}"))))
            }
        }
    }
}
