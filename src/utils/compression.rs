use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};

use crate::utils::async_file_reader;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[inline]
pub fn is_gzip(header: &[u8]) -> bool {
    header.len() >= 2 && header[0..2] == GZIP_MAGIC
}

#[inline]
pub fn is_deflate(header: &[u8]) -> bool {
    header.len() >= 2 && header[0] == 0x78 && matches!(header[1], 0x01 | 0x5e | 0x9c | 0xda)
}

/// Opens a file and decompresses transparently when the content is gzip or
/// zlib, sniffed from the magic bytes. Mirror files keep whatever encoding
/// the upstream served, so every reader goes through this.
pub struct CompressedFileReader {
    reader: Box<dyn AsyncRead + Unpin + Send>,
}

impl CompressedFileReader {
    pub async fn new(path: &Path) -> std::io::Result<Self> {
        let file: File = tokio::fs::File::open(path).await?;

        let mut buffered_file = async_file_reader(file);
        let mut header = [0u8; 2];
        if buffered_file.read_exact(&mut header).await.is_err() {
            // shorter than two bytes, nothing to sniff
            buffered_file.seek(io::SeekFrom::Start(0)).await?;
            return Ok(Self { reader: Box::new(buffered_file) });
        }
        buffered_file.seek(io::SeekFrom::Start(0)).await?;

        if is_gzip(&header) {
            Ok(Self { reader: Box::new(GzipDecoder::new(buffered_file)) })
        } else if is_deflate(&header) {
            Ok(Self { reader: Box::new(ZlibDecoder::new(buffered_file)) })
        } else {
            Ok(Self { reader: Box::new(buffered_file) })
        }
    }
}

impl AsyncRead for CompressedFileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}
