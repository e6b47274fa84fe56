//! Gzip transcoding between transport and local storage.

use crate::api::UploadReader;
use crate::manifest::{FileCompression, FileEntry};
use crate::utils::{BackupError, Result};
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use async_compression::tokio::write::GzipEncoder as GzipWriter;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Copy `reader` into `writer`, converting from `transport` to `local` compression.
///
/// Returns the number of bytes written to `writer` before compression.
pub async fn transcode<R, W>(
    reader: R,
    transport: FileCompression,
    local: FileCompression,
    writer: &mut W,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = reader;
    let copied = match (transport, local) {
        (FileCompression::None, FileCompression::Gzip) => {
            let mut encoder = GzipWriter::new(&mut *writer);
            let n = tokio::io::copy(&mut reader, &mut encoder).await?;
            encoder.shutdown().await?;
            n
        }
        (FileCompression::Gzip, FileCompression::None) => {
            let mut decoder = GzipDecoder::new(BufReader::new(reader));
            tokio::io::copy(&mut decoder, writer).await?
        }
        _ => tokio::io::copy(&mut reader, writer).await?,
    };
    writer.flush().await?;
    Ok(copied)
}

/// Write a downloaded snapshot to `path` and describe it for the manifest.
pub async fn write_snapshot_file<R>(
    reader: R,
    transport: FileCompression,
    local: FileCompression,
    path: &Path,
) -> Result<FileEntry>
where
    R: AsyncRead + Unpin + Send,
{
    let mut file = File::create(path)
        .await
        .map_err(|e| BackupError::file(path, e))?;
    transcode(reader, transport, local, &mut file)
        .await
        .map_err(|e| BackupError::file(path, e))?;
    file.sync_all().await.map_err(|e| BackupError::file(path, e))?;

    let size = file
        .metadata()
        .await
        .map_err(|e| BackupError::file(path, e))?
        .len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::InvalidArgument(format!("{:?} has no file name", path)))?;

    Ok(FileEntry {
        file_name,
        size: size as i64,
        compression: local,
    })
}

async fn open(path: &Path) -> Result<File> {
    File::open(path).await.map_err(|e| BackupError::file(path, e))
}

/// Open an archived file as a gzip stream, compressing on the fly if it was stored plain.
pub async fn open_gzipped(path: &Path, stored: FileCompression) -> Result<UploadReader> {
    let file = open(path).await?;
    Ok(match stored {
        FileCompression::Gzip => Box::pin(file),
        FileCompression::None => Box::pin(GzipEncoder::new(BufReader::new(file))),
    })
}

/// Open an archived file as plain bytes, decompressing on the fly if it was stored gzipped.
pub async fn open_plain(path: &Path, stored: FileCompression) -> Result<UploadReader> {
    let file = open(path).await?;
    Ok(match stored {
        FileCompression::Gzip => Box::pin(GzipDecoder::new(BufReader::new(file))),
        FileCompression::None => Box::pin(file),
    })
}
