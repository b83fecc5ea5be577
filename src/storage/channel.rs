//! Positional file I/O helpers
//!
//! All table, keystone and copy paths go through these so that reads never
//! touch a shared seek cursor (`&File` is enough, concurrent readers are fine)
//! and short reads/writes are completed in a loop.
//!
//! A call that makes no progress is retried at most [`ZERO_PROGRESS_RETRIES`]
//! times before it fails. Nothing else is retried.

use crate::{Result, StorageError};
use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Consecutive zero-length transfers tolerated before giving up
pub const ZERO_PROGRESS_RETRIES: usize = 3;

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

/// Fill `buf` from `offset`, failing with `UnexpectedEof` if the file ends first
pub fn read_fully_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut done = 0usize;
    let mut stalls = 0usize;

    while done < buf.len() {
        match pread(file, &mut buf[done..], offset + done as u64) {
            Ok(0) => {
                stalls += 1;
                if stalls > ZERO_PROGRESS_RETRIES {
                    return Err(StorageError::UnexpectedEof(format!(
                        "read {} of {} bytes at offset {}",
                        done,
                        buf.len(),
                        offset
                    )));
                }
            }
            Ok(n) => {
                done += n;
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    Ok(())
}

/// Write all of `buf` at `offset`
pub fn write_fully_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut done = 0usize;
    let mut stalls = 0usize;

    while done < buf.len() {
        match pwrite(file, &buf[done..], offset + done as u64) {
            Ok(0) => {
                stalls += 1;
                if stalls > ZERO_PROGRESS_RETRIES {
                    return Err(StorageError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("wrote {} of {} bytes at offset {}", done, buf.len(), offset),
                    )));
                }
            }
            Ok(n) => {
                done += n;
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    Ok(())
}
