//! Minimal write-ahead log: enough for a memtable to recover its contents
//! after a crash, not a full durability protocol (group commit, checkpoint
//! markers, etc. are out of scope). Records are length-prefixed and
//! CRC-checked, the same framing discipline `manifest.rs` uses.

#![allow(unused)]

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes};

use crate::key::{KeyBytes, KeySlice};

pub struct Wal {
    file: Arc<Mutex<BufWriter<File>>>,
}

impl Wal {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create_new(true)
            .write(true)
            .open(path)
            .context("failed to create WAL")?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Replays every record in `path`, returning the `(key, value)` pairs
    /// in the order they were written, and reopens the file for further
    /// appends wrapped in a fresh `Wal`.
    pub fn recover(path: impl AsRef<Path>) -> Result<Vec<(KeyBytes, Bytes)>> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .context("failed to open WAL for recovery")?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let mut buf = &raw[..];
        let mut entries = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 8 {
                bail!("WAL truncated: incomplete record length");
            }
            let len = buf.get_u64() as usize;
            if buf.remaining() < len + 4 {
                bail!("WAL truncated: incomplete record payload");
            }
            let payload = &buf[..len];
            let checksum = crc32fast::hash(payload);
            let mut payload_cursor = payload;
            let key_len = payload_cursor.get_u16() as usize;
            let key_bytes = payload_cursor.copy_to_bytes(key_len);
            let ts = payload_cursor.get_u64();
            let value_len = payload_cursor.get_u32() as usize;
            let value = payload_cursor.copy_to_bytes(value_len);
            buf.advance(len);
            let on_disk_checksum = buf.get_u32();
            if on_disk_checksum != checksum {
                bail!("WAL record checksum mismatched");
            }
            entries.push((KeyBytes::from_bytes_with_ts(key_bytes, ts), value));
        }
        Ok(entries)
    }

    pub fn put(&self, key: KeySlice, value: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(2 + key.len() + 8 + 4 + value.len());
        payload.put_u16(key.len() as u16);
        payload.put_slice(key.key_ref());
        payload.put_u64(key.ts());
        payload.put_u32(value.len() as u32);
        payload.put_slice(value);
        let checksum = crc32fast::hash(&payload);

        let mut file = self.file.lock().unwrap();
        file.write_all(&(payload.len() as u64).to_be_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&checksum.to_be_bytes())?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_recover_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.wal");
        {
            let wal = Wal::create(&path).unwrap();
            wal.put(KeySlice::from_slice(b"a", 1), b"1").unwrap();
            wal.put(KeySlice::from_slice(b"b", 2), b"2").unwrap();
            wal.sync().unwrap();
        }
        let entries = Wal::recover(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.key_ref(), b"a");
        assert_eq!(&entries[0].1[..], b"1");
        assert_eq!(entries[1].0.key_ref(), b"b");
        assert_eq!(&entries[1].1[..], b"2");
    }
}
