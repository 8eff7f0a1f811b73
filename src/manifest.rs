use bytes::BufMut;
use parking_lot::{Mutex, MutexGuard};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use crate::compact::CompactionTask;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Manifest stores the metadata of SSTs in the disk
pub struct Manifest {
    file: Arc<Mutex<File>>,
}

#[derive(Serialize, Deserialize)]
pub enum ManifestRecord {
    Flush(usize),
    NewMemTable(usize),
    Compaction(CompactionTask, Vec<usize>),
}

impl Manifest {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: Arc::new(Mutex::new(
                OpenOptions::new()
                    .read(true)
                    .create_new(true)
                    .write(true)
                    .open(path)
                    .context("fail to create manifest")?,
            )),
        })
    }

    pub fn recover(path: impl AsRef<Path>) -> Result<(Self, Vec<ManifestRecord>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .context("fail to recover manifest")?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let mut buf = &raw[..];
        let mut records = Vec::new();
        while !buf.is_empty() {
            if buf.len() < 8 {
                anyhow::bail!("manifest truncated: incomplete record length");
            }
            let len = u64::from_be_bytes(buf[..8].try_into().unwrap()) as usize;
            buf = &buf[8..];
            if buf.len() < len + 4 {
                anyhow::bail!("manifest truncated: incomplete record payload");
            }
            let json = &buf[..len];
            let checksum = crc32fast::hash(json);
            let on_disk_checksum = u32::from_be_bytes(buf[len..len + 4].try_into().unwrap());
            if checksum != on_disk_checksum {
                anyhow::bail!("manifest record checksum mismatched");
            }
            records.push(serde_json::from_slice(json)?);
            buf = &buf[len + 4..];
        }
        Ok((
            Self {
                file: Arc::new(Mutex::new(file)),
            },
            records,
        ))
    }

    pub fn add_record(
        &self,
        _state_lock_observer: &MutexGuard<()>,
        record: ManifestRecord,
    ) -> Result<()> {
        self.add_record_when_init(record)
    }

    pub fn add_record_when_init(&self, record: ManifestRecord) -> Result<()> {
        let mut file = self.file.lock();
        let mut buf = serde_json::to_vec(&record)?;
        let hash = crc32fast::hash(&buf);
        // writing record length and hash to file
        file.write_all(&(buf.len() as u64).to_be_bytes())?;
        buf.put_u32(hash);
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}
