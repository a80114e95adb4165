//! Named shared-memory arrays for large read-only inputs.
//!
//! Buffers live as files under `/dev/shm` with deterministic names, so
//! pool workers can map them by name. This is an optimization only:
//! nothing may rely on a buffer existing.

use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use memmap2::Mmap;
use memmap2::MmapMut;

fn shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// A mutable f64 array backed by a named shared-memory file.
pub struct SharedArray {
    pub name: String,
    pub len: usize,
    path: PathBuf,
    map: MmapMut,
}

impl SharedArray {
    /// Creates the buffer and fills it with `value`.
    pub fn create(
        name: &str,
        len: usize,
        value: f64,
    ) -> anyhow::Result<Self> {
        let path = shm_dir().join(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("creating shared buffer {}", path.display()))?;
        file.set_len((len * 8) as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let bytes = value.to_le_bytes();
        for chunk in map.chunks_exact_mut(8) {
            chunk.copy_from_slice(&bytes);
        }
        Ok(Self {
            name: name.to_owned(),
            len,
            path,
            map,
        })
    }

    pub fn write(
        &mut self,
        index: usize,
        value: f64,
    ) {
        let at = index * 8;
        self.map[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read(
        &self,
        index: usize,
    ) -> f64 {
        read_f64(&self.map, index)
    }

    /// Removes the backing file; missing files are fine, so unlinking is
    /// idempotent.
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A read-only view of an existing buffer, mapped by name.
pub struct SharedArrayView {
    pub len: usize,
    map: Mmap,
}

impl SharedArrayView {
    pub fn attach(name: &str) -> anyhow::Result<Self> {
        let path = shm_dir().join(name);
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .with_context(|| format!("attaching shared buffer {}", path.display()))?;
        let map = unsafe { Mmap::map(&file)? };
        let len = map.len() / 8;
        Ok(Self { len, map })
    }

    pub fn read(
        &self,
        index: usize,
    ) -> f64 {
        read_f64(&self.map, index)
    }
}

fn read_f64(
    bytes: &[u8],
    index: usize,
) -> f64 {
    let at = index * 8;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    f64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::SharedArray;
    use super::SharedArrayView;

    #[test]
    fn create_attach_unlink() -> anyhow::Result<()> {
        let name = format!("oq-shm-test-{}", std::process::id());
        let mut array = SharedArray::create(&name, 16, 0.5)?;
        array.write(3, 2.25);

        let view = SharedArrayView::attach(&name)?;
        assert_eq!(view.len, 16);
        assert_eq!(view.read(0), 0.5);
        assert_eq!(view.read(3), 2.25);

        array.unlink();
        array.unlink();
        assert!(SharedArrayView::attach(&name).is_err());
        Ok(())
    }
}
