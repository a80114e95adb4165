//! Manual encoding of values into self-describing byte blobs.
//!
//! A [`Packed`] plays the role of a hand-built serialization envelope: the
//! blob is produced once, its length is known without re-encoding, and the
//! class-name tag survives into error messages on both ends of the wire.

use std::collections::HashMap;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::io::Read;
use std::io::Write;

use derive_debug_plus::Dbg;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackError {
    /// The value could not be encoded; the message names the offending type.
    #[error("cannot encode a value of type {class_name}. err: {err}")]
    Encode {
        class_name: &'static str,
        #[source]
        err: bincode::Error,
    },

    /// The blob could not be decoded back into the requested type.
    #[error("cannot decode a blob tagged {class_name} as {wanted}. err: {err}")]
    Decode {
        class_name: String,
        wanted: &'static str,
        #[source]
        err: bincode::Error,
    },

    /// The compressed blob could not be inflated.
    #[error("cannot inflate a blob tagged {class_name}. err: {err}")]
    Inflate {
        class_name: String,
        #[source]
        err: std::io::Error,
    },

    /// The compressor itself failed, which only happens on I/O errors.
    #[error("cannot deflate a value of type {class_name}. err: {err}")]
    Deflate {
        class_name: &'static str,
        #[source]
        err: std::io::Error,
    },
}

/// A value encoded once, carried around as bytes until somebody needs it.
#[derive(Clone, PartialEq, Eq, Dbg, Serialize, Deserialize)]
pub struct Packed {
    /// Type tag of the encoded value, for error messages and debugging.
    pub class_name: String,

    /// Calculation the value belongs to; empty outside a job context.
    pub calc_id: String,

    compressed: bool,

    #[dbg(formatter = crate::pack::blob_pretty)]
    blob: Vec<u8>,
}

pub(crate) fn blob_pretty(blob: &Vec<u8>) -> String {
    crate::humansize(blob.len() as u64)
}

impl Packed {
    /// Encodes `value` into a fresh blob.
    pub fn new<T: Serialize + ?Sized>(value: &T) -> Result<Self, PackError> {
        let blob = bincode::serialize(value).map_err(|err| {
            PackError::Encode {
                class_name: std::any::type_name::<T>(),
                err,
            }
        })?;
        Ok(Self {
            class_name: std::any::type_name::<T>().to_owned(),
            calc_id: String::new(),
            compressed: false,
            blob,
        })
    }

    /// Encodes `value` and zlib-compresses the blob.
    pub fn compressed<T: Serialize + ?Sized>(value: &T) -> Result<Self, PackError> {
        let raw = bincode::serialize(value).map_err(|err| {
            PackError::Encode {
                class_name: std::any::type_name::<T>(),
                err,
            }
        })?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).map_err(|err| {
            PackError::Deflate {
                class_name: std::any::type_name::<T>(),
                err,
            }
        })?;
        let blob = encoder.finish().map_err(|err| {
            PackError::Deflate {
                class_name: std::any::type_name::<T>(),
                err,
            }
        })?;
        Ok(Self {
            class_name: std::any::type_name::<T>().to_owned(),
            calc_id: String::new(),
            compressed: true,
            blob,
        })
    }

    pub fn with_calc_id(
        mut self,
        calc_id: impl Into<String>,
    ) -> Self {
        self.calc_id = calc_id.into();
        self
    }

    /// Length of the encoded blob, cached since encoding time.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.blob.len()
    }

    /// Decodes the blob back into a value.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, PackError> {
        if self.compressed {
            let mut decoder = ZlibDecoder::new(&self.blob[..]);
            let mut raw = Vec::new();
            decoder.read_to_end(&mut raw).map_err(|err| {
                PackError::Inflate {
                    class_name: self.class_name.clone(),
                    err,
                }
            })?;
            bincode::deserialize(&raw)
        } else {
            bincode::deserialize(&self.blob)
        }
        .map_err(|err| {
            PackError::Decode {
                class_name: self.class_name.clone(),
                wanted: std::any::type_name::<T>(),
                err,
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum SeqEntry {
    Blob(Packed),
    /// Index of an earlier `Blob` entry holding the same bytes.
    Backref(u32),
}

/// A sequence of blobs encoded in a single pass, deduplicating identical
/// payloads: later occurrences of the same bytes become back-references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedSeq {
    entries: Vec<SeqEntry>,
}

impl PackedSeq {
    pub fn new(values: Vec<Packed>) -> Self {
        let mut entries = Vec::with_capacity(values.len());
        let mut seen: HashMap<u64, u32> = HashMap::new();
        for packed in values {
            let mut hasher = DefaultHasher::new();
            packed.blob.hash(&mut hasher);
            let digest = hasher.finish();
            match seen.get(&digest) {
                Some(&index) if entry_blob(&entries, index) == Some(&packed) => {
                    entries.push(SeqEntry::Backref(index));
                },
                _ => {
                    seen.insert(digest, entries.len() as u32);
                    entries.push(SeqEntry::Blob(packed));
                },
            }
        }
        Self { entries }
    }

    /// Number of items in the sequence, back-references included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves item `index`, following a back-reference if needed.
    pub fn get(
        &self,
        index: usize,
    ) -> Option<&Packed> {
        match self.entries.get(index)? {
            SeqEntry::Blob(packed) => Some(packed),
            SeqEntry::Backref(at) => entry_blob(&self.entries, *at),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packed> {
        (0..self.len()).filter_map(|index| self.get(index))
    }

    /// Transport footprint: bytes stored once per unique blob.
    pub fn nbytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| {
                match entry {
                    SeqEntry::Blob(packed) => packed.len() as u64,
                    SeqEntry::Backref(_) => 0,
                }
            })
            .sum()
    }

    /// Resolved blob length of item `index`, for per-argument accounting.
    pub fn item_len(
        &self,
        index: usize,
    ) -> u64 {
        self.get(index).map(|packed| packed.len() as u64).unwrap_or(0)
    }
}

fn entry_blob(
    entries: &[SeqEntry],
    index: u32,
) -> Option<&Packed> {
    match entries.get(index as usize) {
        Some(SeqEntry::Blob(packed)) => Some(packed),
        _ => None,
    }
}

impl FromIterator<Packed> for PackedSeq {
    fn from_iter<I: IntoIterator<Item = Packed>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::Packed;
    use super::PackedSeq;

    #[test]
    fn roundtrip() -> anyhow::Result<()> {
        let value = BTreeMap::from([("h".to_string(), 1u64), ("e".to_string(), 2)]);
        let packed = Packed::new(&value)?;
        assert_eq!(packed.len(), bincode::serialize(&value)?.len());
        let back: BTreeMap<String, u64> = packed.unpack()?;
        assert_eq!(back, value);
        Ok(())
    }

    #[test]
    fn roundtrip_compressed() -> anyhow::Result<()> {
        let value = vec![0u8; 4096];
        let packed = Packed::compressed(&value)?;
        assert!(packed.len() < 4096);
        let back: Vec<u8> = packed.unpack()?;
        assert_eq!(back, value);
        Ok(())
    }

    #[test]
    fn decode_error_names_both_types() -> anyhow::Result<()> {
        let packed = Packed::new(&"hello".to_string())?;
        let err = packed.unpack::<Vec<f64>>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("String"), "missing source tag: {msg}");
        Ok(())
    }

    #[test]
    fn sequence_dedups_identical_blobs() -> anyhow::Result<()> {
        let one = Packed::new(&"hello".to_string())?;
        let seq = PackedSeq::new(vec![one.clone(), one.clone(), Packed::new(&1u32)?]);
        assert_eq!(seq.len(), 3);
        // the duplicate is stored once
        assert_eq!(seq.nbytes(), one.len() as u64 + Packed::new(&1u32)?.len() as u64);
        // but still resolves at both positions
        assert_eq!(seq.get(0), Some(&one));
        assert_eq!(seq.get(1), Some(&one));
        assert_eq!(seq.item_len(1), one.len() as u64);
        Ok(())
    }

    #[test]
    fn sequence_survives_the_wire() -> anyhow::Result<()> {
        let one = Packed::new(&"world".to_string())?;
        let seq = PackedSeq::new(vec![one.clone(), one.clone()]);
        let bytes = bincode::serialize(&seq)?;
        let back: PackedSeq = bincode::deserialize(&bytes)?;
        assert_eq!(back.get(1), Some(&one));
        Ok(())
    }
}
