//! Joint snapshot store
//!
//! Keeps the full joint JSON per unit in sled, next to the normalized rows
//! in SQLite. Keys are `"j\n" + unit`.

use std::path::Path;

use sled::{Batch, Db};
use tracing::info;

use crate::error::WriterError;
use crate::joint::Joint;

pub const JOINT_KEY_PREFIX: &str = "j\n";

pub fn joint_key(unit: &str) -> Vec<u8> {
    format!("{}{}", JOINT_KEY_PREFIX, unit).into_bytes()
}

/// Joint snapshot database
#[derive(Clone)]
pub struct JointStore {
    db: Db,
}

impl JointStore {
    /// Open or create the joint store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WriterError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened joint store");
        Ok(Self { db })
    }

    /// Store that is deleted on drop (for testing)
    pub fn open_temporary() -> Result<Self, WriterError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Stage a joint in a write batch
    pub fn stage_joint(batch: &mut Batch, joint: &Joint) -> Result<(), WriterError> {
        let value = serde_json::to_vec(joint)?;
        batch.insert(joint_key(&joint.unit.unit), value);
        Ok(())
    }

    /// Atomically apply a batch and flush it to disk
    pub fn write_batch(&self, batch: Batch) -> Result<(), WriterError> {
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_joint(&self, unit: &str) -> Result<Option<Joint>, WriterError> {
        match self.db.get(joint_key(unit))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn contains_joint(&self, unit: &str) -> Result<bool, WriterError> {
        Ok(self.db.contains_key(joint_key(unit))?)
    }

    /// Number of stored joints
    pub fn joint_count(&self) -> usize {
        self.db.scan_prefix(JOINT_KEY_PREFIX.as_bytes()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn joint(unit: &str) -> Joint {
        serde_json::from_value(json!({
            "unit": {
                "unit": unit, "version": "1.0", "alt": "1",
                "authors": [{"address": "ADDR"}]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_batch_is_invisible_until_written() {
        let store = JointStore::open_temporary().unwrap();
        let mut batch = Batch::default();
        JointStore::stage_joint(&mut batch, &joint("U1")).unwrap();
        assert!(!store.contains_joint("U1").unwrap());

        store.write_batch(batch).unwrap();
        let loaded = store.get_joint("U1").unwrap().unwrap();
        assert_eq!(loaded.unit.unit, "U1");
        assert_eq!(store.joint_count(), 1);
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(joint_key("abc"), b"j\nabc".to_vec());
    }
}
