use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::AttackResult;

/// Flatten an object key into a single filesystem-safe name.
pub fn flatten_key(bucket: &str, key: &str) -> String {
    format!("{}_{}", bucket, key.replace('/', "_"))
}

/// Writes exfiltrated content and dump files under one local directory,
/// created on demand. File names are deduplicated so two keys that flatten
/// to the same name cannot overwrite each other.
#[derive(Debug)]
pub struct LootWriter {
    dir: PathBuf,
    used: HashSet<String>,
}

impl LootWriter {
    pub fn new(dir: impl Into<PathBuf>) -> AttackResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, used: HashSet::new() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one object's bytes. Returns the artifact path.
    pub fn write_object(&mut self, bucket: &str, key: &str, body: &[u8]) -> AttackResult<PathBuf> {
        let name = self.claim(flatten_key(bucket, key));
        let path = self.dir.join(&name);
        std::fs::write(&path, body)?;
        debug!(bucket, key, path = %path.display(), bytes = body.len(), "object persisted");
        Ok(path)
    }

    /// Persist a serializable value as pretty-printed JSON.
    pub fn write_json<T: Serialize>(&mut self, file_name: &str, value: &T) -> AttackResult<PathBuf> {
        let name = self.claim(file_name.to_string());
        let path = self.dir.join(&name);
        std::fs::write(&path, serde_json::to_string_pretty(value)?)?;
        debug!(path = %path.display(), "json artifact persisted");
        Ok(path)
    }

    // First writer keeps the plain name; later colliders get -2, -3, ...
    fn claim(&mut self, base: String) -> String {
        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slashes_flatten_to_underscores() {
        assert_eq!(flatten_key("pay", "2024/q1/cards.csv"), "pay_2024_q1_cards.csv");
        assert_eq!(flatten_key("pay", "plain.txt"), "pay_plain.txt");
    }

    #[test]
    fn colliding_keys_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut loot = LootWriter::new(dir.path().join("out")).unwrap();

        // "a/b" and "a_b" flatten identically
        let p1 = loot.write_object("bkt", "a/b", b"first").unwrap();
        let p2 = loot.write_object("bkt", "a_b", b"second").unwrap();
        let p3 = loot.write_object("bkt", "a//b", b"third").unwrap();

        assert_eq!(p1.file_name().unwrap(), "bkt_a_b");
        assert_eq!(p2.file_name().unwrap(), "bkt_a_b-2");
        assert_ne!(p2, p3);
        assert_eq!(std::fs::read(&p1).unwrap(), b"first");
        assert_eq!(std::fs::read(&p2).unwrap(), b"second");
    }

    #[test]
    fn object_bytes_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut loot = LootWriter::new(dir.path()).unwrap();
        let body = vec![0u8, 159, 146, 150, 255];
        let path = loot.write_object("customer-data", "blob.bin", &body).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), body);
    }

    #[test]
    fn json_dump_is_structurally_equal() {
        let dir = tempfile::tempdir().unwrap();
        let mut loot = LootWriter::new(dir.path()).unwrap();
        let items = json!([{"ID": "1001", "CustomerName": "A"}, {"ID": "1002"}]);
        let path = loot.write_json("CustomerOrdersTable.json", &items).unwrap();
        let back: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let loot = LootWriter::new(&nested).unwrap();
        assert!(loot.dir().is_dir());
    }
}
