use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use super::model::Schema;
use super::parser;
use crate::error::{Error, Result};

#[derive(Debug)]
struct Snapshot {
    schema: Arc<Schema>,
    modified: Option<SystemTime>,
}

/// Process-wide parsed schema, shared read-only between requests.
///
/// The schema is rebuilt wholesale when the file's modification time changes;
/// readers holding an older `Arc` keep seeing the schema they started with.
#[derive(Debug)]
pub struct SchemaCache {
    path: PathBuf,
    current: RwLock<Snapshot>,
}

impl SchemaCache {
    /// Parse the file once; a schema that cannot be loaded at startup is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let modified = modified_at(&path);
        let schema = load(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Snapshot {
                schema: Arc::new(schema),
                modified,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current schema, reloading first if the file changed.
    pub fn get(&self) -> Arc<Schema> {
        let modified = modified_at(&self.path);
        {
            let snapshot = self.read();
            if snapshot.modified == modified {
                return Arc::clone(&snapshot.schema);
            }
        }

        let mut snapshot = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Another reader may have reloaded while we waited for the lock.
        if snapshot.modified == modified {
            return Arc::clone(&snapshot.schema);
        }
        match load(&self.path) {
            Ok(schema) => {
                tracing::info!(
                    stage = "schema",
                    path = %self.path.display(),
                    collections = schema.collections.len(),
                    "schema reloaded"
                );
                snapshot.schema = Arc::new(schema);
            }
            Err(e) => {
                tracing::warn!(
                    stage = "schema",
                    path = %self.path.display(),
                    error = %e,
                    "schema reload failed, keeping previous schema"
                );
            }
        }
        snapshot.modified = modified;
        Arc::clone(&snapshot.schema)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn load(path: &Path) -> Result<Schema> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::SchemaParse(format!("cannot read {}: {}", path.display(), e)))?;
    parser::parse(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_schema(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "querygate-cache-{}-{}.md",
            name,
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn touch_later(path: &Path, body: &str) {
        let before = modified_at(path);
        for _ in 0..50 {
            std::fs::write(path, body).unwrap();
            if modified_at(path) != before {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_get_returns_shared_schema() {
        let path = temp_schema("shared", "## Collection: orders\nfields: id:int\n");
        let cache = SchemaCache::open(&path).unwrap();
        let a = cache.get();
        let b = cache.get();
        assert!(Arc::ptr_eq(&a, &b));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reload_on_change_keeps_old_arcs() {
        let path = temp_schema("reload", "## Collection: orders\nfields: id:int\n");
        let cache = SchemaCache::open(&path).unwrap();
        let before = cache.get();
        touch_later(&path, "## Collection: orders\nfields: id:int\n## Collection: users\nfields: id:int\n");
        let after = cache.get();
        assert_eq!(before.collections.len(), 1);
        assert_eq!(after.collections.len(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_failed_reload_keeps_previous() {
        let path = temp_schema("broken", "## Collection: orders\nfields: id:int\n");
        let cache = SchemaCache::open(&path).unwrap();
        touch_later(&path, "nothing structured here");
        let schema = cache.get();
        assert_eq!(schema.collection_names(), vec!["orders"]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = SchemaCache::open("/nonexistent/querygate/schema.md");
        assert!(matches!(result, Err(Error::SchemaParse(_))));
    }
}
