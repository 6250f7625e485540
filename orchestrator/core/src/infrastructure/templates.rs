// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Nexon template sources and the bounded template cache.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::domain::ir::{NexonTemplate, TemplateError, TemplateSource, LATEST_VERSION};

/// Templates registered in memory, keyed by `(nexonId, version)`.
#[derive(Default)]
pub struct InMemoryTemplateSource {
    templates: parking_lot::RwLock<HashMap<(String, String), NexonTemplate>>,
}

impl InMemoryTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under its own version and as `latest`.
    pub fn register(&self, template: NexonTemplate) {
        let mut templates = self.templates.write();
        templates.insert(
            (template.nexon_id.clone(), LATEST_VERSION.to_string()),
            template.clone(),
        );
        templates.insert((template.nexon_id.clone(), template.version.clone()), template);
    }
}

#[async_trait]
impl TemplateSource for InMemoryTemplateSource {
    async fn fetch(&self, nexon_id: &str, version: &str) -> Result<NexonTemplate, TemplateError> {
        self.templates
            .read()
            .get(&(nexon_id.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| TemplateError::NotFound {
                nexon_id: nexon_id.to_string(),
                version: version.to_string(),
            })
    }
}

/// Reads `<dir>/<nexonId>@<version>.json`, falling back to
/// `<dir>/<nexonId>.json` for `latest`.
pub struct DirectoryTemplateSource {
    dir: PathBuf,
}

impl DirectoryTemplateSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, nexon_id: &str, version: &str) -> Vec<PathBuf> {
        let mut paths = vec![self.dir.join(format!("{nexon_id}@{version}.json"))];
        if version == LATEST_VERSION {
            paths.push(self.dir.join(format!("{nexon_id}.json")));
        }
        paths
    }
}

#[async_trait]
impl TemplateSource for DirectoryTemplateSource {
    async fn fetch(&self, nexon_id: &str, version: &str) -> Result<NexonTemplate, TemplateError> {
        let load_err = |message: String| TemplateError::Load {
            nexon_id: nexon_id.to_string(),
            message,
        };

        if nexon_id.contains(['/', '\\']) || nexon_id.starts_with('.') || version.contains(['/', '\\']) {
            return Err(load_err("nexon id and version must be plain names".into()));
        }

        for path in self.candidates(nexon_id, version) {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    debug!(path = %path.display(), "Loaded nexon template");
                    return serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(load_err(format!("{}: {e}", path.display()))),
            }
        }

        Err(TemplateError::NotFound {
            nexon_id: nexon_id.to_string(),
            version: version.to_string(),
        })
    }
}

/// Bounded LRU of resolved templates, owned by the compiler that uses it.
pub struct TemplateCache {
    source: Arc<dyn TemplateSource>,
    entries: Mutex<LruCache<(String, String), NexonTemplate>>,
}

impl TemplateCache {
    pub fn new(source: Arc<dyn TemplateSource>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, nexon_id: &str, version: &str) -> Result<NexonTemplate, TemplateError> {
        let key = (nexon_id.to_string(), version.to_string());
        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(hit.clone());
        }

        let template = self.source.fetch(nexon_id, version).await?;
        if template.nodes.is_empty() {
            return Err(TemplateError::Empty(nexon_id.to_string()));
        }
        self.entries.lock().put(key, template.clone());
        Ok(template)
    }

    pub fn evict(&self, nexon_id: &str, version: &str) -> bool {
        self.entries
            .lock()
            .pop(&(nexon_id.to_string(), version.to_string()))
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ir::TemplateNode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn template(nexon_id: &str, version: &str) -> NexonTemplate {
        NexonTemplate {
            nexon_id: nexon_id.into(),
            version: version.into(),
            nodes: vec![TemplateNode {
                id: "in".into(),
                node_type: "http in".into(),
                name: "in".into(),
                props: Default::default(),
                wires: vec![],
            }],
        }
    }

    struct CountingSource {
        inner: InMemoryTemplateSource,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl TemplateSource for CountingSource {
        async fn fetch(&self, nexon_id: &str, version: &str) -> Result<NexonTemplate, TemplateError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(nexon_id, version).await
        }
    }

    #[tokio::test]
    async fn test_cache_hits_and_bounds() {
        let inner = InMemoryTemplateSource::new();
        inner.register(template("a", "1.0.0"));
        inner.register(template("b", "1.0.0"));
        let source = Arc::new(CountingSource {
            inner,
            fetches: AtomicUsize::new(0),
        });
        let cache = TemplateCache::new(source.clone(), 1);

        cache.get("a", "1.0.0").await.unwrap();
        cache.get("a", "1.0.0").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        cache.get("b", "latest").await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.get("a", "1.0.0").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);

        assert!(cache.evict("a", "1.0.0"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_template() {
        let cache = TemplateCache::new(Arc::new(InMemoryTemplateSource::new()), 4);
        assert!(matches!(
            cache.get("nope", "latest").await,
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hl7.listener.json"),
            serde_json::to_vec(&template("hl7.listener", "2.0.0")).unwrap(),
        )
        .unwrap();
        let source = DirectoryTemplateSource::new(dir.path());

        let t = source.fetch("hl7.listener", "latest").await.unwrap();
        assert_eq!(t.version, "2.0.0");
        assert!(matches!(
            source.fetch("hl7.listener", "9.9.9").await,
            Err(TemplateError::NotFound { .. })
        ));
        assert!(matches!(
            source.fetch("../secrets", "latest").await,
            Err(TemplateError::Load { .. })
        ));
    }
}
