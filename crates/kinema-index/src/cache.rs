//! Cache of parsed segment-index entities, consulted before any remote
//! fetch. Keyed by URL and byte range so the same file can hold several
//! independently addressed entities.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::matroska::MatroskaIndex;
use crate::sidx::SidxBox;

#[derive(Clone, Debug)]
pub enum CachedEntity {
    Sidx(Arc<SidxBox>),
    Matroska(Arc<MatroskaIndex>),
    /// Unparsed payload, e.g. a preloaded init segment.
    Raw(Bytes),
}

#[derive(Default)]
pub struct EntityCache {
    entries: RwLock<HashMap<(String, Option<String>), CachedEntity>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str, range: Option<&str>) -> Option<CachedEntity> {
        self.entries
            .read()
            .get(&(url.to_string(), range.map(str::to_string)))
            .cloned()
    }

    pub fn put(&self, url: &str, range: Option<&str>, entity: CachedEntity) {
        self.entries
            .write()
            .insert((url.to_string(), range.map(str::to_string)), entity);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidx::testutil::build_sidx;

    #[test]
    fn hit_requires_matching_url_and_range() {
        let cache = EntityCache::new();
        let sidx = Arc::new(
            crate::sidx::SidxBox::parse(&build_sidx(1_000, 0, 0, &[(10, 2_000, 1)])).unwrap(),
        );
        cache.put(
            "http://cdn.test/v.mp4",
            Some("862-1023"),
            CachedEntity::Sidx(sidx),
        );

        assert!(cache.get("http://cdn.test/v.mp4", Some("862-1023")).is_some());
        assert!(cache.get("http://cdn.test/v.mp4", Some("0-861")).is_none());
        assert!(cache.get("http://cdn.test/other.mp4", Some("862-1023")).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_replaces_existing_entry() {
        let cache = EntityCache::new();
        let a = Arc::new(
            crate::sidx::SidxBox::parse(&build_sidx(1_000, 0, 0, &[(10, 2_000, 1)])).unwrap(),
        );
        let b = Arc::new(
            crate::sidx::SidxBox::parse(&build_sidx(90_000, 0, 0, &[(20, 1_000, 1)])).unwrap(),
        );
        cache.put("u", None, CachedEntity::Sidx(a));
        cache.put("u", None, CachedEntity::Sidx(b.clone()));
        match cache.get("u", None).unwrap() {
            CachedEntity::Sidx(s) => assert_eq!(s.timescale, 90_000),
            _ => panic!("wrong entity type"),
        }
    }
}
