use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mproxy_protocol::openai::models::ModelList;
use mproxy_registry::Service;

const TTL: Duration = Duration::from_secs(60);

struct CachedList {
    list: ModelList,
    fetched_at: Instant,
}

/// 60-second cache of the per-service `GET /v1/models` payload.
#[derive(Default)]
pub struct ModelsCache {
    entries: Mutex<HashMap<Service, CachedList>>,
}

impl ModelsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(
        &self,
        service: Service,
        build: impl FnOnce() -> ModelList,
    ) -> ModelList {
        let now = Instant::now();
        let Ok(mut guard) = self.entries.lock() else {
            return build();
        };
        if let Some(cached) = guard.get(&service)
            && now.duration_since(cached.fetched_at) < TTL
        {
            return cached.list.clone();
        }
        let list = build();
        guard.insert(
            service,
            CachedList {
                list: list.clone(),
                fetched_at: now,
            },
        );
        list
    }

    /// Test hook: drop all entries.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_read_within_ttl_hits_cache() {
        let cache = ModelsCache::new();
        let mut builds = 0;
        for _ in 0..3 {
            cache.get_or_insert_with(Service::Openai, || {
                builds += 1;
                ModelList::new(vec!["gpt-4o".to_string()], "openai", 0)
            });
        }
        assert_eq!(builds, 1);
        cache.clear();
        cache.get_or_insert_with(Service::Openai, || {
            builds += 1;
            ModelList::new(vec!["gpt-4o".to_string()], "openai", 0)
        });
        assert_eq!(builds, 2);
    }
}
