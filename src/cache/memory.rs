//! In-process cache backend. Entries expire lazily on access.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use tokio::time::Instant;

use super::CacheStore;
use crate::errors::CacheError;

#[derive(Debug, Clone)]
struct CacheItem {
    value: String,
    expires_at: Instant,
}

impl CacheItem {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheItem>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live and not-yet-collected expired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Translate a Redis-style glob (`*`, `?`, `[...]`, `\x`) to an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                for class in chars.by_ref() {
                    if class == '\\' {
                        out.push_str("\\\\");
                        continue;
                    }
                    out.push(class);
                    if class == ']' {
                        break;
                    }
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| CacheError::Unavailable(format!("bad pattern {pattern}: {e}")))
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|item| (item.value.clone(), item.is_expired(now)));
        match found {
            Some((value, false)) => Ok(value),
            Some((_, true)) => {
                self.entries.remove_if(key, |_, item| item.is_expired(now));
                Err(CacheError::Miss)
            }
            None => Err(CacheError::Miss),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), CacheItem::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(CacheItem::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheItem::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let re = glob_to_regex(pattern)?;
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let hit = re.is_match(key);
            if hit {
                removed += 1;
            }
            !hit
        });
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|item| !item.is_expired(now)))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}
