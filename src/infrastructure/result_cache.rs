//! 评分结果缓存
//!
//! 指纹 → 成功的评分。并发读写由 `DashMap` 分片锁保护，调用方无需额外加锁；
//! 同一指纹的并发写入以最后一次为准。过期条目在读取时惰性淘汰；
//! 条目数超过上限时，写入会淘汰 `stored_at` 最早的条目。
//! 可选地从 JSON 文件加载并在运行结束时写回。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{CacheEntry, Fingerprint, ScoreCard};

/// 默认条目上限
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

pub struct ResultCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    ttl: chrono::Duration,
    max_entries: usize,
    path: Option<PathBuf>,
}

impl ResultCache {
    /// 纯内存缓存，条目上限为 [`DEFAULT_MAX_ENTRIES`]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            max_entries: DEFAULT_MAX_ENTRIES,
            path: None,
        }
    }

    /// 设置条目上限，至少为 1
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// 以 `path` 为持久化文件打开缓存，文件不存在时从空缓存开始
    ///
    /// 文件里的有效条目超过 `max_entries` 时只保留最新的那些。
    pub async fn open(path: impl AsRef<Path>, ttl: Duration, max_entries: usize) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cache = Self::new(ttl).with_max_entries(max_entries);

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let stored: Vec<CacheEntry> = serde_json::from_str(&content)?;
                let now = Utc::now();
                let total = stored.len();
                let mut live: Vec<CacheEntry> = stored
                    .into_iter()
                    .filter(|entry| entry.is_live(now, cache.ttl))
                    .collect();
                live.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
                live.truncate(cache.max_entries);
                for entry in live {
                    cache.entries.insert(entry.fingerprint.clone(), entry);
                }
                info!(
                    "📦 已加载评分缓存 {}: {} 条有效 / {} 条记录",
                    path.display(),
                    cache.entries.len(),
                    total
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("缓存文件 {} 不存在，使用空缓存", path.display());
            }
            Err(e) => return Err(AppError::file(path.display().to_string(), e)),
        }

        cache.path = Some(path);
        Ok(cache)
    }

    /// 查询有效条目
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ScoreCard> {
        self.get_at(fingerprint, Utc::now())
    }

    pub fn get_at(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<ScoreCard> {
        // map 消费掉读锁，之后才能安全地 remove
        let lookup = self
            .entries
            .get(fingerprint)
            .map(|entry| (entry.is_live(now, self.ttl), entry.card.clone()));

        match lookup {
            Some((true, card)) => Some(card),
            Some((false, _)) => {
                let ttl = self.ttl;
                self.entries
                    .remove_if(fingerprint, |_, entry| !entry.is_live(now, ttl));
                None
            }
            None => None,
        }
    }

    /// 写入一次成功的评分，覆盖旧条目
    pub fn put(&self, fingerprint: Fingerprint, card: ScoreCard) {
        self.put_at(fingerprint, card, Utc::now());
    }

    pub fn put_at(&self, fingerprint: Fingerprint, card: ScoreCard, stored_at: DateTime<Utc>) {
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            card,
            stored_at,
        };
        self.entries.insert(fingerprint.clone(), entry);

        while self.entries.len() > self.max_entries {
            if !self.evict_oldest(&fingerprint) {
                break;
            }
        }
    }

    /// 淘汰 `stored_at` 最早的条目（刚写入的 `keep` 除外）
    fn evict_oldest(&self, keep: &Fingerprint) -> bool {
        // 迭代器的读锁在这条语句结束时释放，之后才能 remove
        let oldest = self
            .entries
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| entry.key().clone());

        match oldest {
            Some(fingerprint) => {
                debug!("评分缓存已满 ({} 条)，淘汰 {}", self.max_entries, fingerprint);
                self.entries.remove(&fingerprint).is_some()
            }
            None => false,
        }
    }

    /// 删除所有过期条目，返回删除数量
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.is_live(now, ttl));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 把有效条目写回持久化文件，返回写入条数；纯内存缓存不做任何事
    pub async fn flush(&self) -> AppResult<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut live: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.is_live(now, self.ttl))
            .map(|entry| entry.value().clone())
            .collect();
        live.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        let json = serde_json::to_string_pretty(&live)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::file(parent.display().to_string(), e))?;
        }

        // 先写临时文件再改名，中途失败不会留下半截文件
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AppError::file(tmp.display().to_string(), e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!("缓存文件改名失败: {}", e);
            return Err(AppError::file(path.display().to_string(), e));
        }

        info!("💾 评分缓存已写入 {} ({} 条)", path.display(), live.len());
        Ok(live.len())
    }
}
