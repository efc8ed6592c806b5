//! 幂等账本
//!
//! 记录已成功生效的幂等键。处理消息前检查，业务生效后写入，
//! 同一键在 TTL 内的重复投递会被识别为 duplicate-skipped。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use order_shared::cache::Cache;
use order_shared::config::{LedgerBackend, LedgerConfig, RedisConfig};
use order_shared::error::Result;

use crate::messages::DedupeKey;

const PROCESSED_KEY_PREFIX: &str = "order:processed:";

/// 已处理消息账本
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    async fn contains(&self, key: &DedupeKey) -> Result<bool>;

    async fn record(&self, key: &DedupeKey) -> Result<()>;
}

/// 进程内账本，条目在 TTL 后失效
#[derive(Debug)]
pub struct MemoryLedger {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl MemoryLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ProcessedLedger for MemoryLedger {
    async fn contains(&self, key: &DedupeKey) -> Result<bool> {
        let expired = match self.entries.get(key.as_str()) {
            None => return Ok(false),
            Some(recorded_at) => recorded_at.elapsed() >= self.ttl,
        };

        if expired {
            self.entries
                .remove_if(key.as_str(), |_, recorded_at| recorded_at.elapsed() >= self.ttl);
            return Ok(false);
        }

        debug!(dedupe_key = %key, "幂等键已存在");
        Ok(true)
    }

    async fn record(&self, key: &DedupeKey) -> Result<()> {
        self.entries.insert(key.as_str().to_string(), Instant::now());
        Ok(())
    }
}

/// Redis 账本，多实例部署时共享
pub struct RedisLedger {
    cache: Cache,
    ttl: Duration,
}

impl RedisLedger {
    pub fn new(cache: Cache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn redis_key(key: &DedupeKey) -> String {
        format!("{PROCESSED_KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl ProcessedLedger for RedisLedger {
    async fn contains(&self, key: &DedupeKey) -> Result<bool> {
        let exists = self.cache.exists(&Self::redis_key(key)).await?;
        if exists {
            debug!(dedupe_key = %key, "幂等键已存在");
        }
        Ok(exists)
    }

    /// SET NX EX，键已存在时保留原有过期时间
    async fn record(&self, key: &DedupeKey) -> Result<()> {
        let created = self
            .cache
            .set_nx(&Self::redis_key(key), "1", self.ttl)
            .await?;
        if !created {
            debug!(dedupe_key = %key, "幂等键已被其他实例写入");
        }
        Ok(())
    }
}

/// 按配置构建账本；Redis 后端会先做一次连通性检查
pub async fn from_config(
    ledger: &LedgerConfig,
    redis: &RedisConfig,
) -> Result<Arc<dyn ProcessedLedger>> {
    match ledger.backend {
        LedgerBackend::Memory => {
            info!(ttl_seconds = ledger.ttl_seconds, "使用进程内幂等账本");
            Ok(Arc::new(MemoryLedger::new(ledger.ttl())))
        }
        LedgerBackend::Redis => {
            let cache = Cache::new(redis)?;
            cache.health_check().await?;
            info!(ttl_seconds = ledger.ttl_seconds, "使用 Redis 幂等账本");
            Ok(Arc::new(RedisLedger::new(cache, ledger.ttl())))
        }
    }
}
