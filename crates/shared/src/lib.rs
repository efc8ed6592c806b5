//! 共享库
//!
//! 包含消息队列能力抽象、Kafka 与进程内客户端、配置、错误处理、
//! 重试、死信、缓存与可观测性等基础设施代码。

pub mod cache;
pub mod config;
pub mod dlq;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod test_utils;
