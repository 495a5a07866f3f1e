//! 凭证池模块。
//!
//! 目标：在多 provider、多账号场景下，为每个请求挑选一个可用凭证，
//! 按上游结果施加冷却与指数退避，并在故障时沿用户配置的链路轮换。

pub mod manager;
pub mod selector;
pub mod types;

pub use manager::{ChainEntry, CredentialPool};
pub use selector::SelectStrategy;
