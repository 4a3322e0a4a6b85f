//! # 密钥池模块
//!
//! 不可变的密钥注册表以及凭据提供者接口

pub mod provider;
pub mod registry;

pub use provider::{ConfigKeyProvider, KeyProvider, StaticKeyProvider};
pub use registry::{KeyRecord, Registry, key_hash, mask_key};
