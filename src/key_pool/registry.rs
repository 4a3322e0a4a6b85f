//! # 密钥注册表
//!
//! 进程生命周期内不可变的有序密钥列表。加载时按密钥值与标签去重（保留首次出现），
//! 再按优先级降序、标签（忽略大小写）升序排序。

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 单个密钥记录
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct KeyRecord {
    /// 唯一展示标签
    pub label: String,
    /// 凭据原文
    #[serde(skip_serializing)]
    pub secret: String,
    /// 优先级
    pub priority: i64,
    /// 是否禁用
    pub disabled: bool,
    /// 凭据的不可逆摘要，用于追踪关联
    pub hash: String,
}

impl KeyRecord {
    /// 创建记录并计算摘要
    pub fn new(
        label: impl Into<String>,
        secret: impl Into<String>,
        priority: i64,
        disabled: bool,
    ) -> Self {
        let secret = secret.into();
        let hash = key_hash(&secret);
        Self {
            label: label.into(),
            secret,
            priority,
            disabled,
            hash,
        }
    }

    /// 掩码后的凭据
    #[must_use]
    pub fn masked(&self) -> String {
        mask_key(&self.secret)
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("label", &self.label)
            .field("secret", &self.masked())
            .field("priority", &self.priority)
            .field("disabled", &self.disabled)
            .field("hash", &self.hash)
            .finish()
    }
}

/// sha256 十六进制摘要的前 12 位
#[must_use]
pub fn key_hash(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(12);
    encoded
}

/// 掩码展示：保留首尾各 4 个字符，8 个字符及以下全部替换为 `*`
#[must_use]
pub fn mask_key(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

/// 有序密钥注册表
#[derive(Debug, Clone, Default)]
pub struct Registry {
    keys: Vec<KeyRecord>,
}

impl Registry {
    /// 从记录构建：去重、排序
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let mut secrets = HashSet::new();
        let mut labels = HashSet::new();
        let mut keys: Vec<KeyRecord> = records
            .into_iter()
            .filter(|record| !record.secret.is_empty() && secrets.insert(record.secret.clone()))
            .filter(|record| {
                let unique = labels.insert(record.label.clone());
                if !unique {
                    lwarn!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::KeyPool,
                        "duplicate_key_label",
                        "标签重复，忽略后出现的密钥",
                        key_label = %record.label,
                        key_hash = %record.hash
                    );
                }
                unique
            })
            .collect();
        keys.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.label.to_lowercase().cmp(&b.label.to_lowercase()))
        });
        Self { keys }
    }

    /// 所有密钥
    #[must_use]
    pub fn keys(&self) -> &[KeyRecord] {
        &self.keys
    }

    /// 密钥数量
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// 是否为空
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 按下标获取
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&KeyRecord> {
        self.keys.get(index)
    }

    /// 按标签查找
    #[must_use]
    pub fn find_by_label(&self, label: &str) -> Option<&KeyRecord> {
        self.keys.iter().find(|key| key.label == label)
    }

}
