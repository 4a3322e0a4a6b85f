//! # 请求头处理
//!
//! 逐跳头过滤、上游请求头构造以及代理令牌校验。

use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use subtle::ConstantTimeEq;

use crate::error::{ProxyError, Result};

/// 固定的逐跳头
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// 去掉逐跳头以及 `Connection` 中声明的头
#[must_use]
pub fn filter_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: HashSet<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lowered = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lowered) || listed.contains(lowered) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// 构造发往上游的请求头：过滤后再去掉 host、content-length、authorization 与代理令牌头，
/// 最后注入所选密钥
pub fn build_upstream_headers(
    headers: &HeaderMap,
    proxy_token_header: &str,
    secret: &str,
) -> Result<HeaderMap> {
    let mut filtered = filter_hop_by_hop(headers);
    filtered.remove(HOST);
    filtered.remove(CONTENT_LENGTH);
    filtered.remove(AUTHORIZATION);
    if let Ok(name) = HeaderName::from_bytes(proxy_token_header.as_bytes()) {
        filtered.remove(name);
    }

    let mut bearer = HeaderValue::from_str(&format!("Bearer {secret}"))
        .map_err(|e| ProxyError::internal_with_source("密钥包含非法字符", e))?;
    bearer.set_sensitive(true);
    filtered.insert(AUTHORIZATION, bearer);
    Ok(filtered)
}

/// 从请求中取出调用方提供的代理令牌：优先 Bearer，其次备用头
#[must_use]
pub fn provided_token<'a>(headers: &'a HeaderMap, proxy_token_header: &str) -> &'a str {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, rest) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
        })
        .filter(|token| !token.is_empty());

    bearer.unwrap_or_else(|| {
        headers
            .get(proxy_token_header)
            .and_then(|value| value.to_str().ok())
            .map_or("", str::trim)
    })
}

/// 校验代理令牌；未配置令牌时不校验
#[must_use]
pub fn authorize(headers: &HeaderMap, expected: &str, proxy_token_header: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    let provided = provided_token(headers, proxy_token_header);
    bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}
