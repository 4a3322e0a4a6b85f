//! 上游地址拼接
//!
//! 剩余路径与查询串原样转发，只规整基础地址末尾与路径开头的 `/`。

/// `{base}/{path}?{query}`；路径为空时只用基础地址
#[must_use]
pub fn build_upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let mut url = if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    };
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}
