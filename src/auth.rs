// 鉴权辅助：统一路径保护规则与 API Key 解析。
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// 运营面路径需要操作员密钥；调用面 /portway/invoke 由路由器自行鉴权。
pub fn is_operator_path(path: &str) -> bool {
    if path == "/healthz" {
        return false;
    }
    if !path.starts_with("/portway") {
        return false;
    }
    if path.starts_with("/portway/invoke") {
        return false;
    }
    if path.starts_with("/portway/catalog") {
        return false;
    }
    true
}

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    // 兼容 X-API-Key 与 Authorization: Bearer 的两种格式。
    if let Some(value) = headers.get("x-api-key") {
        if let Ok(text) = value.to_str() {
            let cleaned = text.trim();
            if !cleaned.is_empty() {
                return Some(cleaned.to_string());
            }
        }
    }
    if let Some(value) = headers.get(AUTHORIZATION) {
        let text = value.to_str().ok()?.trim();
        if let Some(prefix) = text.get(..7) {
            if prefix.eq_ignore_ascii_case("bearer ") {
                if let Some(raw) = text.get(7..) {
                    let cleaned = raw.trim();
                    if !cleaned.is_empty() {
                        return Some(cleaned.to_string());
                    }
                }
            }
        }
    }
    None
}

pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-forwarded-for") {
        if let Ok(text) = value.to_str() {
            let first = text.split(',').next().map(str::trim).unwrap_or_default();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-real-ip") {
        if let Ok(text) = value.to_str() {
            let cleaned = text.trim();
            if !cleaned.is_empty() {
                return Some(cleaned.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_is_operator_path() {
        assert!(!is_operator_path("/"));
        assert!(!is_operator_path("/healthz"));
        assert!(!is_operator_path("/portway/invoke"));
        assert!(!is_operator_path("/portway/catalog"));
        assert!(!is_operator_path("/portway/catalog/stripe"));
        assert!(is_operator_path("/portway/keys"));
        assert!(is_operator_path("/portway/services"));
        assert!(is_operator_path("/portway/usage"));
        assert!(is_operator_path("/portway/admin/catalog"));
    }

    #[test]
    fn api_key_extraction_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static(" ptw_one "));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer ptw_two"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("ptw_one"));

        headers.remove("x-api-key");
        assert_eq!(extract_api_key(&headers).as_deref(), Some("ptw_two"));

        headers.remove(AUTHORIZATION);
        assert!(extract_api_key(&headers).is_none());
    }

    #[test]
    fn client_ip_uses_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }
}
