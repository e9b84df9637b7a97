//! Loopback-only CORS policy (§4.7 "Bind"): by default only
//! `http://127.0.0.1:*` and `http://localhost:*` may cross-origin fetch the
//! API, regardless of what the listener itself is bound to. Patterns come
//! from `CorsConfig.allowed_origins`, each compiled once into a regex (the
//! only wildcard supported is a literal port `*`).

use axum::http::HeaderValue;
use regex::Regex;
use sd_domain::config::CorsConfig;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub fn layer(config: &CorsConfig) -> CorsLayer {
    let patterns: Vec<Regex> = config.allowed_origins.iter().filter_map(|p| compile(p)).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| patterns.iter().any(|re| re.is_match(o)))
                .unwrap_or(false)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

fn compile(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace("\\*", "[0-9]+");
    Regex::new(&format!("^{escaped}$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<Regex> {
        CorsConfig::default().allowed_origins.iter().filter_map(|p| compile(p)).collect()
    }

    #[test]
    fn matches_loopback_with_any_port() {
        let patterns = patterns();
        assert!(patterns.iter().any(|re| re.is_match("http://127.0.0.1:5173")));
        assert!(patterns.iter().any(|re| re.is_match("http://localhost:3000")));
    }

    #[test]
    fn rejects_non_loopback_origin() {
        let patterns = patterns();
        assert!(!patterns.iter().any(|re| re.is_match("http://evil.example.com")));
    }
}
