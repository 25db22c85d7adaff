use axum::response::Json;
use serde_json::{json, Value};
use tracing::instrument;

/// Liveness check
#[instrument(name = "health_check")]
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Readiness check
#[instrument(name = "readiness_check")]
pub async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_and_readiness_bodies() {
        let Json(health) = health_check().await;
        assert_eq!(health["status"], "ok");
        assert!(chrono::DateTime::parse_from_rfc3339(health["timestamp"].as_str().unwrap()).is_ok());

        let Json(ready) = readiness_check().await;
        assert_eq!(ready["status"], "ready");
    }
}
