pub const DELIVERIES: &str = "categorizer_deliveries_total";
pub const SETTLEMENT_FAILED: &str = "categorizer_settlement_failed_total";
pub const CONNECTION_ATTEMPTS: &str = "categorizer_connection_attempts_total";
pub const SESSIONS_LOST: &str = "categorizer_sessions_lost_total";
pub const PUBLISH_DURATION: &str = "categorizer_publish_duration_seconds";

pub const CLASSIFICATION_DURATION: &str = "categorizer_classification_duration_seconds";
pub const CLASSIFICATION_FALLBACKS: &str = "categorizer_classification_fallbacks_total";
pub const CLASSIFICATION_REPAIRED: &str = "categorizer_classification_repaired_total";

pub const HTTP_REQUESTS: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_requests_duration_seconds";
