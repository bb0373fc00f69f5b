use std::sync::Arc;

use x402::Facilitator;

/// Shared application state for the facilitator server.
pub struct AppState {
    pub facilitator: Arc<Facilitator>,
    /// HMAC shared secret for authenticating POST endpoints.
    /// This is mandatory; the server will not start without it.
    pub hmac_secret: Vec<u8>,
    pub webhook_urls: Vec<String>,
    pub http_client: reqwest::Client,
    /// Separate bearer token for /metrics (not the HMAC secret).
    pub metrics_token: Option<Vec<u8>>,
    /// Serve /metrics unauthenticated when no token is set.
    pub public_metrics: bool,
    /// Derived key for webhook HMAC signing (domain-separated from auth secret).
    pub webhook_hmac_key: Option<Vec<u8>>,
}

impl AppState {
    /// State with no webhooks and metrics locked.
    pub fn new(facilitator: Arc<Facilitator>, hmac_secret: Vec<u8>) -> Self {
        Self {
            facilitator,
            hmac_secret,
            webhook_urls: Vec::new(),
            http_client: reqwest::Client::new(),
            metrics_token: None,
            public_metrics: false,
            webhook_hmac_key: None,
        }
    }
}
