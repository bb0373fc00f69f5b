use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementWebhook {
    pub event: String,
    pub scheme: String,
    pub payer: String,
    pub amount: String,
    pub transaction: Option<String>,
    pub network: String,
    pub timestamp: u64,
}

/// Validate every webhook URL at startup: HTTPS only, no private or
/// loopback targets.
pub fn validate_webhook_urls(urls: &[String]) -> Result<(), String> {
    for url in urls {
        x402::network::validate_webhook_url(url)?;
    }
    Ok(())
}

/// HTTP client for webhook delivery. Redirects are not followed, so a
/// validated public URL cannot bounce the request to an internal host.
pub fn webhook_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build webhook client, using defaults");
            reqwest::Client::new()
        })
}

/// Fire-and-forget POST to each webhook URL.
/// If `hmac_key` is provided, includes an `X-Webhook-Signature` HMAC header.
pub fn fire_webhooks(
    client: &reqwest::Client,
    urls: &[String],
    webhook: SettlementWebhook,
    hmac_key: Option<&[u8]>,
) {
    let body_bytes = match serde_json::to_vec(&webhook) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize webhook payload");
            return;
        }
    };
    let signature = hmac_key.map(|key| x402::hmac::compute_hmac(key, &body_bytes));

    for url in urls {
        let client = client.clone();
        let url = url.clone();
        let body = body_bytes.clone();
        let signature = signature.clone();

        tokio::spawn(async move {
            let mut req = client
                .post(&url)
                .header("content-type", "application/json");
            if let Some(sig) = signature {
                req = req.header("X-Webhook-Signature", sig);
            }

            match req.body(body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(url = %url, status = %resp.status(), "webhook delivered")
                }
                Ok(resp) => {
                    tracing::warn!(url = %url, status = %resp.status(), "webhook rejected")
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "webhook delivery failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_insecure_urls() {
        assert!(validate_webhook_urls(&["https://hooks.example.com/x".to_string()]).is_ok());
        assert!(validate_webhook_urls(&["http://hooks.example.com/x".to_string()]).is_err());
        assert!(validate_webhook_urls(&[
            "https://hooks.example.com/x".to_string(),
            "https://10.0.0.5/x".to_string(),
        ])
        .is_err());
    }

    #[test]
    fn payload_shape() {
        let hook = SettlementWebhook {
            event: "settlement.success".to_string(),
            scheme: "deferred".to_string(),
            payer: "0xb0".to_string(),
            amount: "1000000".to_string(),
            transaction: None,
            network: "base".to_string(),
            timestamp: 1,
        };
        let v = serde_json::to_value(&hook).unwrap();
        assert_eq!(v["event"], "settlement.success");
        assert_eq!(v["scheme"], "deferred");
        assert!(v["transaction"].is_null());
    }
}
