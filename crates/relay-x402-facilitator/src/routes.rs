use actix_web::{get, post, web, HttpRequest, HttpResponse};
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use x402::{
    DepositRequest, EscrowAccount, EscrowKey, LedgerError, PaymentRequest, RegistryError,
    X402Error,
};

use crate::metrics;
use crate::state::AppState;
use crate::webhook;

/// Validate the HMAC header on an incoming request.
/// HMAC authentication is always required; the secret must be set at startup.
/// Returns an error response if the signature is missing or invalid.
fn validate_hmac(
    req: &HttpRequest,
    body_bytes: &[u8],
    state: &AppState,
) -> Result<(), HttpResponse> {
    let header_value = req
        .headers()
        .get(x402::hmac::AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    match header_value {
        Some(sig) => {
            if x402::hmac::verify_hmac(&state.hmac_secret, body_bytes, sig) {
                Ok(())
            } else {
                tracing::warn!(path = %req.path(), "HMAC verification failed, signature mismatch");
                metrics::HMAC_FAILURES.with_label_values(&["invalid"]).inc();
                Err(HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "authentication failed"
                })))
            }
        }
        None => {
            tracing::warn!(path = %req.path(), "HMAC header missing on authenticated endpoint");
            metrics::HMAC_FAILURES.with_label_values(&["missing"]).inc();
            Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication required"
            })))
        }
    }
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "error": "bad_request",
        "message": message.into(),
    }))
}

fn not_found(message: impl Into<String>) -> HttpResponse {
    HttpResponse::NotFound().json(serde_json::json!({
        "error": "not_found",
        "message": message.into(),
    }))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let networks = state.facilitator.health_check().await;
    let healthy = networks.iter().all(|n| n.is_healthy());
    let body = serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "service": "x402-facilitator",
        "networks": networks,
    });
    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    // Separate METRICS_TOKEN, never the HMAC shared secret.
    match &state.metrics_token {
        Some(token) => {
            let header = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            if !x402::security::bearer_matches(header, token) {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None if !state.public_metrics => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN or X402_PUBLIC_METRICS=true to access /metrics"
            }));
        }
        None => {}
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

#[get("/supported")]
pub async fn supported(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "kinds": state.facilitator.supported(),
    }))
}

#[post("/verify")]
pub async fn verify(req: HttpRequest, state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if let Err(resp) = validate_hmac(&req, &body, &state) {
        return resp;
    }

    let parsed: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "malformed verify body");
            return HttpResponse::BadRequest().json(serde_json::json!({
                "isValid": false,
                "invalidReason": "invalid request body",
            }));
        }
    };

    let result = state.facilitator.verify(&parsed);
    let scheme = metrics::scheme_label(&parsed.payment_payload.scheme);
    metrics::VERIFY_REQUESTS
        .with_label_values(&[scheme, if result.is_valid { "valid" } else { "invalid" }])
        .inc();
    HttpResponse::Ok().json(result)
}

#[post("/settle")]
pub async fn settle(req: HttpRequest, state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if let Err(resp) = validate_hmac(&req, &body, &state) {
        return resp;
    }

    let parsed: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "malformed settle body");
            return HttpResponse::BadRequest().json(serde_json::json!({
                "success": false,
                "errorReason": "invalid request body",
                "transaction": null,
                "network": null,
            }));
        }
    };

    let scheme = metrics::scheme_label(&parsed.payment_payload.scheme);
    let start = std::time::Instant::now();
    let outcome = state.facilitator.settle(&parsed).await;
    let elapsed = start.elapsed().as_secs_f64();

    match outcome {
        Ok(result) => {
            let label = if result.success { "success" } else { "rejected" };
            metrics::SETTLE_REQUESTS.with_label_values(&[scheme, label]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&[scheme, label])
                .observe(elapsed);

            if result.success {
                tracing::info!(
                    scheme,
                    payer = ?result.payer,
                    tx = ?result.transaction,
                    network = %result.network,
                    "settlement completed"
                );
                if !state.webhook_urls.is_empty() {
                    webhook::fire_webhooks(
                        &state.http_client,
                        &state.webhook_urls,
                        webhook::SettlementWebhook {
                            event: "settlement.success".to_string(),
                            scheme: scheme.to_string(),
                            payer: result.payer.map(|a| format!("{a}")).unwrap_or_default(),
                            amount: parsed.payment_requirements.max_amount_required.clone(),
                            transaction: result.transaction.clone(),
                            network: result.network.clone(),
                            timestamp: unix_now(),
                        },
                        state.webhook_hmac_key.as_deref(),
                    );
                }
            } else {
                tracing::warn!(
                    scheme,
                    payer = ?result.payer,
                    reason = result.error_reason.as_deref().unwrap_or("unknown"),
                    "settlement rejected"
                );
            }
            HttpResponse::Ok().json(result)
        }
        Err(e) => {
            metrics::SETTLE_REQUESTS.with_label_values(&[scheme, "error"]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&[scheme, "error"])
                .observe(elapsed);
            tracing::error!(error = %e, scheme, "settlement infrastructure failure");

            let body = serde_json::json!({
                "success": false,
                "errorReason": "settlement failed",
                "transaction": null,
                "network": &parsed.payment_payload.network,
            });
            match e {
                X402Error::Transport(_) => HttpResponse::BadGateway().json(body),
                _ => HttpResponse::InternalServerError().json(body),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    pub network: Option<String>,
}

#[get("/api/deferred/info")]
pub async fn deferred_info(query: web::Query<InfoQuery>, state: web::Data<AppState>) -> HttpResponse {
    let Some(network) = query.network.as_deref().filter(|n| !n.is_empty()) else {
        return bad_request("missing required parameter: network");
    };
    match state.facilitator.deferred_info(network) {
        Ok(info) => HttpResponse::Ok().json(info),
        Err(e @ (RegistryError::UnknownNetwork(_) | RegistryError::DeferredDisabled(_))) => {
            not_found(e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "unexpected registry error");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub network: Option<String>,
    pub buyer: Option<String>,
    pub seller: Option<String>,
    pub asset: Option<String>,
}

/// Escrow account as returned by the balance and deposit endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowBalance {
    pub network: String,
    pub buyer: Address,
    pub seller: Address,
    pub asset: Address,
    pub balance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_deposit_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawable_at: Option<u64>,
    pub withdrawable: bool,
}

impl EscrowBalance {
    fn new(key: EscrowKey, account: &EscrowAccount, thaw_period: u64, now: u64) -> Self {
        Self {
            balance: account.balance.to_string(),
            last_deposit_at: account.last_deposit_at,
            withdrawable_at: account.withdrawable_at(thaw_period),
            withdrawable: account.is_withdrawable(now, thaw_period),
            network: key.network,
            buyer: key.buyer,
            seller: key.seller,
            asset: key.asset,
        }
    }
}

fn parse_address(name: &str, raw: Option<&str>) -> Result<Address, HttpResponse> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request(format!("missing required parameter: {name}")))?;
    raw.parse()
        .map_err(|_| bad_request(format!("invalid address for {name}: {raw}")))
}

fn ledger_error_response(e: LedgerError) -> HttpResponse {
    match e {
        LedgerError::UnknownNetwork(_) | LedgerError::DeferredNotEnabled(_) => {
            not_found(e.to_string())
        }
        LedgerError::CapExceeded { .. } => HttpResponse::Conflict().json(serde_json::json!({
            "error": "cap_exceeded",
            "message": e.to_string(),
        })),
        LedgerError::ZeroAmount => HttpResponse::BadRequest().json(serde_json::json!({
            "error": "zero_amount",
            "message": e.to_string(),
        })),
        LedgerError::Storage(_) => {
            tracing::error!(error = %e, "escrow storage failure");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "storage_error",
            }))
        }
        LedgerError::InsufficientBalance { .. }
        | LedgerError::Thawing { .. }
        | LedgerError::DuplicateCharge => {
            HttpResponse::Conflict().json(serde_json::json!({
                "error": e.reason().map(|r| r.as_str()).unwrap_or("conflict"),
                "message": e.to_string(),
            }))
        }
    }
}

fn thaw_period(state: &AppState, network: &str) -> u64 {
    state
        .facilitator
        .registry()
        .resolve(network)
        .map(|n| n.thaw_period_seconds)
        .unwrap_or_default()
}

#[get("/api/deferred/balance")]
pub async fn deferred_balance(
    query: web::Query<BalanceQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let Some(network) = query.network.clone().filter(|n| !n.is_empty()) else {
        return bad_request("missing required parameter: network");
    };
    let key = match (
        parse_address("buyer", query.buyer.as_deref()),
        parse_address("seller", query.seller.as_deref()),
        parse_address("asset", query.asset.as_deref()),
    ) {
        (Ok(buyer), Ok(seller), Ok(asset)) => EscrowKey::new(network, buyer, seller, asset),
        (Err(resp), _, _) | (_, Err(resp), _) | (_, _, Err(resp)) => return resp,
    };

    match state.facilitator.balance(&key) {
        Ok(account) => {
            metrics::LEDGER_OPERATIONS
                .with_label_values(&["balance", "ok"])
                .inc();
            let thaw = thaw_period(&state, &key.network);
            let now = state.facilitator.ledger().now();
            HttpResponse::Ok().json(EscrowBalance::new(key, &account, thaw, now))
        }
        Err(e) => {
            metrics::LEDGER_OPERATIONS
                .with_label_values(&["balance", "error"])
                .inc();
            ledger_error_response(e)
        }
    }
}

#[post("/api/deferred/deposit")]
pub async fn deferred_deposit(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(resp) = validate_hmac(&req, &body, &state) {
        return resp;
    }

    let parsed: DepositRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    if parsed.amount.is_empty() || !parsed.amount.bytes().all(|b| b.is_ascii_digit()) {
        return bad_request(format!("amount must be a decimal integer: {}", parsed.amount));
    }
    let Ok(amount) = U256::from_str_radix(&parsed.amount, 10) else {
        return bad_request(format!("amount out of range: {}", parsed.amount));
    };
    // Deferred verification never accepts these accounts.
    if [parsed.buyer, parsed.seller, parsed.asset].contains(&Address::ZERO) {
        return bad_request("buyer, seller and asset must be non-zero addresses");
    }
    if parsed.buyer == parsed.seller {
        return bad_request("buyer and seller must differ");
    }

    let key = EscrowKey::new(parsed.network, parsed.buyer, parsed.seller, parsed.asset);
    match state.facilitator.deposit(&key, amount).await {
        Ok(account) => {
            metrics::LEDGER_OPERATIONS
                .with_label_values(&["deposit", "ok"])
                .inc();
            let thaw = thaw_period(&state, &key.network);
            let now = state.facilitator.ledger().now();
            HttpResponse::Ok().json(EscrowBalance::new(key, &account, thaw, now))
        }
        Err(e) => {
            let label = e.reason().map(|r| r.as_str()).unwrap_or("error");
            metrics::LEDGER_OPERATIONS
                .with_label_values(&["deposit", label])
                .inc();
            ledger_error_response(e)
        }
    }
}

/// Register every facilitator route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(metrics_endpoint)
        .service(supported)
        .service(verify)
        .service(settle)
        .service(deferred_info)
        .service(deferred_balance)
        .service(deferred_deposit);
}
