use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{test, web, App};
use alloy::primitives::{Address, FixedBytes, TxHash, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;

use x402::{
    eip712, ChainClient, ChainError, Confirmation, DeferredPayload, ExactAuthorization,
    ExactPayload, Facilitator, KnownNetwork, ManualClock, NetworkConfig, NetworkRegistry,
    SignedTransfer, TransferWithAuthorization,
};
use x402_facilitator::routes;
use x402_facilitator::state::AppState;

const SECRET: &[u8] = b"test-secret";
const T0: u64 = 1_700_000_000;
const BUYER: &str = "0xb0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0";
const SELLER: &str = "0x5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e";

struct StubChain {
    broadcast: Mutex<Result<TxHash, ChainError>>,
}

#[async_trait]
impl ChainClient for StubChain {
    async fn broadcast_transfer(
        &self,
        _network: &NetworkConfig,
        _transfer: &SignedTransfer,
    ) -> Result<TxHash, ChainError> {
        self.broadcast.lock().unwrap().clone()
    }

    async fn await_confirmation(
        &self,
        _network: &NetworkConfig,
        _tx: TxHash,
        _timeout: Duration,
    ) -> Confirmation {
        Confirmation::Confirmed {
            block_number: Some(7),
        }
    }

    async fn block_number(&self, _network: &NetworkConfig) -> Result<u64, ChainError> {
        Ok(7)
    }

    fn supports(&self, network_id: &str) -> bool {
        network_id == "celo"
    }
}

struct Harness {
    state: web::Data<AppState>,
    chain: Arc<StubChain>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let registry = NetworkRegistry::new(vec![
        NetworkConfig::for_known(KnownNetwork::Base).with_escrow(Address::repeat_byte(0xee)),
        NetworkConfig::for_known(KnownNetwork::Celo),
    ])
    .unwrap();
    let chain = Arc::new(StubChain {
        broadcast: Mutex::new(Ok(TxHash::repeat_byte(0xab))),
    });
    let clock = Arc::new(ManualClock::new(T0));
    let facilitator = Facilitator::builder(Arc::new(registry))
        .chain_client(chain.clone())
        .clock(clock.clone())
        .build();
    Harness {
        state: web::Data::new(AppState::new(Arc::new(facilitator), SECRET.to_vec())),
        chain,
        clock,
    }
}

fn usdc_base() -> String {
    format!("{}", KnownNetwork::Base.usdc())
}

fn signed_post(uri: &str, body: &serde_json::Value) -> test::TestRequest {
    let bytes = serde_json::to_vec(body).unwrap();
    let sig = x402::hmac::compute_hmac(SECRET, &bytes);
    test::TestRequest::post()
        .uri(uri)
        .set_payload(bytes)
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("X-Facilitator-Auth", sig))
}

fn deposit_body(amount: &str) -> serde_json::Value {
    serde_json::json!({
        "network": "base",
        "buyer": BUYER,
        "seller": SELLER,
        "asset": usdc_base(),
        "amount": amount,
    })
}

fn deferred_settle_body(amount: &str, nonce: u8) -> serde_json::Value {
    let asset = KnownNetwork::Base.usdc();
    serde_json::json!({
        "x402Version": 1,
        "paymentPayload": {
            "x402Version": 1,
            "scheme": "deferred",
            "network": "base",
            "payload": DeferredPayload {
                buyer: BUYER.parse().unwrap(),
                seller: SELLER.parse().unwrap(),
                asset,
                amount: amount.to_string(),
                nonce: FixedBytes::repeat_byte(nonce),
            },
        },
        "paymentRequirements": {
            "scheme": "deferred",
            "network": "base",
            "maxAmountRequired": amount,
            "asset": asset,
            "payTo": SELLER,
            "maxTimeoutSeconds": 60,
        },
    })
}

fn exact_settle_body(signer: &PrivateKeySigner) -> serde_json::Value {
    let config = NetworkConfig::for_known(KnownNetwork::Celo);
    let seller: Address = SELLER.parse().unwrap();
    let auth = TransferWithAuthorization {
        from: signer.address(),
        to: seller,
        value: U256::from(1_000u64),
        validAfter: U256::from(T0 - 10),
        validBefore: U256::from(T0 + 100),
        nonce: FixedBytes::repeat_byte(0x42),
    };
    let sig = signer
        .sign_hash_sync(&eip712::signing_hash(&auth, &config, config.asset))
        .unwrap();
    serde_json::json!({
        "x402Version": 1,
        "paymentPayload": {
            "scheme": "exact",
            "network": "celo",
            "payload": ExactPayload {
                signature: eip712::encode_signature_hex(&sig),
                authorization: ExactAuthorization {
                    from: signer.address(),
                    to: seller,
                    value: "1000".to_string(),
                    valid_after: (T0 - 10).to_string(),
                    valid_before: (T0 + 100).to_string(),
                    nonce: FixedBytes::repeat_byte(0x42),
                },
            },
        },
        "paymentRequirements": {
            "scheme": "exact",
            "network": "celo",
            "maxAmountRequired": "1000",
            "asset": config.asset,
            "payTo": SELLER,
            "maxTimeoutSeconds": 60,
        },
    })
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .app_data(web::JsonConfig::default().limit(65_536))
                .configure(routes::configure),
        )
        .await
    };
}

#[actix_rt::test]
async fn test_supported_lists_enabled_kinds() {
    let h = harness();
    let app = app!(h.state);

    let req = test::TestRequest::get().uri("/supported").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

    let kinds = body["kinds"].as_array().unwrap();
    assert_eq!(kinds.len(), 2);
    assert_eq!(kinds[0]["scheme"], "deferred");
    assert_eq!(kinds[0]["network"], "base");
    assert_eq!(kinds[1]["scheme"], "exact");
    assert_eq!(kinds[1]["network"], "celo");
    assert_eq!(kinds[1]["x402Version"], 1);
}

#[actix_rt::test]
async fn test_post_endpoints_require_hmac() {
    let h = harness();
    let app = app!(h.state);

    for uri in ["/verify", "/settle", "/api/deferred/deposit"] {
        let req = test::TestRequest::post()
            .uri(uri)
            .set_payload("{}")
            .insert_header(("Content-Type", "application/json"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401, "{uri}");
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "authentication required");

        let req = test::TestRequest::post()
            .uri(uri)
            .set_payload("{}")
            .insert_header(("Content-Type", "application/json"))
            .insert_header(("X-Facilitator-Auth", "deadbeef"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401, "{uri}");
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "authentication failed");
    }
}

#[actix_rt::test]
async fn test_valid_hmac_with_malformed_body_is_400() {
    let h = harness();
    let app = app!(h.state);

    for uri in ["/verify", "/settle", "/api/deferred/deposit"] {
        let req = signed_post(uri, &serde_json::json!({})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{uri}");
    }
}

#[actix_rt::test]
async fn test_deferred_info() {
    let h = harness();
    let app = app!(h.state);

    let req = test::TestRequest::get()
        .uri("/api/deferred/info?network=base")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["chainId"], 8453);
    assert_eq!(body["thawPeriod"], 86_400);
    assert_eq!(body["maxDeposit"], "10000000");
    assert_eq!(body["network"], "base");
    assert!(body["escrowAddress"].is_string());

    for uri in [
        "/api/deferred/info?network=celo",
        "/api/deferred/info?network=solana",
    ] {
        let req = test::TestRequest::get().uri(uri).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404, "{uri}");
    }

    let req = test::TestRequest::get().uri("/api/deferred/info").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_rt::test]
async fn test_deferred_balance_validation() {
    let h = harness();
    let app = app!(h.state);
    let asset = usdc_base();

    let missing = format!("/api/deferred/balance?network=base&buyer={BUYER}&asset={asset}");
    let bad = format!("/api/deferred/balance?network=base&buyer=0x12&seller={SELLER}&asset={asset}");
    for uri in [missing, bad] {
        let req = test::TestRequest::get().uri(&uri).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400, "{uri}");
    }

    let disabled =
        format!("/api/deferred/balance?network=celo&buyer={BUYER}&seller={SELLER}&asset={asset}");
    let req = test::TestRequest::get().uri(&disabled).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let fresh =
        format!("/api/deferred/balance?network=base&buyer={BUYER}&seller={SELLER}&asset={asset}");
    let req = test::TestRequest::get().uri(&fresh).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["balance"], "0");
    assert_eq!(body["network"], "base");
}

#[actix_rt::test]
async fn test_deposit_cap_and_settle_flow() {
    let h = harness();
    let app = app!(h.state);

    let req = signed_post("/api/deferred/deposit", &deposit_body("5000000")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["balance"], "5000000");
    assert_eq!(body["withdrawable"], false);

    let req = signed_post("/api/deferred/deposit", &deposit_body("6000000")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "cap_exceeded");

    for amount in ["0", "1.5", "-1"] {
        let req = signed_post("/api/deferred/deposit", &deposit_body(amount)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400, "{amount}");
    }

    // Inside the thaw window the charge is rejected in-band.
    let settle = deferred_settle_body("5000000", 1);
    let req = signed_post("/settle", &settle).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["errorReason"], "thawing");

    h.clock.advance(86_400);
    let req = signed_post("/settle", &settle).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["network"], "base");
    assert_eq!(body["payer"].as_str().unwrap().to_lowercase(), BUYER);

    let asset = usdc_base();
    let uri =
        format!("/api/deferred/balance?network=base&buyer={BUYER}&seller={SELLER}&asset={asset}");
    let req = test::TestRequest::get().uri(&uri).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["balance"], "0");
}

#[actix_rt::test]
async fn test_deposit_rejects_unchargeable_accounts() {
    let h = harness();
    let app = app!(h.state);
    let zero = format!("{}", Address::ZERO);

    let mut bodies = Vec::new();
    for field in ["buyer", "seller", "asset"] {
        let mut body = deposit_body("1000");
        body[field] = serde_json::json!(zero);
        bodies.push(body);
    }
    let mut self_escrow = deposit_body("1000");
    self_escrow["seller"] = serde_json::json!(BUYER);
    bodies.push(self_escrow);

    for body in &bodies {
        let req = signed_post("/api/deferred/deposit", body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{body}");
        let json: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(json["error"], "bad_request");
    }

    let asset = usdc_base();
    let uri = format!("/api/deferred/balance?network=base&buyer={BUYER}&seller={BUYER}&asset={asset}");
    let req = test::TestRequest::get().uri(&uri).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["balance"], "0");
}

#[actix_rt::test]
async fn test_verify_reports_in_band() {
    let h = harness();
    let app = app!(h.state);

    let req = signed_post("/verify", &deferred_settle_body("1000", 1)).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["isValid"], true);

    let mut wrong_amount = deferred_settle_body("1000", 1);
    wrong_amount["paymentRequirements"]["maxAmountRequired"] = serde_json::json!("999");
    let req = signed_post("/verify", &wrong_amount).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], false);
    assert_eq!(body["invalidReason"], "amount_mismatch");
}

#[actix_rt::test]
async fn test_exact_settle_and_transport_failure() {
    let h = harness();
    let app = app!(h.state);
    let signer = PrivateKeySigner::random();

    *h.chain.broadcast.lock().unwrap() =
        Err(ChainError::Transport("connection refused".to_string()));
    let req = signed_post("/settle", &exact_settle_body(&signer)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 502);

    *h.chain.broadcast.lock().unwrap() = Ok(TxHash::repeat_byte(0xab));
    let req = signed_post("/settle", &exact_settle_body(&signer)).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["transaction"], format!("{}", TxHash::repeat_byte(0xab)));
    assert_eq!(body["network"], "celo");
}

#[actix_rt::test]
async fn test_health_reports_rpc_networks() {
    let h = harness();
    let app = app!(h.state);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["networks"][0]["network"], "celo");
    assert_eq!(body["networks"][0]["blockNumber"], 7);
}

#[actix_rt::test]
async fn test_metrics_access_control() {
    let h = harness();
    let app = app!(h.state);
    let req = test::TestRequest::get().uri("/metrics").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let mut state = AppState::new(h.state.facilitator.clone(), SECRET.to_vec());
    state.metrics_token = Some(b"scrape-token".to_vec());
    let state = web::Data::new(state);
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("Authorization", "Bearer wrong"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("Authorization", "Bearer scrape-token"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
}
