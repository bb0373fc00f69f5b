//! EIP-712 typed data for EIP-3009 `TransferWithAuthorization`.
//!
//! Provides functions for:
//! - Building the token's EIP-712 domain for a network ([`transfer_domain`])
//! - Computing signing hashes ([`signing_hash`])
//! - Recovering signers with EIP-2 malleability protection ([`recover_signer`])
//! - Splitting signatures into `(v, r, s)` for on-chain submission ([`split_signature`])

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::sol_types::SolStruct;

use crate::registry::NetworkConfig;
use crate::TransferWithAuthorization;
use crate::X402Error;

/// Build the EIP-712 domain of `asset` on the given network.
pub fn transfer_domain(config: &NetworkConfig, asset: Address) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(config.asset_domain_name.clone())),
        version: Some(std::borrow::Cow::Owned(config.asset_domain_version.clone())),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(asset),
        salt: None,
    }
}

pub fn signing_hash(
    auth: &TransferWithAuthorization,
    config: &NetworkConfig,
    asset: Address,
) -> B256 {
    auth.eip712_signing_hash(&transfer_domain(config, asset))
}

/// secp256k1 curve order N / 2. Signatures with s > this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xDFE92F46681B20A0,
    0x5D576E7357A4501D,
    0xFFFFFFFFFFFFFFFF,
    0x7FFFFFFFFFFFFFFF,
]);

fn parse_signature(signature_bytes: &[u8]) -> Result<Signature, X402Error> {
    if signature_bytes.len() != 65 {
        return Err(X402Error::SignatureError(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| X402Error::SignatureError(format!("invalid signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(X402Error::SignatureError(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }
    Ok(sig)
}

/// Recover the address that signed `auth` for `asset` on the given network.
pub fn recover_signer(
    auth: &TransferWithAuthorization,
    signature_bytes: &[u8],
    config: &NetworkConfig,
    asset: Address,
) -> Result<Address, X402Error> {
    let sig = parse_signature(signature_bytes)?;
    let hash = signing_hash(auth, config, asset);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| X402Error::SignatureError(format!("recovery failed: {e}")))
}

/// Split a 65-byte signature into the `(v, r, s)` triple EIP-3009 expects,
/// with `v` in Electrum notation (27/28).
pub fn split_signature(signature_bytes: &[u8]) -> Result<(u8, B256, B256), X402Error> {
    let sig = parse_signature(signature_bytes)?;
    let r: [u8; 32] = sig.r().to_be_bytes();
    let s: [u8; 32] = sig.s().to_be_bytes();
    let v = 27 + u8::from(sig.v());
    Ok((v, B256::from(r), B256::from(s)))
}

/// Decode a `0x`-prefixed (or bare) hex signature.
pub fn decode_signature_hex(signature: &str) -> Result<Vec<u8>, X402Error> {
    alloy::hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|e| X402Error::SignatureError(format!("invalid hex signature: {e}")))
}

/// Encode a Signature to a hex string with 0x prefix (65 bytes -> 0x + 130 hex).
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}
