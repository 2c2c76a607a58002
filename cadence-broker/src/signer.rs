//! OAuth 1.0a request signing against the broker's web API.
//!
//! Two signature methods are in play: `RSA-SHA256` for the live-session-token
//! handshake and `HMAC-SHA256` (keyed by the derived token) for everything
//! after it. Query-string parameters join the signature base string; JSON
//! request bodies never do.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{BrokerError, BrokerResult};

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) const SIG_METHOD_RSA: &str = "RSA-SHA256";
pub(crate) const SIG_METHOD_HMAC: &str = "HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

/// Percent-encode a string with the OAuth character set.
pub fn pct_encode(input: &str) -> String {
    utf8_percent_encode(input, OAUTH_ENCODE_SET).to_string()
}

/// 16 random lowercase hex characters.
pub fn nonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Load an RSA private key from a PEM file, accepting both PKCS#1
/// (`BEGIN RSA PRIVATE KEY`) and PKCS#8 (`BEGIN PRIVATE KEY`) encodings.
pub fn load_private_key(path: &Path) -> BrokerResult<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path).map_err(|err| {
        BrokerError::Auth(format!("failed to read key file {}: {err}", path.display()))
    })?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|err| {
            BrokerError::Auth(format!("failed to parse RSA key {}: {err}", path.display()))
        })
}

/// Holds the long-lived OAuth identity and the private keys backing it.
pub struct OauthSigner {
    pub consumer_key: String,
    pub access_token: String,
    pub realm: String,
    signature_key: RsaPrivateKey,
    encryption_key: RsaPrivateKey,
}

impl OauthSigner {
    pub fn new(
        consumer_key: String,
        access_token: String,
        realm: String,
        signature_key: RsaPrivateKey,
        encryption_key: RsaPrivateKey,
    ) -> Self {
        Self {
            consumer_key,
            access_token,
            realm,
            signature_key,
            encryption_key,
        }
    }

    /// RSA-OAEP decryption of the base64 access-token-secret ciphertext.
    /// The plaintext bytes seed both the base-string prepend and the
    /// HMAC message of the token derivation.
    pub fn decrypt_access_token_secret(&self, ciphertext_b64: &str) -> BrokerResult<Vec<u8>> {
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|err| BrokerError::Auth(format!("access token secret is not base64: {err}")))?;
        self.encryption_key
            .decrypt(Oaep::new::<Sha1>(), &ciphertext)
            .map_err(|err| {
                BrokerError::Auth(format!("failed to decrypt access token secret: {err}"))
            })
    }

    fn base_oauth_params(&self, signature_method: &str) -> Vec<(String, String)> {
        vec![
            ("oauth_consumer_key".into(), self.consumer_key.clone()),
            ("oauth_nonce".into(), nonce()),
            ("oauth_signature_method".into(), signature_method.into()),
            (
                "oauth_timestamp".into(),
                chrono::Utc::now().timestamp().to_string(),
            ),
            ("oauth_token".into(), self.access_token.clone()),
        ]
    }

    /// Authorization header for the live-session-token request. The base
    /// string is prefixed with the hex of the decrypted secret and signed
    /// with the RSA signature key.
    pub fn lst_request_header(
        &self,
        url: &str,
        dh_challenge_hex: &str,
        prepend_hex: &str,
    ) -> BrokerResult<String> {
        let mut params = self.base_oauth_params(SIG_METHOD_RSA);
        params.push((
            "diffie_hellman_challenge".into(),
            dh_challenge_hex.to_string(),
        ));

        let base = format!("{prepend_hex}{}", base_string("POST", url, &params));
        let digest = Sha256::digest(base.as_bytes());
        let signature = self
            .signature_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|err| BrokerError::Auth(format!("RSA signing failed: {err}")))?;
        params.push(("oauth_signature".into(), pct_encode(&BASE64.encode(signature))));
        Ok(authorization_header(&self.realm, params))
    }

    /// Authorization header for an authenticated call, signed with
    /// HMAC-SHA256 keyed by the decoded live session token. `query` must
    /// carry every query-string pair of the actual request.
    pub fn signed_header(
        &self,
        method: &str,
        url: &str,
        query: &[(String, String)],
        live_session_token: &[u8],
    ) -> BrokerResult<String> {
        let mut params = self.base_oauth_params(SIG_METHOD_HMAC);
        let mut base_params = params.clone();
        base_params.extend(query.iter().cloned());

        let base = base_string(method, url, &base_params);
        let mut mac = HmacSha256::new_from_slice(live_session_token)
            .map_err(|err| BrokerError::Auth(format!("failed to key request HMAC: {err}")))?;
        mac.update(base.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        params.push(("oauth_signature".into(), pct_encode(&signature)));
        Ok(authorization_header(&self.realm, params))
    }
}

/// `METHOD&pct(url)&pct(k1=v1&k2=v2...)` with parameters sorted by key.
pub fn base_string(method: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{method}&{}&{}", pct_encode(url), pct_encode(&joined))
}

/// `OAuth realm="...", k="v", ...` with keys sorted and values quoted.
pub fn authorization_header(realm: &str, mut params: Vec<(String, String)>) -> String {
    params.sort();
    let pairs = params
        .iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth realm=\"{realm}\", {pairs}")
}
