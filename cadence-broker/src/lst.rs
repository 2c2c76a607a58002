//! Live-session-token derivation math.
//!
//! The broker hands back a Diffie-Hellman response; the shared secret keys an
//! HMAC-SHA1 over the decrypted access-token secret, and that MAC *is* the
//! session token. The broker also returns an HMAC of the consumer key under
//! the freshly derived token so the client can prove both sides agree before
//! ever using it.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// How close to expiry a token may get before the next authenticated call
/// derives a fresh one.
const REFRESH_THRESHOLD_SECS: i64 = 60;

/// An opaque, verified session token. Swapped atomically behind the client's
/// session mutex; never written to disk.
#[derive(Clone)]
pub struct LiveSessionToken {
    /// Raw HMAC output; the base64 form is only ever an encoding detail.
    pub token: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl LiveSessionToken {
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > Duration::seconds(REFRESH_THRESHOLD_SECS)
    }
}

impl std::fmt::Debug for LiveSessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSessionToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Random exponent in `[2, p - 2]`.
pub fn generate_dh_random(prime: &BigUint) -> BigUint {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let two = BigUint::from(2u8);
    let upper = prime - &two;
    let mut random = BigUint::from_bytes_be(&bytes) % &upper;
    if random < two {
        random += two;
    }
    random
}

/// `g^random mod p` with generator 2.
pub fn dh_challenge(prime: &BigUint, random: &BigUint) -> BigUint {
    BigUint::from(2u8).modpow(random, prime)
}

/// `response^random mod p`.
pub fn shared_secret(prime: &BigUint, response: &BigUint, random: &BigUint) -> BigUint {
    response.modpow(random, prime)
}

/// Big-endian bytes of a positive big integer in signed-magnitude form:
/// a leading zero byte is prepended whenever the top bit is set, matching
/// the positive-`BigInteger` convention the broker's HMAC keying relies on.
/// Dropping that byte makes the verification HMAC disagree.
pub fn to_signed_magnitude_bytes(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes == [0] {
        return bytes;
    }
    if bytes[0] & 0x80 != 0 {
        let mut padded = Vec::with_capacity(bytes.len() + 1);
        padded.push(0);
        padded.extend_from_slice(&bytes);
        padded
    } else {
        bytes
    }
}

/// HMAC-SHA1 over the decrypted access-token secret, keyed by the shared
/// secret bytes. The MAC output is the live session token.
pub fn derive_token(shared_secret: &BigUint, decrypted_secret: &[u8]) -> Vec<u8> {
    let key = to_signed_magnitude_bytes(shared_secret);
    let mut mac = HmacSha1::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(decrypted_secret);
    mac.finalize().into_bytes().to_vec()
}

/// The broker's proof: hex HMAC-SHA1 of the consumer key under the derived
/// token must equal `live_session_token_signature`.
#[must_use]
pub fn verify_token(token: &[u8], consumer_key: &str, signature_hex: &str) -> bool {
    let mut mac = HmacSha1::new_from_slice(token).expect("HMAC accepts any key length");
    mac.update(consumer_key.as_bytes());
    hex::encode(mac.finalize().into_bytes()) == signature_hex.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn biguint(hex_str: &str) -> BigUint {
        BigUint::parse_bytes(hex_str.as_bytes(), 16).unwrap()
    }

    #[test]
    fn signed_magnitude_test_vectors() {
        // Top bit clear: unchanged.
        assert_eq!(to_signed_magnitude_bytes(&biguint("7f")), vec![0x7f]);
        // Top bit set: leading zero byte.
        assert_eq!(to_signed_magnitude_bytes(&biguint("80")), vec![0x00, 0x80]);
        assert_eq!(
            to_signed_magnitude_bytes(&biguint("ff00")),
            vec![0x00, 0xff, 0x00]
        );
        assert_eq!(
            to_signed_magnitude_bytes(&biguint("0123")),
            vec![0x01, 0x23]
        );
        assert_eq!(to_signed_magnitude_bytes(&BigUint::from(0u8)), vec![0x00]);
    }

    #[test]
    fn both_sides_of_the_exchange_agree() {
        // 1536-bit MODP prime (RFC 3526 group 5).
        let prime = biguint(
            "ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024e088a67cc74\
             020bbea63b139b22514a08798e3404ddef9519b3cd3a431b302b0a6df25f1437\
             4fe1356d6d51c245e485b576625e7ec6f44c42e9a637ed6b0bff5cb6f406b7ed\
             ee386bfb5a899fa5ae9f24117c4b1fe649286651ece45b3dc2007cb8a163bf05\
             98da48361c55d39a69163fa8fd24cf5f83655d23dca3ad961c62f356208552bb\
             9ed529077096966d670c354e4abc9804f1746c08ca237327ffffffffffffffff",
        );
        let secret = b"decrypted-access-token-secret";

        let client_random = generate_dh_random(&prime);
        let server_random = generate_dh_random(&prime);
        let client_challenge = dh_challenge(&prime, &client_random);
        let server_response = dh_challenge(&prime, &server_random);

        let client_k = shared_secret(&prime, &server_response, &client_random);
        let server_k = shared_secret(&prime, &client_challenge, &server_random);
        assert_eq!(client_k, server_k);

        let client_token = derive_token(&client_k, secret);
        let server_token = derive_token(&server_k, secret);
        assert_eq!(client_token, server_token);

        // SHA-1 output, 20 bytes.
        assert_eq!(client_token.len(), 20);

        let mut mac = HmacSha1::new_from_slice(&server_token).unwrap();
        mac.update(b"consumer-key");
        let signature = hex::encode(mac.finalize().into_bytes());
        assert!(verify_token(&client_token, "consumer-key", &signature));
        assert!(!verify_token(&client_token, "other-key", &signature));
    }

    #[test]
    fn expiry_threshold_forces_refresh() {
        let token = LiveSessionToken {
            token: vec![0; 20],
            expires_at: Utc::now() + Duration::seconds(30),
        };
        assert!(!token.is_valid(Utc::now()));
        let fresh = LiveSessionToken {
            token: vec![0; 20],
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(fresh.is_valid(Utc::now()));
    }
}
