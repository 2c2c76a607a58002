//! Disposable OAuth key material for tests.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tempfile::TempDir;

use cadence_broker::BrokerSettings;

/// 1536-bit MODP prime (RFC 3526 group 5), plenty for the handshake.
pub const TEST_DH_PRIME_HEX: &str =
    "ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024e088a67cc74\
     020bbea63b139b22514a08798e3404ddef9519b3cd3a431b302b0a6df25f1437\
     4fe1356d6d51c245e485b576625e7ec6f44c42e9a637ed6b0bff5cb6f406b7ed\
     ee386bfb5a899fa5ae9f24117c4b1fe649286651ece45b3dc2007cb8a163bf05\
     98da48361c55d39a69163fa8fd24cf5f83655d23dca3ad961c62f356208552bb\
     9ed529077096966d670c354e4abc9804f1746c08ca237327ffffffffffffffff";

const KEY_BITS: usize = 2048;

/// Generated signing and encryption keys plus a pre-encrypted access token
/// secret, written out as PEM files the way production config references
/// them.
pub struct TestKeys {
    _dir: TempDir,
    pub signature_key_path: PathBuf,
    pub encryption_key_path: PathBuf,
    pub consumer_key: String,
    pub access_token: String,
    /// The plaintext the broker side HMACs over.
    pub access_token_secret_plain: Vec<u8>,
    /// What goes in the config: base64 of the OAEP ciphertext.
    pub access_token_secret_b64: String,
}

impl TestKeys {
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let signature_key =
            RsaPrivateKey::new(&mut rng, KEY_BITS).context("signature key generation")?;
        let encryption_key =
            RsaPrivateKey::new(&mut rng, KEY_BITS).context("encryption key generation")?;

        let secret = b"test-access-token-secret".to_vec();
        let encryption_public = RsaPublicKey::from(&encryption_key);
        let ciphertext = encryption_public
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &secret)
            .context("secret encryption")?;

        let dir = TempDir::new()?;
        let signature_key_path = dir.path().join("private_signature.pem");
        let encryption_key_path = dir.path().join("private_encryption.pem");
        std::fs::write(
            &signature_key_path,
            signature_key.to_pkcs8_pem(LineEnding::LF)?.as_bytes(),
        )?;
        std::fs::write(
            &encryption_key_path,
            encryption_key.to_pkcs8_pem(LineEnding::LF)?.as_bytes(),
        )?;

        Ok(Self {
            _dir: dir,
            signature_key_path,
            encryption_key_path,
            consumer_key: "TESTCONSUMER".into(),
            access_token: "test-access-token".into(),
            access_token_secret_plain: secret,
            access_token_secret_b64: BASE64.encode(ciphertext),
        })
    }

    /// Broker settings pointed at a mock server.
    pub fn broker_settings(&self, base_url: &str) -> BrokerSettings {
        BrokerSettings {
            base_url: base_url.to_string(),
            consumer_key: self.consumer_key.clone(),
            access_token: self.access_token.clone(),
            access_token_secret: self.access_token_secret_b64.clone(),
            dh_prime: TEST_DH_PRIME_HEX.to_string(),
            realm: "limited_poa".into(),
            signature_key_path: self.signature_key_path.clone(),
            encryption_key_path: self.encryption_key_path.clone(),
            account_id: None,
            call_timeout: Duration::from_secs(5),
        }
    }
}
