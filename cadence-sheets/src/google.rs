//! Google Sheets v4 values transport with service-account authentication.
//!
//! The service account's RSA key signs an RS256 JWT grant which is exchanged
//! at the OAuth2 token endpoint for a bearer token; the token is cached until
//! shortly before expiry. Only the values surface is used: one ranged `GET`
//! to read, one ranged `PUT` to write a cell.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use cadence_core::RowIndex;

use crate::{SheetError, Worksheet};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Read well past any plausible order table.
const READ_RANGE: &str = "A1:AZ500";

pub struct GoogleSheetsSettings {
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub credentials_path: PathBuf,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Worksheet transport backed by the Google Sheets values API.
pub struct GoogleSheets {
    http: Client,
    api_base: String,
    spreadsheet_id: String,
    worksheet: String,
    client_email: String,
    token_uri: String,
    key: RsaPrivateKey,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleSheets {
    pub fn new(settings: GoogleSheetsSettings) -> Result<Self, SheetError> {
        let account = load_service_account(&settings.credentials_path)?;
        let key = RsaPrivateKey::from_pkcs8_pem(&account.private_key).map_err(|err| {
            SheetError::Auth(format!("failed to parse service account key: {err}"))
        })?;
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|err| SheetError::Io(format!("failed to create HTTP client: {err}")))?;
        Ok(Self {
            http,
            api_base: SHEETS_API_BASE.to_string(),
            spreadsheet_id: settings.spreadsheet_id,
            worksheet: settings.worksheet,
            client_email: account.client_email,
            token_uri: account.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.into()),
            key,
            token: Mutex::new(None),
        })
    }

    /// Point the client at a different API root. Test hook.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    async fn bearer(&self) -> Result<String, SheetError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - Utc::now() > Duration::seconds(60) {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.fetch_token().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    async fn fetch_token(&self) -> Result<CachedToken, SheetError> {
        let now = Utc::now();
        let assertion = self.signed_jwt(now)?;
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|err| SheetError::Io(format!("token request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SheetError::Io(err.to_string()))?;
        if !status.is_success() {
            return Err(SheetError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| SheetError::Auth(format!("bad token response: {err}")))?;
        debug!("service account token refreshed");
        Ok(CachedToken {
            token: parsed.access_token,
            expires_at: now + Duration::seconds(parsed.expires_in),
        })
    }

    /// RS256 JWT grant: `header.claims.signature`, base64url without padding.
    fn signed_jwt(&self, now: DateTime<Utc>) -> Result<String, SheetError> {
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "RS256", "typ": "JWT"}).to_string());
        let claims = URL_SAFE_NO_PAD.encode(
            json!({
                "iss": self.client_email,
                "scope": SPREADSHEETS_SCOPE,
                "aud": self.token_uri,
                "iat": now.timestamp(),
                "exp": now.timestamp() + 3600,
            })
            .to_string(),
        );
        let signing_input = format!("{header}.{claims}");
        let digest = Sha256::digest(signing_input.as_bytes());
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|err| SheetError::Auth(format!("JWT signing failed: {err}")))?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn values_url(&self, range: &str) -> String {
        let quoted = format!("'{}'!{range}", self.worksheet);
        format!(
            "{}/{}/values/{}",
            self.api_base,
            self.spreadsheet_id,
            urlencode(&quoted)
        )
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(self.values_url(range))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SheetError::Io(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SheetError::Io(err.to_string()))?;
        if !status.is_success() {
            return Err(SheetError::Io(format!(
                "values read returned {status}: {body}"
            )));
        }
        #[derive(Deserialize)]
        struct ValuesResponse {
            #[serde(default)]
            values: Vec<Vec<Value>>,
        }
        let parsed: ValuesResponse = serde_json::from_str(&body)
            .map_err(|err| SheetError::Io(format!("bad values response: {err}")))?;
        Ok(parsed
            .values
            .into_iter()
            .map(|row| row.into_iter().map(value_to_string).collect())
            .collect())
    }
}

#[async_trait]
impl Worksheet for GoogleSheets {
    async fn read_all(&self) -> Result<Vec<Vec<String>>, SheetError> {
        self.get_values(READ_RANGE).await
    }

    async fn read_row(&self, row: RowIndex) -> Result<Vec<String>, SheetError> {
        let mut rows = self.get_values(&format!("{row}:{row}")).await?;
        let result = rows.drain(..).next().unwrap_or_default();
        Ok(result)
    }

    async fn update_cell(
        &self,
        row: RowIndex,
        col: usize,
        value: &str,
    ) -> Result<(), SheetError> {
        let token = self.bearer().await?;
        let cell = format!("{}{row}", column_letters(col));
        let url = format!("{}?valueInputOption=RAW", self.values_url(&cell));
        let response = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(&json!({
                "majorDimension": "ROWS",
                "values": [[value]],
            }))
            .send()
            .await
            .map_err(|err| SheetError::Io(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SheetError::Io(format!(
                "cell update returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

fn load_service_account(path: &Path) -> Result<ServiceAccountKey, SheetError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        SheetError::Auth(format!(
            "failed to read service account file {}: {err}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| SheetError::Auth(format!("bad service account file: {err}")))
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 1-based column number to spreadsheet letters (1 = A, 27 = AA).
fn column_letters(mut col: usize) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).expect("ASCII letters")
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
