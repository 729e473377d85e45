//! Best-effort remote copy of the index files.
//!
//! After every successful index write the store hands each file to a
//! [`Mirror`]; when the local files are missing at load time it asks the
//! mirror for them. Mirror failures are logged by the caller and never fail
//! the local operation.
//!
//! [`S3Mirror`] talks to the S3 REST API directly with AWS Signature V4,
//! signed with `hmac` + `sha2`, and works against S3-compatible services
//! (MinIO, LocalStack) through `endpoint_url`.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::MirrorConfig;

/// Remote blob storage for index files.
#[async_trait]
pub trait Mirror: Send + Sync {
    /// Human-readable location, used in log lines.
    fn describe(&self) -> String;
    /// Store `bytes` under `name`, replacing any previous object.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<()>;
    /// Fetch `name`; `Ok(None)` when the object does not exist.
    async fn download(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Mirror backed by an S3 bucket.
pub struct S3Mirror {
    config: MirrorConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Mirror {
    /// Build a mirror from config, reading credentials from the environment.
    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    fn object_key(&self, name: &str) -> String {
        let prefix = self.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    fn scheme(&self) -> &'static str {
        match self.config.endpoint_url {
            Some(ref url) if url.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Build a signed request for `method` on `key` with the given payload.
    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        payload: &[u8],
    ) -> reqwest::RequestBuilder {
        let host = s3_host(&self.config);
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = if self.config.endpoint_url.is_some() {
            // Path-style addressing for custom endpoints.
            format!("/{}/{}", uri_encode(&self.config.bucket), encoded_key)
        } else {
            format!("/{}", encoded_key)
        };
        let url = format!("{}://{}{}", self.scheme(), host, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        req
    }
}

#[async_trait]
impl Mirror for S3Mirror {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.config.bucket, self.config.prefix)
    }

    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let key = self.object_key(name);
        let resp = self
            .signed_request(reqwest::Method::PUT, &key, &bytes)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.config.bucket, key))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let key = self.object_key(name);
        let resp = self
            .signed_request(reqwest::Method::GET, &key, b"")
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.config.bucket, key))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }
}

// ============ AWS SigV4 Helpers ============

/// Compute the S3 hostname for the configured bucket and region.
///
/// A custom `endpoint_url` is used verbatim (path-style); otherwise the
/// virtual-hosted `<bucket>.s3.<region>.amazonaws.com` form.
fn s3_host(config: &MirrorConfig) -> String {
    if let Some(ref endpoint) = config.endpoint_url {
        endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    } else {
        format!("{}.s3.{}.amazonaws.com", config.bucket, config.region)
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, keeping only `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror(prefix: &str, endpoint: Option<&str>) -> S3Mirror {
        S3Mirror {
            config: MirrorConfig {
                bucket: "docs".to_string(),
                prefix: prefix.to_string(),
                region: "eu-west-1".to_string(),
                endpoint_url: endpoint.map(str::to_string),
            },
            creds: AwsCredentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn object_keys_respect_prefix() {
        assert_eq!(mirror("", None).object_key("index.bin"), "index.bin");
        assert_eq!(
            mirror("team/idx/", None).object_key("metadata.json"),
            "team/idx/metadata.json"
        );
    }

    #[test]
    fn host_and_scheme_follow_endpoint() {
        let aws = mirror("", None);
        assert_eq!(s3_host(&aws.config), "docs.s3.eu-west-1.amazonaws.com");
        assert_eq!(aws.scheme(), "https");

        let minio = mirror("", Some("http://localhost:9000/"));
        assert_eq!(s3_host(&minio.config), "localhost:9000");
        assert_eq!(minio.scheme(), "http");
    }

    #[test]
    fn uri_encode_reserved_characters() {
        assert_eq!(uri_encode("a b/c~d"), "a%20b%2Fc~d");
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn empty_payload_hash() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
