//! Outline Server Management API (REST поверх HTTPS с самоподписанным сертификатом).

use super::{
    BackendError, BackendStatus, HealthStatus, Provisioned, UsageRecord, VpnBackendClient,
    validate_display_name,
};
use crate::config::{ConfigError, OutlineConfig};
use crate::model::VpnKey;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKey {
    id: serde_json::Value,
    access_url: Option<String>,
    data_limit: Option<DataLimit>,
}

#[derive(Debug, Deserialize)]
struct DataLimit {
    bytes: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferMetrics {
    bytes_transferred_by_user_id: HashMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    version: Option<String>,
}

/// Проверяет сертификат сервера только по SHA-256 отпечатку.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = Sha256::digest(end_entity.as_ref());
        if actual.as_slice() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                expected = %hex::encode_upper(&self.expected),
                actual = %hex::encode_upper(actual),
                "Outline certificate fingerprint mismatch"
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Отпечаток в формате Outline Manager (`certSha256`): hex, допускаются `:`.
pub fn parse_fingerprint(raw: &str) -> Result<Vec<u8>, ConfigError> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let bytes = hex::decode(&compact)
        .map_err(|e| ConfigError::Invalid(format!("cert_sha256 не hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ConfigError::Invalid(format!(
            "cert_sha256 должен содержать 32 байта, получено {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn pinned_tls_config(fingerprint: Vec<u8>) -> Result<rustls::ClientConfig, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = FingerprintVerifier {
        expected: fingerprint,
        provider: provider.clone(),
    };
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Invalid(format!("TLS: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// HTTP-статус -> ошибка бэкенда.
pub fn error_from_status(status: StatusCode, operation: &str) -> BackendError {
    match status.as_u16() {
        400 | 409 | 422 => {
            BackendError::InvalidInput(format!("{}: Outline ответил {}", operation, status))
        }
        429 | 507 => {
            BackendError::QuotaExceeded(format!("{}: Outline ответил {}", operation, status))
        }
        401 | 403 => BackendError::Unavailable(format!(
            "{}: Outline отклонил авторизацию ({}), проверьте api_url",
            operation, status
        )),
        _ => BackendError::Unavailable(format!("{}: Outline ответил {}", operation, status)),
    }
}

fn error_from_transport(operation: &str, error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Unavailable(format!("{}: таймаут запроса к Outline", operation))
    } else if error.is_connect() {
        BackendError::Unavailable(format!("{}: нет соединения с Outline: {}", operation, error))
    } else if error.is_decode() {
        BackendError::Unavailable(format!("{}: неразборчивый ответ Outline: {}", operation, error))
    } else {
        BackendError::Unavailable(format!("{}: {}", operation, error))
    }
}

fn id_to_string(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Добавляет к ссылке доступа фрагмент с именем, если его ещё нет.
pub fn with_name_fragment(access_url: &str, name: &str) -> String {
    if access_url.contains('#') {
        access_url.to_string()
    } else {
        format!("{}#{}", access_url, urlencoding::encode(name))
    }
}

fn validate_key_id(external_reference: &str) -> Result<&str, BackendError> {
    let valid = !external_reference.is_empty()
        && external_reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(external_reference)
    } else {
        Err(BackendError::InvalidInput(format!(
            "некорректный id ключа Outline: {}",
            external_reference
        )))
    }
}

pub struct OutlineClient {
    http: reqwest::Client,
    api_url: String,
}

impl OutlineClient {
    pub fn new(config: &OutlineConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout);
        if let Some(raw) = config.cert_sha256.as_deref() {
            builder = builder.use_preconfigured_tls(pinned_tls_config(parse_fingerprint(raw)?)?);
        }
        let http = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP-клиент Outline: {}", e)))?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response, BackendError> {
        request
            .send()
            .await
            .map_err(|e| error_from_transport(operation, e))
    }

    async fn read_json<T: DeserializeOwned>(
        response: Response,
        operation: &str,
    ) -> Result<T, BackendError> {
        let body = response
            .bytes()
            .await
            .map_err(|e| error_from_transport(operation, e))?;
        serde_json::from_slice(&body).map_err(|e| {
            BackendError::Unavailable(format!("{}: неразборчивый JSON от Outline: {}", operation, e))
        })
    }
}

#[async_trait]
impl VpnBackendClient for OutlineClient {
    async fn provision(
        &self,
        display_name: &str,
        data_limit_bytes: i64,
    ) -> Result<Provisioned, BackendError> {
        const OP: &str = "создание ключа";
        let name = validate_display_name(display_name)?;
        let mut body = serde_json::json!({ "name": name });
        if data_limit_bytes > 0 {
            body["limit"] = serde_json::json!({ "bytes": data_limit_bytes });
        }

        let response = self
            .send(self.http.post(self.url("/access-keys")).json(&body), OP)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_status(response.status(), OP));
        }
        let key: AccessKey = Self::read_json(response, OP).await?;
        let id = id_to_string(&key.id).ok_or_else(|| {
            BackendError::Unavailable(format!("{}: Outline не вернул id ключа", OP))
        })?;
        let access_url = key.access_url.ok_or_else(|| {
            BackendError::Unavailable(format!("{}: Outline не вернул accessUrl", OP))
        })?;

        tracing::info!(key_id = %id, name = %name, "Outline access key created");
        Ok(Provisioned {
            external_reference: id,
            credential_material: with_name_fragment(&access_url, name),
        })
    }

    async fn deprovision(&self, external_reference: &str) -> Result<bool, BackendError> {
        const OP: &str = "удаление ключа";
        let id = validate_key_id(external_reference)?;
        let response = self
            .send(self.http.delete(self.url(&format!("/access-keys/{}", id))), OP)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::info!(key_id = %id, "Outline access key already absent");
                Ok(false)
            }
            status if status.is_success() => {
                tracing::info!(key_id = %id, "Outline access key deleted");
                Ok(true)
            }
            status => Err(error_from_status(status, OP)),
        }
    }

    async fn get_usage(&self, external_reference: &str) -> Result<UsageRecord, BackendError> {
        const OP: &str = "запрос трафика";
        let id = validate_key_id(external_reference)?;

        let response = self
            .send(self.http.get(self.url(&format!("/access-keys/{}", id))), OP)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(UsageRecord::not_found());
        }
        if !response.status().is_success() {
            return Err(error_from_status(response.status(), OP));
        }
        let key: AccessKey = Self::read_json(response, OP).await?;

        let response = self
            .send(self.http.get(self.url("/metrics/transfer")), OP)
            .await?;
        if !response.status().is_success() {
            return Err(error_from_status(response.status(), OP));
        }
        let metrics: TransferMetrics = Self::read_json(response, OP).await?;
        let bytes = metrics
            .bytes_transferred_by_user_id
            .get(id)
            .copied()
            .unwrap_or(0);

        let limited = key.data_limit.is_some_and(|limit| bytes >= limit.bytes);
        Ok(UsageRecord {
            bytes_transferred: bytes,
            backend_status: if limited {
                BackendStatus::Inactive
            } else {
                BackendStatus::Active
            },
        })
    }

    /// Приостановка: лимит 0 байт. Возобновление: лимит ключа или снятие лимита.
    async fn set_enabled(&self, key: &VpnKey, enabled: bool) -> Result<bool, BackendError> {
        const OP: &str = "смена лимита ключа";
        let id = validate_key_id(&key.external_reference)?;
        let url = self.url(&format!("/access-keys/{}/data-limit", id));
        let request = if enabled && key.data_limit_bytes <= 0 {
            self.http.delete(url)
        } else {
            let bytes = if enabled { key.data_limit_bytes } else { 0 };
            self.http
                .put(url)
                .json(&serde_json::json!({ "limit": { "bytes": bytes } }))
        };
        let response = self.send(request, OP).await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::info!(key_id = %id, enabled, "Outline access key absent, limit not changed");
                Ok(false)
            }
            status if status.is_success() => {
                tracing::info!(key_id = %id, enabled, "Outline access key limit applied");
                Ok(true)
            }
            status => Err(error_from_status(status, OP)),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        const OP: &str = "проверка сервера";
        let response = match self.send(self.http.get(self.url("/server")), OP).await {
            Ok(response) => response,
            Err(error) => return HealthStatus::unhealthy(error.to_string()),
        };
        if !response.status().is_success() {
            return HealthStatus::unhealthy(error_from_status(response.status(), OP).to_string());
        }
        match Self::read_json::<ServerInfo>(response, OP).await {
            Ok(info) => HealthStatus::healthy(info.version),
            Err(error) => HealthStatus::unhealthy(error.to_string()),
        }
    }
}
