use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use sha2::Sha256;

use crate::config::Credentials;
use crate::error::AggregatorError;

type HmacSha256 = Hmac<Sha256>;

/// Thin REST client shared by the venue adapters: base URL, request timeout,
/// API-key header and HMAC-SHA256 query signing (Binance/MEXC style).
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    api_key_header: &'static str,
    credentials: Option<Credentials>,
}

impl RestClient {
    pub fn new(
        base_url: &str,
        api_key_header: &'static str,
        credentials: Option<Credentials>,
        timeout_ms: u64,
    ) -> Result<Self, AggregatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(AggregatorError::api)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key_header,
            credentials,
        })
    }

    /// Unauthenticated GET with query parameters.
    pub async fn get_public<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, AggregatorError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let res = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(AggregatorError::api)?;
        Self::decode(res).await
    }

    /// Signed request: appends a millisecond timestamp and an HMAC-SHA256
    /// signature of the query string, and sets the API-key header.
    pub async fn call_signed<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, AggregatorError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(AggregatorError::MissingCredentials(self.api_key_header))?;

        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        query.push(format!(
            "timestamp={}",
            chrono::Utc::now().timestamp_millis()
        ));
        let query = query.join("&");
        let signature = Self::sign(&creds.api_secret, &query)?;

        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, endpoint, query, signature
        );
        let res = self
            .client
            .request(method, &url)
            .header(self.api_key_header, &creds.api_key)
            .send()
            .await
            .map_err(AggregatorError::api)?;
        Self::decode(res).await
    }

    /// API-key-only request (no signature). Binance listen-key management
    /// authenticates this way.
    pub async fn call_with_key<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, AggregatorError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(AggregatorError::MissingCredentials(self.api_key_header))?;
        let url = format!("{}{}", self.base_url, endpoint);
        let res = self
            .client
            .request(method, &url)
            .query(params)
            .header(self.api_key_header, &creds.api_key)
            .send()
            .await
            .map_err(AggregatorError::api)?;
        Self::decode(res).await
    }

    fn sign(secret: &str, payload: &str) -> Result<String, AggregatorError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AggregatorError::ApiError(format!("bad secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, AggregatorError> {
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AggregatorError::ApiError(format!("{status}: {body}")));
        }
        res.json::<T>().await.map_err(AggregatorError::api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        // Example vector from the Binance REST docs.
        let sig = RestClient::sign(
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559",
        )
        .unwrap();
        assert_eq!(
            sig,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }
}
