// Client for the Qingping open API. Two calls are needed per cycle: an
// OAuth2 client-credentials exchange for a bearer token, then a device list
// request authorised with that token. Each step is a single attempt; any
// failure is reported to the caller, which abandons the cycle.
use reqwest::{Client, Request, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::CloudConfig;
use crate::reading::{self, DeviceList, Readings};

const TOKEN_PATH: &str = "/oauth2/token";
const DEVICES_PATH: &str = "/v1/apis/devices";
const TOKEN_FORM: [(&str, &str); 2] = [
    ("grant_type", "client_credentials"),
    ("scope", "device_full_access"),
];

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("failed to build request: {0}")]
    Request(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("access token not found in response")]
    MissingToken,

    #[error("no devices returned")]
    NoDevices,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

/// Application credentials for the token exchange.
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"*******")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CloudClient {
    client: Client,
    token_uri: Url,
    devices_uri: Url,
    credentials: Credentials,
}

impl CloudClient {
    pub fn new(config: &CloudConfig, credentials: Credentials) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(CloudError::Request)?;

        Ok(Self {
            client,
            token_uri: with_path(&config.oauth_endpoint, TOKEN_PATH),
            devices_uri: with_path(&config.api_endpoint, DEVICES_PATH),
            credentials,
        })
    }

    /// Exchange the application credentials for a bearer token.
    pub async fn access_token(&self) -> Result<String, CloudError> {
        let req = self
            .client
            .post(self.token_uri.clone())
            .basic_auth(&self.credentials.key, Some(&self.credentials.secret))
            .form(&TOKEN_FORM)
            .build()
            .map_err(CloudError::Request)?;

        let res: TokenResponse = self.execute(req).await?;
        if res.access_token.is_empty() {
            return Err(CloudError::MissingToken);
        }

        Ok(res.access_token)
    }

    /// Fetch the latest reading of every device bound to the application.
    pub async fn devices(&self, access_token: &str) -> Result<Readings, CloudError> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        let mut uri = self.devices_uri.clone();
        uri.query_pairs_mut()
            .append_pair("timestamp", &timestamp.to_string());

        let req = self
            .client
            .get(uri)
            .bearer_auth(access_token)
            .build()
            .map_err(CloudError::Request)?;

        let list: DeviceList = self.execute(req).await?;
        if list.devices.is_empty() {
            return Err(CloudError::NoDevices);
        }

        Ok(reading::normalize(list))
    }

    async fn execute<T: DeserializeOwned>(&self, req: Request) -> Result<T, CloudError> {
        let method = req.method().clone();
        let path = req.url().path().to_owned();

        let res = self
            .client
            .execute(req)
            .await
            .map_err(CloudError::Transport)?;
        let status = res.status();
        let body = res.bytes().await.map_err(CloudError::Body)?;
        debug!(
            "{method} {path} replied {status}: {}",
            String::from_utf8_lossy(&body)
        );

        Ok(serde_json::from_slice(&body)?)
    }
}

fn with_path(base: &Url, path: &str) -> Url {
    let mut uri = base.clone();
    uri.set_path(path);
    uri.set_query(None);
    uri
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn test_client(server: &Server) -> CloudClient {
        let endpoint: Url = server.url().parse().unwrap();
        let config = CloudConfig {
            oauth_endpoint: endpoint.clone(),
            api_endpoint: endpoint,
            request_timeout: Duration::from_secs(5),
        };
        let credentials = Credentials {
            key: "key".to_string(),
            secret: "secret".to_string(),
        };
        CloudClient::new(&config, credentials).unwrap()
    }

    #[tokio::test]
    async fn test_access_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            // base64("key:secret")
            .match_header("authorization", "Basic a2V5OnNlY3JldA==")
            .match_header(
                "content-type",
                Matcher::Regex("application/x-www-form-urlencoded".to_string()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("scope".into(), "device_full_access".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "tok123", "expires_in": 7199, "token_type": "bearer"}"#)
            .create_async()
            .await;

        let token = test_client(&server).access_token().await.unwrap();

        assert_eq!(token, "tok123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_access_token_missing() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(r#"{"token_type": "bearer"}"#)
            .create_async()
            .await;

        let res = test_client(&server).access_token().await;
        assert!(matches!(res, Err(CloudError::MissingToken)), "{res:?}");
    }

    #[tokio::test]
    async fn test_access_token_empty() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(401)
            .with_body(r#"{"access_token": "", "error": "invalid_client"}"#)
            .create_async()
            .await;

        let res = test_client(&server).access_token().await;
        assert!(matches!(res, Err(CloudError::MissingToken)), "{res:?}");
    }

    #[tokio::test]
    async fn test_access_token_invalid_json() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(502)
            .with_body("<html>Bad Gateway</html>")
            .create_async()
            .await;

        let res = test_client(&server).access_token().await;
        assert!(matches!(res, Err(CloudError::Decode(_))), "{res:?}");
    }

    #[tokio::test]
    async fn test_access_token_unreachable() {
        // Nothing listens on the tcpmux port
        let endpoint: Url = "http://127.0.0.1:1".parse().unwrap();
        let config = CloudConfig {
            oauth_endpoint: endpoint.clone(),
            api_endpoint: endpoint,
            request_timeout: Duration::from_secs(2),
        };
        let credentials = Credentials {
            key: "key".to_string(),
            secret: "secret".to_string(),
        };
        let client = CloudClient::new(&config, credentials).unwrap();

        let res = client.access_token().await;
        assert!(matches!(res, Err(CloudError::Transport(_))), "{res:?}");
    }

    #[tokio::test]
    async fn test_devices() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/apis/devices")
            .match_header("authorization", "Bearer tok123")
            .match_query(Matcher::Regex(r"^timestamp=\d+$".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"total": 2, "devices": [
                    {"info": {"mac": "AA:BB"}, "data": {"battery": {"value": 87.5}, "co2": {"value": 640}}},
                    {"info": {"mac": "CC:DD"}, "data": {"battery": {"value": 12}, "co2": {"value": 410}}}
                ]}"#,
            )
            .create_async()
            .await;

        let readings = test_client(&server).devices("tok123").await.unwrap();

        assert_eq!(readings.len(), 2);
        assert_eq!(readings["AA:BB"].battery, 87.5);
        assert_eq!(readings["AA:BB"].co2, 640.0);
        assert_eq!(readings["CC:DD"].battery, 12.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_devices_empty() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/apis/devices")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"total": 0, "devices": []}"#)
            .create_async()
            .await;

        let res = test_client(&server).devices("tok123").await;
        assert!(matches!(res, Err(CloudError::NoDevices)), "{res:?}");
    }

    #[tokio::test]
    async fn test_devices_absent() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/apis/devices")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"code": 401, "message": "unauthorized"}"#)
            .create_async()
            .await;

        let res = test_client(&server).devices("expired").await;
        assert!(matches!(res, Err(CloudError::NoDevices)), "{res:?}");
    }

    #[test]
    fn test_with_path_replaces_path_and_query() {
        let base: Url = "https://apis.cleargrass.com/ignored?x=1".parse().unwrap();
        assert_eq!(
            with_path(&base, DEVICES_PATH).as_str(),
            "https://apis.cleargrass.com/v1/apis/devices"
        );
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let credentials = Credentials {
            key: "key".to_string(),
            secret: "secret".to_string(),
        };
        let out = format!("{credentials:?}");
        assert!(out.contains("key"));
        assert!(!out.contains("\"secret\""));
    }
}
