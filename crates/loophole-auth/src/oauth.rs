//! OAuth 2.0 device-authorization grant against the hosted tenant.

use serde::Deserialize;
use tracing::debug;

use crate::store::{AuthError, TokenPair};

pub(crate) const DEVICE_CODE_URL: &str = "https://owlsome.eu.auth0.com/oauth/device/code";
pub(crate) const TOKEN_URL: &str = "https://owlsome.eu.auth0.com/oauth/token";
pub(crate) const CLIENT_ID: &str = "R569dcCOUErjw1xVZOzqc7OUCiGTYNqN";
const SCOPE: &str = "openid offline_access";
const AUDIENCE: &str = "https://api.loophole.cloud";

/// Device-code grant returned when a login is initiated.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeGrant {
    pub device_code: String,
    pub user_code: String,
    pub expires_in: u64,
    pub interval: u64,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: String,
}

/// Error document the authorization server attaches to 4xx responses.
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}

/// Start the device-authorization flow and print the login instructions.
pub async fn register_device() -> Result<DeviceCodeGrant, AuthError> {
    register_device_at(DEVICE_CODE_URL).await
}

pub(crate) async fn register_device_at(device_code_url: &str) -> Result<DeviceCodeGrant, AuthError> {
    let client = reqwest::Client::new();
    let response = client
        .post(device_code_url)
        .form(&[
            ("client_id", CLIENT_ID),
            ("scope", SCOPE),
            ("audience", AUDIENCE),
        ])
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AuthError::UnexpectedResponse(body));
    }

    let grant: DeviceCodeGrant = serde_json::from_str(&body)?;
    println!(
        "Please open {} and use {} code to log in",
        grant.verification_uri, grant.user_code
    );

    Ok(grant)
}

/// Poll the token endpoint until the user completes the login in a browser.
pub async fn poll_for_token(device_code: &str, interval: u64) -> Result<TokenPair, AuthError> {
    poll_for_token_at(TOKEN_URL, device_code, interval).await
}

pub(crate) async fn poll_for_token_at(
    token_url: &str,
    device_code: &str,
    interval: u64,
) -> Result<TokenPair, AuthError> {
    let polling_interval = std::time::Duration::from_secs(interval.max(1));
    debug!("Polling for token every {:?}", polling_interval);

    let client = reqwest::Client::new();

    loop {
        tokio::time::sleep(polling_interval).await;

        let response = client
            .post(token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device_code),
                ("client_id", CLIENT_ID),
            ])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                debug!("Token poll request failed: {}", err);
                continue;
            }
        };

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }

        if status.is_client_error() {
            let error: OAuthErrorBody = match serde_json::from_str(&body) {
                Ok(error) => error,
                Err(err) => {
                    debug!("Undecodable token poll response: {} ({})", body, err);
                    continue;
                }
            };
            debug!(
                "Token poll pending: {} ({})",
                error.error, error.error_description
            );
            match error.error.as_str() {
                "authorization_pending" | "slow_down" => continue,
                "expired_token" | "invalid_grand" | "invalid_grant" | "access_denied" => {
                    return Err(AuthError::ReinitializeLogin)
                }
                _ => return Err(AuthError::UnexpectedResponse(body)),
            }
        }

        return Err(AuthError::UnexpectedResponse(body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serves the given `(status_line, body)` responses to sequential
    /// connections; resolves to the raw requests it saw.
    async fn stub_server(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status_line, body) in responses {
                let (mut conn, _) = listener.accept().await.unwrap();

                let mut data = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = conn.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&chunk[..n]);
                    if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&data[..end]).to_lowercase();
                        let content_length = headers
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if data.len() >= end + 4 + content_length {
                            break;
                        }
                    }
                }
                requests.push(String::from_utf8_lossy(&data).to_string());

                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                conn.write_all(response.as_bytes()).await.unwrap();
                conn.shutdown().await.ok();
            }
            requests
        });

        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn device_registration_parses_the_grant() {
        let (url, served) = stub_server(vec![(
            "200 OK",
            r#"{"device_code":"dev-1","user_code":"ABCD-EFGH","expires_in":900,"interval":5,"verification_uri":"https://example.com/activate"}"#,
        )])
        .await;

        let grant = register_device_at(&url).await.unwrap();

        assert_eq!(grant.device_code, "dev-1");
        assert_eq!(grant.user_code, "ABCD-EFGH");
        assert_eq!(grant.expires_in, 900);
        assert_eq!(grant.interval, 5);
        assert_eq!(grant.verification_uri, "https://example.com/activate");

        let requests = served.await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].contains(&format!("client_id={}", CLIENT_ID)));
        assert!(requests[0].contains("scope="));
        assert!(requests[0].contains("audience="));
    }

    #[tokio::test]
    async fn device_registration_surfaces_server_errors() {
        let (url, served) = stub_server(vec![("500 Internal Server Error", "boom")]).await;

        let result = register_device_at(&url).await;
        served.await.unwrap();

        assert!(matches!(result, Err(AuthError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn polling_returns_the_token_pair() {
        let (url, served) = stub_server(vec![(
            "200 OK",
            r#"{"access_token":"access-1","refresh_token":"refresh-1","id_token":"id-1","token_type":"Bearer","expires_in":86400}"#,
        )])
        .await;

        let pair = poll_for_token_at(&url, "dev-1", 1).await.unwrap();

        assert_eq!(pair.access_token, "access-1");
        assert_eq!(pair.refresh_token, "refresh-1");
        assert_eq!(pair.token_type, "Bearer");

        let requests = served.await.unwrap();
        assert!(requests[0].contains("device_code=dev-1"));
        assert!(requests[0].contains("grant_type="));
    }

    #[tokio::test]
    async fn polling_continues_through_authorization_pending() {
        let (url, served) = stub_server(vec![
            (
                "403 Forbidden",
                r#"{"error":"authorization_pending","error_description":"user has not logged in yet"}"#,
            ),
            (
                "200 OK",
                r#"{"access_token":"access-1","token_type":"Bearer","expires_in":86400}"#,
            ),
        ])
        .await;

        let pair = poll_for_token_at(&url, "dev-1", 1).await.unwrap();

        assert_eq!(pair.access_token, "access-1");
        assert_eq!(served.await.unwrap().len(), 2, "polling kept going");
    }

    #[tokio::test]
    async fn polling_continues_through_slow_down() {
        let (url, served) = stub_server(vec![
            (
                "403 Forbidden",
                r#"{"error":"slow_down","error_description":"polling too fast"}"#,
            ),
            (
                "200 OK",
                r#"{"access_token":"access-1","token_type":"Bearer","expires_in":86400}"#,
            ),
        ])
        .await;

        let pair = poll_for_token_at(&url, "dev-1", 1).await.unwrap();

        assert_eq!(pair.access_token, "access-1");
        assert_eq!(served.await.unwrap().len(), 2, "polling kept going");
    }

    #[tokio::test]
    async fn polling_stops_on_terminal_errors() {
        for error in ["expired_token", "invalid_grand", "invalid_grant", "access_denied"] {
            let body = match error {
                "expired_token" => r#"{"error":"expired_token","error_description":"gone"}"#,
                "invalid_grand" => r#"{"error":"invalid_grand","error_description":"gone"}"#,
                "invalid_grant" => r#"{"error":"invalid_grant","error_description":"gone"}"#,
                _ => r#"{"error":"access_denied","error_description":"no"}"#,
            };
            let (url, served) = stub_server(vec![("403 Forbidden", body)]).await;

            let result = poll_for_token_at(&url, "dev-1", 1).await;
            served.await.unwrap();

            assert!(
                matches!(result, Err(AuthError::ReinitializeLogin)),
                "error token {} should abort the login",
                error
            );
        }
    }

    #[tokio::test]
    async fn polling_flags_unexpected_server_responses() {
        let (url, served) = stub_server(vec![("502 Bad Gateway", "upstream broke")]).await;

        let result = poll_for_token_at(&url, "dev-1", 1).await;
        served.await.unwrap();

        assert!(matches!(result, Err(AuthError::UnexpectedResponse(_))));
    }
}
