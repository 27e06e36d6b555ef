use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AuthError, AuthResult};

/// GET a URL and decode the body as JSON; non-2xx is an error.
pub type GetJsonClient = Arc<dyn Fn(&str) -> AuthResult<Value> + Send + Sync>;
/// GET a URL and report whether it answered with 2xx.
pub type ProbeClient = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// POST a JSON body; the decoded response body is returned whatever the status.
/// A body that is not JSON decodes to `Value::Null`.
pub type PostJsonClient = Arc<dyn Fn(&str, &Value) -> AuthResult<Value> + Send + Sync>;

const USER_AGENT: &str = "sbauth/0.1";

pub struct HttpClients {
    pub get_json: GetJsonClient,
    pub probe: ProbeClient,
    pub post_json: PostJsonClient,
}

impl HttpClients {
    pub fn with_timeout(timeout: Duration) -> AuthResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| AuthError::Http(format!("failed to build HTTP client: {}", err)))?;

        let get_client = client.clone();
        let probe_client = client.clone();
        Ok(Self {
            get_json: Arc::new(move |url| default_get_json(&get_client, url)),
            probe: Arc::new(move |url| default_probe(&probe_client, url)),
            post_json: Arc::new(move |url, body| default_post_json(&client, url, body)),
        })
    }
}

fn default_get_json(client: &reqwest::blocking::Client, url: &str) -> AuthResult<Value> {
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .map_err(|err| AuthError::Http(format!("GET {} failed: {}", url, err)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::Http(format!(
            "GET {} returned {}",
            url,
            status.as_u16()
        )));
    }
    response
        .json::<Value>()
        .map_err(|err| AuthError::Http(format!("GET {} returned invalid JSON: {}", url, err)))
}

fn default_probe(client: &reqwest::blocking::Client, url: &str) -> bool {
    match client.get(url).send() {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            tracing::debug!(url, error = %err, "liveness probe failed");
            false
        }
    }
}

fn default_post_json(
    client: &reqwest::blocking::Client,
    url: &str,
    body: &Value,
) -> AuthResult<Value> {
    let payload = serde_json::to_vec(body)
        .map_err(|err| AuthError::Http(format!("failed to encode request body: {}", err)))?;
    let response = client
        .post(url)
        .header("Content-Type", "application/json; charset=UTF-8")
        .header("Accept", "application/json")
        .body(payload)
        .send()
        .map_err(|err| AuthError::Http(format!("POST {} failed: {}", url, err)))?;
    let status = response.status();
    let text = response
        .text()
        .map_err(|err| AuthError::Http(format!("failed to read response from {}: {}", url, err)))?;
    tracing::debug!(url, status = status.as_u16(), "POST completed");

    Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::Null))
}
