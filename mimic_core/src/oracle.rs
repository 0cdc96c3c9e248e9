use crate::config::OracleSettings;
use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Minimum spacing between two oracle requests that the remote service tolerates.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_ATTEMPTS: usize = 4;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(250);

/// Longest slice of an error body kept in an [`EndpointError`].
const ERROR_BODY_LIMIT: usize = 200;

/// Failure of a single request against the remote service. Every variant is
/// considered transient by [`OracleClient`].
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The body was not a JSON object carrying a string `result`.
    #[error("Unexpected response shape: {0}")]
    BadResponse(String),
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Oracle unavailable for {plaintext:?} after {attempts} attempts: {last_error}")]
    Unavailable {
        plaintext: String,
        attempts: usize,
        last_error: EndpointError,
    },

    #[error("No oracle endpoint configured")]
    NotConfigured,

    #[error("Cannot set up oracle client: {0}")]
    Setup(String),
}

/// Something that turns a plaintext into the remote service's raw token.
///
/// The table builder and the live verifier only depend on this trait, so tests
/// can substitute an in-process cipher for the network.
pub trait Oracle {
    /// Returns the raw url-safe base64 token produced for `plaintext`.
    fn call(&mut self, plaintext: &str) -> Result<String, OracleError>;
}

impl<O: Oracle + ?Sized> Oracle for &mut O {
    fn call(&mut self, plaintext: &str) -> Result<String, OracleError> {
        (**self).call(plaintext)
    }
}

/// One request against the remote service, without throttling or retries.
pub trait Endpoint {
    fn request(&mut self, plaintext: &str) -> Result<String, EndpointError>;
}

/// Extracts the token from a response body of the form `{"result": "<token>"}`.
/// Any other JSON shape, arrays included, is a [`EndpointError::BadResponse`].
pub fn parse_oracle_body(body: &str) -> Result<String, EndpointError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| EndpointError::BadResponse(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| EndpointError::BadResponse("body is not a JSON object".to_string()))?;
    let result = object
        .get("result")
        .and_then(Value::as_str)
        .ok_or_else(|| EndpointError::BadResponse("missing string `result`".to_string()))?;
    if result.is_empty() {
        return Err(EndpointError::BadResponse("empty result".to_string()));
    }
    Ok(result.to_string())
}

fn truncate_body(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

/// Issues `GET <url>?<query_param>=<plaintext>` and reads the JSON `result`.
/// Static `extra_query` pairs from the settings are sent ahead of the probe.
pub struct HttpEndpoint {
    client: HttpClient,
    url: String,
    query_param: String,
    extra_query: Vec<(String, String)>,
}

impl HttpEndpoint {
    pub fn new(
        url: impl Into<String>,
        query_param: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            query_param: query_param.into(),
            extra_query: Vec::new(),
        })
    }

    pub fn from_settings(settings: &OracleSettings) -> Result<Self, OracleError> {
        let url = settings.endpoint.as_deref().ok_or(OracleError::NotConfigured)?;
        let mut endpoint = Self::new(
            url,
            settings.query_param.as_str(),
            Duration::from_millis(settings.timeout_ms),
        )?;
        endpoint.extra_query = settings
            .extra_query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(endpoint)
    }
}

impl Endpoint for HttpEndpoint {
    fn request(&mut self, plaintext: &str) -> Result<String, EndpointError> {
        let mut query: Vec<(&str, &str)> = self
            .extra_query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.push((self.query_param.as_str(), plaintext));

        let response = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(EndpointError::Status {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }
        parse_oracle_body(&body)
    }
}

/// How often and how patiently a failed request is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Exponential backoff after the `attempt`-th failure (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE)
    }
}

/// Rate-limited, retrying wrapper around an [`Endpoint`].
///
/// Requests are issued strictly one at a time, at least `min_delay` apart,
/// measured from the end of the previous request. Transient failures are
/// retried with exponential backoff plus jitter; once `max_attempts` requests
/// have failed the call reports [`OracleError::Unavailable`].
pub struct OracleClient<E: Endpoint> {
    endpoint: E,
    min_delay: Duration,
    retry: RetryPolicy,
    last_request: Option<Instant>,
    requests: u64,
}

impl<E: Endpoint> OracleClient<E> {
    pub fn new(endpoint: E, min_delay: Duration, retry: RetryPolicy) -> Self {
        Self {
            endpoint,
            min_delay,
            retry,
            last_request: None,
            requests: 0,
        }
    }

    /// Total requests sent to the endpoint, retries included.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    fn throttle(&self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                sleep(self.min_delay - elapsed);
            }
        }
    }
}

impl OracleClient<HttpEndpoint> {
    pub fn from_settings(settings: &OracleSettings) -> Result<Self, OracleError> {
        let endpoint = HttpEndpoint::from_settings(settings)?;
        Ok(Self::new(
            endpoint,
            Duration::from_millis(settings.min_delay_ms),
            RetryPolicy::new(
                settings.max_attempts,
                Duration::from_millis(settings.retry_base_ms),
            ),
        ))
    }
}

impl<E: Endpoint> Oracle for OracleClient<E> {
    fn call(&mut self, plaintext: &str) -> Result<String, OracleError> {
        let mut attempt = 0usize;
        let mut rng = rand::rng();
        loop {
            self.throttle();
            let outcome = self.endpoint.request(plaintext);
            self.last_request = Some(Instant::now());
            self.requests += 1;
            match outcome {
                Ok(token) => {
                    debug!(plaintext, attempt = attempt + 1, "Oracle answered");
                    return Ok(token);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts() {
                        return Err(OracleError::Unavailable {
                            plaintext: plaintext.to_string(),
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                    let base_ms = self.retry.base_delay.as_millis() as u64;
                    let jitter = Duration::from_millis(rng.random_range(0..=base_ms));
                    let backoff = self.retry.delay_for_attempt(attempt) + jitter;
                    warn!(
                        plaintext,
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Oracle request failed, retrying"
                    );
                    sleep(backoff);
                }
            }
        }
    }
}
