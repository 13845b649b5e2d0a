//! Declarative request scripts.
//!
//! A `[script]` section lists the requests every iteration issues, so a
//! load test can run from a config file alone:
//!
//! ```toml
//! [script]
//! base_url = "https://test.k6.io"
//! think_time = "1s"
//!
//! [[script.request]]
//! name = "login"
//! method = "POST"
//! url = "/auth/token/login/"
//! json = { username = "admin", password = "123" }
//! expect_status = 200
//!
//! [[script.request]]
//! url = "/my/crocodiles/"
//! ```
//!
//! Requests run in order, or all at once with `batch = true`. A request
//! with `expect_status` records a check named `"<name> status is <code>"`.

use async_trait::async_trait;
use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{HttpError, IterationError, LoadTestError};
use crate::http::{HttpRequest, HttpResponse};
use crate::vu::{Iteration, VuContext};

fn default_method() -> String {
    "GET".to_string()
}

/// The `[script]` config section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    /// Prefix for request URLs that start with `/`.
    #[serde(default, alias = "baseUrl", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Issue every request concurrently instead of in order.
    #[serde(default)]
    pub batch: bool,
    /// Pause at the end of each iteration.
    #[serde(
        default,
        with = "crate::durations::option",
        alias = "thinkTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub think_time: Option<Duration>,
    /// Per-request timeout; the client default applies when unset.
    #[serde(
        default,
        with = "crate::durations::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(rename = "request", alias = "requests")]
    pub requests: Vec<RequestStep>,
}

/// One `[[script.request]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RequestStep {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    /// Used as the `name` tag and in check names. Defaults to the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Raw request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// JSON request body; sets `Content-Type: application/json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    #[serde(default, alias = "expectStatus", skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<u16>,
}

impl ScriptConfig {
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.requests.is_empty() {
            return Err(LoadTestError::validation(
                "[script] must contain at least one [[script.request]]",
            ));
        }
        for (i, step) in self.requests.iter().enumerate() {
            step.method(i)?;
            if step.url.trim().is_empty() {
                return Err(LoadTestError::validation(format!(
                    "Script request {} has an empty url",
                    i + 1
                )));
            }
            if step.body.is_some() && step.json.is_some() {
                return Err(LoadTestError::validation(format!(
                    "Script request {} sets both `body` and `json`",
                    i + 1
                )));
            }
        }
        Ok(())
    }
}

impl RequestStep {
    fn method(&self, index: usize) -> Result<Method, LoadTestError> {
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            LoadTestError::validation(format!(
                "Script request {} has an invalid method '{}'",
                index + 1,
                self.method
            ))
        })
    }
}

/// A validated script with its requests prebuilt.
#[derive(Debug, Clone)]
pub struct HttpScript {
    steps: Vec<(HttpRequest, Option<u16>)>,
    batch: bool,
    think_time: Option<Duration>,
}

impl HttpScript {
    pub fn new(config: &ScriptConfig) -> Result<Self, LoadTestError> {
        config.validate()?;
        let steps = config
            .requests
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let url = match (&config.base_url, step.url.starts_with('/')) {
                    (Some(base), true) => format!("{}{}", base.trim_end_matches('/'), step.url),
                    _ => step.url.clone(),
                };
                let mut request = HttpRequest::new(step.method(i)?, url);
                for (name, value) in &step.headers {
                    request = request.header(name, value);
                }
                if let Some(json) = &step.json {
                    request = request
                        .json(json)
                        .map_err(|e| LoadTestError::validation(format!("Script request {}: {e}", i + 1)))?;
                }
                if let Some(body) = &step.body {
                    request = request.body(body.clone());
                }
                if let Some(timeout) = config.timeout {
                    request = request.timeout(timeout);
                }
                if let Some(name) = &step.name {
                    request = request.name(name);
                }
                Ok((request, step.expect_status))
            })
            .collect::<Result<Vec<_>, LoadTestError>>()?;
        Ok(Self {
            steps,
            batch: config.batch,
            think_time: config.think_time,
        })
    }

    fn check_status(
        vu: &VuContext,
        request: &HttpRequest,
        expected: Option<u16>,
        result: &Result<HttpResponse, HttpError>,
    ) {
        if let Some(expected) = expected {
            let status = result.as_ref().map(|r| r.status).ok();
            vu.check(
                &format!("{} status is {expected}", request.tag_name()),
                status == Some(expected),
            );
        }
    }
}

#[async_trait]
impl Iteration for HttpScript {
    async fn run(&self, vu: VuContext) -> Result<(), IterationError> {
        if self.batch {
            let requests = self.steps.iter().map(|(r, _)| r.clone()).collect();
            let results = vu.batch(requests).await;
            for ((request, expected), result) in self.steps.iter().zip(&results) {
                Self::check_status(&vu, request, *expected, result);
            }
        } else {
            for (request, expected) in &self.steps {
                let result = vu.request(request.clone()).await;
                Self::check_status(&vu, request, *expected, &result);
            }
        }
        if let Some(think_time) = self.think_time {
            vu.sleep(think_time).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RunClock;
    use crate::http::{HttpClient, Timings};
    use crate::metrics::{names, MetricsRegistry};
    use crate::vu::MetricsSink;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Method, String, Option<Bytes>)>>,
    }

    #[async_trait]
    impl HttpClient for Recorder {
        async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let status = if request.url.ends_with("/login/") { 200 } else { 403 };
            self.seen
                .lock()
                .push((request.method.clone(), request.url.clone(), request.body.clone()));
            Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: Bytes::new(),
                timings: Timings::default(),
            })
        }
    }

    fn parse(toml_str: &str) -> ScriptConfig {
        #[derive(Deserialize)]
        struct Wrapper {
            script: ScriptConfig,
        }
        toml::from_str::<Wrapper>(toml_str).unwrap().script
    }

    const LOGIN_FLOW: &str = r#"
[script]
base_url = "https://test.k6.io/"

[[script.request]]
name = "login"
method = "post"
url = "/auth/token/login/"
json = { username = "admin" }
expect_status = 200

[[script.request]]
url = "/my/crocodiles/"
expect_status = 200
"#;

    #[tokio::test]
    async fn test_script_runs_steps_in_order_and_records_checks() {
        let script = HttpScript::new(&parse(LOGIN_FLOW)).unwrap();
        let client = Arc::new(Recorder::default());
        let registry = Arc::new(MetricsRegistry::new());
        let sink = MetricsSink::new(Arc::clone(&registry), RunClock::start(), Default::default());
        let vu = VuContext::new(1, 0, Arc::from("default"), client.clone(), sink, None);

        script.run(vu).await.unwrap();

        let seen = client.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, Method::POST);
        assert_eq!(seen[0].1, "https://test.k6.io/auth/token/login/");
        assert_eq!(seen[0].2.as_deref(), Some(br#"{"username":"admin"}"#.as_slice()));
        assert_eq!(seen[1].1, "https://test.k6.io/my/crocodiles/");

        let checks = registry.checks();
        assert_eq!(checks.len(), 2);
        let login = checks.iter().find(|c| c.name == "login status is 200").unwrap();
        assert_eq!(login.passes, 1);
        let crocs = checks
            .iter()
            .find(|c| c.name == "https://test.k6.io/my/crocodiles/ status is 200")
            .unwrap();
        assert_eq!(crocs.fails, 1);
        assert_eq!(registry.snapshot(names::HTTP_REQS).unwrap().sum(), 2.0);
    }

    #[test]
    fn test_invalid_scripts_are_rejected() {
        let empty = parse("[script]\nrequest = []\n");
        assert!(matches!(
            empty.validate(),
            Err(LoadTestError::ConfigValidation { .. })
        ));

        let bad_method = parse("[script]\n[[script.request]]\nmethod = \"GE T\"\nurl = \"/\"\n");
        assert!(bad_method.validate().is_err());

        let both = parse("[script]\n[[script.request]]\nurl = \"/\"\nbody = \"x\"\njson = { a = 1 }\n");
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_unknown_script_key_is_rejected() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Wrapper {
            script: ScriptConfig,
        }
        let result = toml::from_str::<Wrapper>("[script]\n[[script.request]]\nurl = \"/\"\nretries = 3\n");
        assert!(result.is_err());
    }
}
