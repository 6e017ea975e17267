use crate::error::SwarmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// JSON returned by the dispatcher for one completed shard, per §3.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ShardResult {
    pub config_instance_index: u32,
    pub machine_id: String,
    pub machine_tag: String,
    pub exit_codes: String,
    #[serde(default)]
    pub output: String,
}

impl ShardResult {
    /// `max(int(x) for x in exit_codes.split(','))`, per §4.2.5.
    pub fn max_exit_code(&self) -> i32 {
        self.exit_codes
            .split(',')
            .filter_map(|s| s.trim().parse::<i32>().ok())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct BotInfo {
    pub tag: String,
    pub last_seen: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BotsResponse {
    pub machine_death_timeout: u64,
    pub machines: Vec<BotInfo>,
}

/// Talks the four dispatcher HTTP endpoints from §6. Takes a pre-built
/// `reqwest::Client` so the caller can attach auth headers before handing it
/// over — this crate never manages credentials itself.
pub struct Dispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// `POST <base>/test` with `request=<manifest_json>` form-encoded.
    pub async fn submit_task(&self, manifest_json: &str) -> Result<serde_json::Value, SwarmError> {
        let response = self
            .client
            .post(self.url("test"))
            .form(&[("request", manifest_json)])
            .send()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        if !status.is_success() {
            return Err(SwarmError::ServerReject {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|_| SwarmError::ServerReject {
            status: status.as_u16(),
            body: "response body did not parse as JSON".to_string(),
        })
    }

    /// `GET <base>/get_matching_test_cases?name=<task_name>`. A literal
    /// "No matching" substring means the task isn't registered yet; the
    /// caller is expected to retry with the standard backoff.
    pub async fn get_matching_test_cases(&self, task_name: &str) -> Result<Option<Vec<String>>, SwarmError> {
        let response = self
            .client
            .get(self.url("get_matching_test_cases"))
            .query(&[("name", task_name)])
            .send()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        if body.contains("No matching") {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SwarmError::ServerReject {
                status: status.as_u16(),
                body,
            });
        }

        let keys: Vec<String> = serde_json::from_str(&body).map_err(|_| SwarmError::ServerReject {
            status: status.as_u16(),
            body: "response body did not parse as a JSON array".to_string(),
        })?;
        Ok(Some(keys))
    }

    /// `GET <base>/get_result?r=<task_key>`. HTTP 4xx other than 404 is
    /// fatal for the shard; 404 and transport errors are retryable by the
    /// caller.
    pub async fn get_result(&self, task_key: &str) -> Result<ShardResult, SwarmError> {
        let response = self
            .client
            .get(self.url("get_result"))
            .query(&[("r", task_key)])
            .send()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SwarmError::TransientNetwork(format!("result not yet available for {task_key}")));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SwarmError::ServerReject {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            return Err(SwarmError::TransientNetwork(format!("server error {status} for {task_key}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;
        serde_json::from_str(&body).map_err(|_| SwarmError::TransientNetwork(format!(
            "non-JSON body for {task_key}"
        )))
    }

    /// `GET <base>/swarming/api/v1/bots`, consumed by the `query` command.
    pub async fn query_bots(&self) -> Result<BotsResponse, SwarmError> {
        let response = self
            .client
            .get(self.url("swarming/api/v1/bots"))
            .send()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        if !status.is_success() {
            return Err(SwarmError::ServerReject {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|_| SwarmError::ServerReject {
            status: status.as_u16(),
            body: "bots response did not parse".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn submit_task_returns_parsed_json_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"task_keys":["k1"]}"#))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let response = dispatcher.submit_task(r#"{"task_name":"t"}"#).await.unwrap();
        assert_eq!(response["task_keys"][0], "k1");
    }

    #[tokio::test]
    async fn submit_task_fails_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/test"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let result = dispatcher.submit_task("{}").await;
        assert!(matches!(result, Err(SwarmError::ServerReject { status: 500, .. })));
    }

    #[tokio::test]
    async fn get_matching_test_cases_returns_none_when_not_registered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_matching_test_cases"))
            .respond_with(ResponseTemplate::new(200).set_body_string("No matching cases found"))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let result = dispatcher.get_matching_test_cases("mytask").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_matching_test_cases_returns_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_matching_test_cases"))
            .and(query_param("name", "mytask"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"["k1","k2"]"#))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let keys = dispatcher.get_matching_test_cases("mytask").await.unwrap().unwrap();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn get_result_parses_shard_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_result"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"config_instance_index":0,"machine_id":"m1","machine_tag":"bot1","exit_codes":"0","output":"hello\n"}"#,
            ))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let result = dispatcher.get_result("key1").await.unwrap();
        assert_eq!(result.config_instance_index, 0);
        assert_eq!(result.max_exit_code(), 0);
    }

    #[tokio::test]
    async fn get_result_404_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_result"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let result = dispatcher.get_result("key1").await;
        assert!(matches!(result, Err(SwarmError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn get_result_4xx_other_than_404_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_result"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), server.uri());
        let result = dispatcher.get_result("key1").await;
        assert!(matches!(result, Err(SwarmError::ServerReject { status: 403, .. })));
    }

    #[test]
    fn max_exit_code_picks_largest_of_comma_separated_list() {
        let result = ShardResult {
            config_instance_index: 0,
            machine_id: "m".to_string(),
            machine_tag: "t".to_string(),
            exit_codes: "0,2,1".to_string(),
            output: String::new(),
        };
        assert_eq!(result.max_exit_code(), 2);
    }
}
