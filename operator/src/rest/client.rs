use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::Client;
use serde_json::{Value, json};

use crate::util::Error;

/// FQNs carry slashes, so every name that lands in a path segment gets
/// escaped.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn encode_segment(name: &str) -> String {
    utf8_percent_encode(name, SEGMENT).to_string()
}

/// What the proxy said. Transport failures surface as `Error::Http`
/// instead, which the caller treats as transient.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Ok,
    Rejected { status: u16, content: String },
}

/// Thin client for one proxy instance's admin API at
/// `http://<podIP>:<port>/api/v1`.
pub struct AdminApi {
    http: Client,
    base: String,
}

impl AdminApi {
    pub fn new(http: Client, pod_ip: &str, port: u16) -> Self {
        AdminApi {
            http,
            base: format!("http://{pod_ip}:{port}/api/v1"),
        }
    }

    pub async fn add_listener(&self, listener: Value) -> Result<ApiOutcome, Error> {
        self.post("listeners".into(), json!({"listener": listener}))
            .await
    }

    pub async fn delete_listener(&self, name: &str) -> Result<ApiOutcome, Error> {
        self.delete(format!("listeners/{}", encode_segment(name)), true)
            .await
    }

    pub async fn add_cluster(&self, cluster: Value) -> Result<ApiOutcome, Error> {
        self.post("clusters".into(), json!({"cluster": cluster}))
            .await
    }

    pub async fn delete_cluster(&self, name: &str) -> Result<ApiOutcome, Error> {
        self.delete(format!("clusters/{}", encode_segment(name)), true)
            .await
    }

    pub async fn add_endpoint(&self, cluster: &str, endpoint: Value) -> Result<ApiOutcome, Error> {
        self.post(
            format!("clusters/{}/endpoints", encode_segment(cluster)),
            json!({"endpoint": endpoint}),
        )
        .await
    }

    pub async fn delete_endpoint(&self, cluster: &str, name: &str) -> Result<ApiOutcome, Error> {
        self.delete(
            format!(
                "clusters/{}/endpoints/{}",
                encode_segment(cluster),
                encode_segment(name)
            ),
            false,
        )
        .await
    }

    pub async fn add_rule(
        &self,
        rulelist: &str,
        position: u64,
        rule: Value,
    ) -> Result<ApiOutcome, Error> {
        self.post(
            format!("rulelists/{}/rules/{position}", encode_segment(rulelist)),
            json!({"rule": rule}),
        )
        .await
    }

    pub async fn delete_rule_from_rulelist(
        &self,
        rulelist: &str,
        name: &str,
    ) -> Result<ApiOutcome, Error> {
        self.delete(
            format!(
                "rulelists/{}/rules/{}",
                encode_segment(rulelist),
                encode_segment(name)
            ),
            true,
        )
        .await
    }

    pub async fn delete_rule(&self, name: &str) -> Result<ApiOutcome, Error> {
        self.delete(format!("rules/{}", encode_segment(name)), false)
            .await
    }

    async fn post(&self, path: String, body: Value) -> Result<ApiOutcome, Error> {
        let response = self
            .http
            .post(format!("{}/{path}", self.base))
            .json(&body)
            .send()
            .await?;
        Self::outcome(response).await
    }

    async fn delete(&self, path: String, recursive: bool) -> Result<ApiOutcome, Error> {
        let mut request = self.http.delete(format!("{}/{path}", self.base));
        if recursive {
            request = request.query(&[("recursive", "true")]);
        }
        Self::outcome(request.send().await?).await
    }

    async fn outcome(response: reqwest::Response) -> Result<ApiOutcome, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(ApiOutcome::Ok);
        }
        // Rejections carry a JSON body with a `content` message.
        let body = response.text().await.unwrap_or_default();
        let content = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("content").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or(body);
        Ok(ApiOutcome::Rejected {
            status: status.as_u16(),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqns_survive_path_embedding() {
        assert_eq!(
            encode_segment("/l7mp.io/v1/Target/default/t"),
            "%2Fl7mp.io%2Fv1%2FTarget%2Fdefault%2Ft"
        );
        assert_eq!(encode_segment("plain-name"), "plain-name");
    }
}
