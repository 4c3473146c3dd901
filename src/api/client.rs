use super::{map_ureq_error, ApiError, REQUEST_TIMEOUT_SECS};
use serde_json::Value;
use std::time::Duration;

/// Plain bearer-authenticated CRUD against control-plane collections. Used by
/// the thin CLI surface (`job create`, `job list`, `job steps`); job-scoped
/// worker actions go through the signed protocol in [`super::worker`] instead.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    tenant: String,
    token: String,
    timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, tenant: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tenant: tenant.into(),
            token: token.into(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/d2x/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.tenant,
            collection
        )
    }

    pub fn list(&self, collection: &str, query: &[(&str, String)]) -> Result<Vec<Value>, ApiError> {
        let mut url = self.collection_url(collection);
        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{encoded}");
        }

        let response = ureq::get(&url)
            .timeout(self.timeout)
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(|err| map_ureq_error(err, &url, collection))?;
        response.into_json::<Vec<Value>>().map_err(|err| ApiError::Decode {
            url,
            reason: err.to_string(),
        })
    }

    pub fn read(&self, collection: &str, id: &str) -> Result<Value, ApiError> {
        let url = format!("{}/{id}", self.collection_url(collection));
        let response = ureq::get(&url)
            .timeout(self.timeout)
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(|err| map_ureq_error(err, &url, &format!("{collection} {id}")))?;
        response.into_json::<Value>().map_err(|err| ApiError::Decode {
            url,
            reason: err.to_string(),
        })
    }

    pub fn create(&self, collection: &str, body: &Value) -> Result<Value, ApiError> {
        let url = self.collection_url(collection);
        let response = ureq::post(&url)
            .timeout(self.timeout)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(body.clone())
            .map_err(|err| map_ureq_error(err, &url, collection))?;
        response.into_json::<Value>().map_err(|err| ApiError::Decode {
            url,
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_urls_are_tenant_scoped() {
        let client = ControlPlaneClient::new("https://cloud.example.com/", "acme", "tok");
        assert_eq!(
            client.collection_url("jobs"),
            "https://cloud.example.com/d2x/acme/jobs"
        );
    }
}
