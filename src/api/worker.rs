use super::signing::SigningIdentity;
use super::{map_ureq_error, ApiError, REQUEST_TIMEOUT_SECS};
use crate::job::model::{JobSnapshot, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Credential material for an existing environment user, fetched through the
/// signed protocol. Never partially populated; a rejected signature yields an
/// error instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialBundle {
    pub provider_id: String,
    pub principal: String,
    pub instance_url: String,
    pub access_token: String,
    #[serde(default)]
    pub environment_name: Option<String>,
}

/// Provider-issued fields reported back when a scratch environment has been
/// materialized, so the control plane can record the new environment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScratchCompletion {
    pub provider_id: String,
    pub principal: String,
    pub instance_url: String,
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
}

/// Job-scoped control-plane actions, authenticated by the per-job signing
/// identity on top of the bearer token. The trait is the seam the
/// orchestrator is tested through.
pub trait JobControlApi {
    /// Generates a fresh keypair, signs the job id, and registers the public
    /// half with the control plane. Fails without side effects if the job is
    /// gone or was already claimed.
    fn claim_job(&self, job_id: &str) -> Result<(SigningIdentity, JobSnapshot), ApiError>;

    /// Signed status/log update. Safe to call repeatedly; duplicate terminal
    /// reports are tolerated by the server and never retried by the client.
    fn report_status(
        &self,
        identity: &SigningIdentity,
        job_id: &str,
        status: JobStatus,
        log: &str,
        error: Option<&str>,
    ) -> Result<(), ApiError>;

    fn fetch_environment_credential(
        &self,
        identity: &SigningIdentity,
        job_id: &str,
        environment_user_id: &str,
    ) -> Result<CredentialBundle, ApiError>;

    fn complete_scratch_request(
        &self,
        identity: &SigningIdentity,
        request_id: &str,
        completion: &ScratchCompletion,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct WorkerApiClient {
    base_url: String,
    tenant: String,
    token: String,
    timeout: Duration,
}

impl WorkerApiClient {
    pub fn new(base_url: impl Into<String>, tenant: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tenant: tenant.into(),
            token: token.into(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/d2x/{}/{path}",
            self.base_url.trim_end_matches('/'),
            self.tenant
        )
    }

    /// Signs the canonical form of `fields` and posts them with the signature
    /// attached. The server strips `signature` and verifies against the
    /// public key registered at claim time.
    fn post_signed(
        &self,
        path: &str,
        resource: &str,
        identity: &SigningIdentity,
        fields: BTreeMap<String, Value>,
    ) -> Result<ureq::Response, ApiError> {
        let signature = identity.sign_payload(&fields)?;
        let mut body = serde_json::Map::new();
        for (key, value) in fields {
            body.insert(key, value);
        }
        body.insert("signature".to_string(), json!(signature));

        let url = self.endpoint(path);
        ureq::post(&url)
            .timeout(self.timeout)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(Value::Object(body))
            .map_err(|err| map_ureq_error(err, &url, resource))
    }
}

impl JobControlApi for WorkerApiClient {
    fn claim_job(&self, job_id: &str) -> Result<(SigningIdentity, JobSnapshot), ApiError> {
        let identity = SigningIdentity::generate()?;
        let url = self.endpoint(&format!("jobs/{job_id}/start"));
        let body = json!({
            "public_key": identity.public_key_base64(),
            "signature": identity.sign_bytes(job_id.as_bytes()),
        });
        let response = ureq::post(&url)
            .timeout(self.timeout)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(body)
            .map_err(|err| map_ureq_error(err, &url, &format!("job {job_id}")))?;
        let snapshot = response
            .into_json::<JobSnapshot>()
            .map_err(|err| ApiError::Decode {
                url,
                reason: err.to_string(),
            })?;
        Ok((identity, snapshot))
    }

    fn report_status(
        &self,
        identity: &SigningIdentity,
        job_id: &str,
        status: JobStatus,
        log: &str,
        error: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut fields = BTreeMap::new();
        fields.insert("job_id".to_string(), json!(job_id));
        fields.insert("status".to_string(), json!(status.as_str()));
        fields.insert("log".to_string(), json!(log));
        if let Some(error) = error {
            fields.insert("error".to_string(), json!(error));
        }
        self.post_signed(
            &format!("jobs/{job_id}/status"),
            &format!("job {job_id}"),
            identity,
            fields,
        )?;
        Ok(())
    }

    fn fetch_environment_credential(
        &self,
        identity: &SigningIdentity,
        job_id: &str,
        environment_user_id: &str,
    ) -> Result<CredentialBundle, ApiError> {
        let mut fields = BTreeMap::new();
        fields.insert("job_id".to_string(), json!(job_id));
        fields.insert("environment_user_id".to_string(), json!(environment_user_id));
        // Legacy path name; the control plane still calls these org credentials.
        let url_path = format!("jobs/{job_id}/org-credentials");
        let response = self.post_signed(
            &url_path,
            &format!("environment user {environment_user_id}"),
            identity,
            fields,
        )?;
        response
            .into_json::<CredentialBundle>()
            .map_err(|err| ApiError::Decode {
                url: self.endpoint(&url_path),
                reason: err.to_string(),
            })
    }

    fn complete_scratch_request(
        &self,
        identity: &SigningIdentity,
        request_id: &str,
        completion: &ScratchCompletion,
    ) -> Result<(), ApiError> {
        let mut fields = BTreeMap::new();
        fields.insert("request_id".to_string(), json!(request_id));
        fields.insert("provider_id".to_string(), json!(completion.provider_id));
        fields.insert("principal".to_string(), json!(completion.principal));
        fields.insert("instance_url".to_string(), json!(completion.instance_url));
        if let Some(principal_id) = &completion.principal_id {
            fields.insert("principal_id".to_string(), json!(principal_id));
        }
        if let Some(auth_url) = &completion.auth_url {
            fields.insert("auth_url".to_string(), json!(auth_url));
        }
        self.post_signed(
            &format!("scratch-create-requests/{request_id}/complete"),
            &format!("scratch request {request_id}"),
            identity,
            fields,
        )?;
        Ok(())
    }
}
