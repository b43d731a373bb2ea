// Thin client for the Exotel voice REST API (connect / status / hangup).

use std::collections::HashMap;
use std::time::Duration;

pub mod models;

use reqwest::Client;
use thiserror::Error;

use crate::models::{CallEnvelope, CallResource};

#[derive(Debug, Error)]
pub enum ExotelError {
    #[error("request to Exotel failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Exotel returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse Exotel response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct ExotelOptions {
    pub account_sid: String,
    pub api_key: String,
    pub api_token: String,
    /// Regional API host, e.g. `api.exotel.com` or `api.in.exotel.com`.
    pub subdomain: String,
    /// The Exophone used as caller id for outbound legs.
    pub caller_id: String,
}

#[derive(Debug, Clone)]
pub struct ExotelService {
    options: ExotelOptions,
    client: Client,
}

/// Parameters for an outbound connect request.
#[derive(Debug, Clone)]
pub struct ConnectCallRequest {
    /// Destination number in E.164.
    pub to: String,
    /// Absolute URL Exotel will POST status callbacks to.
    pub status_callback: Option<String>,
    /// Flow/app URL that answers the call once connected.
    pub url: Option<String>,
    /// Opaque fields echoed back in callbacks (CustomField).
    pub custom_field: Option<String>,
}

impl ExotelService {
    pub fn new(options: ExotelOptions) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { options, client }
    }

    fn calls_url(&self, suffix: &str) -> String {
        format!(
            "https://{}/v1/Accounts/{}/Calls{}",
            self.options.subdomain, self.options.account_sid, suffix
        )
    }

    /// Initiate an outbound call. Returns the vendor call resource,
    /// whose `sid` is the handle for status fetches and hangups.
    pub async fn connect_call(&self, req: &ConnectCallRequest) -> Result<CallResource, ExotelError> {
        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("From", req.to.clone());
        form.insert("CallerId", self.options.caller_id.clone());
        if let Some(url) = &req.url {
            form.insert("Url", url.clone());
        }
        if let Some(cb) = &req.status_callback {
            form.insert("StatusCallback", cb.clone());
            form.insert("StatusCallbackEvents[0]", "terminal".to_string());
            form.insert("StatusCallbackContentType", "application/json".to_string());
        }
        if let Some(cf) = &req.custom_field {
            form.insert("CustomField", cf.clone());
        }

        let response = self
            .client
            .post(self.calls_url("/connect.json"))
            .basic_auth(&self.options.api_key, Some(&self.options.api_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExotelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let envelope = response
            .json::<CallEnvelope>()
            .await
            .map_err(|e| ExotelError::Parse(e.to_string()))?;
        Ok(envelope.call)
    }

    /// Fetch the current status of a call by vendor sid.
    pub async fn get_call(&self, sid: &str) -> Result<CallResource, ExotelError> {
        let response = self
            .client
            .get(self.calls_url(&format!("/{}.json", sid)))
            .basic_auth(&self.options.api_key, Some(&self.options.api_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExotelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let envelope = response
            .json::<CallEnvelope>()
            .await
            .map_err(|e| ExotelError::Parse(e.to_string()))?;
        Ok(envelope.call)
    }

    /// Terminate an in-progress call.
    pub async fn hangup_call(&self, sid: &str) -> Result<(), ExotelError> {
        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("Status", "completed".to_string());

        let response = self
            .client
            .post(self.calls_url(&format!("/{}.json", sid)))
            .basic_auth(&self.options.api_key, Some(&self.options.api_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExotelError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
