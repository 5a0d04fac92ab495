/// Hetzner Cloud API client
use anyhow::{Context, Result};
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::models::*;
use crate::error::{permanent, retryable, transient};
use crate::utils::limiter::{RateLimiter, DEFAULT_CLOUD_RPS};
use crate::utils::retry::Backoff;

const HCLOUD_API_BASE: &str = "https://api.hetzner.cloud/v1";

/// Action polling budgets per resource kind.
pub const ACTION_BUDGET_SERVER: Duration = Duration::from_secs(600);
pub const ACTION_BUDGET_LOAD_BALANCER: Duration = Duration::from_secs(300);
pub const ACTION_BUDGET_DEFAULT: Duration = Duration::from_secs(120);

/// Main Hetzner Cloud API client. All requests pass through a token bucket
/// and transient failures are retried with jittered backoff.
#[derive(Clone)]
pub struct HetznerCloudClient {
    client: Client,
    limiter: RateLimiter,
    backoff: Backoff,
}

impl HetznerCloudClient {
    /// Create a new Hetzner Cloud API client
    pub fn new(api_token: String) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", api_token))
                .context("Invalid API token format")?,
        );
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            limiter: RateLimiter::new(DEFAULT_CLOUD_RPS),
            backoff: Backoff::default(),
        })
    }

    /// Make a GET request to the API
    pub(crate) async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        self.request(Method::GET, endpoint, None::<&()>).await
    }

    /// Make a POST request to the API
    pub(crate) async fn post<T: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        self.request(Method::POST, endpoint, Some(body)).await
    }

    /// Make a DELETE request to the API. A 404 is treated as success so
    /// deletes stay idempotent.
    pub(crate) async fn delete(&self, endpoint: &str) -> Result<()> {
        let url = format!("{}/{}", HCLOUD_API_BASE, endpoint);

        for attempt in 0.. {
            self.limiter.acquire().await;
            debug!("DELETE {}", url);

            let response = self.client.delete(&url).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(()),
                Ok(resp) if is_retryable_status(resp.status()) => {
                    if !self.backoff.should_retry(attempt) {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(transient(format!(
                            "DELETE {} failed with {}: {}",
                            endpoint, status, body
                        )));
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(api_error(status, &body))
                        .with_context(|| format!("DELETE {}", endpoint));
                }
                Err(e) => {
                    if !self.backoff.should_retry(attempt) {
                        return Err(transient(format!("DELETE {} failed: {}", endpoint, e)));
                    }
                }
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!("Retrying DELETE {} in {:?}", endpoint, delay);
            tokio::time::sleep(delay).await;
        }
        unreachable!()
    }

    async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<R> {
        let url = format!("{}/{}", HCLOUD_API_BASE, endpoint);

        for attempt in 0.. {
            self.limiter.acquire().await;
            debug!("{} {}", method, url);

            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<R>()
                        .await
                        .context("Failed to parse API response");
                }
                Ok(resp) if is_retryable_status(resp.status()) => {
                    let status = resp.status();
                    if !self.backoff.should_retry(attempt) {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(transient(format!(
                            "{} {} failed with {}: {}",
                            method, endpoint, status, body
                        )));
                    }
                    debug!("{} {} returned {}, will retry", method, endpoint, status);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(api_error(status, &body))
                        .with_context(|| format!("{} {}", method, endpoint));
                }
                Err(e) => {
                    if !self.backoff.should_retry(attempt) {
                        return Err(transient(format!(
                            "{} {} failed: {}",
                            method, endpoint, e
                        )));
                    }
                }
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;
        }
        unreachable!()
    }

    // Servers

    /// List servers matching a label selector
    pub async fn list_servers(&self, label_selector: &str) -> Result<Vec<Server>> {
        let response: ServerListResponse = self
            .get(&format!(
                "servers?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.servers)
    }

    /// Get server by ID
    pub async fn get_server(&self, server_id: u64) -> Result<Server> {
        #[derive(serde::Deserialize)]
        struct Response {
            server: Server,
        }
        let response: Response = self.get(&format!("servers/{}", server_id)).await?;
        Ok(response.server)
    }

    /// Create a new server
    pub async fn create_server(
        &self,
        request: CreateServerRequest,
    ) -> Result<CreateServerResponse> {
        self.post("servers", &request).await
    }

    /// Delete a server
    pub async fn delete_server(&self, server_id: u64) -> Result<()> {
        self.delete(&format!("servers/{}", server_id)).await
    }

    // Networks

    pub async fn list_networks(&self, label_selector: &str) -> Result<Vec<Network>> {
        let response: NetworkListResponse = self
            .get(&format!(
                "networks?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.networks)
    }

    pub async fn create_network(&self, request: CreateNetworkRequest) -> Result<Network> {
        let response: CreateNetworkResponse = self.post("networks", &request).await?;
        Ok(response.network)
    }

    pub async fn delete_network(&self, network_id: u64) -> Result<()> {
        self.delete(&format!("networks/{}", network_id)).await
    }

    // Firewalls

    pub async fn list_firewalls(&self, label_selector: &str) -> Result<Vec<Firewall>> {
        let response: FirewallListResponse = self
            .get(&format!(
                "firewalls?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.firewalls)
    }

    pub async fn create_firewall<T: Serialize>(&self, request: &T) -> Result<Firewall> {
        let response: CreateFirewallResponse = self.post("firewalls", request).await?;
        Ok(response.firewall)
    }

    pub async fn delete_firewall(&self, firewall_id: u64) -> Result<()> {
        self.delete(&format!("firewalls/{}", firewall_id)).await
    }

    // Load balancers

    pub async fn list_load_balancers(&self, label_selector: &str) -> Result<Vec<LoadBalancer>> {
        let response: LoadBalancerListResponse = self
            .get(&format!(
                "load_balancers?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.load_balancers)
    }

    pub async fn create_load_balancer<T: Serialize>(
        &self,
        request: &T,
    ) -> Result<CreateLoadBalancerResponse> {
        self.post("load_balancers", request).await
    }

    pub async fn delete_load_balancer(&self, lb_id: u64) -> Result<()> {
        self.delete(&format!("load_balancers/{}", lb_id)).await
    }

    // Placement groups

    pub async fn list_placement_groups(&self, label_selector: &str) -> Result<Vec<PlacementGroup>> {
        let response: PlacementGroupListResponse = self
            .get(&format!(
                "placement_groups?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.placement_groups)
    }

    pub async fn create_placement_group<T: Serialize>(&self, request: &T) -> Result<PlacementGroup> {
        let response: CreatePlacementGroupResponse = self.post("placement_groups", request).await?;
        Ok(response.placement_group)
    }

    pub async fn delete_placement_group(&self, pg_id: u64) -> Result<()> {
        self.delete(&format!("placement_groups/{}", pg_id)).await
    }

    // SSH keys

    pub async fn list_ssh_keys(&self, label_selector: &str) -> Result<Vec<SSHKey>> {
        let response: SSHKeyListResponse = self
            .get(&format!(
                "ssh_keys?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.ssh_keys)
    }

    pub async fn create_ssh_key<T: Serialize>(&self, request: &T) -> Result<SSHKey> {
        let response: CreateSSHKeyResponse = self.post("ssh_keys", request).await?;
        Ok(response.ssh_key)
    }

    pub async fn delete_ssh_key(&self, key_id: u64) -> Result<()> {
        self.delete(&format!("ssh_keys/{}", key_id)).await
    }

    // Certificates

    pub async fn list_certificates(&self, label_selector: &str) -> Result<Vec<Certificate>> {
        let response: CertificateListResponse = self
            .get(&format!(
                "certificates?label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.certificates)
    }

    pub async fn create_certificate<T: Serialize>(&self, request: &T) -> Result<Certificate> {
        let response: CreateCertificateResponse = self.post("certificates", request).await?;
        Ok(response.certificate)
    }

    pub async fn delete_certificate(&self, cert_id: u64) -> Result<()> {
        self.delete(&format!("certificates/{}", cert_id)).await
    }

    // Images / snapshots

    pub async fn list_snapshots(&self, label_selector: &str) -> Result<Vec<Image>> {
        let response: ImageListResponse = self
            .get(&format!(
                "images?type=snapshot&label_selector={}&per_page=50",
                urlencode(label_selector)
            ))
            .await?;
        Ok(response.images)
    }

    pub async fn delete_image(&self, image_id: u64) -> Result<()> {
        self.delete(&format!("images/{}", image_id)).await
    }

    // Actions

    /// Get action status
    pub async fn get_action(&self, action_id: u64) -> Result<Action> {
        let response: ActionResponse = self.get(&format!("actions/{}", action_id)).await?;
        Ok(response.action)
    }

    /// Poll an action until it reaches a terminal state. The interval backs
    /// off exponentially up to 10 seconds; the budget bounds the whole wait.
    pub async fn wait_for_action(&self, action_id: u64, budget: Duration) -> Result<Action> {
        let start = std::time::Instant::now();
        let mut interval = Duration::from_secs(1);

        loop {
            let action = self.get_action(action_id).await?;

            match action.status.as_str() {
                "success" => return Ok(action),
                "error" => {
                    let error_msg = action
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| "Unknown error".to_string());
                    return Err(retryable(format!(
                        "Action {} failed: {}",
                        action_id, error_msg
                    )));
                }
                "running" => {
                    if start.elapsed() > budget {
                        return Err(retryable(format!(
                            "Action {} exceeded its {}s budget",
                            action_id,
                            budget.as_secs()
                        )));
                    }
                    debug!("Action {} progress: {}%", action_id, action.progress);
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(Duration::from_secs(10));
                }
                status => {
                    warn!("Unknown action status: {}", status);
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Map a terminal API failure onto the error taxonomy.
fn api_error(status: StatusCode, body: &str) -> anyhow::Error {
    let detail = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => format!("{} - {}", parsed.error.code, parsed.error.message),
        Err(_) => body.to_string(),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            permanent(format!("credentials rejected ({}): {}", status, detail))
        }
        StatusCode::CONFLICT => retryable(format!("conflicting concurrent change: {}", detail)),
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            permanent(format!("malformed request ({}): {}", status, detail))
        }
        StatusCode::NOT_FOUND => retryable(format!("not found: {}", detail)),
        _ => retryable(format!("API error ({}): {}", status, detail)),
    }
}

/// Percent-encode the characters a label selector can contain.
fn urlencode(s: &str) -> String {
    s.replace('=', "%3D").replace(',', "%2C")
}

/// Request structure for creating a server
#[derive(Debug, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewalls: Option<Vec<FirewallRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<std::collections::HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automount: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_after_create: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct FirewallRef {
    pub firewall: u64,
}

/// Request structure for creating a network
#[derive(Debug, Serialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub ip_range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnets: Option<Vec<SubnetRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<std::collections::HashMap<String, String>>,
}

/// Request structure for creating a subnet
#[derive(Debug, Serialize)]
pub struct SubnetRequest {
    pub ip_range: String,
    pub network_zone: String,
    #[serde(rename = "type")]
    pub subnet_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let result = HetznerCloudClient::new("test-token".to_string());
        assert!(result.is_ok());
    }

    #[test]
    fn test_api_error_classification() {
        use crate::error::{classify, ErrorKind};

        let err = api_error(StatusCode::UNAUTHORIZED, "{}");
        assert_eq!(classify(&err), ErrorKind::Permanent);

        let err = api_error(StatusCode::CONFLICT, "{}");
        assert_eq!(classify(&err), ErrorKind::Retryable);

        let err = api_error(StatusCode::UNPROCESSABLE_ENTITY, "{}");
        assert_eq!(classify(&err), ErrorKind::Permanent);
    }

    #[test]
    fn test_urlencode_selector() {
        assert_eq!(urlencode("cluster==c1,role==worker"), "cluster%3D%3Dc1%2Crole%3D%3Dworker");
    }
}
