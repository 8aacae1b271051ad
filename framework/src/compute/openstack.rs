// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OpenStack provider: Keystone v3 for auth, Nova for servers, Neutron for
//! networks, Glance for images, Cinder for volumes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use base64::Engine;
use reqwest::Method;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::rest::{describe_failure, send_json, RestResponse};
use super::{
    name_matches, ComputeError, NodeDetails, Provider, ProviderKind,
    ProvisionSpec, CLEANUP_STAGGER, CREATE_POLL_INTERVAL, CREATE_TIMEOUT,
    DELETE_POLL_INTERVAL, DELETE_TIMEOUT, VOLUME_POLL_INTERVAL,
    VOLUME_POLL_TRIES,
};
use crate::config::OpenStackCredentials;
use crate::parallel::Parallel;

/// Keystone tokens default to one hour; refresh comfortably before that.
const TOKEN_LIFETIME: Duration = Duration::from_secs(50 * 60);

/// Per-request timeout. Keystone and Nova can take minutes under load.
const HTTP_TIMEOUT: Duration = Duration::from_secs(280);

/// A network must have more than this many free addresses to be used.
const MIN_FREE_IPS: i64 = 3;

#[derive(Clone)]
pub struct OpenStack {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    creds: OpenStackCredentials,
    session: tokio::sync::Mutex<Option<SessionState>>,
}

#[derive(Clone)]
struct SessionState {
    token: String,
    endpoints: ServiceEndpoints,
    fetched: Instant,
}

#[derive(Clone)]
struct ServiceEndpoints {
    compute: String,
    network: String,
    image: String,
    volume: String,
}

struct NetworkChoice {
    id: String,
    name: String,
    subnet_id: Option<String>,
}

impl OpenStack {
    pub fn new(creds: OpenStackCredentials) -> Result<Self, ComputeError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                creds,
                session: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

impl Inner {
    /// Returns a valid token and the service catalog, fetching a fresh one
    /// when none is cached or the cached one is near expiry.
    async fn ensure_session(
        &self,
    ) -> Result<(String, ServiceEndpoints), ComputeError> {
        let mut guard = self.session.lock().await;
        if let Some(state) = guard.as_ref() {
            if state.fetched.elapsed() < TOKEN_LIFETIME {
                return Ok((state.token.clone(), state.endpoints.clone()));
            }
        }

        let state = self.fetch_session().await?;
        let result = (state.token.clone(), state.endpoints.clone());
        *guard = Some(state);
        Ok(result)
    }

    async fn fetch_session(&self) -> Result<SessionState, ComputeError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(180)),
            ..ExponentialBackoff::default()
        };

        let http = &self.http;
        let creds = &self.creds;
        backoff::future::retry_notify(
            backoff,
            || async move { request_token(http, creds).await },
            |err, delay: Duration| {
                warn!(error = %err, ?delay, "keystone token fetch failed, retrying");
            },
        )
        .await
    }

    async fn api(
        &self,
        method: Method,
        token: &str,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<RestResponse, ComputeError> {
        send_json(&self.http, method, url, ("X-Auth-Token", token), query, body)
            .await
    }

    /// Resolves an image name (or passes a UUID through) to an image ref.
    async fn resolve_image(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        image: &str,
    ) -> Result<String, ComputeError> {
        if uuid::Uuid::parse_str(image).is_ok() {
            return Ok(image.to_string());
        }

        let url = format!("{}/v2/images", endpoints.image);
        let resp = self
            .api(
                Method::GET,
                token,
                &url,
                &[("name", image.to_string())],
                None,
            )
            .await?;
        if !resp.is_success() {
            return Err(ComputeError::NodeError(format!(
                "image lookup for {image} returned {}",
                describe_failure(&resp)
            )));
        }

        exact_image_match(&resp.body, image)
    }

    async fn resolve_flavor(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        flavor: &str,
    ) -> Result<String, ComputeError> {
        let mut url = format!("{}/flavors/detail", endpoints.compute);
        loop {
            let resp = self.api(Method::GET, token, &url, &[], None).await?;
            if !resp.is_success() {
                return Err(ComputeError::NodeError(format!(
                    "flavor listing returned {}",
                    describe_failure(&resp)
                )));
            }

            for entry in resp.body["flavors"].as_array().into_iter().flatten() {
                if entry["name"].as_str() == Some(flavor) {
                    if let Some(id) = entry["id"].as_str() {
                        return Ok(id.to_string());
                    }
                }
            }

            match next_link(&resp.body, "flavors_links") {
                Some(next) => url = next,
                None => break,
            }
        }

        Err(ComputeError::ResourceNotFound(format!("flavor {flavor}")))
    }

    /// Picks the first candidate network with enough free addresses.
    async fn select_network(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        candidates: &[String],
    ) -> Result<NetworkChoice, ComputeError> {
        if candidates.is_empty() {
            return Err(ComputeError::NetworkOpFailure(
                "no candidate networks configured".to_string(),
            ));
        }

        for name in candidates {
            let url = format!("{}/v2.0/networks", endpoints.network);
            let resp = self
                .api(Method::GET, token, &url, &[("name", name.clone())], None)
                .await?;
            if !resp.is_success() {
                return Err(ComputeError::NetworkOpFailure(format!(
                    "network lookup for {name} returned {}",
                    describe_failure(&resp)
                )));
            }

            let Some(network) = resp.body["networks"]
                .as_array()
                .and_then(|nets| nets.first())
            else {
                debug!(network = %name, "network not found, trying next");
                continue;
            };
            let Some(id) = network["id"].as_str() else {
                continue;
            };

            let avail_url = format!(
                "{}/v2.0/network-ip-availabilities/{id}",
                endpoints.network
            );
            let avail =
                self.api(Method::GET, token, &avail_url, &[], None).await?;
            let free = free_ip_count(&avail.body);
            if free > MIN_FREE_IPS {
                return Ok(NetworkChoice {
                    id: id.to_string(),
                    name: name.clone(),
                    subnet_id: network["subnets"]
                        .as_array()
                        .and_then(|s| s.first())
                        .and_then(|s| s.as_str())
                        .map(str::to_string),
                });
            }

            debug!(network = %name, free, "not enough free addresses");
        }

        Err(ComputeError::NetworkOpFailure(format!(
            "no network out of {candidates:?} has more than {MIN_FREE_IPS} free addresses"
        )))
    }

    async fn subnet_cidr(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        subnet_id: &str,
    ) -> Result<String, ComputeError> {
        let url = format!("{}/v2.0/subnets/{subnet_id}", endpoints.network);
        let resp = self.api(Method::GET, token, &url, &[], None).await?;
        if !resp.is_success() {
            return Err(ComputeError::NetworkOpFailure(format!(
                "subnet lookup returned {}",
                describe_failure(&resp)
            )));
        }

        Ok(resp.body["subnet"]["cidr"].as_str().unwrap_or_default().to_string())
    }

    /// Polls a server until ACTIVE, returning its final representation.
    async fn wait_for_active(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        server_id: &str,
        node_name: &str,
    ) -> Result<serde_json::Value, ComputeError> {
        let url = format!("{}/servers/{server_id}", endpoints.compute);
        let deadline = tokio::time::Instant::now() + CREATE_TIMEOUT;

        loop {
            let resp = self.api(Method::GET, token, &url, &[], None).await?;
            if !resp.is_success() {
                return Err(ComputeError::NodeError(format!(
                    "status check for {node_name} returned {}",
                    describe_failure(&resp)
                )));
            }

            let status = resp.body["server"]["status"]
                .as_str()
                .unwrap_or_default()
                .to_uppercase();
            match status.as_str() {
                "ACTIVE" => return Ok(resp.body["server"].clone()),
                "ERROR" => {
                    let fault = resp.body["server"]["fault"]["message"]
                        .as_str()
                        .unwrap_or("no fault message");
                    return Err(ComputeError::NodeError(format!(
                        "{node_name} went to ERROR during provisioning: {fault}"
                    )));
                }
                other => debug!(node = node_name, state = other, "still waiting"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ComputeError::NodeError(format!(
                    "{node_name} did not reach ACTIVE within {CREATE_TIMEOUT:?}"
                )));
            }
            sleep(CREATE_POLL_INTERVAL).await;
        }
    }

    async fn create_volume(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        name: &str,
        size_gib: u32,
    ) -> Result<String, ComputeError> {
        let url = format!("{}/volumes", endpoints.volume);
        let body = serde_json::json!({
            "volume": { "name": name, "size": size_gib }
        });
        let resp =
            self.api(Method::POST, token, &url, &[], Some(&body)).await?;
        if !resp.is_success() {
            return Err(ComputeError::VolumeOpFailure(format!(
                "create of {name} returned {}",
                describe_failure(&resp)
            )));
        }

        resp.body["volume"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ComputeError::VolumeOpFailure(format!(
                    "create of {name} returned no volume id"
                ))
            })
    }

    async fn wait_volume_available(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        volume_id: &str,
        name: &str,
    ) -> Result<(), ComputeError> {
        let url = format!("{}/volumes/{volume_id}", endpoints.volume);
        for _ in 0..VOLUME_POLL_TRIES {
            let resp = self.api(Method::GET, token, &url, &[], None).await?;
            let status =
                resp.body["volume"]["status"].as_str().unwrap_or_default();
            match status {
                "available" => return Ok(()),
                "error" => {
                    return Err(ComputeError::VolumeOpFailure(format!(
                        "{name} went to error state"
                    )))
                }
                _ => sleep(VOLUME_POLL_INTERVAL).await,
            }
        }

        Err(ComputeError::VolumeOpFailure(format!(
            "{name} not available after {VOLUME_POLL_TRIES} checks"
        )))
    }

    async fn attach_volume(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        server_id: &str,
        volume_id: &str,
    ) -> Result<(), ComputeError> {
        let url = format!(
            "{}/servers/{server_id}/os-volume_attachments",
            endpoints.compute
        );
        let body = serde_json::json!({
            "volumeAttachment": { "volumeId": volume_id }
        });
        let resp =
            self.api(Method::POST, token, &url, &[], Some(&body)).await?;
        if !resp.is_success() {
            return Err(ComputeError::VolumeOpFailure(format!(
                "attach of {volume_id} returned {}",
                describe_failure(&resp)
            )));
        }
        Ok(())
    }

    /// Clears the port association of every floating IP handed out to the
    /// node. Failures are logged and swallowed; teardown continues.
    async fn release_floating_ips(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        floating_ips: &[String],
    ) {
        for ip in floating_ips {
            let result = async {
                let url = format!("{}/v2.0/floatingips", endpoints.network);
                let resp = self
                    .api(
                        Method::GET,
                        token,
                        &url,
                        &[("floating_ip_address", ip.clone())],
                        None,
                    )
                    .await?;
                let Some(id) = resp.body["floatingips"]
                    .as_array()
                    .and_then(|f| f.first())
                    .and_then(|f| f["id"].as_str())
                else {
                    return Ok(());
                };

                let update_url =
                    format!("{}/v2.0/floatingips/{id}", endpoints.network);
                let body =
                    serde_json::json!({ "floatingip": { "port_id": null } });
                self.api(Method::PUT, token, &update_url, &[], Some(&body))
                    .await?;
                Ok::<(), ComputeError>(())
            }
            .await;

            if let Err(e) = result {
                warn!(ip = %ip, error = %e, "failed to release floating ip");
            }
        }
    }

    /// Detaches and deletes the node's data volumes. Failures are logged
    /// and swallowed so node deletion still proceeds.
    async fn remove_volumes(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        server_id: &str,
        node_name: &str,
    ) {
        let list_url = format!(
            "{}/servers/{server_id}/os-volume_attachments",
            endpoints.compute
        );
        let attachments = match self
            .api(Method::GET, token, &list_url, &[], None)
            .await
        {
            Ok(resp) => resp.body["volumeAttachments"]
                .as_array()
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                warn!(node = node_name, error = %e, "failed to list volume attachments");
                return;
            }
        };

        for attachment in attachments {
            let Some(volume_id) = attachment["volumeId"].as_str() else {
                continue;
            };

            let detach_url = format!(
                "{}/servers/{server_id}/os-volume_attachments/{volume_id}",
                endpoints.compute
            );
            if let Err(e) =
                self.api(Method::DELETE, token, &detach_url, &[], None).await
            {
                warn!(volume = volume_id, error = %e, "volume detach failed");
                continue;
            }

            if let Err(e) = self
                .wait_volume_available(token, endpoints, volume_id, volume_id)
                .await
            {
                warn!(volume = volume_id, error = %e, "volume did not settle after detach");
            }

            let delete_url = format!("{}/volumes/{volume_id}", endpoints.volume);
            if let Err(e) =
                self.api(Method::DELETE, token, &delete_url, &[], None).await
            {
                warn!(volume = volume_id, error = %e, "volume delete failed");
            }
        }
    }

    /// Lists servers whose names match `pattern`, following pagination.
    async fn list_matching(
        &self,
        token: &str,
        endpoints: &ServiceEndpoints,
        pattern: &str,
    ) -> Result<Vec<NodeDetails>, ComputeError> {
        let mut matches = Vec::new();
        let mut url = format!("{}/servers/detail", endpoints.compute);
        let mut query = vec![("name", pattern.to_string())];

        loop {
            let resp = self.api(Method::GET, token, &url, &query, None).await?;
            if !resp.is_success() {
                return Err(ComputeError::NodeError(format!(
                    "server listing returned {}",
                    describe_failure(&resp)
                )));
            }

            for server in resp.body["servers"].as_array().into_iter().flatten()
            {
                let name = server["name"].as_str().unwrap_or_default();
                if !name_matches(name, pattern) {
                    continue;
                }
                let Some(id) = server["id"].as_str() else { continue };

                let (fixed, floating) = addresses_of(server);
                matches.push(NodeDetails {
                    id: id.to_string(),
                    name: name.to_string(),
                    ip_address: floating
                        .first()
                        .or(fixed.first())
                        .cloned()
                        .unwrap_or_default(),
                    floating_ips: floating,
                    hostname: name.to_string(),
                    subnet: String::new(),
                    volume_count: 0,
                    node_type: ProviderKind::Openstack,
                });
            }

            match next_link(&resp.body, "servers_links") {
                Some(next) => {
                    url = next;
                    query.clear();
                }
                None => break,
            }
        }

        Ok(matches)
    }
}

#[async_trait]
impl Provider for OpenStack {
    fn node_type(&self) -> ProviderKind {
        ProviderKind::Openstack
    }

    async fn create(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<NodeDetails, ComputeError> {
        let inner = &self.inner;
        let (token, endpoints) = inner.ensure_session().await?;

        let image_ref =
            inner.resolve_image(&token, &endpoints, &spec.image).await?;
        let flavor_ref =
            inner.resolve_flavor(&token, &endpoints, &spec.size).await?;
        let network =
            inner.select_network(&token, &endpoints, &spec.networks).await?;

        info!(
            node = %spec.node_name,
            image = %image_ref,
            flavor = %flavor_ref,
            network = %network.name,
            "creating server"
        );

        let mut server = serde_json::json!({
            "name": spec.node_name,
            "imageRef": image_ref,
            "flavorRef": flavor_ref,
            "networks": [ { "uuid": network.id } ],
            "config_drive": true,
        });
        if let Some(userdata) = &spec.userdata {
            server["user_data"] = serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(userdata),
            );
        }
        let body = serde_json::json!({ "server": server });

        let create_url = format!("{}/servers", endpoints.compute);
        let resp = inner
            .api(Method::POST, &token, &create_url, &[], Some(&body))
            .await?;
        if !resp.is_success() {
            return Err(ComputeError::NodeError(format!(
                "server create for {} returned {}",
                spec.node_name,
                describe_failure(&resp)
            )));
        }
        let server_id = resp.body["server"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ComputeError::NodeError(format!(
                    "server create for {} returned no id",
                    spec.node_name
                ))
            })?;

        let server = inner
            .wait_for_active(&token, &endpoints, &server_id, &spec.node_name)
            .await?;

        for index in 0..spec.volume_count {
            let volume_name = format!("{}-vol-{index}", spec.node_name);
            let volume_id = inner
                .create_volume(
                    &token,
                    &endpoints,
                    &volume_name,
                    spec.volume_size_gib,
                )
                .await?;
            inner
                .wait_volume_available(
                    &token,
                    &endpoints,
                    &volume_id,
                    &volume_name,
                )
                .await?;
            inner
                .attach_volume(&token, &endpoints, &server_id, &volume_id)
                .await?;
        }

        let (fixed, floating) = addresses_of(&server);
        let ip_address = floating
            .first()
            .or(fixed.first())
            .cloned()
            .ok_or_else(|| {
                ComputeError::NetworkOpFailure(format!(
                    "{} has no addresses after provisioning",
                    spec.node_name
                ))
            })?;

        let subnet = match &network.subnet_id {
            Some(id) => inner
                .subnet_cidr(&token, &endpoints, id)
                .await
                .unwrap_or_default(),
            None => String::new(),
        };

        info!(node = %spec.node_name, ip = %ip_address, "server is ACTIVE");

        Ok(NodeDetails {
            id: server_id,
            name: spec.node_name.clone(),
            ip_address,
            floating_ips: floating,
            hostname: spec.node_name.clone(),
            subnet,
            volume_count: spec.volume_count,
            node_type: ProviderKind::Openstack,
        })
    }

    async fn destroy(&self, node: &NodeDetails) -> Result<(), ComputeError> {
        let inner = &self.inner;
        let (token, endpoints) = inner.ensure_session().await?;
        let url = format!("{}/servers/{}", endpoints.compute, node.id);

        let resp = inner.api(Method::GET, &token, &url, &[], None).await?;
        if resp.not_found() {
            info!(node = %node.name, "already gone");
            return Ok(());
        }
        if !resp.is_success() {
            return Err(ComputeError::NodeDeleteFailure(format!(
                "lookup of {} returned {}",
                node.name,
                describe_failure(&resp)
            )));
        }

        let state = resp.body["server"]["status"].as_str().unwrap_or_default();
        if state.eq_ignore_ascii_case("BUILD") {
            return Err(ComputeError::NodeDeleteFailure(format!(
                "{} is still being provisioned",
                node.name
            )));
        }

        inner
            .release_floating_ips(&token, &endpoints, &node.floating_ips)
            .await;
        inner.remove_volumes(&token, &endpoints, &node.id, &node.name).await;

        let resp = inner.api(Method::DELETE, &token, &url, &[], None).await?;
        if !(resp.is_success() || resp.not_found()) {
            return Err(ComputeError::NodeDeleteFailure(format!(
                "delete of {} returned {}",
                node.name,
                describe_failure(&resp)
            )));
        }

        let deadline = tokio::time::Instant::now() + DELETE_TIMEOUT;
        loop {
            let resp = inner.api(Method::GET, &token, &url, &[], None).await?;
            if resp.not_found() {
                info!(node = %node.name, "destroyed");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ComputeError::NodeDeleteFailure(format!(
                    "{} still present after {DELETE_TIMEOUT:?}",
                    node.name
                )));
            }
            sleep(DELETE_POLL_INTERVAL).await;
        }
    }

    async fn cleanup(&self, pattern: &str) -> Result<usize, ComputeError> {
        let inner = &self.inner;
        let (token, endpoints) = inner.ensure_session().await?;
        let matches = inner.list_matching(&token, &endpoints, pattern).await?;

        info!(pattern, count = matches.len(), "cleaning up servers");

        let mut group = Parallel::new();
        let total = matches.len();
        for node in matches {
            let provider = self.clone();
            group.spawn(async move {
                provider.destroy(&node).await?;
                Ok(())
            });
            sleep(CLEANUP_STAGGER).await;
        }
        group.join_all().await.map_err(|e| {
            ComputeError::NodeDeleteFailure(format!("cleanup failed: {e}"))
        })?;

        Ok(total)
    }
}

async fn request_token(
    http: &reqwest::Client,
    creds: &OpenStackCredentials,
) -> Result<SessionState, backoff::Error<ComputeError>> {
    let project_domain = match &creds.tenant_domain_id {
        Some(id) => serde_json::json!({ "id": id }),
        None => serde_json::json!({ "name": creds.domain }),
    };
    let body = serde_json::json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": creds.username,
                        "domain": { "name": creds.domain },
                        "password": creds.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": creds.tenant_name,
                    "domain": project_domain,
                }
            }
        }
    });

    let url = format!("{}/auth/tokens", creds.auth_url.trim_end_matches('/'));
    let response = http.post(&url).json(&body).send().await.map_err(|e| {
        backoff::Error::transient(ComputeError::Http(e))
    })?;

    let status = response.status();
    let token = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body: serde_json::Value = response.json().await.map_err(|e| {
        backoff::Error::permanent(ComputeError::Http(e))
    })?;

    if status.is_server_error() {
        return Err(backoff::Error::transient(ComputeError::NodeError(
            format!("keystone returned {status}: {body}"),
        )));
    }
    if !status.is_success() {
        return Err(backoff::Error::permanent(ComputeError::NodeError(
            format!("keystone returned {status}: {body}"),
        )));
    }

    let token = token.ok_or_else(|| {
        backoff::Error::permanent(ComputeError::NodeError(
            "keystone response carried no X-Subject-Token".to_string(),
        ))
    })?;

    let endpoints =
        catalog_endpoints(&body, &creds.service_region).map_err(|e| {
            backoff::Error::permanent(e)
        })?;

    Ok(SessionState { token, endpoints, fetched: Instant::now() })
}

/// Pulls the public endpoint of each service this provider drives out of
/// the keystone catalog.
fn catalog_endpoints(
    token_body: &serde_json::Value,
    region: &str,
) -> Result<ServiceEndpoints, ComputeError> {
    let find = |service_types: &[&str]| -> Result<String, ComputeError> {
        for entry in token_body["token"]["catalog"]
            .as_array()
            .into_iter()
            .flatten()
        {
            let entry_type = entry["type"].as_str().unwrap_or_default();
            if !service_types.contains(&entry_type) {
                continue;
            }
            for endpoint in entry["endpoints"].as_array().into_iter().flatten()
            {
                let interface =
                    endpoint["interface"].as_str().unwrap_or_default();
                let endpoint_region = endpoint["region"]
                    .as_str()
                    .or(endpoint["region_id"].as_str())
                    .unwrap_or_default();
                if interface == "public" && endpoint_region == region {
                    if let Some(url) = endpoint["url"].as_str() {
                        return Ok(url.trim_end_matches('/').to_string());
                    }
                }
            }
        }
        Err(ComputeError::ResourceNotFound(format!(
            "no public {service_types:?} endpoint in region {region}"
        )))
    };

    Ok(ServiceEndpoints {
        compute: find(&["compute"])?,
        network: find(&["network"])?,
        image: find(&["image"])?,
        volume: find(&["volumev3", "block-storage"])?,
    })
}

/// Requires exactly one image whose name equals `name`.
fn exact_image_match(
    body: &serde_json::Value,
    name: &str,
) -> Result<String, ComputeError> {
    let matches: Vec<&str> = body["images"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|img| img["name"].as_str() == Some(name))
        .filter_map(|img| img["id"].as_str())
        .collect();

    match matches.as_slice() {
        [id] => Ok(id.to_string()),
        _ => Err(ComputeError::ExactMatchFailed(format!(
            "image {name} ({} matches)",
            matches.len()
        ))),
    }
}

fn free_ip_count(availability: &serde_json::Value) -> i64 {
    let info = &availability["network_ip_availability"];
    info["total_ips"].as_i64().unwrap_or(0)
        - info["used_ips"].as_i64().unwrap_or(0)
}

/// Splits a server's addresses into fixed and floating lists.
fn addresses_of(server: &serde_json::Value) -> (Vec<String>, Vec<String>) {
    let mut fixed = Vec::new();
    let mut floating = Vec::new();

    if let Some(networks) = server["addresses"].as_object() {
        for addresses in networks.values() {
            for address in addresses.as_array().into_iter().flatten() {
                let Some(addr) = address["addr"].as_str() else { continue };
                match address["OS-EXT-IPS:type"].as_str() {
                    Some("floating") => floating.push(addr.to_string()),
                    _ => fixed.push(addr.to_string()),
                }
            }
        }
    }

    (fixed, floating)
}

fn next_link(body: &serde_json::Value, key: &str) -> Option<String> {
    body[key]
        .as_array()
        .into_iter()
        .flatten()
        .find(|link| link["rel"].as_str() == Some("next"))
        .and_then(|link| link["href"].as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_match_requires_exactly_one() {
        let listing = serde_json::json!({
            "images": [
                { "id": "aaa", "name": "rhel-9.2" },
                { "id": "bbb", "name": "rhel-9.2-beta" },
            ]
        });
        assert_eq!(exact_image_match(&listing, "rhel-9.2").unwrap(), "aaa");

        let duplicated = serde_json::json!({
            "images": [
                { "id": "aaa", "name": "rhel-9.2" },
                { "id": "bbb", "name": "rhel-9.2" },
            ]
        });
        assert!(matches!(
            exact_image_match(&duplicated, "rhel-9.2"),
            Err(ComputeError::ExactMatchFailed(_))
        ));

        assert!(matches!(
            exact_image_match(&listing, "fedora"),
            Err(ComputeError::ExactMatchFailed(_))
        ));
    }

    #[test]
    fn free_ip_count_subtracts_used() {
        let availability = serde_json::json!({
            "network_ip_availability": { "total_ips": 256, "used_ips": 250 }
        });
        assert_eq!(free_ip_count(&availability), 6);
    }

    #[test]
    fn addresses_split_by_type() {
        let server = serde_json::json!({
            "addresses": {
                "provider_net": [
                    { "addr": "10.1.2.3", "OS-EXT-IPS:type": "fixed" },
                    { "addr": "198.51.100.7", "OS-EXT-IPS:type": "floating" },
                ]
            }
        });
        let (fixed, floating) = addresses_of(&server);
        assert_eq!(fixed, vec!["10.1.2.3"]);
        assert_eq!(floating, vec!["198.51.100.7"]);
    }

    #[test]
    fn pagination_link_must_be_rel_next() {
        let body = serde_json::json!({
            "servers_links": [
                { "rel": "prev", "href": "http://x/prev" },
                { "rel": "next", "href": "http://x/next" },
            ]
        });
        assert_eq!(
            next_link(&body, "servers_links").as_deref(),
            Some("http://x/next")
        );
        assert_eq!(next_link(&body, "flavors_links"), None);
    }
}
