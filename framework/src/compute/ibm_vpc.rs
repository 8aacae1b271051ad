// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IBM Cloud VPC provider. Instances come from the VPC REST API; every node
//! also gets A and PTR records in an IBM DNS Services zone so the cluster
//! can resolve its members by name.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::Method;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::rest::{describe_failure, send_json, RestResponse};
use super::{
    name_matches, ComputeError, NodeDetails, Provider, ProviderKind,
    ProvisionSpec, CLEANUP_STAGGER, CREATE_POLL_INTERVAL, CREATE_TIMEOUT,
    DELETE_POLL_INTERVAL, DELETE_TIMEOUT,
};
use crate::config::IbmCredentials;
use crate::parallel::Parallel;

const IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";
const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";
const DNS_SVCS_URL: &str = "https://api.dns-svcs.cloud.ibm.com/v1";

/// Date pin required by the VPC API on every request.
const VPC_API_VERSION: &str = "2024-04-30";

const VOLUME_PROFILE: &str = "general-purpose";
const DNS_RECORD_TTL: u32 = 900;
const DNS_PAGE_LIMIT: usize = 50;

/// Refresh the IAM token this long before its reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct IbmVpc {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    creds: IbmCredentials,
    token: tokio::sync::Mutex<Option<TokenState>>,
}

#[derive(Clone)]
struct TokenState {
    bearer: String,
    expires: Instant,
}

impl IbmVpc {
    pub fn new(creds: IbmCredentials) -> Result<Self, ComputeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(280))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                creds,
                token: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

impl Inner {
    async fn ensure_token(&self) -> Result<String, ComputeError> {
        let mut guard = self.token.lock().await;
        if let Some(state) = guard.as_ref() {
            if Instant::now() < state.expires {
                return Ok(state.bearer.clone());
            }
        }

        let state = self.fetch_token().await?;
        let bearer = state.bearer.clone();
        *guard = Some(state);
        Ok(bearer)
    }

    async fn fetch_token(&self) -> Result<TokenState, ComputeError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(180)),
            ..ExponentialBackoff::default()
        };

        let http = &self.http;
        let api_key = self.creds.access_key.as_str();
        backoff::future::retry_notify(
            backoff,
            || async move { request_iam_token(http, api_key).await },
            |err, delay: Duration| {
                warn!(error = %err, ?delay, "IAM token fetch failed, retrying");
            },
        )
        .await
    }

    fn vpc_url(&self, path: &str) -> String {
        format!("{}/{path}", self.creds.service_url.trim_end_matches('/'))
    }

    fn records_url(&self, suffix: &str) -> String {
        format!(
            "{DNS_SVCS_URL}/instances/{}/dnszones/{}/resource_records{suffix}",
            self.creds.dns_service_id, self.creds.dns_zone_id
        )
    }

    /// Issues a VPC API request; the version and generation parameters are
    /// mandatory on every call.
    async fn vpc_api(
        &self,
        method: Method,
        bearer: &str,
        url: &str,
        extra_query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<RestResponse, ComputeError> {
        let mut query = vec![
            ("version", VPC_API_VERSION.to_string()),
            ("generation", "2".to_string()),
        ];
        query.extend(
            extra_query.iter().map(|(k, v)| (*k, v.clone())),
        );
        send_json(
            &self.http,
            method,
            url,
            ("Authorization", bearer),
            &query,
            body,
        )
        .await
    }

    async fn dns_api(
        &self,
        method: Method,
        bearer: &str,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<RestResponse, ComputeError> {
        send_json(
            &self.http,
            method,
            url,
            ("Authorization", bearer),
            query,
            body,
        )
        .await
    }

    /// Finds a resource by exact name in a VPC collection, following the
    /// `next.href` pagination links.
    async fn find_by_name(
        &self,
        bearer: &str,
        collection: &str,
        name: &str,
    ) -> Result<serde_json::Value, ComputeError> {
        let mut url = self.vpc_url(collection);
        loop {
            let resp =
                self.vpc_api(Method::GET, bearer, &url, &[], None).await?;
            if !resp.is_success() {
                return Err(ComputeError::NodeError(format!(
                    "listing {collection} returned {}",
                    describe_failure(&resp)
                )));
            }

            if let Some(found) = resp.body[collection]
                .as_array()
                .into_iter()
                .flatten()
                .find(|entry| entry["name"].as_str() == Some(name))
            {
                return Ok(found.clone());
            }

            match resp.body["next"]["href"].as_str() {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }

        Err(ComputeError::ResourceNotFound(format!("{collection}: {name}")))
    }

    async fn wait_for_running(
        &self,
        bearer: &str,
        instance_id: &str,
        node_name: &str,
    ) -> Result<serde_json::Value, ComputeError> {
        let url = self.vpc_url(&format!("instances/{instance_id}"));
        let deadline = tokio::time::Instant::now() + CREATE_TIMEOUT;

        loop {
            sleep(CREATE_POLL_INTERVAL).await;
            let resp =
                self.vpc_api(Method::GET, bearer, &url, &[], None).await?;
            if !resp.is_success() {
                debug!(node = node_name, "instance lookup failed, retrying");
                continue;
            }

            let status =
                resp.body["status"].as_str().unwrap_or_default().to_string();
            match status.as_str() {
                "running" => return Ok(resp.body),
                "failed" => {
                    let reasons: Vec<&str> = resp.body["status_reasons"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|r| r["message"].as_str())
                        .collect();
                    return Err(ComputeError::NodeError(format!(
                        "{node_name} failed to provision: {}",
                        reasons.join("; ")
                    )));
                }
                other => debug!(node = node_name, state = other, "still waiting"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ComputeError::NodeError(format!(
                    "{node_name} still {status} after {CREATE_TIMEOUT:?}"
                )));
            }
        }
    }

    /// Creates one DNS resource record, clearing any stale record of the
    /// same name first. Conflicts and server errors are retried on a slow
    /// schedule since the DNS service rate-limits aggressively.
    async fn register_record(
        &self,
        bearer: &str,
        record_type: &str,
        name: &str,
        rdata: serde_json::Value,
    ) -> Result<(), ComputeError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(60),
            multiplier: 3.0,
            max_elapsed_time: Some(Duration::from_secs(15 * 60)),
            ..ExponentialBackoff::default()
        };

        let record = serde_json::json!({
            "name": name,
            "type": record_type,
            "ttl": DNS_RECORD_TTL,
            "rdata": rdata,
        });
        let record = &record;

        backoff::future::retry_notify(
            backoff,
            || async move {
                self.delete_stale_record(bearer, record_type, name).await?;

                let url = self.records_url("");
                let resp = self
                    .dns_api(Method::POST, bearer, &url, &[], Some(record))
                    .await
                    .map_err(backoff::Error::permanent)?;

                if resp.is_success() {
                    return Ok(());
                }

                let err = ComputeError::NetworkOpFailure(format!(
                    "creating {record_type} record {name} returned {}",
                    describe_failure(&resp)
                ));
                if resp.status.as_u16() == 409 || resp.status.is_server_error()
                {
                    Err(backoff::Error::transient(err))
                } else {
                    Err(backoff::Error::permanent(err))
                }
            },
            |err, delay: Duration| {
                warn!(error = %err, ?delay, "DNS registration failed, retrying");
            },
        )
        .await
    }

    async fn delete_stale_record(
        &self,
        bearer: &str,
        record_type: &str,
        name: &str,
    ) -> Result<(), backoff::Error<ComputeError>> {
        let url = self.records_url("");
        let query = vec![
            ("limit", "1".to_string()),
            ("name", name.to_string()),
            ("type", record_type.to_string()),
        ];
        let resp = self
            .dns_api(Method::GET, bearer, &url, &query, None)
            .await
            .map_err(backoff::Error::permanent)?;

        let Some(id) = resp.body["resource_records"]
            .as_array()
            .and_then(|records| records.first())
            .and_then(|record| record["id"].as_str())
        else {
            return Ok(());
        };

        debug!(record = id, name, record_type, "deleting stale DNS record");
        let delete_url = self.records_url(&format!("/{id}"));
        self.dns_api(Method::DELETE, bearer, &delete_url, &[], None)
            .await
            .map_err(backoff::Error::permanent)?;
        Ok(())
    }

    async fn register_dns(
        &self,
        bearer: &str,
        node_name: &str,
        node_ip: &str,
    ) -> Result<(), ComputeError> {
        info!(node = node_name, ip = node_ip, "registering DNS records");

        self.register_record(
            bearer,
            "A",
            node_name,
            serde_json::json!({ "ip": node_ip }),
        )
        .await?;

        let fqdn = format!("{node_name}.{}", self.creds.dns_zone);
        self.register_record(
            bearer,
            "PTR",
            node_ip,
            serde_json::json!({ "ptrdname": fqdn }),
        )
        .await
    }

    /// Deletes the node's A record and its linked PTR record. DNS teardown
    /// failures are logged so the instance delete still runs.
    async fn remove_dns_records(&self, bearer: &str, node_name: &str) {
        let mut offset = 0usize;
        loop {
            let url = self.records_url("");
            let query = vec![
                ("limit", DNS_PAGE_LIMIT.to_string()),
                ("offset", offset.to_string()),
            ];
            let resp = match self
                .dns_api(Method::GET, bearer, &url, &query, None)
                .await
            {
                Ok(resp) if resp.is_success() => resp,
                Ok(resp) => {
                    warn!(
                        node = node_name,
                        response = %describe_failure(&resp),
                        "DNS record listing failed"
                    );
                    return;
                }
                Err(e) => {
                    warn!(node = node_name, error = %e, "DNS record listing failed");
                    return;
                }
            };

            let records = resp.body["resource_records"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            if records.is_empty() {
                break;
            }

            for record in &records {
                if record["type"].as_str() != Some("A") {
                    continue;
                }
                let record_name = record["name"].as_str().unwrap_or_default();
                if !record_name.contains(node_name) {
                    continue;
                }

                if let Some(ptr_id) =
                    record["linked_ptr_record"]["id"].as_str()
                {
                    let ptr_url = self.records_url(&format!("/{ptr_id}"));
                    if let Err(e) = self
                        .dns_api(Method::DELETE, bearer, &ptr_url, &[], None)
                        .await
                    {
                        warn!(node = node_name, error = %e, "PTR record delete failed");
                    }
                }

                if let Some(id) = record["id"].as_str() {
                    info!(node = node_name, record = record_name, "deleting A record");
                    let a_url = self.records_url(&format!("/{id}"));
                    if let Err(e) = self
                        .dns_api(Method::DELETE, bearer, &a_url, &[], None)
                        .await
                    {
                        warn!(node = node_name, error = %e, "A record delete failed");
                    }
                }
                return;
            }

            if resp.body["next"]["href"].as_str().is_none() {
                break;
            }
            offset += records.len();
        }

        debug!(node = node_name, "no matching DNS records found");
    }

    async fn list_matching(
        &self,
        bearer: &str,
        pattern: &str,
    ) -> Result<Vec<NodeDetails>, ComputeError> {
        let mut matches = Vec::new();
        let mut url = self.vpc_url("instances");

        loop {
            let resp =
                self.vpc_api(Method::GET, bearer, &url, &[], None).await?;
            if !resp.is_success() {
                return Err(ComputeError::NodeError(format!(
                    "instance listing returned {}",
                    describe_failure(&resp)
                )));
            }

            for instance in
                resp.body["instances"].as_array().into_iter().flatten()
            {
                let name = instance["name"].as_str().unwrap_or_default();
                if !name_matches(name, pattern) {
                    continue;
                }
                let Some(id) = instance["id"].as_str() else { continue };

                matches.push(NodeDetails {
                    id: id.to_string(),
                    name: name.to_string(),
                    ip_address: primary_ip(instance),
                    floating_ips: Vec::new(),
                    hostname: format!("{name}.{}", self.creds.dns_zone),
                    subnet: String::new(),
                    volume_count: 0,
                    node_type: ProviderKind::Ibmc,
                });
            }

            match resp.body["next"]["href"].as_str() {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }

        Ok(matches)
    }
}

#[async_trait]
impl Provider for IbmVpc {
    fn node_type(&self) -> ProviderKind {
        ProviderKind::Ibmc
    }

    async fn create(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<NodeDetails, ComputeError> {
        let inner = &self.inner;
        let creds = &inner.creds;
        let bearer = inner.ensure_token().await?;

        // Instance names double as DNS labels, which must be lowercase.
        let node_name = spec.node_name.to_lowercase();

        let vpc = inner.find_by_name(&bearer, "vpcs", &creds.vpc_name).await?;
        let network = spec.networks.first().ok_or_else(|| {
            ComputeError::NetworkOpFailure(
                "no subnet configured for IBM provisioning".to_string(),
            )
        })?;
        let subnet = inner.find_by_name(&bearer, "subnets", network).await?;
        let image = inner.find_by_name(&bearer, "images", &spec.image).await?;

        info!(node = %node_name, image = %spec.image, profile = %spec.size, "creating instance");

        let volume_profile = serde_json::json!({ "name": VOLUME_PROFILE });
        let attachments: Vec<serde_json::Value> = (0..spec.volume_count)
            .map(|index| {
                serde_json::json!({
                    "delete_volume_on_instance_delete": true,
                    "volume": {
                        "name": format!("{node_name}-{index}"),
                        "profile": volume_profile,
                        "capacity": spec.volume_size_gib,
                    }
                })
            })
            .collect();

        let mut network_interface = serde_json::json!({
            "allow_ip_spoofing": false,
            "subnet": { "id": subnet["id"] },
        });
        if let Some(group) = &creds.security_group {
            let sg =
                inner.find_by_name(&bearer, "security_groups", group).await?;
            network_interface["security_groups"] =
                serde_json::json!([ { "id": sg["id"] } ]);
        }

        let mut prototype = serde_json::json!({
            "name": node_name,
            "zone": { "name": creds.zone_name },
            "profile": { "name": spec.size },
            "vpc": { "id": vpc["id"] },
            "image": { "id": image["id"] },
            "primary_network_interface": network_interface,
            "boot_volume_attachment": {
                "volume": {
                    "name": format!("{node_name}-boot"),
                    "profile": volume_profile,
                }
            },
            "volume_attachments": attachments,
        });
        if let Some(key_name) = &creds.ssh_key_name {
            let key = inner.find_by_name(&bearer, "keys", key_name).await?;
            prototype["keys"] = serde_json::json!([ { "id": key["id"] } ]);
        }
        if let Some(group_id) = &creds.resource_group {
            prototype["resource_group"] = serde_json::json!({ "id": group_id });
        }
        if let Some(userdata) = &spec.userdata {
            prototype["user_data"] =
                serde_json::Value::String(userdata.clone());
        }

        let create_url = inner.vpc_url("instances");
        let resp = inner
            .vpc_api(Method::POST, &bearer, &create_url, &[], Some(&prototype))
            .await?;
        if !resp.is_success() {
            return Err(ComputeError::NodeError(format!(
                "instance create for {node_name} returned {}",
                describe_failure(&resp)
            )));
        }
        let instance_id =
            resp.body["id"].as_str().map(str::to_string).ok_or_else(|| {
                ComputeError::NodeError(format!(
                    "instance create for {node_name} returned no id"
                ))
            })?;

        let instance =
            inner.wait_for_running(&bearer, &instance_id, &node_name).await?;
        let ip_address = primary_ip(&instance);
        if ip_address.is_empty() {
            return Err(ComputeError::NetworkOpFailure(format!(
                "{node_name} has no primary IP after provisioning"
            )));
        }

        inner.register_dns(&bearer, &node_name, &ip_address).await?;

        info!(node = %node_name, ip = %ip_address, "instance is running");

        Ok(NodeDetails {
            id: instance_id,
            name: node_name.clone(),
            ip_address,
            floating_ips: Vec::new(),
            hostname: format!("{node_name}.{}", creds.dns_zone),
            subnet: subnet["ipv4_cidr_block"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            volume_count: spec.volume_count,
            node_type: ProviderKind::Ibmc,
        })
    }

    async fn destroy(&self, node: &NodeDetails) -> Result<(), ComputeError> {
        let inner = &self.inner;
        let bearer = inner.ensure_token().await?;

        inner.remove_dns_records(&bearer, &node.name).await;

        info!(node = %node.name, "deleting instance");
        let url = inner.vpc_url(&format!("instances/{}", node.id));
        let resp =
            inner.vpc_api(Method::DELETE, &bearer, &url, &[], None).await?;
        if resp.not_found() {
            info!(node = %node.name, "already gone");
            return Ok(());
        }
        if !resp.is_success() {
            return Err(ComputeError::NodeDeleteFailure(format!(
                "delete of {} returned {}",
                node.name,
                describe_failure(&resp)
            )));
        }

        let deadline = tokio::time::Instant::now() + DELETE_TIMEOUT;
        loop {
            sleep(DELETE_POLL_INTERVAL).await;
            let resp =
                inner.vpc_api(Method::GET, &bearer, &url, &[], None).await?;
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
        }
    }

    async fn cleanup(&self, pattern: &str) -> Result<usize, ComputeError> {
        let inner = &self.inner;
        let bearer = inner.ensure_token().await?;
        let matches = inner.list_matching(&bearer, pattern).await?;

        info!(pattern, count = matches.len(), "cleaning up instances");

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

async fn request_iam_token(
    http: &reqwest::Client,
    api_key: &str,
) -> Result<TokenState, backoff::Error<ComputeError>> {
    let response = http
        .post(IAM_TOKEN_URL)
        .header("Accept", "application/json")
        .form(&[("grant_type", IAM_GRANT_TYPE), ("apikey", api_key)])
        .send()
        .await
        .map_err(|e| backoff::Error::transient(ComputeError::Http(e)))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| backoff::Error::permanent(ComputeError::Http(e)))?;

    if status.is_server_error() {
        return Err(backoff::Error::transient(ComputeError::NodeError(
            format!("IAM returned {status}: {body}"),
        )));
    }
    if !status.is_success() {
        return Err(backoff::Error::permanent(ComputeError::NodeError(
            format!("IAM returned {status}: {body}"),
        )));
    }

    let access_token = body["access_token"].as_str().ok_or_else(|| {
        backoff::Error::permanent(ComputeError::NodeError(
            "IAM response carried no access_token".to_string(),
        ))
    })?;
    let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
    let lifetime = Duration::from_secs(expires_in)
        .saturating_sub(TOKEN_EXPIRY_MARGIN);

    Ok(TokenState {
        bearer: format!("Bearer {access_token}"),
        expires: Instant::now() + lifetime,
    })
}

fn primary_ip(instance: &serde_json::Value) -> String {
    instance["primary_network_interface"]["primary_ip"]["address"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_ip_reads_the_nested_address() {
        let instance = serde_json::json!({
            "primary_network_interface": {
                "primary_ip": { "address": "10.240.0.7" }
            }
        });
        assert_eq!(primary_ip(&instance), "10.240.0.7");

        let detached = serde_json::json!({ "name": "x" });
        assert_eq!(primary_ip(&detached), "");
    }
}
