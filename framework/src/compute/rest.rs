// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal JSON-over-HTTP plumbing shared by the REST providers.

use reqwest::{Method, StatusCode};

use super::ComputeError;

pub(crate) struct RestResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// Sends one request and returns the status plus the parsed body. Non-JSON
/// bodies come back as a JSON string so error text is never lost; an empty
/// body becomes `Null`. HTTP status handling is left to the caller.
pub(crate) async fn send_json(
    http: &reqwest::Client,
    method: Method,
    url: &str,
    auth_header: (&str, &str),
    query: &[(&str, String)],
    body: Option<&serde_json::Value>,
) -> Result<RestResponse, ComputeError> {
    let (header_name, header_value) = auth_header;
    let mut request = http
        .request(method, url)
        .header(header_name, header_value)
        .header("Accept", "application/json");

    if !query.is_empty() {
        request = request.query(query);
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;

    let body = if text.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&text)
            .unwrap_or(serde_json::Value::String(text))
    };

    Ok(RestResponse { status, body })
}

/// Renders a failed response for an error message: `404: {...}`.
pub(crate) fn describe_failure(resp: &RestResponse) -> String {
    format!("{}: {}", resp.status, resp.body)
}
