// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request,
};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::contracts::{Tunnel, TunnelEndpoint, TunnelEvent};

use super::{
    Authorization, AuthorizationProvider, HttpError, HttpResult, ResponseError,
    StaticAuthorizationProvider, TunnelLocator, TunnelManagementApi, TunnelRequestOptions,
};

/// HTTP implementation of the management surface consumed by tunnel
/// connections. This is deliberately not a complete client for the service
/// REST API; it covers only the operations the connection layer needs.
#[derive(Clone)]
pub struct TunnelManagementClient {
    client: Client,
    authorization: Arc<dyn AuthorizationProvider>,
    pub(crate) user_agent: HeaderValue,
    service_uri: String,
    api_version: String,
}

const TUNNELS_API_PATH: &str = "/tunnels";
const ENDPOINTS_API_SUB_PATH: &str = "endpoints";
const EVENTS_API_SUB_PATH: &str = "events";
const PKG_VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
const API_VERSIONS: &[&str] = &["2023-09-27-preview"];

/// Default production service URI.
pub const SERVICE_URI: &str = "https://global.rel.tunnels.api.visualstudio.com/";

impl TunnelManagementClient {
    /// Looks up a tunnel by ID or name, distinguishing absence from failure.
    async fn get_tunnel_inner(
        &self,
        locator: &TunnelLocator,
        options: &TunnelRequestOptions,
    ) -> HttpResult<Option<Tunnel>> {
        let url = self.build_tunnel_uri(locator, None, options);
        let request = self.make_tunnel_request(Method::GET, url, options).await?;
        match self.execute_json("get_tunnel", request).await {
            Ok(tunnel) => Ok(Some(tunnel)),
            Err(HttpError::ResponseError(e)) if e.status_code.as_u16() == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Builds a URI that does an operation on a tunnel.
    fn build_tunnel_uri(
        &self,
        locator: &TunnelLocator,
        path: Option<&str>,
        options: &TunnelRequestOptions,
    ) -> Url {
        let make_path = |ident: &str| {
            path.map(|p| format!("{}/{}/{}", TUNNELS_API_PATH, ident, p))
                .unwrap_or_else(|| format!("{}/{}", TUNNELS_API_PATH, ident))
        };

        let mut url = match locator {
            TunnelLocator::Name(name) => self.build_uri(None, &make_path(name)),
            TunnelLocator::ID { cluster, id } => self.build_uri(Some(cluster), &make_path(id)),
        };
        add_query(&mut url, options, &self.api_version);
        url
    }

    /// Builds a URI to a path on the given cluster, if given, or to the global
    /// service if none is provided.
    fn build_uri(&self, cluster_id: Option<&str>, path: &str) -> Url {
        let mut uri = Url::parse(&self.service_uri).expect("expected valid service_uri");

        if let Some(cluster_id) = cluster_id {
            let hostname = uri.host_str().unwrap_or("");
            if !hostname.starts_with(&format!("{}.", cluster_id)) {
                let new_hostname = format!("{}.{}", cluster_id, hostname).replace("global.", "");
                uri.set_host(Some(&new_hostname)).ok();
            }
        }

        uri.set_path(path);

        uri
    }

    /// Makes a request and applies the additional tunnel options to the headers.
    async fn make_tunnel_request(
        &self,
        method: Method,
        url: Url,
        tunnel_opts: &TunnelRequestOptions,
    ) -> HttpResult<Request> {
        let mut request = Request::new(method, url);
        let headers = request.headers_mut();
        headers.insert("User-Agent", self.user_agent.clone());

        if let Some(a) = self.authorization.get_authorization().await?.as_header() {
            if let Ok(value) = HeaderValue::from_str(&a) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        if let Some(authorization) = &tunnel_opts.authorization {
            match authorization.as_header().map(|a| HeaderValue::from_str(&a)) {
                Some(Ok(value)) => {
                    headers.insert(AUTHORIZATION, value);
                }
                _ => {
                    headers.remove(AUTHORIZATION);
                }
            }
        }

        for (name, value) in &tunnel_opts.headers {
            headers.append(name, value.to_owned());
        }

        Ok(request)
    }

    /// Sends the request and deserializes a JSON response.
    async fn execute_json<T>(&self, feature: &'static str, request: Request) -> HttpResult<T>
    where
        T: DeserializeOwned,
    {
        let url_clone = request.url().clone();
        let res = self
            .client
            .execute(request)
            .await
            .map_err(HttpError::ConnectionError)?;

        if res.status().is_success() {
            res.json::<T>().await.map_err(HttpError::ConnectionError)
        } else {
            let err = response_error(url_clone, res).await;
            log::debug!("{} failed: {}", feature, err);
            Err(HttpError::ResponseError(err))
        }
    }

    /// Executes a request in which 200 status codes indicate success and
    /// 404 indicates an unsuccessful deletion but is not an error.
    async fn execute_no_response(&self, _: &'static str, request: Request) -> HttpResult<bool> {
        let url_clone = request.url().clone();
        let res = self
            .client
            .execute(request)
            .await
            .map_err(HttpError::ConnectionError)?;

        if res.status().is_success() {
            Ok(true)
        } else if res.status().as_u16() == 404 {
            Ok(false)
        } else {
            Err(HttpError::ResponseError(response_error(url_clone, res).await))
        }
    }
}

async fn response_error(url: Url, res: reqwest::Response) -> ResponseError {
    let request_id = res
        .headers()
        .get("VsSaaS-Request-Id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_owned());

    ResponseError {
        url,
        status_code: res.status(),
        data: res.text().await.ok(),
        request_id,
    }
}

#[async_trait]
impl TunnelManagementApi for TunnelManagementClient {
    async fn get_tunnel(
        &self,
        locator: &TunnelLocator,
        options: &TunnelRequestOptions,
    ) -> HttpResult<Option<Tunnel>> {
        self.get_tunnel_inner(locator, options).await
    }

    async fn create_tunnel(
        &self,
        tunnel: Tunnel,
        options: &TunnelRequestOptions,
    ) -> HttpResult<Tunnel> {
        let tunnel_id = tunnel.tunnel_id.as_deref().unwrap_or_default();
        let mut url = self.build_uri(
            tunnel.cluster_id.as_deref(),
            &format!("{}/{}", TUNNELS_API_PATH, tunnel_id),
        );
        add_query(&mut url, options, &self.api_version);

        let mut request = self.make_tunnel_request(Method::PUT, url, options).await?;
        json_body(&mut request, &tunnel);
        self.execute_json("create_tunnel", request).await
    }

    async fn update_tunnel_endpoint(
        &self,
        tunnel: &Tunnel,
        endpoint: &TunnelEndpoint,
        options: &TunnelRequestOptions,
    ) -> HttpResult<TunnelEndpoint> {
        let locator = TunnelLocator::try_from(tunnel)
            .map_err(|e| HttpError::AuthorizationError(e.to_string()))?;
        let endpoint_id = endpoint.id.as_deref().unwrap_or_default();
        let mut url = self.build_tunnel_uri(
            &locator,
            Some(&format!("{}/{}", ENDPOINTS_API_SUB_PATH, endpoint_id)),
            options,
        );
        url.query_pairs_mut()
            .append_pair("connectionMode", &endpoint.connection_mode.to_string());
        let mut request = self.make_tunnel_request(Method::PUT, url, options).await?;
        json_body(&mut request, endpoint);
        self.execute_json("update_tunnel_endpoint", request).await
    }

    async fn delete_tunnel_endpoints(
        &self,
        tunnel: &Tunnel,
        endpoint_id: &str,
        options: &TunnelRequestOptions,
    ) -> HttpResult<bool> {
        let locator = TunnelLocator::try_from(tunnel)
            .map_err(|e| HttpError::AuthorizationError(e.to_string()))?;
        let url = self.build_tunnel_uri(
            &locator,
            Some(&format!("{}/{}", ENDPOINTS_API_SUB_PATH, endpoint_id)),
            options,
        );
        let request = self
            .make_tunnel_request(Method::DELETE, url, options)
            .await?;
        self.execute_no_response("delete_tunnel_endpoints", request)
            .await
    }

    async fn report_event(&self, tunnel: &Tunnel, event: TunnelEvent) -> HttpResult<()> {
        let locator = TunnelLocator::try_from(tunnel)
            .map_err(|e| HttpError::AuthorizationError(e.to_string()))?;
        let url = self.build_tunnel_uri(&locator, Some(EVENTS_API_SUB_PATH), NO_OPTIONS);
        let mut request = self
            .make_tunnel_request(Method::POST, url, NO_OPTIONS)
            .await?;
        json_body(&mut request, &event);
        self.execute_no_response("report_event", request).await?;
        Ok(())
    }
}

const NO_OPTIONS: &TunnelRequestOptions = super::NO_REQUEST_OPTIONS;

fn json_body<T>(request: &mut Request, body: &T)
where
    T: Serialize,
{
    request
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(bytes) = serde_json::to_vec(body) {
        *request.body_mut() = Some(bytes.into());
    }
}

pub struct TunnelClientBuilder {
    authorization: Arc<dyn AuthorizationProvider>,
    client: Option<Client>,
    user_agent: HeaderValue,
    service_uri: String,
    api_version: String,
}

/// Creates a new tunnel client builder. You can set options, then use `into()`
/// to get the client instance (or cast automatically).
pub fn new_tunnel_management(user_agent: &str) -> TunnelClientBuilder {
    let full_user_agent = create_full_user_agent(user_agent);

    TunnelClientBuilder {
        authorization: Arc::new(StaticAuthorizationProvider(Authorization::Anonymous)),
        client: None,
        user_agent: HeaderValue::from_str(&full_user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("Dev-Tunnels-Service-Rust-SDK")),
        service_uri: SERVICE_URI.to_string(),
        api_version: API_VERSIONS[0].to_owned(),
    }
}

fn create_full_user_agent(user_agent: &str) -> String {
    let pkg_version = PKG_VERSION.unwrap_or("unknown");
    let os = os_info::get();

    format!(
        "{} Dev-Tunnels-Service-Rust-SDK/{} (OS: {} {})",
        user_agent,
        pkg_version,
        os.os_type(),
        os.version()
    )
}

impl TunnelClientBuilder {
    pub fn authorization(&mut self, authorization: Authorization) -> &mut Self {
        self.authorization = Arc::new(StaticAuthorizationProvider(authorization));
        self
    }

    pub fn authorization_provider(
        &mut self,
        provider: impl AuthorizationProvider + 'static,
    ) -> &mut Self {
        self.authorization = Arc::new(provider);
        self
    }

    pub fn client(&mut self, client: Client) -> &mut Self {
        self.client = Some(client);
        self
    }

    pub fn service_uri(&mut self, service_uri: &str) -> &mut Self {
        self.service_uri = service_uri.to_string();
        self
    }
}

impl From<TunnelClientBuilder> for TunnelManagementClient {
    fn from(builder: TunnelClientBuilder) -> Self {
        TunnelManagementClient {
            authorization: builder.authorization,
            client: builder.client.unwrap_or_default(),
            user_agent: builder.user_agent,
            service_uri: builder.service_uri,
            api_version: builder.api_version,
        }
    }
}

fn add_query(url: &mut Url, tunnel_opts: &TunnelRequestOptions, api_version: &str) {
    if tunnel_opts.include_ports {
        url.query_pairs_mut().append_pair("includePorts", "true");
    }
    if !tunnel_opts.token_scopes.is_empty() {
        url.query_pairs_mut()
            .append_pair("tokenScopes", &tunnel_opts.token_scopes.join(","));
    }
    for (name, value) in &tunnel_opts.additional_query_parameters {
        url.query_pairs_mut().append_pair(name, value);
    }
    url.query_pairs_mut().append_pair("api-version", api_version);
}

#[cfg(test)]
mod tests {
    use regex::Regex;
    use reqwest::Url;

    use crate::management::{TunnelRequestOptions, NO_REQUEST_OPTIONS};

    #[test]
    fn new_tunnel_management_has_user_agent() {
        let builder = super::new_tunnel_management("test-caller");

        let re = Regex::new(r"^test-caller Dev-Tunnels-Service-Rust-SDK/[0-9]+\.[0-9]+\.[0-9]+.*$")
            .unwrap();
        let full_agent = builder.user_agent.to_str().unwrap();
        assert!(re.is_match(full_agent));
    }

    #[test]
    fn add_query_omits_empty_query() {
        let mut url = Url::parse("https://tunnels.api.visualstudio.com/api/v1/tunnels").unwrap();
        let options = NO_REQUEST_OPTIONS;

        super::add_query(&mut url, options, "2023-09-27-preview");

        assert!(!url.to_string().ends_with('?'));
        assert!(url.query().unwrap().contains("api-version=2023-09-27-preview"));
    }

    #[test]
    fn add_query_adds_ports_and_scopes() {
        let mut url = Url::parse("https://tunnels.api.visualstudio.com/api/v1/tunnels").unwrap();
        let options = TunnelRequestOptions {
            include_ports: true,
            token_scopes: vec!["connect".to_string()],
            ..Default::default()
        };

        super::add_query(&mut url, &options, "2023-09-27-preview");

        let query = url.query().unwrap();
        assert!(query.contains("includePorts=true"));
        assert!(query.contains("tokenScopes=connect"));
    }
}
