use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Indexed, KvEntry, KvStore, PutMode, QueryOptions};
use crate::config::ConsulConfig;
use crate::{Error, Result};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
/// Slack on top of the server wait so the client never gives up first.
const BLOCKING_MARGIN: Duration = Duration::from_secs(5);

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    create_index: u64,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Serialize, Debug)]
struct SessionRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: &'static str,
}

#[derive(Deserialize, Debug)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// HTTP client for the agent's `/v1/kv` and `/v1/session` endpoints.
pub struct ConsulClient {
    base: Url,
    token: Option<String>,
    http: Client,
    request_timeout: Duration,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let base = Url::parse(&config.address)
            .map_err(|err| Error::InvalidSpec(format!("consul address {}: {err}", config.address)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidSpec(format!(
                "consul address {} cannot carry a path",
                config.address
            )));
        }
        let http = Client::builder().build()?;
        Ok(Self {
            base,
            token: config.token.clone(),
            http,
            request_timeout: config.request_timeout,
        })
    }

    fn endpoint(&self, route: &[&str], key: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(route);
            path.extend(key.trim_start_matches('/').split('/'));
        }
        url
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> RequestBuilder {
        debug!("{method} {url}");
        let builder = self.http.request(method, url).timeout(timeout);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn read(
        &self,
        key: &str,
        recurse: bool,
        opts: &QueryOptions,
    ) -> Result<Indexed<Vec<KvEntry>>> {
        let mut url = self.endpoint(&["v1", "kv"], key);
        append_read_query(&mut url, opts, recurse);
        let response = self
            .request(Method::GET, url, read_timeout(opts, self.request_timeout))
            .send()
            .await?;
        let index = parse_index(&response)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Indexed::new(Vec::new(), index));
        }
        let body = ensure_success(response).await?.bytes().await?;
        Ok(Indexed::new(decode_entries(&body)?, index))
    }
}

#[async_trait]
impl KvStore for ConsulClient {
    async fn get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvEntry>>> {
        let result = self.read(key, false, &opts).await?;
        Ok(result.map(|entries| entries.into_iter().find(|entry| entry.key == key)))
    }

    async fn get_all(&self, prefix: &str, opts: QueryOptions) -> Result<Indexed<Vec<KvEntry>>> {
        self.read(prefix, true, &opts).await
    }

    async fn put(&self, key: &str, value: &[u8], mode: PutMode) -> Result<bool> {
        let mut url = self.endpoint(&["v1", "kv"], key);
        match &mode {
            PutMode::Plain => {}
            PutMode::Acquire(session) => {
                url.query_pairs_mut().append_pair("acquire", session);
            }
            PutMode::Release(session) => {
                url.query_pairs_mut().append_pair("release", session);
            }
        }
        let response = self
            .request(Method::PUT, url, self.request_timeout)
            .body(value.to_vec())
            .send()
            .await?;
        let accepted = ensure_success(response).await?.json::<bool>().await?;
        Ok(accepted)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "kv"], key);
        let response = self
            .request(Method::DELETE, url, self.request_timeout)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String> {
        let url = self.endpoint(&["v1", "session"], "create");
        let body = SessionRequest {
            name,
            ttl: format_duration(ttl),
            behavior: "release",
        };
        let response = self
            .request(Method::PUT, url, self.request_timeout)
            .json(&body)
            .send()
            .await?;
        let created = ensure_success(response).await?.json::<SessionCreated>().await?;
        Ok(created.id)
    }

    async fn renew_session(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "session", "renew"], id);
        let response = self
            .request(Method::PUT, url, self.request_timeout)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        ensure_success(response).await?;
        Ok(())
    }

    async fn destroy_session(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "session", "destroy"], id);
        let response = self
            .request(Method::PUT, url, self.request_timeout)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn append_read_query(url: &mut Url, opts: &QueryOptions, recurse: bool) {
    let mut pairs: Vec<(&str, String)> = Vec::new();
    if recurse {
        pairs.push(("recurse", "true".to_string()));
    }
    if opts.index > 0 {
        pairs.push(("index", opts.index.to_string()));
        if let Some(wait) = opts.wait {
            pairs.push(("wait", format_duration(wait)));
        }
    }
    if let Some(dc) = &opts.datacenter {
        pairs.push(("dc", dc.clone()));
    }
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
}

/// The agent may hold a blocking read for `wait` plus up to `wait / 16` of jitter.
fn read_timeout(opts: &QueryOptions, default: Duration) -> Duration {
    match opts.wait {
        Some(wait) if opts.index > 0 => wait + wait / 16 + BLOCKING_MARGIN,
        _ => default,
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

fn parse_index(response: &Response) -> Result<u64> {
    let Some(raw) = response.headers().get(INDEX_HEADER) else {
        return Ok(0);
    };
    raw.to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::Decode(format!("bad {INDEX_HEADER} header: {raw:?}")))
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

fn decode_entries(body: &[u8]) -> Result<Vec<KvEntry>> {
    let raw: Vec<RawEntry> =
        serde_json::from_slice(body).map_err(|err| Error::Decode(err.to_string()))?;
    raw.into_iter().map(decode_entry).collect()
}

fn decode_entry(raw: RawEntry) -> Result<KvEntry> {
    let value = match raw.value.as_deref() {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|err| Error::Decode(format!("value of {}: {err}", raw.key)))?,
        None => Vec::new(),
    };
    Ok(KvEntry {
        key: raw.key,
        value,
        create_index: raw.create_index,
        modify_index: raw.modify_index,
        lock_index: raw.lock_index,
        session: raw.session.filter(|session| !session.is_empty()),
    })
}
