use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use shared::{
    domain::{GroupId, MessageId},
    error::{ApiError, ApiException},
    protocol::{ChangeEvent, MessagePatch, MessageRow, NewMessageRow},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::SyncSettings,
    store::{ChangeFeed, ChangeStream, MessageStore},
};

/// `MessageStore` and `ChangeFeed` over the dev backend's REST and WebSocket
/// endpoints.
#[derive(Clone)]
pub struct HttpMessageStore {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpMessageStore {
    pub fn new(server_url: &str, api_key: Option<String>) -> Result<Self> {
        let trimmed = server_url.trim().trim_end_matches('/');
        let base_url = Url::parse(&format!("{trimmed}/"))
            .with_context(|| format!("invalid server_url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            bail!("server_url must start with http:// or https://");
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key,
        })
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        Self::new(&settings.server_url, settings.api_key.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path: {path}"))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn feed_url(&self, group_id: GroupId) -> Result<Url> {
        let mut url = self.endpoint("ws")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|()| anyhow!("cannot derive websocket url from {}", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("group_id", &group_id.0.to_string());
        Ok(url)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow::Error::new(ApiException::from(api_error))
            .context(format!("server responded with {status}"))),
        Err(_) => Err(anyhow!("server responded with {status}: {body}")),
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn insert(&self, message: NewMessageRow) -> Result<MessageRow> {
        let url = self.endpoint(&format!("groups/{}/messages", message.group_id))?;
        let response = self.request(Method::POST, url).json(&message).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn select_by_group(&self, group_id: GroupId) -> Result<Vec<MessageRow>> {
        let url = self.endpoint(&format!("groups/{group_id}/messages"))?;
        let response = self.request(Method::GET, url).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn select_by_id(&self, message_id: MessageId) -> Result<Option<MessageRow>> {
        let url = self.endpoint(&format!("messages/{message_id}"))?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(ensure_success(response).await?.json().await?))
    }

    async fn update(&self, message_id: MessageId, patch: MessagePatch) -> Result<MessageRow> {
        let url = self.endpoint(&format!("messages/{message_id}"))?;
        let response = self.request(Method::PATCH, url).json(&patch).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn delete(&self, message_id: MessageId) -> Result<()> {
        let url = self.endpoint(&format!("messages/{message_id}"))?;
        let response = self.request(Method::DELETE, url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for HttpMessageStore {
    async fn subscribe(&self, group_id: GroupId) -> Result<ChangeStream> {
        let ws_url = self.feed_url(group_id)?;
        let mut request = ws_url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
        }
        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, ws_reader) = ws_stream.split();
        debug!(group_id = group_id.0, "change feed connected");

        let events = futures::stream::unfold(ws_reader, move |mut ws_reader| async move {
            loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ChangeEvent>(&text) {
                            Ok(event) if event.group_id() == group_id => {
                                return Some((event, ws_reader))
                            }
                            Ok(_) => continue,
                            Err(err) => {
                                warn!(group_id = group_id.0, %err, "invalid change event");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(group_id = group_id.0, %err, "websocket receive failed");
                        return None;
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}
