//! Opens the realtime WebSocket to the AI model.

use crate::config::Config;
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::info;

pub type RealtimeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The model is selected through the socket URL's query string.
pub fn realtime_endpoint(config: &Config) -> String {
    format!("{}?model={}", config.realtime_url, config.realtime_model)
}

fn build_request(config: &Config) -> Result<Request> {
    let mut request = realtime_endpoint(config)
        .into_client_request()
        .context("Invalid realtime URL")?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.openai_api_key.expose_secret()))
        .context("API key is not a valid header value")?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    request
        .headers_mut()
        .insert("openai-beta", HeaderValue::from_static("realtime=v1"));
    Ok(request)
}

/// Connects to the AI realtime endpoint, giving up after `connect_timeout`.
pub async fn connect(config: &Config) -> Result<RealtimeStream> {
    let request = build_request(config)?;
    let (stream, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .with_context(|| {
            format!(
                "OpenAI Realtime handshake did not finish within {:?}",
                config.connect_timeout
            )
        })?
        .context("Failed to connect to OpenAI Realtime WebSocket")?;
    info!(model = %config.realtime_model, "Connected to OpenAI Realtime API.");
    Ok(stream)
}
