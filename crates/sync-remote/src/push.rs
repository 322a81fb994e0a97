use async_trait::async_trait;
use futures_util::StreamExt;
use sync_core::{ChannelError, ChannelFrame, PushConnection, PushTransport};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info};
use url::Url;

use crate::{RemoteEndpoints, SharedCredentials, load_token};

/// Close code reported when the peer closed without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// [`PushTransport`] over the backend's `/ws` WebSocket.
#[derive(Clone)]
pub struct WsPushTransport {
    ws_url: Url,
    api_url: Url,
    credentials: SharedCredentials,
}

impl WsPushTransport {
    pub fn new(endpoints: &RemoteEndpoints, credentials: SharedCredentials) -> Self {
        Self {
            ws_url: endpoints.ws_url.clone(),
            api_url: endpoints.api_url.clone(),
            credentials,
        }
    }

    pub fn ws_url(&self) -> &Url {
        &self.ws_url
    }

    fn build_request(&self) -> Result<Request, ChannelError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::Connect(err.to_string()))?;

        let token = load_token(&self.credentials, &self.api_url)
            .map_err(|err| ChannelError::Connect(err.message))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| ChannelError::Connect(format!("invalid token header: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn open(&self) -> Result<Box<dyn PushConnection>, ChannelError> {
        let request = self.build_request()?;
        debug!(url = %self.ws_url, "opening push channel");
        let (stream, response) = connect_async(request)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        info!(url = %self.ws_url, status = %response.status(), "push channel handshake complete");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<ChannelFrame, ChannelError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(Message::Text(text)) => ChannelFrame::Text(text.to_string()),
                Ok(Message::Binary(bytes)) => ChannelFrame::Binary(bytes.to_vec()),
                Ok(Message::Close(frame)) => ChannelFrame::Closed {
                    code: frame.map_or(NO_STATUS_RECEIVED, |frame| u16::from(frame.code)),
                },
                // Pongs are queued by tungstenite and flushed on the next read.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(err) => return Some(Err(ChannelError::Transport(err.to_string()))),
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(ChannelError::Transport(err.to_string())),
        }
    }
}
