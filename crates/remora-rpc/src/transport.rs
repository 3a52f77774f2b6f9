//! Framing shared by clients and servers.
//!
//! Both plain TCP and TLS streams are wrapped in a length-delimited frame
//! codec and serialized with bincode, so the same tarpc transport works
//! over either.

use crate::protocol::{RemoteObject, RemoteObjectClient};
use crate::server::Dispatcher;
use futures::StreamExt;
use remora_core::Endpoint;
use rustls_pki_types::ServerName;
use tarpc::server::{BaseChannel, Channel};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Open a tarpc client connection to `endpoint`.
///
/// Errors are returned as text; callers classify every connect failure
/// as retryable.
pub(crate) async fn connect(
    endpoint: &Endpoint,
    connect_timeout: std::time::Duration,
    max_in_flight: usize,
    tls: Option<&TlsConnector>,
) -> Result<RemoteObjectClient, String> {
    let stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((endpoint.host(), endpoint.port())),
    )
    .await
    .map_err(|_| "connection timeout".to_string())?
    .map_err(|e| e.to_string())?;
    stream.set_nodelay(true).map_err(|e| e.to_string())?;

    if !endpoint.is_secure() {
        return Ok(spawn_client(stream, max_in_flight));
    }

    let connector = tls.ok_or_else(|| {
        "endpoint requires TLS but no trust anchors are configured".to_string()
    })?;
    let server_name = ServerName::try_from(endpoint.host().to_string())
        .map_err(|e| format!("invalid TLS server name: {}", e))?;
    let stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| "TLS handshake timeout".to_string())?
        .map_err(|e| format!("TLS handshake failed: {}", e))?;
    Ok(spawn_client(stream, max_in_flight))
}

fn spawn_client<S>(io: S, max_in_flight: usize) -> RemoteObjectClient
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(io, LengthDelimitedCodec::new());
    let transport = tarpc::serde_transport::new(framed, Bincode::default());

    let mut config = tarpc::client::Config::default();
    config.max_in_flight_requests = max_in_flight;
    RemoteObjectClient::new(config, transport).spawn()
}

/// Serve requests arriving on one connection until the peer hangs up or
/// `cancel` fires.
///
/// Every request runs on its own task, so slow handlers do not block other
/// requests multiplexed on the same connection.
pub(crate) async fn serve_connection<S>(io: S, service: Dispatcher, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(io, LengthDelimitedCodec::new());
    let transport = tarpc::serde_transport::new(framed, Bincode::default());

    let requests = BaseChannel::with_defaults(transport)
        .execute(service.serve())
        .for_each(|response| async move {
            tokio::spawn(response);
        });

    tokio::select! {
        _ = requests => {}
        _ = cancel.cancelled() => {}
    }
}
