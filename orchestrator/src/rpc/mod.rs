pub mod protocol;
mod session;

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::AppContext;
use crate::config::ServerSettings;

/// Accept loop for the device-facing RPC surface, one task per
/// connection. Runs until the token cancels.
pub async fn serve(
    ctx: Arc<AppContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        addr = %listener.local_addr()?,
        tls = tls.is_some(),
        "device RPC listening"
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let result = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => {
                                session::handle_connection(ctx, stream, peer, cancel).await
                            }
                            Err(err) => {
                                warn!(%peer, "TLS handshake failed: {err}");
                                return;
                            }
                        },
                        None => session::handle_connection(ctx, stream, peer, cancel).await,
                    };
                    if let Err(err) = result {
                        warn!(%peer, "device connection ended with error: {err:#}");
                    }
                });
            }
        }
    }
}

/// Build the TLS acceptor when the config asks for one.
pub fn maybe_tls_acceptor(settings: &ServerSettings) -> Result<Option<TlsAcceptor>> {
    if !settings.tls_enabled {
        return Ok(None);
    }
    let (Some(cert_path), Some(key_path)) = (&settings.tls_cert_path, &settings.tls_key_path)
    else {
        bail!("TLS is enabled but --tls-cert-path/--tls-key-path are not set");
    };

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).with_context(|| format!("failed to open {cert_path:?}"))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .with_context(|| format!("failed to parse certificates in {cert_path:?}"))?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).with_context(|| format!("failed to open {key_path:?}"))?,
    ))?
    .ok_or_else(|| anyhow!("no private key found in {key_path:?}"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
