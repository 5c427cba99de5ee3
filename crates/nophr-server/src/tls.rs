//! TLS setup for the Gemini listener.

use std::io::BufReader;
use std::sync::Arc;

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use nophr_config::GeminiTls;

const LOG_TARGET: &str = "nophr::tls";

#[derive(Debug, Snafu)]
pub enum TlsError {
    #[snafu(display("Cannot read {path}: {source}"))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("No certificates found in {path}"))]
    EmptyCertChain { path: String },
    #[snafu(display("No private key found in {path}"))]
    MissingKey { path: String },
    #[snafu(display("Certificate generation failed: {source}"))]
    Generate { source: rcgen::Error },
    #[snafu(display("TLS configuration rejected: {source}"))]
    Config {
        source: tokio_rustls::rustls::Error,
    },
    #[snafu(display(
        "Gemini TLS needs either cert_path+key_path or tls.auto_generate = true"
    ))]
    NotConfigured,
}

pub fn build_acceptor(tls: &GeminiTls, host: &str) -> Result<TlsAcceptor, TlsError> {
    let (certs, key) = match (&tls.cert_path, &tls.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_path_display = cert_path.display().to_string();
            let cert_file = std::fs::File::open(cert_path).context(ReadFileSnafu {
                path: cert_path_display.clone(),
            })?;
            let certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut BufReader::new(cert_file))
                    .collect::<Result<_, _>>()
                    .context(ReadFileSnafu {
                        path: cert_path_display.clone(),
                    })?;
            if certs.is_empty() {
                return EmptyCertChainSnafu {
                    path: cert_path_display,
                }
                .fail();
            }

            let key_path_display = key_path.display().to_string();
            let key_file = std::fs::File::open(key_path).context(ReadFileSnafu {
                path: key_path_display.clone(),
            })?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .context(ReadFileSnafu {
                    path: key_path_display.clone(),
                })?
                .context(MissingKeySnafu {
                    path: key_path_display,
                })?;
            info!(target: LOG_TARGET, "Loaded TLS certificate from disk");
            (certs, key)
        }
        _ if tls.auto_generate => {
            let generated =
                rcgen::generate_simple_self_signed(vec![host.to_owned()]).context(GenerateSnafu)?;
            let cert = generated.cert.der().clone();
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                generated.key_pair.serialize_der(),
            ));
            info!(target: LOG_TARGET, host, "Generated self-signed TLS certificate");
            (vec![cert], key)
        }
        _ => return NotConfiguredSnafu.fail(),
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context(ConfigSnafu)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
