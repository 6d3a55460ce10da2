use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use rustls::SignatureScheme;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore};
use serde::{Deserialize, Serialize};

use super::TlsError;

/// Configures the TLS options for connections to the Proxmox API.
///
/// Proxmox VE ships a self-signed certificate per cluster, so both verification
/// switches default to `false`. Turning them on requires either a CA file or a
/// certificate that chains to one of the native roots.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Absolute path to an additional CA certificate file, in PEM format(X.509).
    pub ca: Option<PathBuf>,

    /// Enables certificate verification. If enabled, certificates must not be
    /// expired and must be issued by a trusted issuer.
    #[serde(default)]
    pub verify_certificate: bool,

    /// Enables hostname verification. If enabled, the hostname used to connect to
    /// the remote host must be present in the TLS certificate presented by the
    /// remote host. Has no effect unless `verify_certificate` is enabled.
    #[serde(default)]
    pub verify_hostname: bool,
}

impl TlsConfig {
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(TlsError::TlsBuild)?;

        if !self.verify_certificate {
            warn!(message = "TLS certificate verification is disabled");

            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new(&provider)))
                .with_no_client_auth());
        }

        let certs = match &self.ca {
            Some(ca_file) => load_certs(ca_file)?,
            None => {
                let result = rustls_native_certs::load_native_certs();
                if result.certs.is_empty() && !result.errors.is_empty() {
                    warn!(
                        message = "native root CA certificate loading errors",
                        errs = ?result.errors
                    );

                    return Err(TlsError::NativeCerts(io::Error::other(
                        "native root CA certificate loading errors",
                    )));
                }

                result.certs
            }
        };

        let mut root_store = RootCertStore::empty();
        for cert in certs {
            root_store.add(cert).map_err(TlsError::AddCertToStore)?;
        }

        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), provider)
            .build()
            .map_err(TlsError::VerifierBuild)?;

        Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ServerCertVerifier {
                inner,
                verify_hostname: self.verify_hostname,
            }))
            .with_no_client_auth())
    }
}

/// Verifies the chain, and optionally forgives a hostname mismatch.
#[derive(Debug)]
struct ServerCertVerifier {
    inner: Arc<WebPkiServerVerifier>,

    verify_hostname: bool,
}

impl rustls::client::danger::ServerCertVerifier for ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            err @ Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                if self.verify_hostname {
                    err
                } else {
                    Ok(ServerCertVerified::assertion())
                }
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Trusts whatever the server presents.
#[derive(Debug)]
struct AcceptAnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyCertificate {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

fn load_certs(filename: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        note: "CA",
        filename: filename.to_path_buf(),
        err,
    })?;

    let certs = pem::parse_many(content)
        .map_err(|err| TlsError::CertificateParse {
            filename: filename.to_path_buf(),
            err: io::Error::new(io::ErrorKind::InvalidData, err),
        })?
        .into_iter()
        .map(|s| CertificateDer::from(s.into_contents()))
        .collect::<Vec<_>>();

    if certs.is_empty() {
        return Err(TlsError::MissingCertificate(filename.to_path_buf()));
    }

    Ok(certs)
}
