//! TLS for PostgreSQL connections

use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use url::{Url, form_urlencoded};

use super::connection::DbError;

/// Transport security for database connections.
///
/// The URL's `sslmode` (`disable`, `prefer`, `require`, `verify-ca`,
/// `verify-full`, or the `ssl=true|false` shorthand) decides whether TLS is
/// attempted; these options decide how the server is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Upgrade `prefer` to `require` and refuse `disable`.
    pub require: bool,
    /// Check the server certificate chain and host name.
    pub verify_certificate: bool,
    /// Extra PEM roots trusted besides the bundled web PKI roots.
    pub ca_file: Option<PathBuf>,
}

impl TlsOptions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            require: false,
            verify_certificate: true,
            ca_file: None,
        }
    }
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// How the URL asked for TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrlSslMode {
    Disable,
    Prefer,
    Require,
    Verify,
}

/// Rewrite `ssl`/`sslmode` query parameters into the subset tokio-postgres
/// parses, returning the requested mode.
///
/// Every other query segment is passed through byte-for-byte: tokio-postgres
/// only percent-decodes, so form re-encoding (`%20` to `+`) would corrupt it.
pub(crate) fn normalize_ssl_params(url: &str) -> Result<(String, UrlSslMode), DbError> {
    let mut parsed =
        Url::parse(url).map_err(|e| DbError::Connect(format!("invalid URL: {e}")))?;

    let mut mode = UrlSslMode::Prefer;
    let mut kept: Vec<String> = Vec::new();
    for segment in parsed.query().unwrap_or_default().split('&') {
        if segment.is_empty() {
            continue;
        }
        let (key, value) = form_urlencoded::parse(segment.as_bytes())
            .next()
            .unwrap_or_default();
        match (key.as_ref(), value.as_ref()) {
            ("sslmode", "disable") | ("ssl", "false") => mode = UrlSslMode::Disable,
            ("sslmode", "prefer" | "allow") => mode = UrlSslMode::Prefer,
            ("sslmode", "require") | ("ssl", "true") => mode = UrlSslMode::Require,
            ("sslmode", "verify-ca" | "verify-full") => mode = UrlSslMode::Verify,
            ("sslmode" | "ssl", other) => {
                return Err(DbError::Connect(format!("unsupported sslmode '{other}'")));
            }
            _ => kept.push(segment.to_owned()),
        }
    }

    let sslmode = match mode {
        UrlSslMode::Disable => "disable",
        UrlSslMode::Prefer => "prefer",
        UrlSslMode::Require | UrlSslMode::Verify => "require",
    };
    kept.push(format!("sslmode={sslmode}"));
    parsed.set_query(Some(&kept.join("&")));

    Ok((parsed.into(), mode))
}

/// Build the rustls connector handed to tokio-postgres.
pub(crate) fn make_connector(options: &TlsOptions) -> Result<MakeRustlsConnect, DbError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| DbError::Connect(format!("TLS setup failed: {e}")))?;

    let config = if options.verify_certificate {
        builder
            .with_root_certificates(root_store(options)?)
            .with_no_client_auth()
    } else {
        tracing::warn!("Database TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth()
    };

    Ok(MakeRustlsConnect::new(config))
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore, DbError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &options.ca_file {
        let pem = std::fs::read(path).map_err(|e| {
            DbError::Connect(format!("failed to read CA file {}: {e}", path.display()))
        })?;
        let mut added = 0usize;
        for cert in CertificateDer::pem_slice_iter(&pem) {
            let cert = cert.map_err(|e| {
                DbError::Connect(format!("invalid CA file {}: {e}", path.display()))
            })?;
            roots
                .add(cert)
                .map_err(|e| DbError::Connect(format!("invalid CA certificate: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(DbError::Connect(format!(
                "CA file {} holds no certificates",
                path.display()
            )));
        }
    }

    Ok(roots)
}

/// Encrypts without authenticating the server. Signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
