//! # TLS Transport Layer
//!
//! Optional TLS wrapping for the TCP session stream.
//!
//! The server presents a PEM certificate chain with a PKCS#8 key, either
//! plain or password-encrypted (`ENCRYPTED PRIVATE KEY`, PBES2). The client validates the chain against a configured CA bundle, or
//! the platform's native roots when none is configured. Both sides use the
//! rustls safe defaults, which means TLS 1.2 or newer with modern cipher
//! suites. A validation failure aborts the connection; there is no bypass.
//!
//! ## Responsibilities
//! - Load certificates and keys from PEM files, decrypting keys when a password is set
//! - Build `TlsAcceptor` / `TlsConnector` instances
//! - Generate throwaway self-signed certificates for development and tests

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use pkcs8::pkcs5::pbes2;
use pkcs8::{Document, EncryptedPrivateKeyInfo, LineEnding, PrivateKeyInfo};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::error::{ProtocolError, Result};
use crate::transport::tcp::BoxedStream;

/// PEM label of a PKCS#8 `EncryptedPrivateKeyInfo`
const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// PBKDF2-SHA256 rounds used when encrypting generated keys
const PBKDF2_ROUNDS: u32 = 10_000;

/// TLS server configuration
#[derive(Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    password: Option<Zeroizing<String>>,
}

impl fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerConfig")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("encrypted_key", &self.password.is_some())
            .finish()
    }
}

impl TlsServerConfig {
    /// Create a new TLS server configuration
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            password: None,
        }
    }

    /// Decrypt the private key with this password
    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Build from the security section of the configuration.
    pub fn from_security(security: &SecurityConfig) -> Result<Self> {
        let config = match (&security.certificate_path, &security.private_key_path) {
            (Some(cert), Some(key)) => Self::new(cert, key),
            _ => {
                return Err(ProtocolError::ConfigError(
                    "TLS requires certificate_path and private_key_path".into(),
                ))
            }
        };
        Ok(match &security.certificate_password {
            Some(password) => config.with_password(password.clone()),
            None => config,
        })
    }

    /// Generate a self-signed certificate for development/testing purposes
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    /// Like [`generate_self_signed`](Self::generate_self_signed), with the key
    /// written as a PBES2 (PBKDF2-SHA256, AES-256-CBC) encrypted PKCS#8 PEM.
    pub fn generate_self_signed_encrypted<P: AsRef<Path>>(
        cert_path: P,
        key_path: P,
        password: &str,
    ) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let der = Zeroizing::new(cert.signing_key.serialize_der());
        let info = PrivateKeyInfo::try_from(der.as_slice())
            .map_err(|e| io::Error::other(format!("Key encoding error: {e}")))?;

        let mut salt = [0u8; 16];
        let mut iv = [0u8; 16];
        getrandom::fill(&mut salt)
            .and_then(|_| getrandom::fill(&mut iv))
            .map_err(|e| io::Error::other(format!("RNG failure: {e}")))?;
        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ROUNDS, &salt, &iv)
            .map_err(|e| io::Error::other(format!("Key encryption error: {e}")))?;
        let encrypted = info
            .encrypt_with_params(params, password.as_bytes())
            .map_err(|e| io::Error::other(format!("Key encryption error: {e}")))?;
        let pem = encrypted
            .to_pem(ENCRYPTED_KEY_LABEL, LineEnding::LF)
            .map_err(|e| io::Error::other(format!("Key encoding error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(pem.as_bytes())?;

        Ok(Self::new(cert_path, key_path).with_password(password))
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certificates(&self.cert_path)?;
        if cert_chain.is_empty() {
            return Err(ProtocolError::TlsError("No certificates found".into()));
        }

        let private_key = match &self.password {
            Some(password) => load_encrypted_key(&self.key_path, password)?,
            None => load_plain_key(&self.key_path)?,
        };

        // with_safe_defaults() restricts to TLS 1.2+
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// TLS Client Configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    ca_path: Option<String>,
}

impl TlsClientConfig {
    /// Create a new TLS client configuration trusting the native roots
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            ca_path: None,
        }
    }

    /// Trust only the certificates in this PEM bundle
    pub fn with_ca_file<S: Into<String>>(mut self, ca_path: S) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    pub fn from_security(security: &SecurityConfig) -> Self {
        let config = Self::new(security.server_name.clone());
        match &security.ca_certificate_path {
            Some(ca) => config.with_ca_file(ca.clone()),
            None => config,
        }
    }

    /// Load the TLS client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let mut root_store = RootCertStore::empty();

        match &self.ca_path {
            Some(ca_path) => {
                for cert in load_certificates(ca_path)? {
                    root_store.add(&cert).map_err(|e| {
                        ProtocolError::TlsError(format!("Failed to add CA certificate: {e}"))
                    })?;
                }
                debug!(path = %ca_path, "Trusting configured CA bundle");
            }
            None => {
                let native_certs = rustls_native_certs::load_native_certs().map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to load native certs: {e}"))
                })?;
                for cert in native_certs {
                    root_store.add(&Certificate(cert.0)).map_err(|e| {
                        ProtocolError::TlsError(format!("Failed to add cert to root store: {e}"))
                    })?;
                }
            }
        }

        if root_store.is_empty() {
            return Err(ProtocolError::TlsError("No trusted root certificates".into()));
        }

        Ok(ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }
}

fn load_plain_key(path: &str) -> Result<PrivateKey> {
    let key_file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;

    if keys.is_empty() {
        return Err(ProtocolError::TlsError(
            "No unencrypted PKCS#8 private key found; set certificate_password for an encrypted key"
                .into(),
        ));
    }
    Ok(PrivateKey(keys.swap_remove(0)))
}

fn load_encrypted_key(path: &str, password: &str) -> Result<PrivateKey> {
    let pem = Zeroizing::new(
        std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?,
    );
    let (label, document) = Document::from_pem(&pem)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to parse private key: {e}")))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(ProtocolError::TlsError(format!(
            "Expected an {ENCRYPTED_KEY_LABEL} block, found {label}"
        )));
    }

    let encrypted = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| ProtocolError::TlsError(format!("Failed to parse private key: {e}")))?;
    let decrypted = encrypted
        .decrypt(password.as_bytes())
        .map_err(|_| ProtocolError::TlsError("Failed to decrypt private key".into()))?;
    debug!(%path, "Decrypted private key");
    Ok(PrivateKey(decrypted.as_bytes().to_vec()))
}

fn load_certificates(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);
    let chain = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Run the server side of the handshake.
#[instrument(skip_all)]
pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<BoxedStream> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))?;
    Ok(Box::new(tls_stream))
}

/// Run the client side of the handshake, validating the server chain.
#[instrument(skip_all)]
pub async fn connect(
    connector: &TlsConnector,
    server_name: ServerName,
    stream: TcpStream,
) -> Result<BoxedStream> {
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))?;
    Ok(Box::new(tls_stream))
}
