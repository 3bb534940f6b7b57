use std::fs::File;
use std::io::{self, BufReader, Read as _, Write as _};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd as _, RawFd};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConnection, ServerConnection, StreamOwned};

use crate::error::{TransportError, TransportResult};

/// Server identity for the accept path, loaded from PEM files.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn from_paths(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<Vec<_>, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or(TransportError::Config("no private key found in key file"))?;

        Ok(Self { certs, key })
    }
}

/// The encrypted endpoint, bound to the same socket the cleartext endpoint
/// was using before the in-place upgrade.
pub struct TlsEndpoint {
    stream: TlsStream,
    peer_public_key: Option<Vec<u8>>,
}

enum TlsStream {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

impl TlsEndpoint {
    /// Performs the client-side handshake over `socket`.
    ///
    /// On failure the socket is handed back so the caller can keep its
    /// cleartext layer unchanged.
    pub(crate) fn connect(mut socket: TcpStream, server_name: &str) -> Result<Self, (TcpStream, TransportError)> {
        let name = match ServerName::try_from(server_name.to_owned()) {
            Ok(name) => name,
            Err(e) => {
                warn!(server_name, error = %e, "invalid TLS server name");
                return Err((socket, TransportError::Config("invalid TLS server name")));
            }
        };

        let mut connection = match ClientConnection::new(client_config(), name) {
            Ok(connection) => connection,
            Err(e) => return Err((socket, TransportError::Tls(e))),
        };

        while connection.is_handshaking() {
            if let Err(e) = connection.complete_io(&mut socket) {
                return Err((socket, TransportError::Io(e)));
            }
        }

        let peer_public_key = connection
            .peer_certificates()
            .and_then(|certificates| certificates.first())
            .and_then(|cert| match extract_public_key(cert) {
                Ok(key) => Some(key),
                Err(e) => {
                    debug!(error = %e, "peer certificate public key is not extractable");
                    None
                }
            });

        Ok(Self {
            stream: TlsStream::Client(StreamOwned::new(connection, socket)),
            peer_public_key,
        })
    }

    /// Performs the server-side handshake over `socket`, presenting
    /// `identity`.
    pub(crate) fn accept(mut socket: TcpStream, identity: TlsIdentity) -> Result<Self, (TcpStream, TransportError)> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.certs, identity.key);

        let config = match config {
            Ok(config) => Arc::new(config),
            Err(e) => return Err((socket, TransportError::Tls(e))),
        };

        let mut connection = match ServerConnection::new(config) {
            Ok(connection) => connection,
            Err(e) => return Err((socket, TransportError::Tls(e))),
        };

        while connection.is_handshaking() {
            if let Err(e) = connection.complete_io(&mut socket) {
                return Err((socket, TransportError::Io(e)));
            }
        }

        Ok(Self {
            stream: TlsStream::Server(StreamOwned::new(connection, socket)),
            peer_public_key: None,
        })
    }

    /// DER SubjectPublicKey of the peer certificate, available on the client
    /// side after the handshake. NLA binds the CredSSP exchange to it.
    pub fn peer_public_key(&self) -> Option<&[u8]> {
        self.peer_public_key.as_deref()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket().as_raw_fd()
    }

    pub fn set_blocking_mode(&mut self, blocking: bool) -> io::Result<()> {
        self.socket().set_nonblocking(!blocking)
    }

    pub fn disconnect(&mut self) -> io::Result<()> {
        match &mut self.stream {
            TlsStream::Client(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
            }
            TlsStream::Server(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
            }
        }

        match self.socket().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            TlsStream::Client(stream) => stream.read(dst),
            TlsStream::Server(stream) => stream.read(dst),
        }
    }

    pub fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            TlsStream::Client(stream) => stream.write(src),
            TlsStream::Server(stream) => stream.write(src),
        }
    }

    fn socket(&self) -> &TcpStream {
        match &self.stream {
            TlsStream::Client(stream) => &stream.sock,
            TlsStream::Server(stream) => &stream.sock,
        }
    }
}

fn client_config() -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
        .with_no_client_auth();

    // This adds support for the SSLKEYLOGFILE env variable (https://wiki.wireshark.org/TLS#using-the-pre-master-secret)
    config.key_log = Arc::new(rustls::KeyLogFile::new());

    // Disable TLS resumption because it’s not supported by some services such as CredSSP.
    //
    // > The CredSSP Protocol does not extend the TLS wire protocol. TLS session resumption is not supported.
    //
    // source: https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cssp/385a7489-d46b-464c-b224-f7340e308a5c
    config.resumption = rustls::client::Resumption::disabled();

    Arc::new(config)
}

fn extract_public_key(cert: &CertificateDer<'_>) -> io::Result<Vec<u8>> {
    use x509_cert::der::Decode as _;

    let cert = x509_cert::Certificate::from_der(cert).map_err(io::Error::other)?;

    let public_key = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| io::Error::other("subject public key BIT STRING is not aligned"))?
        .to_owned();

    Ok(public_key)
}

// RDP servers routinely present self-signed certificates; when NLA is in use
// the CredSSP exchange is bound to the server public key instead.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::{pki_types, DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _: &pki_types::CertificateDer<'_>,
            _: &[pki_types::CertificateDer<'_>],
            _: &pki_types::ServerName<'_>,
            _: &[u8],
            _: pki_types::UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _: &[u8],
            _: &pki_types::CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _: &[u8],
            _: &pki_types::CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA1,
                SignatureScheme::ECDSA_SHA1_Legacy,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
                SignatureScheme::ED448,
            ]
        }
    }
}
