use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::Config;

/// Build the TLS acceptor for the configured PEM pair. Plaintext when
/// neither path is set; a half-configured pair is a startup error.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => load_acceptor(cert, key).map(Some),
        (Some(_), None) => Err(missing("ROOMBOOK_TLS_KEY", "ROOMBOOK_TLS_CERT")),
        (None, Some(_)) => Err(missing("ROOMBOOK_TLS_CERT", "ROOMBOOK_TLS_KEY")),
    }
}

fn missing(absent: &str, present: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{absent} must be set together with {present}"))
}

fn open_pem(path: &str) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
}

fn load_acceptor(cert_path: &str, key_path: &str) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open_pem(cert_path)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("{cert_path}: no certificates found"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut open_pem(key_path)?)?.ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, format!("{key_path}: no private key found"))
    })?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_when_unset() {
        let acceptor = acceptor_from_config(&Config::default()).unwrap();
        assert!(acceptor.is_none());
    }

    #[test]
    fn half_configured_pair_is_rejected() {
        let config = Config {
            tls_cert: Some("/tmp/roombook-cert.pem".into()),
            ..Config::default()
        };
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("ROOMBOOK_TLS_KEY"));
    }

    #[test]
    fn missing_cert_file_names_the_path() {
        let config = Config {
            tls_cert: Some("/nonexistent/roombook-cert.pem".into()),
            tls_key: Some("/nonexistent/roombook-key.pem".into()),
            ..Config::default()
        };
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/nonexistent/roombook-cert.pem"));
    }
}
