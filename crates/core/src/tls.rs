use std::{error::Error, fs::File, io::BufReader};

use rustls::{pki_types::CertificateDer, ClientConfig, RootCertStore};
use rustls_pemfile::certs;

/// Loads the TLS client configuration used to reach the mail server.
///
/// Roots come from the PEM bundle at `ca_file` when given (private or
/// self-signed deployments), from the bundled webpki roots otherwise.
pub fn load_tls_client_config(
    ca_file: Option<&str>,
) -> Result<ClientConfig, Box<dyn Error + Send + Sync>> {
    let mut root_store = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            let ca_certs = load_ca_certs(path)?;
            if ca_certs.is_empty() {
                return Err(format!("No certificates found in {path}").into());
            }
            let (added, ignored) = root_store.add_parsable_certificates(ca_certs);
            if added == 0 {
                return Err(format!("No usable certificates in {path} ({ignored} ignored)").into());
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

fn load_ca_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Box<dyn Error + Send + Sync>> {
    let file = &mut BufReader::new(File::open(path)?);
    let ca_certs = certs(file)?
        .into_iter()
        .map(CertificateDer::from)
        .collect::<Vec<_>>();
    Ok(ca_certs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_load_webpki_roots() {
        assert!(load_tls_client_config(None).is_ok());
    }

    #[test]
    fn test_load_missing_ca_file() {
        assert!(load_tls_client_config(Some("/nonexistent/ca.pem")).is_err());
    }

    #[test]
    fn test_load_ca_file_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let path = file.path().to_str().unwrap();
        let error = load_tls_client_config(Some(path)).unwrap_err();
        assert!(error.to_string().starts_with("No certificates found"));
    }
}
