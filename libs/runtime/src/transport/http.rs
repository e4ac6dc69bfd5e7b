use async_trait::async_trait;
use reqwest::{Certificate, Identity};

use crate::config::HttpConfig;
use crate::error::{Error, Result};

use super::HandlerTransport;

/// POSTs `request` as `application/json` to the configured URL. Mutual TLS
/// is wired the same way `kube::Config::rustls_https_connector` builds its
/// client-identity bundle, via the teacher's transitive `rustls` stack.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    debug: bool,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(tls) = &config.tls {
            let cert_pem = std::fs::read(&tls.cert_file).map_err(Error::HandlerIo)?;
            let key_pem = std::fs::read(&tls.key_file).map_err(Error::HandlerIo)?;
            let mut identity_pem = cert_pem;
            identity_pem.extend_from_slice(&key_pem);
            let identity = Identity::from_pem(&identity_pem)
                .map_err(Error::HandlerHttpTransport)?;
            builder = builder.identity(identity);
            if let Some(ca_path) = &tls.ca_file {
                let ca_pem = std::fs::read(ca_path).map_err(Error::HandlerIo)?;
                let ca = Certificate::from_pem(&ca_pem).map_err(Error::HandlerHttpTransport)?;
                builder = builder.add_root_certificate(ca);
            }
        }
        let client = builder.build().map_err(Error::HandlerHttpTransport)?;
        Ok(Self {
            client,
            url: config.url,
            debug: config.debug,
        })
    }
}

#[async_trait]
impl HandlerTransport for HttpTransport {
    async fn invoke(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(request)
            .send()
            .await
            .map_err(Error::HandlerHttpTransport)?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(Error::HandlerHttpTransport)?
            .to_vec();

        if self.debug {
            tracing::debug!(%status, url = %self.url, "handler http response");
        }

        if !status.is_success() {
            return Err(Error::HandlerHttp {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.is_empty() {
            return Err(Error::HandlerHttp {
                status: status.as_u16(),
                body: "empty response body".into(),
            });
        }
        Ok(body)
    }
}
