//! A simple async fetcher for firmware images.
//!
//! # Features
//!
//! - Async
//! - Fetch over HTTP(S), from `file://` URLs or from plain paths.
//! - Optional progress reporting.
//! - Unsuccessful HTTP responses are errors carrying the status text.

use futures::{StreamExt, channel::mpsc};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for this crate
pub enum Error {
    /// The server answered with an unsuccessful status. Holds the canonical reason, e.g. `Not Found`
    #[error("{0}")]
    Status(String),
    /// The locator uses a scheme that cannot be fetched
    #[error("Unsupported locator: {0}")]
    UnsupportedLocator(String),
    #[error("Reqwest Error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Where a locator points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Remote(Url),
    Local(PathBuf),
}

impl Source {
    /// Classify `locator`. Anything that is not an absolute URL is a path.
    pub fn parse(locator: &str) -> Result<Self> {
        let url = match Url::parse(locator) {
            Ok(x) => x,
            Err(_) => return Ok(Self::Local(PathBuf::from(locator))),
        };

        match url.scheme() {
            "http" | "https" => Ok(Self::Remote(url)),
            "file" => url
                .to_file_path()
                .map(Self::Local)
                .map_err(|_| Error::UnsupportedLocator(locator.to_string())),
            // Windows drive letters parse as a scheme
            x if x.len() == 1 => Ok(Self::Local(PathBuf::from(locator))),
            _ => Err(Error::UnsupportedLocator(locator.to_string())),
        }
    }
}

/// Simple fetcher holding a reusable HTTP client.
///
/// You do not have to wrap the Client in an Rc or Arc to reuse it, because it already uses an Arc
/// internally.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self { client }
    }

    /// Fetch the bytes behind `locator`.
    ///
    /// # Progress
    ///
    /// Progress can be optionally tracked using a [`futures::channel::mpsc`]. Values go from 0 to 1.
    pub async fn download(
        &self,
        locator: &str,
        chan: Option<mpsc::Sender<f32>>,
    ) -> Result<Vec<u8>> {
        match Source::parse(locator)? {
            Source::Remote(url) => self.download_url(url, chan).await,
            Source::Local(path) => read_file(&path, chan).await,
        }
    }

    async fn download_url(
        &self,
        url: Url,
        mut chan: Option<mpsc::Sender<f32>>,
    ) -> Result<Vec<u8>> {
        info!("Downloading {url}");
        chan_send(chan.as_mut(), 0.0);

        let response = self.client.get(url).send().await.map_err(Error::from)?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or(status.as_str());
            return Err(Error::Status(reason.to_string()));
        }

        let response_size = response.content_length().map(|x| x as usize);
        let mut data = Vec::with_capacity(response_size.unwrap_or_default());
        let mut response_stream = response.bytes_stream();

        while let Some(x) = response_stream.next().await {
            let x = x.map_err(Error::from)?;
            data.extend_from_slice(&x);

            if let Some(size) = response_size.filter(|x| *x > 0) {
                chan_send(chan.as_mut(), (data.len() as f32) / (size as f32));
            }
        }

        chan_send(chan.as_mut(), 1.0);
        debug!("Downloaded {} bytes", data.len());

        Ok(data)
    }
}

async fn read_file(path: &Path, mut chan: Option<mpsc::Sender<f32>>) -> Result<Vec<u8>> {
    info!("Reading {}", path.display());
    chan_send(chan.as_mut(), 0.0);

    let data = tokio::fs::read(path).await.map_err(|e| {
        io::Error::new(e.kind(), format!("{}: {e}", path.display()))
    })?;

    chan_send(chan.as_mut(), 1.0);
    Ok(data)
}

fn chan_send(chan: Option<&mut mpsc::Sender<f32>>, msg: f32) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn sources() {
        assert!(matches!(
            Source::parse("https://example.com/fw/app.bin"),
            Ok(Source::Remote(_))
        ));
        assert_eq!(
            Source::parse("./firmware/app.bin").unwrap(),
            Source::Local(PathBuf::from("./firmware/app.bin"))
        );
        assert!(matches!(
            Source::parse("ftp://example.com/app.bin"),
            Err(Error::UnsupportedLocator(_))
        ));
    }

    #[tokio::test]
    async fn local_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"\xe9firmware").unwrap();

        let downloader = Downloader::new();
        let locator = f.path().to_str().unwrap();
        assert_eq!(downloader.download(locator, None).await.unwrap(), b"\xe9firmware");

        let url = Url::from_file_path(f.path()).unwrap();
        assert_eq!(
            downloader.download(url.as_str(), None).await.unwrap(),
            b"\xe9firmware"
        );
    }

    #[tokio::test]
    async fn missing_file() {
        let err = Downloader::new()
            .download("/nonexistent/app.bin", None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IoError(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    async fn serve_once(response: &'static [u8]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(response).await.unwrap();
            sock.shutdown().await.unwrap();
        });

        format!("http://{addr}/firmware/app.bin")
    }

    #[tokio::test]
    async fn http_not_found() {
        let url =
            serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;

        let err = Downloader::new().download(&url, None).await.unwrap_err();
        assert!(matches!(err, Error::Status(ref x) if x == "Not Found"));
        assert_eq!(err.to_string(), "Not Found");
    }

    #[tokio::test]
    async fn http_ok_with_progress() {
        let url =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nABCD")
                .await;
        let (tx, mut rx) = mpsc::channel(16);

        let data = Downloader::new().download(&url, Some(tx)).await.unwrap();
        assert_eq!(data, b"ABCD");

        let mut last = None;
        while let Some(x) = rx.next().await {
            last = Some(x);
        }
        assert_eq!(last, Some(1.0));
    }
}
