use reqwest::blocking::Client;
use reqwest::header::CONTENT_LENGTH;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::UpdateError;
use crate::http::http_client;

/// Bytes read from the response per chunk.
pub const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Streams an update package to disk.
pub struct ArchiveFetcher {
    client: Client,
}

impl ArchiveFetcher {
    /// `connect_timeout` bounds connection setup; the body itself may take as
    /// long as it needs, since cancellation is checked between chunks.
    pub fn new(connect_timeout: Duration) -> Result<Self, UpdateError> {
        Ok(ArchiveFetcher {
            client: http_client(connect_timeout, None)?,
        })
    }

    /// Declared size of `url` from a HEAD request, if the server gives one.
    pub fn content_length(&self, url: &str) -> Option<u64> {
        let resp = self.client.head(url).send().ok()?.error_for_status().ok()?;
        // the body of a HEAD response is empty, so read the header itself
        resp.headers()
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
    }

    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// `on_progress(downloaded, total)` fires after every chunk written;
    /// `total` is `None` when the server sent no content length. On
    /// cancellation the partial file is left for the caller to delete.
    ///
    /// # Errors
    /// - `Network` for request/stream failures.
    /// - `IncompletePayload` when a declared content length is not met.
    /// - `Cancelled` if `cancel` was set between chunks.
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<u64, UpdateError> {
        cancel.check()?;
        let mut resp = self.client.get(url).send()?.error_for_status()?;
        let total = resp.content_length();
        info!(url, ?total, "downloading update package");

        let mut out = File::create(dest).map_err(|e| UpdateError::from_io(dest, e))?;
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let mut written: u64 = 0;
        loop {
            cancel.check()?;
            let n = match resp.read(&mut buf) {
                Ok(n) => n,
                // the connection closed before the declared length arrived
                Err(e) if total.is_some_and(|expected| written < expected) => {
                    debug!(written, error = %e, "body ended early");
                    break;
                }
                Err(e) => {
                    return Err(UpdateError::Network(format!(
                        "reading response body: {}",
                        e
                    )));
                }
            };
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| UpdateError::from_io(dest, e))?;
            written += n as u64;
            on_progress(written, total);
        }
        out.flush().map_err(|e| UpdateError::from_io(dest, e))?;
        debug!(written, "download stream finished");

        if let Some(expected) = total
            && expected != written
        {
            return Err(UpdateError::IncompletePayload {
                path: dest.to_path_buf(),
                expected,
                actual: written,
            });
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::tempdir;

    fn fetcher() -> ArchiveFetcher {
        ArchiveFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn streams_body_and_reports_progress() {
        let server = MockServer::start();
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        server.mock(|when, then| {
            when.method(GET).path("/pkg.zip");
            then.status(200).body(&body);
        });

        let td = tempdir().unwrap();
        let dest = td.path().join("pkg.zip");
        let mut calls = Vec::new();
        let n = fetcher()
            .download(
                &server.url("/pkg.zip"),
                &dest,
                &mut |done, total| calls.push((done, total)),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(n, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!calls.is_empty());
        let (last_done, last_total) = *calls.last().unwrap();
        assert_eq!(last_done, body.len() as u64);
        assert_eq!(last_total, Some(body.len() as u64));
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn cancellation_stops_between_chunks() {
        let server = MockServer::start();
        let body = vec![7u8; 512 * 1024];
        server.mock(|when, then| {
            when.method(GET).path("/pkg.zip");
            then.status(200).body(&body);
        });

        let td = tempdir().unwrap();
        let dest = td.path().join("pkg.zip");
        let token = CancelToken::new();
        let cancel_from_progress = token.clone();
        let err = fetcher()
            .download(
                &server.url("/pkg.zip"),
                &dest,
                &mut |_, _| {
                    let _ = cancel_from_progress.cancel();
                },
                &token,
            )
            .unwrap_err();

        assert!(matches!(err, UpdateError::Cancelled));
        let partial = std::fs::metadata(&dest).unwrap().len();
        assert!(partial < body.len() as u64);
    }

    #[test]
    fn http_error_is_network_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing.zip");
            then.status(404);
        });
        let td = tempdir().unwrap();
        let err = fetcher()
            .download(
                &server.url("/missing.zip"),
                &td.path().join("x.zip"),
                &mut |_, _| {},
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
    }

    #[test]
    fn already_cancelled_token_sends_no_request() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET).path("/pkg.zip");
            then.status(200).body("x");
        });
        let token = CancelToken::new();
        token.cancel().unwrap();
        let td = tempdir().unwrap();
        let err = fetcher()
            .download(
                &server.url("/pkg.zip"),
                &td.path().join("x.zip"),
                &mut |_, _| {},
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        m.assert_hits(0);
    }

    #[test]
    fn content_length_is_none_when_head_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/pkg.zip");
            then.status(405);
        });
        assert_eq!(fetcher().content_length(&server.url("/pkg.zip")), None);
    }

    #[test]
    fn short_body_is_incomplete_payload() {
        use std::io::{BufRead, BufReader};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n")
                .unwrap();
            stream.write_all(&[9u8; 10]).unwrap();
            stream.flush().unwrap();
        });

        let td = tempdir().unwrap();
        let dest = td.path().join("pkg.zip");
        let err = fetcher()
            .download(
                &format!("http://{}/pkg.zip", addr),
                &dest,
                &mut |_, _| {},
                &CancelToken::new(),
            )
            .unwrap_err();
        server.join().unwrap();

        match err {
            UpdateError::IncompletePayload {
                path,
                expected,
                actual,
            } => {
                assert_eq!(path, dest);
                assert_eq!(expected, 1000);
                assert!(actual <= 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
