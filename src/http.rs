use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;

use crate::error::UpdateError;

const AGENT: &str = concat!("updraft/", env!("CARGO_PKG_VERSION"));

/// Blocking client shared by the manifest client and the archive fetcher.
///
/// `timeout` bounds the whole request; `None` leaves only the connect timeout,
/// which is what long downloads want.
pub fn http_client(connect: Duration, timeout: Option<Duration>) -> Result<Client, UpdateError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, application/octet-stream, */*"),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static(AGENT));
    let client = Client::builder()
        .default_headers(headers)
        .connect_timeout(connect)
        .timeout(timeout)
        .build()?;
    Ok(client)
}
