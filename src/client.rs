//! Feed retrieval.
//!
//! Fetches the KOERI listing over blocking HTTP (reqwest with rustls), or
//! reads a saved copy from disk or stdin, and returns the candidate rows.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, instrument, warn};

use crate::errors::{Result, SeismoalarmError};

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 20;

/// User agent string for feed requests.
const USER_AGENT: &str = concat!("seismoalarm/", env!("CARGO_PKG_VERSION"));

/// HTTP client for one feed URL.
pub struct FeedClient {
    client: Client,
    url: String,
}

impl FeedClient {
    /// Create a client for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, url: url.into() })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the listing and return its data rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the server answers with an
    /// error status, or the document has no usable listing.
    #[instrument(skip(self), fields(url = %self.url))]
    pub fn fetch_rows(&self) -> Result<Vec<String>> {
        debug!("fetching feed");

        let response = self.client.get(&self.url).send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SeismoalarmError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let document = response.text()?;
        let rows = extract_rows(&document)?;
        debug!("fetched {} rows", rows.len());
        Ok(rows)
    }
}

/// Where a run reads its feed from.
pub enum FeedSource {
    Http(FeedClient),
    File(PathBuf),
    Stdin,
}

impl FeedSource {
    /// Pick a source from CLI input: `-` is stdin, any other value a file;
    /// without input the URL is fetched.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_args(input: Option<PathBuf>, url: &str) -> Result<Self> {
        Ok(match input {
            Some(path) if path.as_os_str() == "-" => Self::Stdin,
            Some(path) => Self::File(path),
            None => Self::Http(FeedClient::new(url)?),
        })
    }

    /// Human-readable origin for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Http(c) => c.url().to_string(),
            Self::File(p) => p.display().to_string(),
            Self::Stdin => "stdin".to_string(),
        }
    }

    /// Read the data rows from this source.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or holds no listing.
    pub fn rows(&self) -> Result<Vec<String>> {
        match self {
            Self::Http(client) => client.fetch_rows(),
            Self::File(path) => extract_rows(&std::fs::read_to_string(path)?),
            Self::Stdin => {
                let mut document = String::new();
                std::io::stdin().read_to_string(&mut document)?;
                extract_rows(&document)
            }
        }
    }
}

/// Pull data rows out of a listing document.
///
/// HTML documents contribute the content of their `<pre>` block; anything
/// else is taken as plain rows. Only lines that start with a digit are kept,
/// which drops titles, column headers and separators.
///
/// # Errors
///
/// Returns [`SeismoalarmError::Feed`] for a `<pre>` block that never closes.
pub fn extract_rows(document: &str) -> Result<Vec<String>> {
    let lower = document.to_ascii_lowercase();
    let body = match lower.find("<pre") {
        Some(open) => {
            let start = lower[open..]
                .find('>')
                .map(|i| open + i + 1)
                .ok_or_else(|| SeismoalarmError::Feed("malformed <pre> tag".into()))?;
            let end = lower[start..]
                .find("</pre>")
                .map(|i| start + i)
                .ok_or_else(|| SeismoalarmError::Feed("unterminated <pre> block".into()))?;
            &document[start..end]
        }
        None => document,
    };

    let rows: Vec<String> = body
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with(|c: char| c.is_ascii_digit()))
        .map(ToString::to_string)
        .collect();

    if rows.is_empty() {
        warn!("feed document contains no data rows");
    }
    Ok(rows)
}
