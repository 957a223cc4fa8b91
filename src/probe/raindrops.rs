use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};

use crate::error::{Error, Result};

const USER_AGENT: &str = "raingutter";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Counters parsed from one raindrops response body.
///
/// Each field is present iff its label appeared in the body with a
/// parseable value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaindropsSample {
    pub calling: Option<u64>,
    pub writing: Option<u64>,
    pub active: Option<u64>,
    pub queued: Option<u64>,
}

/// Socket-stats source backed by the legacy raindrops middleware
/// endpoint on the observed server.
pub struct RaindropsProber {
    http: reqwest::Client,
    url: String,
    ready: bool,
}

impl RaindropsProber {
    pub fn new(url: &str) -> AnyhowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url: url.to_string(),
            ready: false,
        })
    }

    /// Whether the endpoint has ever responded successfully. Used to
    /// suppress startup warnings while the observed server is still
    /// booting.
    pub fn ready(&self) -> bool {
        self.ready
    }

    pub async fn fetch(&mut self) -> Result<RaindropsSample> {
        let response = self.http.get(&self.url).send().await.map_err(|e| Error::Http {
            url: self.url.clone(),
            source: e,
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| Error::Http {
            url: self.url.clone(),
            source: e,
        })?;

        self.ready = true;

        Ok(parse_body(&body))
    }
}

/// Parse a raindrops response body.
///
/// Each line carries one labelled counter whose value is the last
/// colon-separated token, e.g. `calling: 1` or
/// `127.0.0.1:3000 queued: 4`. Lines without a parseable value are
/// skipped, leaving that counter unset.
pub fn parse_body(body: &str) -> RaindropsSample {
    let mut sample = RaindropsSample::default();

    for line in body.lines() {
        let value = line
            .rsplit(':')
            .next()
            .and_then(|v| v.trim().parse::<u64>().ok());
        let Some(value) = value else {
            continue;
        };

        if line.contains("calling") {
            sample.calling = Some(value);
        } else if line.contains("writing") {
            sample.writing = Some(value);
        } else if line.contains("active") {
            sample.active = Some(value);
        } else if line.contains("queued") {
            sample.queued = Some(value);
        }
    }

    sample
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_socket_body() {
        let body = "calling: 1\nwriting: 2\n/tmp/unicorn.sock active: 3\n/tmp/unicorn.sock queued: 4";
        let sample = parse_body(body);
        assert_eq!(sample.calling, Some(1));
        assert_eq!(sample.writing, Some(2));
        assert_eq!(sample.active, Some(3));
        assert_eq!(sample.queued, Some(4));
    }

    #[test]
    fn test_parse_tcp_body() {
        let body = "calling: 1\nwriting: 2\n127.0.0.1:3000 active: 3\n127.0.0.1:3000 queued: 4";
        let sample = parse_body(body);
        assert_eq!(sample.calling, Some(1));
        assert_eq!(sample.writing, Some(2));
        assert_eq!(sample.active, Some(3));
        assert_eq!(sample.queued, Some(4));
    }

    #[test]
    fn test_parse_missing_labels_stay_unset() {
        let sample = parse_body("calling: 7");
        assert_eq!(sample.calling, Some(7));
        assert_eq!(sample.writing, None);
        assert_eq!(sample.active, None);
        assert_eq!(sample.queued, None);
    }

    #[test]
    fn test_parse_skips_unparseable_values() {
        let sample = parse_body("active: lots\nqueued: 4");
        assert_eq!(sample.active, None);
        assert_eq!(sample.queued, Some(4));
    }

    #[test]
    fn test_parse_empty_body() {
        assert_eq!(parse_body(""), RaindropsSample::default());
    }
}
