//! Blocking HTTP client for the Zuul REST API and its log server.

use std::io::{Read, Write};

use reqwest::blocking::{Client, Response};
use tracing::debug;

use crate::zuul::{Build, BuildQuery, BuildService, LogFetcher, ZuulError};

/// Default API endpoint: the OpenDev Zuul deployment.
pub const DEFAULT_ZUUL_API_URL: &str = "https://zuul.opendev.org/api";

/// Chunk size used when streaming log files to disk.
const CHUNK_SIZE: usize = 10 * 1024;

/// Client for `GET {base}/tenant/{tenant}/builds` and build log downloads.
pub struct ZuulClient {
    base_url: String,
    http: Client,
}

impl ZuulClient {
    /// Create a client for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ZuulError::Unavailable`] if the HTTP client cannot be built
    /// (e.g. the TLS backend fails to initialize).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ZuulError> {
        let http = Client::builder()
            .user_agent(concat!("logsearch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ZuulError::unavailable)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn builds_url(&self, tenant: &str) -> String {
        format!("{}/tenant/{tenant}/builds", self.base_url)
    }

    fn query_builds(&self, tenant: &str, pairs: &[(&str, String)]) -> Result<Vec<Build>, ZuulError> {
        let url = self.builds_url(tenant);
        debug!(%url, ?pairs, "querying builds");

        let builds: Vec<Build> = self
            .http
            .get(&url)
            .query(pairs)
            .send()
            .and_then(Response::error_for_status)
            .and_then(|response| response.json::<Vec<Build>>())
            .map_err(ZuulError::unavailable)?;

        Ok(builds.into_iter().map(Build::normalized).collect())
    }
}

impl BuildService for ZuulClient {
    fn list_builds(&self, tenant: &str, query: &BuildQuery) -> Result<Vec<Build>, ZuulError> {
        self.query_builds(tenant, &query.to_query_pairs())
    }

    fn get_build(&self, tenant: &str, uuid: &str) -> Result<Build, ZuulError> {
        let mut builds = self.query_builds(tenant, &[("uuid", uuid.to_string())])?;

        match builds.len() {
            0 => Err(ZuulError::BuildNotFound(uuid.to_string())),
            1 => Ok(builds.remove(0)),
            count => Err(ZuulError::AmbiguousBuild {
                uuid: uuid.to_string(),
                count,
            }),
        }
    }
}

impl LogFetcher for ZuulClient {
    fn fetch_log(
        &self,
        build: &Build,
        relative_path: &str,
        dest: &mut dyn Write,
        progress: &mut dyn FnMut(usize),
    ) -> Result<u64, ZuulError> {
        let url = build
            .log_file_url(relative_path)
            .ok_or_else(|| ZuulError::MissingLogUrl(build.uuid.clone()))?;
        debug!(%url, "fetching log file");

        let mut response = self.http.get(&url).send().map_err(ZuulError::Transfer)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ZuulError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        let mut chunks = 0usize;
        loop {
            let read = response.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            dest.write_all(&buffer[..read])?;
            written += read as u64;
            chunks += 1;
            progress(chunks);
        }
        dest.flush()?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ZuulClient::new("https://zuul.example.org/api/").unwrap();
        assert_eq!(client.base_url(), "https://zuul.example.org/api");
        assert_eq!(
            client.builds_url("openstack"),
            "https://zuul.example.org/api/tenant/openstack/builds"
        );
    }

    #[test]
    fn fetch_without_log_url_fails_before_network() {
        let client = ZuulClient::new(DEFAULT_ZUUL_API_URL).unwrap();
        let build = Build {
            uuid: "u1".to_string(),
            ..Build::default()
        };
        let mut sink = Vec::new();

        let err = client
            .fetch_log(&build, "job-output.txt", &mut sink, &mut |_| {})
            .unwrap_err();

        assert!(matches!(err, ZuulError::MissingLogUrl(uuid) if uuid == "u1"));
        assert!(sink.is_empty());
    }
}
