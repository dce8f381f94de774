//! Chart version lookup.
//!
//! HTTP chart repositories publish every version in `index.yaml`. OCI
//! registries list them through the distribution API
//! (`/v2/<repository>/tags/list`), usually behind an anonymous bearer token
//! obtained from the realm named in the `WWW-Authenticate` challenge.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, LINK, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{BackendError, ChartRef};

/// Upper bound on `Link`-paginated tag pages.
const MAX_TAG_PAGES: usize = 50;

#[derive(Debug, Default, Deserialize)]
struct Index {
    #[serde(default)]
    entries: HashMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

#[derive(Clone)]
pub struct TagLookup {
    http: reqwest::Client,
}

impl TagLookup {
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .user_agent(concat!("kubesock/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        Ok(Self { http })
    }

    /// Available versions of `chart`.
    pub async fn tags(&self, chart: &ChartRef) -> Result<Vec<String>, BackendError> {
        if chart.repo_url.is_empty() {
            return Err(BackendError::InvalidRequest(
                "a repository URL is required to list chart versions".into(),
            ));
        }
        if chart.is_oci {
            self.registry_tags(&chart.repo_url).await
        } else {
            self.index_versions(&chart.repo_url, &chart.name).await
        }
    }

    async fn index_versions(&self, repo_url: &str, chart: &str) -> Result<Vec<String>, BackendError> {
        let url = index_url(repo_url);
        debug!("Fetching chart index {url}");
        let resp = self.http.get(&url).send().await.map_err(http_error)?;
        if !resp.status().is_success() {
            return Err(BackendError::Http(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        let body = resp.text().await.map_err(http_error)?;
        parse_index(&body, chart)
    }

    async fn registry_tags(&self, repo_url: &str) -> Result<Vec<String>, BackendError> {
        let mut next = Some(registry_tags_url(repo_url)?);
        let mut token: Option<String> = None;
        let mut raw = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let Some(url) = next.take() else { break };
            debug!("Listing registry tags {url}");
            let mut resp = self.get(&url, token.as_deref()).await?;

            if resp.status() == StatusCode::UNAUTHORIZED && token.is_none() {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_challenge)
                    .ok_or_else(|| {
                        BackendError::Http(format!("{url} requires authentication"))
                    })?;
                token = Some(self.anonymous_token(&challenge).await?);
                resp = self.get(&url, token.as_deref()).await?;
            }
            if !resp.status().is_success() {
                return Err(BackendError::Http(format!(
                    "{url} returned {}",
                    resp.status()
                )));
            }

            next = next_page(&url, resp.headers());
            let page: TagList = resp.json().await.map_err(|e| BackendError::Decode {
                what: "tag list".into(),
                reason: e.to_string(),
            })?;
            raw.extend(page.tags.unwrap_or_default());
        }

        Ok(normalize_tags(raw))
    }

    async fn get(&self, url: &Url, token: Option<&str>) -> Result<reqwest::Response, BackendError> {
        let mut req = self.http.get(url.clone());
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req.send().await.map_err(http_error)
    }

    async fn anonymous_token(&self, challenge: &Challenge) -> Result<String, BackendError> {
        let mut url = Url::parse(&challenge.realm)
            .map_err(|e| BackendError::Http(format!("invalid token realm: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if !challenge.service.is_empty() {
                query.append_pair("service", &challenge.service);
            }
            if !challenge.scope.is_empty() {
                query.append_pair("scope", &challenge.scope);
            }
        }
        let resp = self.http.get(url).send().await.map_err(http_error)?;
        if !resp.status().is_success() {
            return Err(BackendError::Http(format!(
                "token request returned {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp.json().await.map_err(|e| BackendError::Decode {
            what: "registry token".into(),
            reason: e.to_string(),
        })?;
        match (body.token, body.access_token) {
            (t, _) if !t.is_empty() => Ok(t),
            (_, t) if !t.is_empty() => Ok(t),
            _ => Err(BackendError::Http("registry returned an empty token".into())),
        }
    }
}

fn http_error(e: reqwest::Error) -> BackendError {
    BackendError::Http(e.to_string())
}

pub fn index_url(repo_url: &str) -> String {
    format!("{}/index.yaml", repo_url.trim_end_matches('/'))
}

/// Versions of `chart` listed in a repository index, in index order.
pub fn parse_index(yaml: &str, chart: &str) -> Result<Vec<String>, BackendError> {
    let index: Index = serde_yaml::from_str(yaml).map_err(|e| BackendError::Decode {
        what: "index.yaml".into(),
        reason: e.to_string(),
    })?;
    Ok(index
        .entries
        .get(chart)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| !e.version.is_empty())
                .map(|e| e.version.clone())
                .collect()
        })
        .unwrap_or_default())
}

/// `oci://host/repo` (or `https://host/repo`) to the registry's tag list
/// endpoint. Only an explicit `http://` scheme talks plain HTTP.
pub fn registry_tags_url(repo_url: &str) -> Result<Url, BackendError> {
    let (scheme, rest) = match repo_url.split_once("://") {
        Some(("http", rest)) => ("http", rest),
        Some((_, rest)) => ("https", rest),
        None => ("https", repo_url),
    };
    let rest = rest.trim_end_matches('/');
    let Some((host, repository)) = rest.split_once('/') else {
        return Err(BackendError::InvalidRequest(format!(
            "'{repo_url}' does not name a repository"
        )));
    };
    Url::parse(&format!("{scheme}://{host}/v2/{repository}/tags/list"))
        .map_err(|e| BackendError::InvalidRequest(format!("invalid registry URL: {e}")))
}

/// Registry tags to chart versions: `_` back to `+`, digest tags dropped,
/// newest first.
pub fn normalize_tags(raw: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .into_iter()
        .map(|t| t.replace('_', "+"))
        .filter(|t| !t.contains("sha256"))
        .collect();
    tags.reverse();
    tags
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let mut challenge = Challenge::default();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.trim_start();
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            after.split_once(',').map_or((after, ""), |(v, t)| (v, t))
        };
        match key.trim() {
            "realm" => challenge.realm = value.to_string(),
            "service" => challenge.service = value.to_string(),
            "scope" => challenge.scope = value.to_string(),
            _ => {}
        }
        rest = tail.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }
    (!challenge.realm.is_empty()).then_some(challenge)
}

/// Follow `Link: </v2/...?last=x&n=y>; rel="next"` relative to `current`.
fn next_page(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let target = link
        .split(',')
        .find(|part| part.contains("rel=\"next\""))?
        .split(';')
        .next()?
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>');
    current.join(target).ok()
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  nginx:
    - name: nginx
      version: 15.4.2
      urls: [nginx-15.4.2.tgz]
    - name: nginx
      version: 15.4.1
  redis:
    - version: 18.0.0
generated: "2024-01-01T00:00:00Z"
"#;

    #[test]
    fn index_versions_keep_index_order() {
        assert_eq!(parse_index(INDEX, "nginx").unwrap(), vec!["15.4.2", "15.4.1"]);
        assert!(parse_index(INDEX, "postgresql").unwrap().is_empty());
    }

    #[test]
    fn broken_index_is_a_decode_error() {
        let err = parse_index("entries: [", "nginx").unwrap_err();
        assert!(matches!(err, BackendError::Decode { .. }));
    }

    #[test]
    fn index_url_tolerates_trailing_slash() {
        assert_eq!(
            index_url("https://charts.bitnami.com/bitnami/"),
            "https://charts.bitnami.com/bitnami/index.yaml"
        );
    }

    #[test]
    fn registry_urls() {
        assert_eq!(
            registry_tags_url("oci://registry-1.docker.io/bitnamicharts/nginx")
                .unwrap()
                .as_str(),
            "https://registry-1.docker.io/v2/bitnamicharts/nginx/tags/list"
        );
        assert_eq!(
            registry_tags_url("http://localhost:5000/charts/app/").unwrap().as_str(),
            "http://localhost:5000/v2/charts/app/tags/list"
        );
        assert!(registry_tags_url("oci://registry-only").is_err());
    }

    #[test]
    fn tags_are_normalized_newest_first() {
        let raw = vec![
            "1.0.0".to_string(),
            "1.1.0_build.1".to_string(),
            "sha256-abc.sig".to_string(),
            "2.0.0".to_string(),
        ];
        assert_eq!(normalize_tags(raw), vec!["2.0.0", "1.1.0+build.1", "1.0.0"]);
    }

    #[test]
    fn docker_hub_challenge() {
        let c = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:bitnamicharts/nginx:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service, "registry.docker.io");
        assert_eq!(c.scope, "repository:bitnamicharts/nginx:pull");
    }

    #[test]
    fn non_bearer_challenge_is_ignored() {
        assert!(parse_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_challenge("Bearer service=\"x\"").is_none());
    }

    #[test]
    fn next_page_is_resolved_against_current_url() {
        let current = Url::parse("https://ghcr.io/v2/org/chart/tags/list").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static("</v2/org/chart/tags/list?last=1.2.0&n=100>; rel=\"next\""),
        );
        assert_eq!(
            next_page(&current, &headers).unwrap().as_str(),
            "https://ghcr.io/v2/org/chart/tags/list?last=1.2.0&n=100"
        );
        assert!(next_page(&current, &HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn missing_repository_is_rejected() {
        let lookup = TagLookup::new(Duration::from_secs(1)).unwrap();
        let err = lookup.tags(&ChartRef::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }
}
