//! GitHub Releases as a release host.
//!
//! Releases are looked up by tag and created on first upload. An asset name
//! that already exists is deleted before the new file is uploaded, so a
//! re-run replaces assets instead of failing or duplicating them. Asset
//! listings follow the `Link: <...>; rel="next"` header across pages.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, LINK};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::host::{HostError, ReleaseHost, UploadedAsset};

pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const API_URL_ENV: &str = "GITHUB_API_URL";
pub const UPLOAD_URL_ENV: &str = "GITHUB_UPLOAD_URL";

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_UPLOAD_URL: &str = "https://uploads.github.com";

/// Per-request timeout. Uploads carry whole binaries.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const USER_AGENT: &str = concat!("repro/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";
const ASSETS_PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
struct Release {
  id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct Asset {
  id: u64,
  name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedAsset {
  name: String,
  size: u64,
  #[serde(default)]
  browser_download_url: String,
}

/// Uploads to `<api>/repos/<owner>/<name>/releases`.
#[derive(Debug, Clone)]
pub struct GitHubHost {
  client: reqwest::Client,
  repository: String,
  token: String,
  api_url: String,
  upload_url: String,
}

impl GitHubHost {
  pub fn new(repository: &str, token: &str, api_url: &str, upload_url: &str) -> Result<Self, HostError> {
    let valid = repository
      .split_once('/')
      .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
    if !valid {
      return Err(HostError::InvalidRepository(repository.to_string()));
    }
    for endpoint in [api_url, upload_url] {
      if !Url::parse(endpoint).is_ok_and(|u| !u.cannot_be_a_base()) {
        return Err(HostError::InvalidEndpoint(endpoint.to_string()));
      }
    }

    let client = reqwest::Client::builder()
      .timeout(UPLOAD_TIMEOUT)
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| HostError::Transport {
        url: api_url.to_string(),
        message: e.to_string(),
      })?;

    Ok(Self {
      client,
      repository: repository.to_string(),
      token: token.to_string(),
      api_url: api_url.trim_end_matches('/').to_string(),
      upload_url: upload_url.trim_end_matches('/').to_string(),
    })
  }

  /// Build a host from `GITHUB_TOKEN` and the optional endpoint overrides.
  pub fn from_env(repository: &str) -> Result<Self, HostError> {
    let token = std::env::var(TOKEN_ENV)
      .ok()
      .filter(|t| !t.is_empty())
      .ok_or(HostError::MissingToken)?;
    let api_url = std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let upload_url = std::env::var(UPLOAD_URL_ENV).unwrap_or_else(|_| DEFAULT_UPLOAD_URL.to_string());
    Self::new(repository, &token, &api_url, &upload_url)
  }

  fn repo_url(&self, path: &str) -> String {
    format!("{}/repos/{}/{}", self.api_url, self.repository, path)
  }

  /// `releases/tags/<tag>` with the tag percent-encoded as one path segment.
  fn tag_url(&self, tag: &str) -> Result<String, HostError> {
    let base = self.repo_url("releases/tags");
    let mut url = Url::parse(&base).map_err(|_| HostError::InvalidEndpoint(base.clone()))?;
    url
      .path_segments_mut()
      .map_err(|()| HostError::InvalidEndpoint(base.clone()))?
      .push(tag);
    Ok(url.into())
  }

  fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
    self
      .client
      .request(method, url)
      .bearer_auth(&self.token)
      .header(reqwest::header::ACCEPT, "application/vnd.github+json")
      .header("X-GitHub-Api-Version", API_VERSION)
  }

  async fn send(
    &self,
    method: &'static str,
    url: &str,
    request: reqwest::RequestBuilder,
  ) -> Result<reqwest::Response, HostError> {
    let response = request.send().await.map_err(|e| HostError::Transport {
      url: url.to_string(),
      message: e.to_string(),
    })?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(HostError::Status {
      method,
      url: url.to_string(),
      status: status.as_u16(),
      message,
    })
  }

  async fn json<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T, HostError> {
    response.json().await.map_err(|e| HostError::Response {
      url: url.to_string(),
      message: e.to_string(),
    })
  }

  async fn get_release(&self, tag: &str) -> Result<Option<Release>, HostError> {
    let url = self.tag_url(tag)?;
    match self.send("GET", &url, self.request(Method::GET, &url)).await {
      Ok(response) => Ok(Some(Self::json(&url, response).await?)),
      Err(HostError::Status { status, .. }) if status == StatusCode::NOT_FOUND => Ok(None),
      Err(e) => Err(e),
    }
  }

  /// The release for `tag`, created when absent.
  async fn find_or_create_release(&self, tag: &str) -> Result<Release, HostError> {
    if let Some(release) = self.get_release(tag).await? {
      debug!(tag, id = release.id, "found release");
      return Ok(release);
    }

    let url = self.repo_url("releases");
    let body = serde_json::json!({ "tag_name": tag, "name": tag });
    match self.send("POST", &url, self.request(Method::POST, &url).json(&body)).await {
      Ok(response) => {
        let release: Release = Self::json(&url, response).await?;
        info!(tag, id = release.id, repository = %self.repository, "created release");
        Ok(release)
      }
      // Another job created it between our lookup and create.
      Err(HostError::Status { status: 422, .. }) => {
        self
          .get_release(tag)
          .await?
          .ok_or_else(|| HostError::Response {
            url: url.clone(),
            message: format!("release for tag '{tag}' neither exists nor can be created"),
          })
      }
      Err(e) => Err(e),
    }
  }

  /// Every asset of `release`, across all pages.
  async fn release_assets(&self, release: &Release) -> Result<Vec<Asset>, HostError> {
    let first = self.repo_url(&format!("releases/{}/assets", release.id));
    let mut request = self
      .request(Method::GET, &first)
      .query(&[("per_page", ASSETS_PER_PAGE)]);
    let mut url = first;
    let mut assets = Vec::new();

    loop {
      let response = self.send("GET", &url, request).await?;
      let next = next_page(response.headers());
      let page: Vec<Asset> = Self::json(&url, response).await?;
      debug!(release = release.id, count = page.len(), "listed asset page");
      assets.extend(page);

      match next {
        Some(next) => {
          request = self.request(Method::GET, &next);
          url = next;
        }
        None => return Ok(assets),
      }
    }
  }

  async fn delete_asset(&self, asset: &Asset) -> Result<(), HostError> {
    let url = self.repo_url(&format!("releases/assets/{}", asset.id));
    self.send("DELETE", &url, self.request(Method::DELETE, &url)).await?;
    debug!(asset = %asset.name, id = asset.id, "deleted existing asset");
    Ok(())
  }
}

/// The `rel="next"` target of a `Link` header.
fn next_page(headers: &HeaderMap) -> Option<String> {
  let link = headers.get(LINK)?.to_str().ok()?;
  link.split(',').find_map(|part| {
    let (target, params) = part.split_once(';')?;
    let is_next = params
      .split(';')
      .any(|p| matches!(p.trim(), "rel=\"next\"" | "rel=next"));
    is_next.then(|| target.trim().trim_start_matches('<').trim_end_matches('>').to_string())
  })
}

impl ReleaseHost for GitHubHost {
  async fn upload(&self, tag: &str, asset: &str, path: &Path) -> Result<UploadedAsset, HostError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| HostError::ReadArtifact {
      path: path.to_path_buf(),
      source: e,
    })?;

    let release = self.find_or_create_release(tag).await?;
    for existing in self.release_assets(&release).await? {
      if existing.name == asset {
        self.delete_asset(&existing).await?;
      }
    }

    let url = format!(
      "{}/repos/{}/releases/{}/assets",
      self.upload_url, self.repository, release.id
    );
    let request = self
      .request(Method::POST, &url)
      .query(&[("name", asset)])
      .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
      .body(bytes);
    let response = self.send("POST", &url, request).await?;
    let created: CreatedAsset = Self::json(&url, response).await?;

    Ok(UploadedAsset {
      name: created.name,
      size: created.size,
      location: created.browser_download_url,
    })
  }

  async fn list_assets(&self, tag: &str) -> Result<Vec<String>, HostError> {
    let Some(release) = self.get_release(tag).await? else {
      return Ok(Vec::new());
    };
    let mut names: Vec<String> = self
      .release_assets(&release)
      .await?
      .into_iter()
      .map(|a| a.name)
      .collect();
    names.sort();
    Ok(names)
  }

  fn describe(&self) -> String {
    format!("github {}", self.repository)
  }
}
