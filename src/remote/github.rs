use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;

use super::{
    BlobContent, CommitInfo, ContentResponse, EntryKind, FileContent, ListingEntry, MergeOutcome,
    RemoteRepository, TreeEntry,
};
use crate::{
    config::{RepoConfig, SyncConfig},
    error::{Result, SyncError},
};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("git-docsync/", env!("CARGO_PKG_VERSION"));

/// `RemoteRepository` backed by the GitHub REST API.
#[derive(Clone)]
pub struct GithubClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaOnly,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaOnly,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: Option<String>,
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsPayload {
    Listing(Vec<ContentItem>),
    Single(ContentItem),
}

impl GithubClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("invalid API URL `{}`: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Build a client from configuration, reading the token from `token_env` now.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            tracing::warn!(
                env_var = %config.token_env,
                "no API token found; only public repositories are readable"
            );
        }
        Self::new(
            &config.api_base_url,
            token,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// `{base}/repos/{owner}/{repo}/{segments...}` with each segment percent-encoded.
    fn repo_url(&self, repo: &RepoConfig, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SyncError::Config(format!("API URL {} cannot be a base", self.base_url)))?;
            path.pop_if_empty()
                .extend(["repos", repo.owner.as_str(), repo.repo.as_str()]);
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header(API_VERSION_HEADER, API_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> Result<Response> {
        tracing::debug!("github: {}", what);
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|err| format!("response body error: {err}"));
        Err(classify(status, what, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, what: &str, builder: RequestBuilder) -> Result<T> {
        let resp = self.send(what, builder).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("{}: {}", what, e)))
    }
}

/// Map an unsuccessful HTTP status to the sync error taxonomy.
fn classify(status: StatusCode, what: &str, body: &str) -> SyncError {
    let reason = format!("{} ({}): {}", what, status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(reason),
        StatusCode::NOT_FOUND => SyncError::NotFound(reason),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => SyncError::Conflict(reason),
        _ => SyncError::Transport(reason),
    }
}

fn into_listing(items: Vec<ContentItem>) -> Vec<ListingEntry> {
    items
        .into_iter()
        .map(|item| ListingEntry {
            kind: match item.kind.as_str() {
                "file" => EntryKind::File,
                "dir" => EntryKind::Dir,
                _ => EntryKind::Other,
            },
            name: item.name,
            path: item.path,
        })
        .collect()
}

fn into_content(payload: ContentsPayload) -> Result<ContentResponse> {
    match payload {
        ContentsPayload::Listing(items) => Ok(ContentResponse::Directory(into_listing(items))),
        ContentsPayload::Single(item) if item.kind == "file" => {
            Ok(ContentResponse::File(FileContent {
                path: item.path,
                sha: item.sha,
                content: item.content,
                encoding: item.encoding,
            }))
        }
        ContentsPayload::Single(item) => Err(SyncError::InvalidResponse(format!(
            "{} is a {}, not a file or directory",
            item.path, item.kind
        ))),
    }
}

#[async_trait]
impl RemoteRepository for GithubClient {
    async fn get_ref(&self, repo: &RepoConfig, branch: &str) -> Result<String> {
        let url = self.repo_url(repo, &["git", "ref", "heads", branch])?;
        let resp: RefResponse = self
            .send_json(&format!("get ref heads/{}", branch), self.request(Method::GET, url))
            .await?;
        Ok(resp.object.sha)
    }

    async fn get_commit(&self, repo: &RepoConfig, sha: &str) -> Result<CommitInfo> {
        let url = self.repo_url(repo, &["git", "commits", sha])?;
        let resp: CommitResponse = self
            .send_json(&format!("get commit {}", sha), self.request(Method::GET, url))
            .await?;
        Ok(CommitInfo {
            sha: resp.sha,
            tree_sha: resp.tree.sha,
        })
    }

    async fn create_ref(&self, repo: &RepoConfig, branch: &str, from_sha: &str) -> Result<()> {
        let url = self.repo_url(repo, &["git", "refs"])?;
        let body = json!({ "ref": format!("refs/heads/{}", branch), "sha": from_sha });
        self.send(
            &format!("create ref heads/{}", branch),
            self.request(Method::POST, url).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn create_blob(&self, repo: &RepoConfig, base64_content: &str) -> Result<String> {
        let url = self.repo_url(repo, &["git", "blobs"])?;
        let body = json!({ "content": base64_content, "encoding": "base64" });
        let resp: ShaOnly = self
            .send_json("create blob", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(resp.sha)
    }

    async fn create_tree(
        &self,
        repo: &RepoConfig,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        let url = self.repo_url(repo, &["git", "trees"])?;
        let body = json!({ "base_tree": base_tree, "tree": entries });
        let resp: ShaOnly = self
            .send_json(
                &format!("create tree ({} entries)", entries.len()),
                self.request(Method::POST, url).json(&body),
            )
            .await?;
        Ok(resp.sha)
    }

    async fn create_commit(
        &self,
        repo: &RepoConfig,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String> {
        let url = self.repo_url(repo, &["git", "commits"])?;
        let body = json!({ "message": message, "tree": tree_sha, "parents": parents });
        let resp: ShaOnly = self
            .send_json("create commit", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(resp.sha)
    }

    async fn update_ref(&self, repo: &RepoConfig, branch: &str, commit_sha: &str) -> Result<()> {
        let url = self.repo_url(repo, &["git", "refs", "heads", branch])?;
        let body = json!({ "sha": commit_sha, "force": false });
        self.send(
            &format!("update ref heads/{}", branch),
            self.request(Method::PATCH, url).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_content(
        &self,
        repo: &RepoConfig,
        path: &str,
        branch: &str,
    ) -> Result<ContentResponse> {
        let url = self.repo_url(repo, &["contents", path])?;
        let payload: ContentsPayload = self
            .send_json(
                &format!("get contents {}@{}", path, branch),
                self.request(Method::GET, url).query(&[("ref", branch)]),
            )
            .await?;
        into_content(payload)
    }

    async fn get_blob(&self, repo: &RepoConfig, sha: &str) -> Result<BlobContent> {
        let url = self.repo_url(repo, &["git", "blobs", sha])?;
        let resp: BlobResponse = self
            .send_json(&format!("get blob {}", sha), self.request(Method::GET, url))
            .await?;
        Ok(BlobContent {
            content: resp.content,
            encoding: resp.encoding,
        })
    }

    async fn merge(
        &self,
        repo: &RepoConfig,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<MergeOutcome> {
        let url = self.repo_url(repo, &["merges"])?;
        let body = json!({ "base": base, "head": head, "commit_message": message });
        let what = format!("merge {} into {}", head, base);
        let resp = self
            .send(&what, self.request(Method::POST, url).json(&body))
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(MergeOutcome::UpToDate);
        }
        let merged: ShaOnly = resp
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("{}: {}", what, e)))?;
        Ok(MergeOutcome::Merged { sha: merged.sha })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoConfig {
        RepoConfig {
            owner: "octo".to_string(),
            repo: "notes".to_string(),
            main_branch: "main".to_string(),
            work_branch: "work".to_string(),
        }
    }

    fn client() -> GithubClient {
        GithubClient::new("https://api.github.com", None, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_repo_url_encodes_segments() {
        let url = client()
            .repo_url(&repo(), &["contents", "articles/my note.md"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/octo/notes/contents/articles/my%20note.md"
        );
    }

    #[test]
    fn test_repo_url_keeps_branch_slashes() {
        let url = client()
            .repo_url(&repo(), &["git", "ref", "heads", "feature/drafts"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/octo/notes/git/ref/heads/feature/drafts"
        );
    }

    #[test]
    fn test_repo_url_with_base_path() {
        let client =
            GithubClient::new("https://ghe.example.com/api/v3/", None, Duration::from_secs(5))
                .unwrap();
        let url = client.repo_url(&repo(), &["merges"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://ghe.example.com/api/v3/repos/octo/notes/merges"
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(classify(StatusCode::UNAUTHORIZED, "x", "").is_auth());
        assert!(classify(StatusCode::FORBIDDEN, "x", "").is_auth());
        assert!(classify(StatusCode::NOT_FOUND, "x", "").is_not_found());
        assert!(classify(StatusCode::CONFLICT, "x", "").is_conflict());
        assert!(classify(StatusCode::UNPROCESSABLE_ENTITY, "x", "not a fast forward").is_conflict());
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, "x", ""),
            SyncError::Transport(_)
        ));
    }

    #[test]
    fn test_parse_directory_listing() {
        let body = r#"[
            {"type": "file", "name": "a.md", "path": "articles/a.md", "sha": "s1"},
            {"type": "dir", "name": "drafts", "path": "articles/drafts", "sha": "s2"},
            {"type": "symlink", "name": "l", "path": "articles/l", "sha": "s3"}
        ]"#;
        let payload: ContentsPayload = serde_json::from_str(body).unwrap();
        let ContentResponse::Directory(entries) = into_content(payload).unwrap() else {
            panic!("expected a directory listing");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[1].kind, EntryKind::Dir);
        assert_eq!(entries[2].kind, EntryKind::Other);
        assert_eq!(entries[1].path, "articles/drafts");
    }

    #[test]
    fn test_parse_single_file() {
        let body = r#"{"type": "file", "name": "a.md", "path": "articles/a.md", "sha": "s1",
                       "content": "aGVsbG8=\n", "encoding": "base64"}"#;
        let payload: ContentsPayload = serde_json::from_str(body).unwrap();
        let ContentResponse::File(file) = into_content(payload).unwrap() else {
            panic!("expected a file");
        };
        assert_eq!(file.sha, "s1");
        assert_eq!(file.encoding.as_deref(), Some("base64"));
        assert_eq!(file.content.as_deref(), Some("aGVsbG8=\n"));
    }

    #[test]
    fn test_parse_submodule_rejected() {
        let body = r#"{"type": "submodule", "name": "m", "path": "m", "sha": "s1"}"#;
        let payload: ContentsPayload = serde_json::from_str(body).unwrap();
        assert!(into_content(payload).is_err());
    }
}
