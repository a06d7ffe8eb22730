// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git workspace materialization: clone/adopt, worktree add, commit+push,
//! cleanup. All mutation of a given local clone directory is serialized by
//! a per-repo-dir mutex; different repo dirs proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::GitWorkspaceError;

use super::remote::{parse_remote, redact_url, resolve_git_root, same_repo, ParsedRemote, RemoteGitInfo};

/// A materialized git worktree backing a session.
#[derive(Debug, Clone)]
pub struct GitWorkspaceContext {
    pub repo_dir: PathBuf,
    pub workdir: PathBuf,
    pub branch_name: String,
    pub remote_url: String,
}

/// Outcome of a commit+push attempt.
#[derive(Debug, Clone)]
pub struct CommitPushOutcome {
    pub revision: String,
    pub pushed: bool,
}

pub struct GitWorkspaceManager {
    default_root: PathBuf,
    git_root_map: HashMap<String, PathBuf>,
    user_name: Option<String>,
    user_email: Option<String>,
    push_enabled: bool,
    repo_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitWorkspaceManager {
    pub fn new(
        default_root: PathBuf,
        git_root_map: HashMap<String, PathBuf>,
        user_name: Option<String>,
        user_email: Option<String>,
        push_enabled: bool,
    ) -> Self {
        Self {
            default_root,
            git_root_map,
            user_name,
            user_email,
            push_enabled,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn repo_lock(&self, key: PathBuf) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Build the ordered, deduplicated set of local clone directories a
    /// previously-materialized repo might live at:
    /// `<gitRoot>/<repoName>`, `<gitRoot>/<host>/<segments>`,
    /// `<gitRoot>/<segments>`, `<gitRoot>/<owner>/<repoName>`,
    /// `<gitRoot>/<owner>-<repoName>`, `<gitRoot>/<host>/<repoName>`.
    fn candidate_clone_dirs(&self, git_root: &Path, parsed: &ParsedRemote, repo_name: &str) -> Vec<PathBuf> {
        let owner = parsed.repo_path.rsplit_once('/').map(|(owner, _)| owner);
        let host = (!parsed.host.is_empty()).then_some(parsed.host.as_str());

        let mut ordered = vec![git_root.join(repo_name)];
        if let Some(host) = host {
            ordered.push(git_root.join(host).join(&parsed.repo_path));
        }
        ordered.push(git_root.join(&parsed.repo_path));
        if let Some(owner) = owner {
            ordered.push(git_root.join(owner).join(repo_name));
            ordered.push(git_root.join(format!("{owner}-{repo_name}")));
        }
        if let Some(host) = host {
            ordered.push(git_root.join(host).join(repo_name));
        }

        let mut seen = std::collections::HashSet::new();
        ordered.retain(|path| seen.insert(path.clone()));
        ordered
    }

    /// Resolve (or create) a local clone for `remote`, fetch, and add a
    /// worktree for this run, notifying progress at coarse milestones.
    pub async fn ensure_repo_workdir(
        &self,
        remote: &RemoteGitInfo,
        run_id: &str,
        notify: &(dyn Fn(&str, &str) + Send + Sync),
    ) -> Result<GitWorkspaceContext, GitWorkspaceError> {
        let parsed = parse_remote(&remote.url)?;
        let git_root = resolve_git_root(&remote.url, &self.git_root_map, &self.default_root).to_path_buf();
        let repo_name = parsed
            .repo_path
            .rsplit('/')
            .next()
            .unwrap_or(&parsed.repo_path)
            .to_string();
        let candidates = self.candidate_clone_dirs(&git_root, &parsed, &repo_name);

        let repo_lock = self.repo_lock(candidates[0].clone()).await;
        let _guard = repo_lock.lock().await;

        let repo_dir = self.adopt_or_clone(&remote.url, &git_root, &candidates, notify).await?;

        notify("git/fetch", "fetching origin");
        run_git(&repo_dir, &["fetch", "--prune", "origin"]).await?;

        let revision = remote
            .revision
            .clone()
            .or_else(|| remote.branch.clone().map(|b| format!("origin/{b}")))
            .ok_or(GitWorkspaceError::NoRevision)?;

        let branch_name = format!("agent/changes-{}", sanitize_run_id(run_id));
        let workdir = git_root.join(".acp-remote-worktrees").join(&repo_name).join(run_id);

        if workdir.exists() {
            notify("git/worktree", "removing stale worktree");
            let _ = run_git(
                &repo_dir,
                &["worktree", "remove", "--force", &workdir.to_string_lossy()],
            )
            .await;
        }

        notify("git/worktree", "adding worktree");
        run_git(
            &repo_dir,
            &["worktree", "add", "-B", &branch_name, &workdir.to_string_lossy(), &revision],
        )
        .await?;

        Ok(GitWorkspaceContext {
            repo_dir,
            workdir,
            branch_name,
            remote_url: remote.url.clone(),
        })
    }

    async fn adopt_or_clone(
        &self,
        remote_url: &str,
        git_root: &Path,
        candidates: &[PathBuf],
        notify: &(dyn Fn(&str, &str) + Send + Sync),
    ) -> Result<PathBuf, GitWorkspaceError> {
        for candidate in candidates {
            if candidate.join(".git").exists() {
                if let Ok(origin) = read_origin(candidate).await {
                    if same_repo(&origin, remote_url) {
                        notify("git/open", "reusing existing clone");
                        if origin != remote_url {
                            run_git(candidate, &["remote", "set-url", "origin", remote_url]).await?;
                        }
                        return Ok(candidate.clone());
                    }
                }
            }
        }

        if git_root.exists() {
            let mut read_dir = tokio::fs::read_dir(git_root).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if path.join(".git").exists() {
                    if let Ok(origin) = read_origin(&path).await {
                        if same_repo(&origin, remote_url) {
                            notify("git/open", "found existing clone in git root");
                            return Ok(path);
                        }
                    }
                }
            }
        }

        for candidate in candidates {
            if !candidate.exists() {
                if let Some(parent) = candidate.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                notify("git/clone", &format!("cloning {}", redact_url(remote_url)));
                run_git(
                    candidate.parent().unwrap_or(git_root),
                    &["clone", remote_url, &candidate.to_string_lossy()],
                )
                .await?;
                return Ok(candidate.clone());
            }
        }

        Err(GitWorkspaceError::NoAvailableCloneDir)
    }

    /// Stage and commit any dirty working tree, then push if enabled. A
    /// push failure is reported via `notify`, never as an error return —
    /// the caller still has a valid commit.
    pub async fn ensure_committed_and_pushed(
        &self,
        ctx: &GitWorkspaceContext,
        notify: &(dyn Fn(&str, &str) + Send + Sync),
    ) -> Result<CommitPushOutcome, GitWorkspaceError> {
        let repo_lock = self.repo_lock(ctx.repo_dir.clone()).await;
        let _guard = repo_lock.lock().await;

        let status = run_git(&ctx.workdir, &["status", "--porcelain"]).await?;
        if !status.trim().is_empty() {
            run_git(&ctx.workdir, &["add", "-A"]).await?;
            let user_name = self.user_name.as_deref().unwrap_or("ACP Broker");
            let user_email = self.user_email.as_deref().unwrap_or("acp-broker@localhost");
            run_git(
                &ctx.workdir,
                &[
                    "-c",
                    &format!("user.name={user_name}"),
                    "-c",
                    &format!("user.email={user_email}"),
                    "commit",
                    "-m",
                    "Automated commit from agent session",
                ],
            )
            .await?;
        }

        let revision = run_git(&ctx.workdir, &["rev-parse", "HEAD"]).await?.trim().to_string();

        if !self.push_enabled {
            return Ok(CommitPushOutcome { revision, pushed: false });
        }

        match run_git(&ctx.workdir, &["push", "-u", "origin", &ctx.branch_name]).await {
            Ok(_) => Ok(CommitPushOutcome { revision, pushed: true }),
            Err(e) => {
                warn!(remote = %redact_url(&ctx.remote_url), "push failed: {}", e);
                notify("git/push", &format!("push failed: {e}"));
                Ok(CommitPushOutcome { revision, pushed: false })
            }
        }
    }

    /// Best-effort worktree + directory removal.
    pub async fn cleanup_workspace(&self, ctx: &GitWorkspaceContext) {
        let repo_lock = self.repo_lock(ctx.repo_dir.clone()).await;
        let _guard = repo_lock.lock().await;
        let _ = run_git(
            &ctx.repo_dir,
            &["worktree", "remove", "--force", &ctx.workdir.to_string_lossy()],
        )
        .await;
        let _ = tokio::fs::remove_dir_all(&ctx.workdir).await;
    }
}

fn sanitize_run_id(run_id: &str) -> String {
    let sanitized: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    sanitized.chars().take(24).collect()
}

async fn read_origin(path: &Path) -> Result<String, GitWorkspaceError> {
    run_git(path, &["remote", "get-url", "origin"]).await.map(|s| s.trim().to_string())
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, GitWorkspaceError> {
    let output = Command::new("git").current_dir(cwd).args(args).output().await?;
    if !output.status.success() {
        return Err(GitWorkspaceError::Git(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
