//! Review feedback polling against external systems.
//!
//! The Dispatcher only sees generic review items and an opaque poll state; the
//! provider translates a concrete feedback channel (pull-request comments via
//! the `gh` CLI) into that shape and back.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One piece of review feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub author: String,
    pub body: String,
}

/// Opaque provider cursor carried between polls so items are seen once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPollState {
    /// Id of the newest item already seen.
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// Where to look for feedback.
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub repo_root: PathBuf,
    pub branch: String,
}

/// Translates an external feedback channel into review items and back.
pub trait ReviewProvider {
    /// Return items newer than `prior`, plus the advanced poll state.
    fn poll(
        &self,
        ctx: &ReviewContext,
        prior: &ReviewPollState,
    ) -> Result<(Vec<ReviewItem>, ReviewPollState)>;

    /// Post a response, optionally tied to a specific item.
    fn respond(
        &self,
        ctx: &ReviewContext,
        message: &str,
        related_item_id: Option<&str>,
    ) -> Result<()>;
}

/// Pull-request comments via the GitHub CLI.
#[derive(Debug, Clone, Default)]
pub struct GhReviewProvider;

#[derive(Debug, Deserialize)]
struct GhPrView {
    comments: Vec<GhComment>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: String,
    body: String,
    author: GhAuthor,
}

#[derive(Debug, Deserialize)]
struct GhAuthor {
    login: String,
}

impl ReviewProvider for GhReviewProvider {
    fn poll(
        &self,
        ctx: &ReviewContext,
        prior: &ReviewPollState,
    ) -> Result<(Vec<ReviewItem>, ReviewPollState)> {
        let output = Command::new("gh")
            .args(["pr", "view", &ctx.branch, "--json", "comments"])
            .current_dir(&ctx.repo_root)
            .output()
            .context("spawn gh pr view")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "gh pr view '{}' failed: {}",
                ctx.branch,
                stderr.trim()
            ));
        }
        let view: GhPrView =
            serde_json::from_slice(&output.stdout).context("parse gh pr view output")?;

        // Comments arrive oldest-first; keep everything after the cursor.
        let seen_boundary = prior
            .last_seen
            .as_deref()
            .and_then(|id| view.comments.iter().position(|c| c.id == id));
        let fresh_from = seen_boundary.map_or(0, |pos| pos + 1);
        let items: Vec<ReviewItem> = view.comments[fresh_from..]
            .iter()
            .map(|c| ReviewItem {
                id: c.id.clone(),
                author: c.author.login.clone(),
                body: c.body.clone(),
            })
            .collect();
        let new_state = ReviewPollState {
            last_seen: view
                .comments
                .last()
                .map(|c| c.id.clone())
                .or_else(|| prior.last_seen.clone()),
        };
        debug!(branch = %ctx.branch, fresh = items.len(), "review poll complete");
        Ok((items, new_state))
    }

    fn respond(
        &self,
        ctx: &ReviewContext,
        message: &str,
        related_item_id: Option<&str>,
    ) -> Result<()> {
        let body = match related_item_id {
            Some(id) => format!("Re {id}: {message}"),
            None => message.to_string(),
        };
        let output = Command::new("gh")
            .args(["pr", "comment", &ctx.branch, "--body", &body])
            .current_dir(&ctx.repo_root)
            .output()
            .context("spawn gh pr comment")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "gh pr comment '{}' failed: {}",
                ctx.branch,
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_state_round_trips() {
        let state = ReviewPollState {
            last_seen: Some("c-42".to_string()),
        };
        let json = serde_json::to_string(&state).expect("serialize");
        let back: ReviewPollState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }

    #[test]
    fn empty_poll_state_defaults_to_no_cursor() {
        let state: ReviewPollState = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(state, ReviewPollState::default());
    }
}
