//! `ssh.*`: authorized key inventory and the SSH activity stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use super::{Services, StreamParams};
use crate::dispatcher::{ActionContext, ActionOutput};
use crate::error::HostdResult;
use crate::types::Domain;

/// One `authorized_keys` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedKey {
    pub user: String,
    pub path: String,
    pub line: usize,
    pub key_type: String,
    /// Short stable identity of the key material
    pub key_id: String,
    pub comment: Option<String>,
    pub options: Vec<String>,
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-")
        || token.starts_with("ecdsa-sha2-")
        || token.starts_with("sk-ssh-")
        || token.starts_with("sk-ecdsa-")
}

/// Split the leading options field, honoring double quotes. Returns the
/// field and the remainder.
fn split_options(line: &str) -> (&str, &str) {
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ' ' | '\t' if !quoted => return (&line[..i], line[i..].trim_start()),
            _ => {}
        }
    }
    (line, "")
}

/// Split `a,b="x,y",c` on unquoted commas.
fn split_option_list(field: &str) -> Vec<String> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in field.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => options.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        options.push(current);
    }
    options
}

/// Parse one line. Blank lines, comments and lines without key material
/// yield `None`.
pub fn parse_key_line(user: &str, path: &str, line_no: usize, line: &str) -> Option<AuthorizedKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (options, rest) = match line.split_whitespace().next() {
        Some(first) if is_key_type(first) => (Vec::new(), line),
        _ => {
            let (field, rest) = split_options(line);
            (split_option_list(field), rest)
        }
    };

    let mut parts = rest.splitn(3, char::is_whitespace);
    let key_type = parts.next().filter(|t| is_key_type(t))?;
    let blob = parts.next().filter(|b| !b.is_empty())?;
    let comment = parts.next().map(str::trim).filter(|c| !c.is_empty()).map(str::to_string);

    Some(AuthorizedKey {
        user: user.to_string(),
        path: path.to_string(),
        line: line_no,
        key_type: key_type.to_string(),
        key_id: format!("{:016x}", xxh3_64(blob.as_bytes())),
        comment,
        options,
    })
}

/// `/home/alice/.ssh/authorized_keys` -> `alice`, `/root/...` -> `root`.
pub fn owner_of(path: &Path) -> String {
    path.parent()
        .filter(|dir| dir.file_name().map_or(false, |n| n == ".ssh"))
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".into())
}

/// Read every file matching `patterns`. Unreadable files are reported, not
/// fatal.
pub async fn inventory(patterns: &[String]) -> serde_json::Value {
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut errors = Vec::new();
    for pattern in patterns {
        match glob::glob(pattern) {
            Ok(matches) => paths.extend(matches.filter_map(Result::ok)),
            Err(e) => errors.push(json!({ "path": pattern, "error": e.to_string() })),
        }
    }
    paths.sort();
    paths.dedup();

    let mut keys = Vec::new();
    for path in &paths {
        let shown = path.display().to_string();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let user = owner_of(path);
                keys.extend(
                    content
                        .lines()
                        .enumerate()
                        .filter_map(|(i, line)| parse_key_line(&user, &shown, i + 1, line)),
                );
            }
            Err(e) => {
                debug!(target: "hostd::actions", path = %shown, error = %e, "authorized_keys unreadable");
                errors.push(json!({ "path": shown, "error": e.to_string() }));
            }
        }
    }

    json!({
        "count": keys.len(),
        "keys": keys,
        "files": paths.len(),
        "errors": errors,
    })
}

pub async fn keys(services: Arc<Services>, _ctx: ActionContext) -> HostdResult<ActionOutput> {
    Ok(ActionOutput::Response(
        inventory(&services.config.actions.authorized_keys).await,
    ))
}

pub async fn events(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: StreamParams = ctx.params()?;
    services.subscribe(&ctx, Domain::AuthLog, &params, None)
}
