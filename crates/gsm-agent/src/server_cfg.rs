//! Line-oriented `key value` editing for `server.cfg`.
//!
//! Lines are never added or reordered. Each managed key rewrites only the
//! first line whose first whitespace-delimited token equals the key.

use std::{borrow::Cow, path::Path};

use crate::error::{ProvisionError, Result};
use crate::instance::InstanceConfig;

pub const RCON_PASSWORD: &str = "rcon_password";

/// Stock config shipped with the SA-MP server package.
const DEFAULT_SERVER_CFG: &str = "echo Executing Server Config...
lanmode 0
rcon_password changeme
maxplayers 50
port 7777
hostname SA-MP 0.3 Server
gamemode0 grandlarc 1
filterscripts base gl_actions gl_property gl_realtime
announce 0
chatlogging 0
weburl www.sa-mp.com
onfoot_rate 40
incar_rate 40
weapon_rate 40
stream_distance 300.0
stream_rate 1000
maxnpc 0
logtimeformat [%H:%M:%S]
language English
";

/// Ordered set of managed keys. Order is the order the keys are applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Overrides(Vec<(String, String)>);

impl Overrides {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Later inserts of an existing key replace its value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The instance overrides in their fixed application order.
    pub fn for_instance(cfg: &InstanceConfig) -> Self {
        let mut o = Self::new();
        o.insert(RCON_PASSWORD, cfg.rcon_password.clone());
        o.insert("maxplayers", cfg.max_players.to_string());
        o.insert("port", cfg.port.to_string());
        o.insert("hostname", cfg.hostname.clone());
        o.insert("announce", "1");
        o.insert("chatlogging", "1");
        o
    }
}

/// Splits a line into its body and its terminator (`\r\n`, `\n` or empty).
fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    let body = match line {
        [rest @ .., b'\r', b'\n'] => rest.len(),
        [rest @ .., b'\n'] => rest.len(),
        _ => line.len(),
    };
    line.split_at(body)
}

fn first_token(line: &[u8]) -> Option<&[u8]> {
    let (body, _) = split_terminator(line);
    body.split(|b| b.is_ascii_whitespace()).find(|t| !t.is_empty())
}

/// Applies `overrides` to raw config bytes and returns the new contents.
///
/// Only matched lines change. A rewritten line keeps its own terminator, so
/// mixed endings survive and an unterminated last line stays unterminated.
/// Bytes outside rewritten lines are copied through untouched, whatever
/// their encoding.
pub fn patch_bytes(raw: &[u8], overrides: &Overrides, exclude: Option<&str>) -> Vec<u8> {
    let mut lines: Vec<Cow<'_, [u8]>> = raw
        .split_inclusive(|b| *b == b'\n')
        .map(Cow::Borrowed)
        .collect();

    for (key, value) in overrides.iter() {
        if exclude == Some(key) {
            continue;
        }
        let Some(line) = lines
            .iter_mut()
            .find(|l| first_token(&l[..]) == Some(key.as_bytes()))
        else {
            continue;
        };
        let mut rewritten = format!("{key} {value}").into_bytes();
        rewritten.extend_from_slice(split_terminator(&line[..]).1);
        *line = Cow::Owned(rewritten);
    }

    lines.concat()
}

/// [`patch_bytes`] for text already held as a string.
pub fn patch_text(text: &str, overrides: &Overrides, exclude: Option<&str>) -> String {
    String::from_utf8_lossy(&patch_bytes(text.as_bytes(), overrides, exclude)).into_owned()
}

/// Rewrites the config file at `path` in place.
pub async fn apply_overrides(
    path: &Path,
    overrides: &Overrides,
    exclude: Option<&str>,
) -> Result<()> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| ProvisionError::fs(path, e))?;
    let patched = patch_bytes(&raw, overrides, exclude);
    if patched == raw {
        return Ok(());
    }

    let tmp = path.with_extension("cfg.tmp");
    tokio::fs::write(&tmp, &patched)
        .await
        .map_err(|e| ProvisionError::fs(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ProvisionError::fs(path, e))?;
    tracing::debug!(path = %path.display(), ?exclude, "patched server config");
    Ok(())
}

/// Writes the stock config when none exists. Returns whether a file was written.
pub async fn ensure_default(path: &Path) -> Result<bool> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProvisionError::fs(parent, e))?;
    }
    tokio::fs::write(path, DEFAULT_SERVER_CFG.as_bytes())
        .await
        .map_err(|e| ProvisionError::fs(path, e))?;
    Ok(true)
}
