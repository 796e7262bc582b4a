//! Guarded file mutation.
//!
//! Every write to a file that already exists is preceded by a timestamped
//! backup (`<path>.backup.<YYYYmmddHHMMSS>`, suffixed `.1`, `.2`, ... when a
//! backup for the same second already exists). Writes that would not change
//! the content are skipped entirely, backup included.
//!
//! Managed blocks are parsed into a [`ManagedDocument`] rather than patched as
//! raw text:
//!
//! ```text
//! # BEGIN <tag>
//! ...body...
//! # END <tag>
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::fs_abstraction::FileSystem;

const BEGIN: &str = "# BEGIN ";
const END: &str = "# END ";
/// Tags this tool writes.
const OWNED_PREFIX: &str = "bastion";

/// Where a managed block goes.
#[derive(Debug, Clone, Copy)]
pub enum Anchor<'s> {
    /// Immediately before the last line whose trimmed text equals this.
    /// The block inherits that line's indentation.
    BeforeLast(&'s str),
    /// At the top of the file.
    StartOfFile,
    /// At the end of the file.
    EndOfFile,
}

/// What a tracked write did to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The file did not exist before.
    Created(PathBuf),
    /// The file existed; its previous content is in `backup`.
    Replaced { path: PathBuf, backup: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Line(String),
    Block {
        tag: String,
        indent: String,
        body: Vec<String>,
    },
}

/// A text file split into plain lines and tagged blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDocument {
    segments: Vec<Segment>,
    trailing_newline: bool,
}

impl ManagedDocument {
    /// Split `text` into lines and blocks.
    ///
    /// A foreign `# BEGIN` without its own `# END` stays plain text. The
    /// same defect in one of our own blocks is an error.
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.lines().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            if let Some(tag) = line.trim().strip_prefix(BEGIN).map(str::trim) {
                match closing_marker(&lines[i + 1..], tag) {
                    Some(len) => {
                        segments.push(Segment::Block {
                            tag: tag.to_string(),
                            indent: leading_whitespace(line).to_string(),
                            body: lines[i + 1..i + 1 + len]
                                .iter()
                                .map(|l| l.to_string())
                                .collect(),
                        });
                        i += len + 2;
                        continue;
                    }
                    None if tag.starts_with(OWNED_PREFIX) => {
                        anyhow::bail!(
                            "Managed block '{}' at line {} has no end marker",
                            tag,
                            i + 1
                        );
                    }
                    None => debug!("Unmatched '{}' at line {} left as text", line.trim(), i + 1),
                }
            }
            segments.push(Segment::Line(line.to_string()));
            i += 1;
        }

        Ok(Self {
            segments,
            trailing_newline: text.is_empty() || text.ends_with('\n'),
        })
    }

    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Line(line) => lines.push(line.clone()),
                Segment::Block { tag, indent, body } => {
                    lines.push(format!("{}{}{}", indent, BEGIN, tag));
                    lines.extend(body.iter().cloned());
                    lines.push(format!("{}{}{}", indent, END, tag));
                }
            }
        }
        let mut out = lines.join("\n");
        if self.trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn has_block(&self, tag: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Block { tag: t, .. } if t == tag))
    }

    pub fn block_count(&self, tag: &str) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Block { tag: t, .. } if t == tag))
            .count()
    }

    /// Body of block `tag` with the block indentation removed.
    pub fn block_body(&self, tag: &str) -> Option<String> {
        self.segments.iter().find_map(|s| match s {
            Segment::Block { tag: t, indent, body } if t == tag => Some(
                body.iter()
                    .map(|l| l.strip_prefix(indent.as_str()).unwrap_or(l))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        })
    }

    /// Whether an unmanaged line contains `needle`.
    pub fn plain_lines_contain(&self, needle: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Line(l) if l.contains(needle)))
    }

    /// Insert a block tagged `tag` at `anchor`.
    ///
    /// Returns `false` when the block already exists. Fails when the anchor
    /// line is missing.
    pub fn insert_block(&mut self, tag: &str, body: &str, anchor: Anchor<'_>) -> Result<bool> {
        if self.has_block(tag) {
            return Ok(false);
        }

        let (position, indent) = match anchor {
            Anchor::StartOfFile => (0, String::new()),
            Anchor::EndOfFile => (self.segments.len(), String::new()),
            Anchor::BeforeLast(text) => {
                let position = self
                    .segments
                    .iter()
                    .rposition(|s| matches!(s, Segment::Line(l) if l.trim() == text))
                    .ok_or_else(|| ProvisionError::MissingAnchor {
                        path: String::new(),
                        anchor: text.to_string(),
                    })?;
                let indent = match &self.segments[position] {
                    Segment::Line(l) => leading_whitespace(l).to_string(),
                    Segment::Block { .. } => String::new(),
                };
                (position, indent)
            }
        };

        let body = body
            .lines()
            .map(|l| {
                if l.is_empty() {
                    String::new()
                } else {
                    format!("{}{}", indent, l)
                }
            })
            .collect();
        self.segments.insert(
            position,
            Segment::Block {
                tag: tag.to_string(),
                indent,
                body,
            },
        );
        Ok(true)
    }

    /// Remove every block tagged `tag`. Returns whether anything was removed.
    pub fn remove_block(&mut self, tag: &str) -> bool {
        let before = self.segments.len();
        self.segments
            .retain(|s| !matches!(s, Segment::Block { tag: t, .. } if t == tag));
        self.segments.len() != before
    }

    /// Remove unmanaged lines matching `pattern`. Returns how many went.
    pub fn remove_matching(&mut self, pattern: &Regex) -> usize {
        let before = self.segments.len();
        self.segments
            .retain(|s| !matches!(s, Segment::Line(l) if pattern.is_match(l)));
        before - self.segments.len()
    }
}

/// Body length of the block opened by `tag`, if its end marker comes
/// before any other begin marker.
fn closing_marker(rest: &[&str], tag: &str) -> Option<usize> {
    for (n, line) in rest.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.strip_prefix(END).map(str::trim) == Some(tag) {
            return Some(n);
        }
        if trimmed.starts_with(BEGIN) {
            return None;
        }
    }
    None
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}

/// Applies changes to files with backup-before-write.
pub struct FileMutator<'a> {
    fs: &'a dyn FileSystem,
}

impl<'a> FileMutator<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &'a dyn FileSystem {
        self.fs
    }

    /// Copy `path` to a fresh timestamped backup. No-op when `path` is absent.
    pub fn backup(&self, path: &Path) -> Result<Option<PathBuf>> {
        if !self.fs.exists(path) {
            return Ok(None);
        }
        let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let base = format!("{}.backup.{}", path.display(), stamp);
        let mut target = PathBuf::from(&base);
        let mut n = 1;
        while self.fs.exists(&target) {
            target = PathBuf::from(format!("{}.{}", base, n));
            n += 1;
        }
        self.fs
            .copy(path, &target)
            .with_context(|| format!("Failed to back up {:?} to {:?}", path, target))?;
        debug!("Backed up {} to {}", path.display(), target.display());
        Ok(Some(target))
    }

    /// Current content, or `None` when the file does not exist.
    pub fn read(&self, path: &Path) -> Result<Option<String>> {
        if !self.fs.exists(path) {
            return Ok(None);
        }
        self.fs
            .read_to_string(path)
            .map(Some)
            .with_context(|| format!("Failed to read {:?}", path))
    }

    /// Write `content` to `path` unless it already holds exactly that.
    ///
    /// Backs up a pre-existing file first. Returns whether a write happened.
    pub fn write_file(&self, path: &Path, content: &str, mode: Option<u32>) -> Result<bool> {
        Ok(self.stage_file(path, content, mode)?.is_some())
    }

    /// Like [`write_file`](Self::write_file) but reports what changed, so the
    /// caller can undo it.
    pub fn stage_file(&self, path: &Path, content: &str, mode: Option<u32>) -> Result<Option<Change>> {
        let current = self.read(path)?;
        if current.as_deref() == Some(content) {
            if let Some(mode) = mode {
                self.fs.set_permissions_mode(path, mode)?;
            }
            return Ok(None);
        }

        let change = match current {
            Some(_) => {
                let backup = self.backup(path)?.ok_or_else(|| {
                    ProvisionError::FileSystem(format!("{} vanished during backup", path.display()))
                })?;
                Change::Replaced {
                    path: path.to_path_buf(),
                    backup,
                }
            }
            None => {
                if let Some(parent) = path.parent() {
                    if !self.fs.exists(parent) {
                        self.fs
                            .create_dir_all(parent)
                            .with_context(|| format!("Failed to create {:?}", parent))?;
                    }
                }
                Change::Created(path.to_path_buf())
            }
        };

        self.fs
            .write(path, content.as_bytes())
            .with_context(|| format!("Failed to write {:?}", path))?;
        if let Some(mode) = mode {
            self.fs.set_permissions_mode(path, mode)?;
        }
        info!("Wrote {}", path.display());
        Ok(Some(change))
    }

    /// Run `edit` on the parsed document and write back if anything changed.
    fn edit<T>(
        &self,
        path: &Path,
        edit: impl FnOnce(&mut ManagedDocument) -> Result<T>,
    ) -> Result<(T, Option<Change>)> {
        let original = self.read(path)?.ok_or_else(|| {
            ProvisionError::FileSystem(format!("{} does not exist", path.display()))
        })?;
        let mut doc = ManagedDocument::parse(&original)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        let result = edit(&mut doc).map_err(|e| -> anyhow::Error {
            match e.downcast::<ProvisionError>() {
                Ok(ProvisionError::MissingAnchor { anchor, .. }) => ProvisionError::MissingAnchor {
                    path: path.display().to_string(),
                    anchor,
                }
                .into(),
                Ok(other) => other.into(),
                Err(e) => e,
            }
        })?;
        let updated = doc.render();
        let change = if updated != original {
            self.stage_file(path, &updated, None)?
        } else {
            None
        };
        Ok((result, change))
    }

    /// Append `line` unless a line equal to it exists. Creates the file.
    pub fn upsert_line(&self, path: &Path, line: &str) -> Result<bool> {
        let current = self.read(path)?.unwrap_or_default();
        if current.lines().any(|l| l == line) {
            return Ok(false);
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(line);
        updated.push('\n');
        self.write_file(path, &updated, None)
    }

    /// Insert `body` as block `tag` before `anchor`, once.
    ///
    /// Skipped when the block exists, or when `fingerprint` already appears
    /// in the unmanaged part of the file.
    pub fn insert_block(
        &self,
        path: &Path,
        tag: &str,
        body: &str,
        anchor: Anchor<'_>,
        fingerprint: Option<&str>,
    ) -> Result<bool> {
        Ok(self
            .stage_block_insert(path, tag, body, anchor, fingerprint)?
            .is_some())
    }

    /// Like [`insert_block`](Self::insert_block) but reports the change.
    pub fn stage_block_insert(
        &self,
        path: &Path,
        tag: &str,
        body: &str,
        anchor: Anchor<'_>,
        fingerprint: Option<&str>,
    ) -> Result<Option<Change>> {
        let (_, change) = self.edit(path, |doc| {
            if let Some(needle) = fingerprint {
                if doc.plain_lines_contain(needle) {
                    return Ok(false);
                }
            }
            doc.insert_block(tag, body, anchor)
        })?;
        if change.is_some() {
            info!("Inserted managed block '{}' into {}", tag, path.display());
        } else {
            debug!("Managed block '{}' already present in {}", tag, path.display());
        }
        Ok(change)
    }

    /// Remove block `tag`. Returns whether it was present.
    pub fn remove_block(&self, path: &Path, tag: &str) -> Result<bool> {
        Ok(self.stage_block_removal(path, tag)?.is_some())
    }

    /// Remove block `tag`, reporting the change for a later undo.
    pub fn stage_block_removal(&self, path: &Path, tag: &str) -> Result<Option<Change>> {
        if !self.fs.exists(path) {
            return Ok(None);
        }
        let (_, change) = self.edit(path, |doc| Ok(doc.remove_block(tag)))?;
        Ok(change)
    }

    /// Remove unmanaged lines matching `pattern`.
    pub fn remove_matching(&self, path: &Path, pattern: &Regex) -> Result<usize> {
        if !self.fs.exists(path) {
            return Ok(0);
        }
        let (removed, _) = self.edit(path, |doc| Ok(doc.remove_matching(pattern)))?;
        Ok(removed)
    }

    /// Put `backup` back in place of `path`.
    pub fn restore(&self, backup: &Path, path: &Path) -> Result<()> {
        self.fs
            .copy(backup, path)
            .with_context(|| format!("Failed to restore {:?} from {:?}", path, backup))?;
        info!("Restored {} from {}", path.display(), backup.display());
        Ok(())
    }

    /// Delete `path` if present. Returns whether it existed.
    pub fn remove_file(&self, path: &Path) -> Result<bool> {
        if !self.fs.exists(path) && !self.fs.is_symlink(path) {
            return Ok(false);
        }
        self.fs
            .remove_file(path)
            .with_context(|| format!("Failed to remove {:?}", path))?;
        Ok(true)
    }
}
