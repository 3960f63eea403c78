//! Manifest codec: `meta.info` line records <-> [`Manifest`].
//!
//! One `key:::value` statement per line. Each file block ends with the `:#!` sentinel,
//! which also resets the file being accumulated. Unknown keys are skipped and numeric
//! values that do not parse read as zero.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{LynkError, Result};
use crate::lynk::{
    FileEntry, DEFAULT_CHUNKS, DEFAULT_CHUNK_LENGTH, META_FILE, SEP, TRACKER_MARKER,
};

/// Closes one file block.
pub const END_OF_ENTRY: &str = ":#!";

/// Persisted description of a lynk: tracker, identity and file list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub tracker: String,
    pub name: String,
    pub owner: String,
    pub files: Vec<FileEntry>,
}

/// One manifest line, typed by its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Announce(String),
    LynkName(String),
    Owner(String),
    Length(u64),
    Path(String),
    Name(String),
    ChunkLength(u64),
    Chunks(String),
    EndOfEntry,
    Unknown,
}

impl Record {
    pub fn parse(line: &str) -> Record {
        let line = line.trim();
        if line == END_OF_ENTRY {
            return Record::EndOfEntry;
        }
        let Some((key, value)) = line.split_once(SEP) else {
            return Record::Unknown;
        };
        let value = value.to_string();
        match key {
            "announce" => Record::Announce(value),
            "lynkName" => Record::LynkName(value),
            "owner" => Record::Owner(value),
            "length" => Record::Length(lenient_int(&value)),
            "path" => Record::Path(value),
            "name" => Record::Name(value),
            "chunkLength" => Record::ChunkLength(lenient_int(&value)),
            "chunks" => Record::Chunks(value),
            _ => Record::Unknown,
        }
    }
}

fn lenient_int(value: &str) -> u64 {
    value.trim().parse().unwrap_or(0)
}

impl Manifest {
    pub fn new(tracker: &str, name: &str, owner: &str) -> Self {
        Self {
            tracker: tracker.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
            files: Vec::new(),
        }
    }

    pub fn decode(text: &str) -> Manifest {
        let mut manifest = Manifest::default();
        let mut pending = FileEntry::default();
        for line in text.lines() {
            match Record::parse(line) {
                Record::Announce(v) => manifest.tracker = v,
                Record::LynkName(v) => manifest.name = v,
                Record::Owner(v) => manifest.owner = v,
                Record::Length(n) => pending.length = n,
                Record::Path(v) => pending.path = v,
                Record::Name(v) => pending.name = v,
                Record::ChunkLength(n) => pending.chunk_length = n,
                Record::Chunks(v) => pending.chunks = v,
                Record::EndOfEntry => manifest.files.push(std::mem::take(&mut pending)),
                Record::Unknown => {}
            }
        }
        manifest
    }

    pub fn encode(&self) -> String {
        let mut out = header(&self.tracker, &self.name, &self.owner);
        for f in &self.files {
            out.push_str(&file_block(f));
        }
        out
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.files.iter().any(|f| f.name == file_name)
    }

    /// Drop the entry named `file_name`. Returns whether one was present.
    pub fn remove_file(&mut self, file_name: &str) -> bool {
        let before = self.files.len();
        self.files.retain(|f| f.name != file_name);
        before != self.files.len()
    }
}

fn header(tracker: &str, name: &str, owner: &str) -> String {
    format!("announce{SEP}{tracker}\nlynkName{SEP}{name}\nowner{SEP}{owner}\n")
}

fn file_block(f: &FileEntry) -> String {
    format!(
        "length{SEP}{}\npath{SEP}{}\nname{SEP}{}\nchunkLength{SEP}{}\nchunks{SEP}{}\n{END_OF_ENTRY}\n",
        f.length, f.path, f.name, f.chunk_length, f.chunks
    )
}

/// Reject anything that is not a `meta.info` file, then read it.
pub fn parse(manifest_path: &Path) -> Result<Manifest> {
    ensure_manifest_path(manifest_path)?;
    let text = fs::read_to_string(manifest_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            LynkError::NotFound(manifest_path.display().to_string())
        }
        _ => LynkError::Io(e),
    })?;
    Ok(Manifest::decode(&text))
}

fn ensure_manifest_path(path: &Path) -> Result<()> {
    if path.file_name().and_then(|n| n.to_str()) != Some(META_FILE) {
        return Err(LynkError::InvalidFormat(path.to_path_buf()));
    }
    Ok(())
}

/// Full rewrite through a temp file in the same directory, renamed over the old manifest.
pub fn write(manifest_path: &Path, manifest: &Manifest) -> Result<()> {
    ensure_manifest_path(manifest_path)?;
    write_atomic(manifest_path, manifest.encode().as_bytes())
}

pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Stat `file_path` and append its block to the manifest. A name already listed is a
/// `Duplicate` and the manifest is left untouched.
pub fn append_file(file_path: &Path, manifest_path: &Path) -> Result<FileEntry> {
    let manifest = parse(manifest_path)?;
    let entry = entry_for(file_path)?;
    if manifest.contains(&entry.name) {
        return Err(LynkError::Duplicate(entry.name));
    }
    let mut out = OpenOptions::new().append(true).open(manifest_path)?;
    out.write_all(file_block(&entry).as_bytes())?;
    out.sync_all()?;
    Ok(entry)
}

fn entry_for(file_path: &Path) -> Result<FileEntry> {
    let meta = fs::metadata(file_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LynkError::NotFound(file_path.display().to_string()),
        _ => LynkError::Io(e),
    })?;
    let name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| LynkError::InvalidFormat(file_path.to_path_buf()))?
        .to_string();
    let path = fs::canonicalize(file_path)?;
    Ok(FileEntry {
        length: meta.len(),
        path: path.to_string_lossy().replace('\\', "/"),
        name,
        chunk_length: DEFAULT_CHUNK_LENGTH,
        chunks: DEFAULT_CHUNKS.to_string(),
    })
}

/// Every file under `dir` that belongs in a manifest, first of each base name only.
/// Directories, the manifest itself and tracker scratch paths are left out.
pub fn scan(dir: &Path) -> Result<Vec<FileEntry>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if entry.file_type().is_dir() || !qualifies(relative) {
            continue;
        }
        let file = entry_for(entry.path())?;
        if !seen.insert(file.name.clone()) {
            debug!("Skipping {}: name already listed", entry.path().display());
            continue;
        }
        out.push(file);
    }
    Ok(out)
}

fn qualifies(path: &Path) -> bool {
    if path.file_name().and_then(|n| n.to_str()) == Some(META_FILE) {
        return false;
    }
    !path
        .components()
        .any(|c| c.as_os_str().to_string_lossy().contains(TRACKER_MARKER))
}

/// Point `file_name`'s entry at the copy now held at `local`. Returns false when the
/// manifest does not list that name.
pub fn record_local(manifest_path: &Path, file_name: &str, local: &Path) -> Result<bool> {
    let mut manifest = parse(manifest_path)?;
    let path = fs::canonicalize(local)?
        .to_string_lossy()
        .replace('\\', "/");
    let Some(entry) = manifest.files.iter_mut().find(|f| f.name == file_name) else {
        return Ok(false);
    };
    if entry.path == path {
        return Ok(true);
    }
    entry.path = path;
    write(manifest_path, &manifest)?;
    Ok(true)
}

/// Publish semantics: a fresh manifest listing every qualifying file now under `dir`.
pub fn build(dir: &Path, tracker: &str, name: &str, owner: &str) -> Result<Manifest> {
    let mut manifest = Manifest::new(tracker, name, owner);
    manifest.files = scan(dir)?;
    write(&dir.join(META_FILE), &manifest)?;
    Ok(manifest)
}
