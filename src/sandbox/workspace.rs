//! Per-session sandbox workspaces
//!
//! Each chat session owns one working directory whose name is derived from
//! the session key, so artifacts written by the sandboxed code survive across
//! runs of the same session. Every run freshly overwrites the two delivered
//! artifacts: the generated code file and the runtime shim.

use std::io;
use std::path::{Path, PathBuf};

/// Code file delivered into the workspace each run
pub const CODE_FILE: &str = "main.py";
/// Runtime shim delivered into the workspace each run
pub const SHIM_FILE: &str = "shim.py";

/// Fixed import preamble prepended to every generated code file.
const CODE_PREAMBLE: &str = "import sys\nsys.path.insert(0, '/sandbox/packages')\nfrom shim import *  # session capability stubs\n\n";

/// Runtime shim template. Capability calls are plain HTTP callbacks to the
/// host-side API, which resolves them against the session's registered
/// plugin methods.
const SHIM_TEMPLATE: &str = r#"# generated, do not edit
import base64
import json
import os
import sys
import urllib.request

SESSION_KEY = {session_key}
HOST_API = {host_api}


def _rpc(method, **kwargs):
    body = json.dumps({"session": SESSION_KEY, "method": method, "args": kwargs}).encode()
    req = urllib.request.Request(
        HOST_API + "/sandbox/rpc",
        data=body,
        headers={"Content-Type": "application/json"},
    )
    with urllib.request.urlopen(req, timeout=30) as resp:
        return json.loads(resp.read().decode())


def send_msg(text):
    _rpc("send_msg", text=text)


def send_image(path):
    _rpc("send_image", path=os.path.abspath(path))


def agent_response(text):
    """Reply directly and stop; code after this call does not run."""
    sys.stdout.write(text)
    sys.stdout.flush()
    sys.exit(8)


def manual_stop():
    sys.exit(9)


def image_part(path):
    """Wrap an image file as an inline part for multimodal_response."""
    with open(path, "rb") as f:
        return "<|media|>" + base64.b64encode(f.read()).decode() + "<|/media|>"


def multimodal_response(parts):
    for part in parts:
        sys.stdout.write(part)
    sys.stdout.flush()
    sys.exit(11)
"#;

/// Materializes and addresses per-session working directories.
#[derive(Debug, Clone)]
pub struct SandboxWorkspace {
    root: PathBuf,
    host_api_url: String,
}

impl SandboxWorkspace {
    pub fn new(root: impl Into<PathBuf>, host_api_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            host_api_url: host_api_url.into(),
        }
    }

    /// Stable directory name for a session key.
    ///
    /// Sanitizes the key for the filesystem and appends a short stable hash
    /// so distinct keys that sanitize identically cannot share a directory.
    pub fn dir_name(session_key: &str) -> String {
        let sanitized: String = session_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .take(48)
            .collect();
        format!("chat-{}-{:08x}", sanitized, fnv1a(session_key.as_bytes()))
    }

    /// Absolute path of the session's working directory.
    pub fn session_dir(&self, session_key: &str) -> PathBuf {
        self.root.join(Self::dir_name(session_key))
    }

    /// Write the two delivered artifacts for this run, creating the directory
    /// on first use. Pre-existing artifacts are overwritten; anything else in
    /// the directory is left alone so session artifacts persist across runs.
    pub fn materialize(&self, session_key: &str, code: &str) -> io::Result<PathBuf> {
        let dir = self.session_dir(session_key);
        std::fs::create_dir_all(&dir)?;

        let mut source = String::with_capacity(CODE_PREAMBLE.len() + code.len());
        source.push_str(CODE_PREAMBLE);
        source.push_str(code);
        std::fs::write(dir.join(CODE_FILE), source)?;

        let shim = SHIM_TEMPLATE
            .replace("{session_key}", &py_str(session_key))
            .replace("{host_api}", &py_str(&self.host_api_url));
        std::fs::write(dir.join(SHIM_FILE), shim)?;

        Ok(dir)
    }

    /// Delete the session's working directory. Missing directory is fine.
    pub fn remove(&self, session_key: &str) -> io::Result<()> {
        let dir = self.session_dir(session_key);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Quote a string as a Python literal.
fn py_str(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Tiny stable hash for directory-name disambiguation.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}
