//! HTTP-archive loading with large-body offloading.
//!
//! Browser HAR captures inline every response body, which makes multi-hundred
//! megabyte files routine. On first sight of a capture, bodies that are large
//! or base64-encoded move into a content-addressed `blob/` directory and a
//! lightweight copy of the capture goes to `lhar/`, identical in shape except
//! that `content.text` is replaced by a `hashtxt`/`hashbin` reference (the
//! two channels keep the text-vs-binary distinction lossless). Later loads
//! read the lightweight copy and open blobs lazily.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::blob::Blob;
use crate::error::{Error, Result};

const OFFLOAD_THRESHOLD: i64 = 2 * 1024 * 1024;

/// A response body pulled out of a HAR entry, keeping track of whether the
/// capture stored it as text.
enum Body {
    Text(String),
    Bin(Vec<u8>),
}

pub struct HarStore {
    root: PathBuf,
}

impl HarStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blob"))?;
        std::fs::create_dir_all(root.join("lhar"))?;
        Ok(HarStore { root })
    }

    fn lhar_path(&self, har_path: &Path) -> PathBuf {
        let name = har_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join("lhar").join(name)
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join("blob").join(hash)
    }

    /// Parsed capture, preferring the lightweight copy when one exists.
    pub fn load(&self, har_path: &Path) -> Result<Value> {
        let lhar_path = self.lhar_path(har_path);
        let path = if lhar_path.exists() { &lhar_path } else { har_path };
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    /// Offloads large bodies of `har_path` and writes the lightweight copy.
    /// Blob names are SHA-1 hashes, so re-running over the same capture is
    /// idempotent.
    pub fn add(&self, har_path: &Path, skip_if_exists: bool) -> Result<()> {
        let lhar_path = self.lhar_path(har_path);
        if skip_if_exists && lhar_path.exists() {
            return Ok(());
        }

        let mut har: Value = serde_json::from_slice(&std::fs::read(har_path)?)?;
        let entries = har
            .pointer_mut("/log/entries")
            .and_then(Value::as_array_mut)
            .map(std::mem::take)
            .unwrap_or_default();

        let mut rewritten = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if should_offload(&entry) {
                match entry_body(&entry) {
                    Ok(Some(body)) => {
                        let content = entry
                            .pointer_mut("/response/content")
                            .and_then(Value::as_object_mut)
                            .expect("checked by should_offload");
                        content.remove("text");
                        content.remove("encoding");
                        let (channel, data) = match body {
                            Body::Text(text) => ("hashtxt", text.into_bytes()),
                            Body::Bin(bin) => ("hashbin", bin),
                        };
                        let hash = sha1_hex(&data);
                        std::fs::write(self.blob_path(&hash), &data)?;
                        content.insert(channel.to_owned(), Value::String(hash));
                    }
                    // Firefox sometimes declares base64 wrongly; keep those
                    // entries inline.
                    Ok(None) | Err(_) => {}
                }
            }
            rewritten.push(entry);
        }

        if let Some(slot) = har.pointer_mut("/log/entries") {
            *slot = Value::Array(rewritten);
        }
        let out = std::fs::File::create(&lhar_path)?;
        serde_json::to_writer_pretty(out, &har)?;
        Ok(())
    }

    /// Body of a (possibly rewritten) entry as a lazily-opened blob, or
    /// `MissingBody` when the capture recorded no content at all.
    pub fn entry_blob(&self, entry: &Value) -> Result<Blob> {
        let content = entry
            .pointer("/response/content")
            .and_then(Value::as_object)
            .ok_or_else(|| missing_body(entry))?;
        let mime = content
            .get("mimeType")
            .and_then(Value::as_str)
            .map(str::to_owned);

        if let Some(hash) = content.get("hashtxt").and_then(Value::as_str) {
            Ok(Blob::on_disk(self.blob_path(hash)).with_mime(mime))
        } else if let Some(hash) = content.get("hashbin").and_then(Value::as_str) {
            Ok(Blob::on_disk(self.blob_path(hash)).with_mime(mime))
        } else if content.contains_key("text") {
            let body = entry_body(entry)?.ok_or_else(|| missing_body(entry))?;
            let data = match body {
                Body::Text(text) => text.into_bytes(),
                Body::Bin(bin) => bin,
            };
            Ok(Blob::in_memory(data).with_mime(mime))
        } else {
            Err(missing_body(entry))
        }
    }
}

fn missing_body(entry: &Value) -> Error {
    let url = entry
        .pointer("/request/url")
        .and_then(Value::as_str)
        .unwrap_or("<unknown url>");
    Error::MissingBody(url.to_owned())
}

fn should_offload(entry: &Value) -> bool {
    let Some(content) = entry.pointer("/response/content").and_then(Value::as_object) else {
        return false;
    };
    if !content.contains_key("text") {
        return false;
    }
    if content.get("encoding").and_then(Value::as_str) == Some("base64") {
        return true;
    }
    content.get("size").and_then(Value::as_i64).unwrap_or(0) >= OFFLOAD_THRESHOLD
}

fn entry_body(entry: &Value) -> Result<Option<Body>> {
    let Some(content) = entry.pointer("/response/content").and_then(Value::as_object) else {
        return Ok(None);
    };
    let Some(text) = content.get("text").and_then(Value::as_str) else {
        return Ok(None);
    };
    if content.get("encoding").and_then(Value::as_str) == Some("base64") {
        let bin = BASE64
            .decode(text)
            .map_err(|err| Error::corrupt(format!("bad base64 body: {err}")))?;
        Ok(Some(Body::Bin(bin)))
    } else {
        Ok(Some(Body::Text(text.to_owned())))
    }
}

fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut hex = String::with_capacity(40);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_har(body: &str, size: i64) -> Value {
        json!({
            "log": {
                "entries": [{
                    "startedDateTime": "2024-05-01T12:00:00.000Z",
                    "request": { "url": "https://x.com/i/api/graphql/q/UserTweets", "cookies": [] },
                    "response": { "content": {
                        "mimeType": "application/json",
                        "size": size,
                        "text": body,
                    }},
                }]
            }
        })
    }

    #[test]
    fn small_bodies_stay_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = HarStore::new(dir.path().join("harstore")).unwrap();
        let har_path = dir.path().join("a.har");
        std::fs::write(&har_path, sample_har("{\"data\":{}}", 11).to_string()).unwrap();

        store.add(&har_path, false).unwrap();
        let lhar = store.load(&har_path).unwrap();
        let entry = &lhar["log"]["entries"][0];
        assert!(entry["response"]["content"]["text"].is_string());
        assert_eq!(store.entry_blob(entry).unwrap().read().unwrap(), b"{\"data\":{}}");
    }

    #[test]
    fn large_bodies_offload_to_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = HarStore::new(dir.path().join("harstore")).unwrap();
        let har_path = dir.path().join("big.har");
        std::fs::write(
            &har_path,
            sample_har("payload", OFFLOAD_THRESHOLD).to_string(),
        )
        .unwrap();

        store.add(&har_path, false).unwrap();
        let lhar = store.load(&har_path).unwrap();
        let content = &lhar["log"]["entries"][0]["response"]["content"];
        assert!(content.get("text").is_none());
        let hash = content["hashtxt"].as_str().unwrap();
        assert_eq!(hash.len(), 40);

        let blob = store.entry_blob(&lhar["log"]["entries"][0]).unwrap();
        assert_eq!(blob.read().unwrap(), b"payload");
        // idempotent under repeated runs
        store.add(&har_path, false).unwrap();
        assert_eq!(
            store.entry_blob(&lhar["log"]["entries"][0]).unwrap().read().unwrap(),
            b"payload"
        );
    }

    #[test]
    fn base64_bodies_become_binary_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = HarStore::new(dir.path().join("harstore")).unwrap();
        let mut har = sample_har(&BASE64.encode(b"\x89PNG"), 4);
        har["log"]["entries"][0]["response"]["content"]["encoding"] = "base64".into();
        let har_path = dir.path().join("img.har");
        std::fs::write(&har_path, har.to_string()).unwrap();

        store.add(&har_path, false).unwrap();
        let lhar = store.load(&har_path).unwrap();
        let content = &lhar["log"]["entries"][0]["response"]["content"];
        assert!(content.get("hashbin").is_some());
        let blob = store.entry_blob(&lhar["log"]["entries"][0]).unwrap();
        assert_eq!(blob.read().unwrap(), b"\x89PNG");
    }

    #[test]
    fn entries_without_body_are_missing() {
        let store = HarStore::new(tempfile::tempdir().unwrap().path().join("s")).unwrap();
        let entry = json!({
            "request": { "url": "https://x.com/i/api/x" },
            "response": { "content": { "size": 0 } },
        });
        assert!(matches!(store.entry_blob(&entry), Err(Error::MissingBody(_))));
    }
}
