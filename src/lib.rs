pub mod blob;
pub mod capture;
pub mod config;
pub mod error;
pub mod ingest;
pub mod media;
pub mod prop;
pub mod seqalign;
pub mod store;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context};
use chrono::DateTime;
use serde_json::Value;
use spdlog::prelude::*;

use crate::blob::{SharedFile, Vfs};
use crate::capture::har::HarStore;
use crate::capture::warc::{self, WarcRecord};
use crate::config::Config;
use crate::ingest::{CaptureContext, Dispatcher};
use crate::store::Store;

/// Owns the per-run capture machinery around the store: the blob cache, the
/// cross-file web-archive response table, and the registry of still-growing
/// archive files.
pub struct Loader {
    pub config: Config,
    pub store: Store,
    har: HarStore,
    ignore_urls: HashSet<String>,
    warc_responses: HashMap<String, WarcRecord>,
    /// Open handle and resume offset per `.warc.open` file; keyed by path so
    /// incremental reloads neither reopen nor re-read.
    warc_open: HashMap<PathBuf, (SharedFile, u64)>,
    seen: HashSet<PathBuf>,
}

impl Loader {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let har = HarStore::new(&config.blob_cache)
            .with_context(|| format!("failed to set up {}", config.blob_cache.display()))?;
        let ignore_urls = config.ignored_urls();
        let mut store = Store::new();
        store.allow_retcon = config.allow_retcon;
        Ok(Loader {
            config,
            store,
            har,
            ignore_urls,
            warc_responses: HashMap::new(),
            warc_open: HashMap::new(),
            seen: HashSet::new(),
        })
    }

    /// Ingests any inputs not seen yet (still-growing web archives are
    /// always revisited) and rebuilds the secondary indexes. Never panics
    /// across this boundary; a failing input aborts that input only.
    pub fn reload(&mut self, args: &[PathBuf]) -> anyhow::Result<()> {
        let paths = gather_inputs(args, &self.config.input_list);
        for path in &paths {
            if self.seen.contains(path) && !is_open_warc(path) {
                continue;
            }
            info!("ingesting {}", path.display());
            if let Err(err) = self.load_single(path) {
                error!("failed to ingest {}: {err}", path.display());
            }
        }
        self.seen = paths.into_iter().collect();

        self.store.rebuild_indexes();
        for (count, uid) in self.store.author_counts() {
            let name = self
                .store
                .profiles
                .get(&uid)
                .and_then(|p| p.screen_name.clone())
                .unwrap_or_else(|| uid.to_string());
            info!("{count:4} {name}");
        }
        Ok(())
    }

    fn load_single(&mut self, path: &Path) -> anyhow::Result<()> {
        let name = path.to_string_lossy().into_owned();
        if name.ends_with(".har") {
            self.har.add(path, true)?;
            self.load_har(path)
        } else if name.ends_with(".warc") {
            // a completed archive may continue one we saw while growing
            let resume = self.warc_open.remove(&path.with_extension("warc.open"));
            self.load_warc(path, resume)?;
            Ok(())
        } else if name.ends_with(".warc.open") {
            let resume = self.warc_open.remove(path);
            let state = self.load_warc(path, resume)?;
            self.warc_open.insert(path.to_owned(), state);
            Ok(())
        } else if name.ends_with(".zip") {
            let fs = Vfs::open_zip(path)?;
            capture::bundle::load_bundle(&mut self.store, &fs)?;
            Ok(())
        } else {
            let fs = Vfs::native(path);
            capture::bundle::load_bundle(&mut self.store, &fs)?;
            Ok(())
        }
    }

    fn dispatch(&mut self, source: &str, blob: &blob::Blob, ctx: &CaptureContext) -> anyhow::Result<()> {
        let mut dispatcher =
            Dispatcher::new(&mut self.store, self.config.strict, &self.ignore_urls);
        match dispatcher.load_api(source, blob, ctx) {
            Ok(()) => Ok(()),
            Err(err) if self.config.strict => Err(err.into()),
            Err(err) => {
                warn!("skipping a response of {source}: {err}");
                Ok(())
            }
        }
    }

    fn load_har(&mut self, path: &Path) -> anyhow::Result<()> {
        let name = path.to_string_lossy().into_owned();
        let lhar = self.har.load(path)?;
        let entries = lhar
            .pointer("/log/entries")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut any_missing = false;
        for entry in &entries {
            let Some(url) = entry.pointer("/request/url").and_then(Value::as_str) else {
                continue;
            };
            let content_present = entry
                .pointer("/response/content")
                .and_then(Value::as_object)
                .is_some_and(|content| !content.is_empty());
            if !content_present {
                continue;
            }
            let blob = match self.har.entry_blob(entry) {
                Ok(blob) => blob,
                Err(err) => {
                    warn!("{err}");
                    if let Some(comment) = entry
                        .pointer("/response/content/comment")
                        .and_then(Value::as_str)
                    {
                        warn!("  {comment}");
                    }
                    any_missing = true;
                    continue;
                }
            };
            let time_ms = entry
                .get("startedDateTime")
                .and_then(Value::as_str)
                .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
                .map(|date| date.timestamp_millis());
            let cookies = entry
                .pointer("/request/cookies")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|cookie| {
                    Some((
                        cookie.get("name")?.as_str()?.to_owned(),
                        cookie.get("value")?.as_str()?.to_owned(),
                    ))
                })
                .collect();
            let ctx = CaptureContext {
                url: url.to_owned(),
                time_ms,
                cookies,
            };
            self.dispatch(&name, &blob, &ctx)?;
        }

        if any_missing {
            warn!("for firefox consider setting devtools.netmonitor.responseBodyLimit higher");
        }
        Ok(())
    }

    fn load_warc(
        &mut self,
        path: &Path,
        resume: Option<(SharedFile, u64)>,
    ) -> anyhow::Result<(SharedFile, u64)> {
        let name = path.to_string_lossy().into_owned();
        let (file, start) = match resume {
            Some(state) => state,
            // the file handle outlives this call: payload blobs reference it
            None => (
                Rc::new(RefCell::new(
                    File::open(path).map_err(|err| anyhow!("failed to open {name}: {err}"))?,
                )),
                0,
            ),
        };

        let (order, end) = warc::read_warc(&file, start, &mut self.warc_responses)?;
        for record_id in &order {
            let Some(record) = self.warc_responses.get(record_id).cloned() else {
                continue;
            };
            if record.is_chunked() {
                continue;
            }
            let status = record.status_line();
            if status.starts_with("HTTP/1.1 404") || status.starts_with("HTTP/1.1 304") {
                continue;
            }
            if record.target_uri.contains("//localhost") {
                continue;
            }
            let cookies = record
                .request_header("Cookie")
                .map(|header| warc::parse_cookie_header(&header))
                .unwrap_or_default();
            let ctx = CaptureContext {
                url: record.target_uri.clone(),
                time_ms: DateTime::parse_from_rfc3339(&record.date)
                    .ok()
                    .map(|date| date.timestamp_millis()),
                cookies,
            };
            self.dispatch(&name, &record.payload, &ctx)?;
        }
        Ok((file, end))
    }
}

fn is_open_warc(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".warc.open")
}

fn is_bundle_dir(path: &Path) -> bool {
    path.join("data").exists() || path.join("tweet.js").exists()
}

/// Deterministic input enumeration: explicit arguments in order, otherwise
/// the input list file plus the current directory (sorted). Export bundles
/// sort before HTTP-archive captures because exports mis-encode retweet
/// parentage and the API captures must win.
pub fn gather_inputs(args: &[PathBuf], input_list: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    fn add_file(paths: &mut Vec<PathBuf>, path: PathBuf, explicit: bool) {
        let name = path.to_string_lossy().into_owned();
        if name.ends_with(".zip")
            || name.ends_with(".har")
            || name.ends_with(".warc")
            || name.ends_with(".warc.open")
        {
            paths.push(path);
        } else if name.ends_with(".txt") && explicit {
            add_list(paths, &path);
        }
    }

    fn add_path(paths: &mut Vec<PathBuf>, path: PathBuf) {
        if path.is_dir() {
            if is_bundle_dir(&path) {
                paths.push(path);
            } else if let Ok(entries) = std::fs::read_dir(&path) {
                let mut names: Vec<PathBuf> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .collect();
                // keep timestamped capture files in order
                names.sort();
                for name in names {
                    add_file(paths, name, false);
                }
            }
        } else {
            add_file(paths, path, true);
        }
    }

    fn add_list(paths: &mut Vec<PathBuf>, path: &Path) {
        let Ok(text) = std::fs::read_to_string(path) else {
            return;
        };
        for line in text.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                add_path(paths, PathBuf::from(line));
            }
        }
    }

    if args.is_empty() {
        add_list(&mut paths, input_list);
        add_path(&mut paths, PathBuf::from("."));
    } else {
        for arg in args {
            add_path(&mut paths, arg.clone());
        }
    }

    // archive data is broken for retweets, apply HTTP captures last so they
    // overwrite it
    paths.sort_by_key(|path| path.to_string_lossy().ends_with(".har"));
    paths
}

/// Builds the store from the given inputs. The serving layer keeps the
/// returned loader around and calls `reload` to pick up new captures.
pub fn run(config: Config, inputs: &[PathBuf]) -> anyhow::Result<Loader> {
    let mut loader = Loader::new(config)?;
    loader.reload(inputs)?;
    info!(
        "loaded {} posts, {} profiles, {} conversations",
        loader.store.posts.len(),
        loader.store.profiles.len(),
        loader.store.conversations.len()
    );
    Ok(loader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn har_inputs_sort_after_bundles() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.har", "a.zip", "c.warc", "a.har"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let paths = gather_inputs(&[dir.path().to_owned()], Path::new("exports.txt"));
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.zip", "c.warc", "a.har", "b.har"]);
    }

    #[test]
    fn explicit_args_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("later.har");
        let b = dir.path().join("earlier.warc");
        std::fs::write(&a, b"").unwrap();
        std::fs::write(&b, b"").unwrap();
        let paths = gather_inputs(&[b.clone(), a.clone()], Path::new("exports.txt"));
        assert_eq!(paths, vec![b, a]);
    }

    #[test]
    fn list_files_expand_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let warc = dir.path().join("x.warc");
        std::fs::write(&warc, b"").unwrap();
        let inner = dir.path().join("inner.txt");
        std::fs::write(&inner, format!("# comment\n{}\n", warc.display())).unwrap();
        let outer = dir.path().join("outer.txt");
        std::fs::write(&outer, format!("{}\n", inner.display())).unwrap();

        let paths = gather_inputs(&[outer], Path::new("exports.txt"));
        assert_eq!(paths, vec![warc]);
    }

    #[test]
    fn bundle_directories_are_kept_whole() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let paths = gather_inputs(&[dir.path().to_owned()], Path::new("exports.txt"));
        assert_eq!(paths, vec![dir.path().to_owned()]);
    }
}
