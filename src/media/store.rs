//! Content store for captured media.
//!
//! Variants of the same logical asset group under its canonical base. Images
//! rank by declared size and fall back to the largest available rendition;
//! videos keep whichever bytes were captured first. Segmented videos
//! (`*.m3u8.mp4` requests) are reassembled from their playlist through an
//! external ffmpeg invocation.

use std::collections::HashMap;
use std::io::Write;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use spdlog::prelude::*;

use crate::blob::{Blob, Vfs};
use crate::error::{Error, Result};
use crate::media::url::{decode_media_url, SizeClass};

struct ImageSet {
    // (format, variant, blob), ordered smallest rendition first
    entries: Vec<(Option<String>, Option<String>, Blob)>,
    sizes: Option<SizeClass>,
    fullres: Option<String>,
    // whether the largest rendition is known to be among the entries
    have_largest: bool,
}

impl ImageSet {
    fn new() -> Self {
        ImageSet {
            entries: Vec::new(),
            sizes: None,
            fullres: None,
            have_largest: false,
        }
    }

    fn add(
        &mut self,
        blob: Blob,
        format: Option<String>,
        variant: Option<String>,
        sizes: SizeClass,
        fullres: Option<String>,
    ) {
        match self.sizes {
            None => self.sizes = Some(sizes),
            Some(existing) if existing != sizes => {
                warn!("size table mismatch within one asset group, keeping {existing:?}");
            }
            _ => {}
        }
        if self.fullres.is_none() {
            self.fullres = fullres;
        }
        self.entries.push((format, variant, blob));
        let table = self.sizes.unwrap_or(SizeClass::Single);
        self.entries.sort_by_key(|(_, variant, _)| {
            table.rank(variant.as_deref()).unwrap_or(usize::MAX)
        });
    }

    fn get_variant(&self, format: Option<&str>, variant: Option<&str>) -> (Option<Blob>, bool) {
        let entries: Vec<_> = match format {
            Some(fmt) => self
                .entries
                .iter()
                .filter(|(f, _, _)| f.as_deref() == Some(fmt))
                .collect(),
            None => self.entries.iter().collect(),
        };
        if entries.is_empty() {
            return (None, false);
        }
        for (_, entry_variant, blob) in &entries {
            if entry_variant.as_deref() == variant {
                return (Some(blob.clone()), true);
            }
        }
        let largest = entries.last().expect("non-empty checked above");
        (Some(largest.2.clone()), self.have_largest)
    }
}

struct VideoSet {
    entries: Vec<Blob>,
}

impl VideoSet {
    fn first(&self) -> Option<Blob> {
        self.entries.first().cloned()
    }
}

enum MediaSet {
    Images(ImageSet),
    Videos(VideoSet),
}

#[derive(Default)]
pub struct MediaStore {
    by_url: HashMap<String, MediaSet>,
}

static ARCHIVE_MEDIA_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-([A-Za-z0-9_\-]+)\.(.*)$").unwrap());

impl MediaStore {
    pub fn new() -> Self {
        MediaStore::default()
    }

    fn images(&mut self, key: String) -> Option<&mut ImageSet> {
        match self
            .by_url
            .entry(key)
            .or_insert_with(|| MediaSet::Images(ImageSet::new()))
        {
            MediaSet::Images(set) => Some(set),
            MediaSet::Videos(_) => None,
        }
    }

    fn videos(&mut self, key: String) -> Option<&mut VideoSet> {
        match self
            .by_url
            .entry(key)
            .or_insert_with(|| MediaSet::Videos(VideoSet { entries: Vec::new() }))
        {
            MediaSet::Videos(set) => Some(set),
            MediaSet::Images(_) => None,
        }
    }

    /// Media files bundled inside an export archive, named
    /// `<post-id>-<media-id>.<ext>`. Images key as post-media bases, mp4s as
    /// video bases.
    pub fn add_from_archive(&mut self, fs: &Vfs, dir: &str) {
        for name in fs.list_dir(dir) {
            let Some(m) = ARCHIVE_MEDIA_NAME.captures(&name) else {
                debug!("unrecognized archive media file {name}");
                continue;
            };
            let stem = &m[2];
            let format = &m[3];
            let blob = fs.blob(&format!("{dir}/{name}"));
            if format == "mp4" {
                let key = format!("video.twimg.com/{stem}.mp4");
                if let Some(set) = self.videos(key) {
                    set.entries.push(blob);
                }
            } else {
                let key = format!("/media/{stem}");
                let fullres =
                    format!("https://pbs.twimg.com/media/{stem}?format={format}&name=orig");
                if let Some(set) = self.images(key) {
                    set.add(
                        blob,
                        Some(format.to_owned()),
                        Some("medium".to_owned()),
                        SizeClass::Media,
                        Some(fullres),
                    );
                }
            }
        }
    }

    /// One captured CDN response body.
    pub fn add_http_snapshot(&mut self, url: &str, blob: Blob) -> Result<()> {
        if url.ends_with("twimg.com/favicon.ico") {
            return Ok(());
        }
        let decoded = decode_media_url(url)?;
        if decoded.is_video() {
            if let Some(set) = self.videos(decoded.base) {
                set.entries.push(blob);
            }
        } else if let Some(set) = self.images(decoded.base) {
            set.add(
                blob,
                decoded.format,
                decoded.variant,
                decoded.sizes.expect("image urls always carry a table"),
                decoded.fullres,
            );
        }
        Ok(())
    }

    /// Best available bytes for a request URL. `cacheable` is true only when
    /// the exact requested variant was found (a fallback rendition should
    /// not be cached under the requested URL).
    pub fn lookup(&self, url: &str) -> (Option<Blob>, bool) {
        if url
            .split('?')
            .next()
            .is_some_and(|path| path.ends_with(".m3u8.mp4"))
        {
            return self.lookup_video(url);
        }
        let Ok(decoded) = decode_media_url(url) else {
            return (None, false);
        };
        match self.by_url.get(&decoded.base) {
            Some(MediaSet::Images(set)) => {
                set.get_variant(decoded.format.as_deref(), decoded.variant.as_deref())
            }
            Some(MediaSet::Videos(set)) => (set.first(), false),
            None => (None, false),
        }
    }

    fn get_by_url(&self, url: &str) -> Option<Blob> {
        let absolute;
        let url = if url.starts_with('/') {
            absolute = format!("https://video.twimg.com{url}");
            absolute.as_str()
        } else {
            url
        };
        let decoded = decode_media_url(url).ok()?;
        match self.by_url.get(&decoded.base)? {
            MediaSet::Images(set) => set.get_variant(None, None).0,
            MediaSet::Videos(set) => set.first(),
        }
    }

    /// Multi-segment reassembly: read the top-level playlist, pick the first
    /// sub-playlist whose every segment was captured, remux. The result is
    /// never cacheable under the request URL.
    fn lookup_video(&self, url: &str) -> (Option<Blob>, bool) {
        let Some(top_blob) = self.get_by_url(&url.replace(".m3u8.mp4", ".m3u8")) else {
            return (None, false);
        };
        let Ok(top) = top_blob.read_to_string() else {
            return (None, false);
        };

        for sub_url in playlist_lines(&top) {
            let Some(sub_blob) = self.get_by_url(sub_url) else {
                continue;
            };
            let Ok(sub) = sub_blob.read_to_string() else {
                continue;
            };
            let complete = playlist_lines(&sub).all(|line| self.get_by_url(line).is_some());
            if !complete {
                continue;
            }
            match self.merge_playlist(&sub) {
                Ok(bytes) => {
                    let blob = Blob::in_memory(bytes).with_mime(Some("video/mp4".to_owned()));
                    return (Some(blob), false);
                }
                Err(err) => {
                    warn!("failed to remux {url}: {err}");
                    return (None, false);
                }
            }
        }
        (None, false)
    }

    /// Rewrites segment references to local files (extracting non-disk blobs
    /// into temporaries) and concatenates them with ffmpeg, copying codecs.
    fn merge_playlist(&self, playlist: &str) -> Result<Vec<u8>> {
        static MAP_URI: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#"^#EXT-X-MAP:URI="(.*)""#).unwrap());

        let mut temp_files = Vec::new();
        let mut local_path = |url: &str| -> Result<String> {
            let blob = self
                .get_by_url(url)
                .ok_or_else(|| Error::Muxer(format!("segment {url} disappeared")))?;
            if let Some(path) = blob.disk_path() {
                return Ok(std::fs::canonicalize(path)?.to_string_lossy().into_owned());
            }
            let suffix = url
                .rsplit('/')
                .next()
                .and_then(|name| name.rfind('.').map(|i| name[i..].to_owned()))
                .unwrap_or_default();
            let mut file = tempfile::Builder::new().suffix(&suffix).tempfile()?;
            file.write_all(&blob.read()?)?;
            file.flush()?;
            let path = file.path().to_string_lossy().into_owned();
            temp_files.push(file);
            Ok(path)
        };

        let mut rewritten = Vec::new();
        for line in playlist.lines() {
            if let Some(m) = MAP_URI.captures(line) {
                rewritten.push(format!("#EXT-X-MAP:URI=\"{}\"", local_path(&m[1])?));
            } else if !line.is_empty() && !line.starts_with('#') {
                rewritten.push(local_path(line)?);
            } else {
                rewritten.push(line.to_owned());
            }
        }
        let mut rewritten = rewritten.join("\n");
        rewritten.push('\n');

        let mut playlist_file = tempfile::Builder::new().suffix(".m3u8").tempfile()?;
        playlist_file.write_all(rewritten.as_bytes())?;
        playlist_file.flush()?;
        let merged = tempfile::Builder::new().suffix(".mp4").tempfile()?;

        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-allowed_extensions")
            .arg("ALL")
            .arg("-i")
            .arg(playlist_file.path())
            .arg("-c")
            .arg("copy")
            .arg("-strict")
            .arg("-2")
            .arg(merged.path())
            .output()
            .map_err(|err| Error::Muxer(format!("failed to run ffmpeg: {err}")))?;
        if !output.status.success() {
            return Err(Error::Muxer(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(std::fs::read(merged.path())?)
    }
}

fn playlist_lines(playlist: &str) -> impl Iterator<Item = &str> {
    playlist
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(tag: &str) -> Blob {
        Blob::in_memory(tag.as_bytes().to_vec())
    }

    #[test]
    fn exact_variant_is_cacheable() {
        let mut store = MediaStore::new();
        store
            .add_http_snapshot(
                "https://pbs.twimg.com/media/AAA.jpg?name=small",
                blob("small-bytes"),
            )
            .unwrap();
        store
            .add_http_snapshot(
                "https://pbs.twimg.com/media/AAA.jpg?name=large",
                blob("large-bytes"),
            )
            .unwrap();

        let (hit, cacheable) = store.lookup("https://pbs.twimg.com/media/AAA.jpg?name=large");
        assert!(cacheable);
        assert_eq!(hit.unwrap().read().unwrap(), b"large-bytes");
    }

    #[test]
    fn missing_variant_falls_back_to_largest() {
        let mut store = MediaStore::new();
        store
            .add_http_snapshot(
                "https://pbs.twimg.com/media/AAA.jpg?name=small",
                blob("small-bytes"),
            )
            .unwrap();
        store
            .add_http_snapshot(
                "https://pbs.twimg.com/media/AAA.jpg?name=medium",
                blob("medium-bytes"),
            )
            .unwrap();

        let (hit, cacheable) = store.lookup("https://pbs.twimg.com/media/AAA.jpg?name=orig");
        assert!(!cacheable);
        assert_eq!(hit.unwrap().read().unwrap(), b"medium-bytes");
    }

    #[test]
    fn unknown_asset_misses() {
        let store = MediaStore::new();
        let (hit, cacheable) = store.lookup("https://pbs.twimg.com/media/NOPE.jpg");
        assert!(hit.is_none());
        assert!(!cacheable);
    }

    #[test]
    fn video_variants_collapse_to_one_group() {
        let mut store = MediaStore::new();
        store
            .add_http_snapshot(
                "https://video.twimg.com/ext_tw_video/9/pu/vid/640x360/clip.mp4",
                blob("low-res"),
            )
            .unwrap();
        store
            .add_http_snapshot(
                "https://video.twimg.com/ext_tw_video/9/pu/vid/1280x720/clip.mp4",
                blob("hi-res"),
            )
            .unwrap();

        let (hit, cacheable) =
            store.lookup("https://video.twimg.com/ext_tw_video/9/pu/vid/640x360/clip.mp4");
        assert!(!cacheable);
        assert_eq!(hit.unwrap().read().unwrap(), b"low-res");
    }

    #[test]
    fn archive_media_lands_under_post_media_base() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("tweets_media");
        std::fs::create_dir(&media_dir).unwrap();
        std::fs::write(media_dir.join("123456-AbCdEf.jpg"), b"jpeg-bytes").unwrap();
        std::fs::write(media_dir.join("what-is-this"), b"junk").unwrap();

        let mut store = MediaStore::new();
        store.add_from_archive(&Vfs::native(dir.path()), "tweets_media");

        let (hit, cacheable) = store.lookup("https://pbs.twimg.com/media/AbCdEf.jpg?name=medium");
        assert!(cacheable);
        assert_eq!(hit.unwrap().read().unwrap(), b"jpeg-bytes");
    }
}
