//! Reader for official user-data export bundles.
//!
//! Four historical layouts are probed by marker files: browsable archives
//! from ~2022 (`data/tweets.js`) and ~2020 (`data/tweet.js`), the ~2019
//! Grailbird layout (`data/js/tweet_index.js`), and raw ~2018 archives
//! (`tweet.js` at the root). Every data file begins with a vendor assignment
//! prefix that is verified and stripped before JSON parsing.

use chrono::DateTime;
use serde_json::Value;
use spdlog::prelude::*;

use crate::blob::Vfs;
use crate::error::{Error, Result};
use crate::seqalign::Snapshot;
use crate::store::{
    DmMessage, IngestCtx, LegacyPost, LegacyProfile, PostId, PostRecord, Store, UserId,
};

const LIKES_PAGE: usize = 25;
const LIKES_ROOT_FANOUT: usize = 9;
const LIKES_FANOUT: usize = 10;

/// Loads one export bundle (an unzipped directory or a zip archive) into the
/// store.
pub fn load_bundle(store: &mut Store, fs: &Vfs) -> Result<()> {
    if fs.exists("data/tweets.js") {
        // browsable archives from ~2022
        let layout = ModernLayout {
            base: "data",
            tweets_file: "tweets.js",
            tweets_prefix: "window.YTD.tweets.part0 = ",
            media_dir: Some("data/tweets_media"),
        };
        load_modern(store, fs, layout)
    } else if fs.exists("data/tweet.js") {
        // browsable archives from ~2020
        let layout = ModernLayout {
            base: "data",
            tweets_file: "tweet.js",
            tweets_prefix: "window.YTD.tweet.part0 = ",
            media_dir: Some("data/tweet_media"),
        };
        load_modern(store, fs, layout)
    } else if fs.exists("data/js/tweet_index.js") {
        // browsable archives from ~2019
        load_2019(store, fs)
    } else if fs.exists("tweet.js") {
        // raw archives from ~2018; media filenames carry no post association
        let layout = ModernLayout {
            base: "",
            tweets_file: "tweet.js",
            tweets_prefix: "window.YTD.tweet.part0 = ",
            media_dir: None,
        };
        load_modern(store, fs, layout)
    } else {
        Err(Error::corrupt("unrecognized export bundle layout"))
    }
}

struct ModernLayout {
    base: &'static str,
    tweets_file: &'static str,
    tweets_prefix: &'static str,
    media_dir: Option<&'static str>,
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_owned()
    } else {
        format!("{base}/{name}")
    }
}

/// Reads a data file, verifying and stripping the vendor assignment prefix.
fn load_with_prefix(fs: &Vfs, rel: &str, expected_prefix: &str) -> Result<Value> {
    let text = fs.read_to_string(rel)?;
    let Some(stripped) = text.strip_prefix(expected_prefix) else {
        let head: String = text.chars().take(expected_prefix.len()).collect();
        return Err(Error::corrupt(format!(
            "{rel} starts with {head:?}, expected {expected_prefix:?}"
        )));
    };
    Ok(serde_json::from_str(stripped)?)
}

/// Generation timestamp of the bundle: the manifest's generation date when
/// present, the file modification time otherwise.
fn bundle_time(fs: &Vfs, base: &str) -> Option<i64> {
    let manifest_rel = join(base, "manifest.js");
    // 2019 bundles keep it in payload_details instead
    let parsed = if fs.exists(&manifest_rel) {
        load_with_prefix(fs, &manifest_rel, "window.__THAR_CONFIG = ").ok()
    } else {
        None
    };
    let generation_date = parsed
        .as_ref()
        .and_then(|manifest| manifest.pointer("/archiveInfo/generationDate"))
        .and_then(Value::as_str)
        .and_then(|date| DateTime::parse_from_rfc3339(date).ok());
    match generation_date {
        Some(date) => Some(date.timestamp_millis()),
        None => fs.mtime_ms(),
    }
}

fn load_modern(store: &mut Store, fs: &Vfs, layout: ModernLayout) -> Result<()> {
    let base = layout.base;
    let tweets = load_with_prefix(fs, &join(base, layout.tweets_file), layout.tweets_prefix)?;
    let likes = load_with_prefix(fs, &join(base, "like.js"), "window.YTD.like.part0 = ")?;
    let account = load_with_prefix(fs, &join(base, "account.js"), "window.YTD.account.part0 = ")?;
    let profile = load_with_prefix(fs, &join(base, "profile.js"), "window.YTD.profile.part0 = ")?;

    let account = account
        .pointer("/0/account")
        .ok_or_else(|| Error::schema("account.js without an account record"))?;
    let profile = profile
        .pointer("/0/profile")
        .ok_or_else(|| Error::schema("profile.js without a profile record"))?;

    let uid: UserId = account
        .get("accountId")
        .and_then(Value::as_str)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::schema("account record without an accountId"))?;

    let ctx = IngestCtx {
        time_ms: bundle_time(fs, base),
        observer: Some(uid),
    };
    store.observers.insert(uid);

    // exports describe the account's own profile across two records
    let record = LegacyProfile {
        screen_name: account
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_owned),
        name: account
            .get("accountDisplayName")
            .and_then(Value::as_str)
            .map(str::to_owned),
        description: profile
            .pointer("/description/bio")
            .and_then(Value::as_str)
            .map(str::to_owned),
        profile_banner_url: profile
            .get("headerMediaUrl")
            .and_then(Value::as_str)
            .map(str::to_owned),
        profile_image_url_https: profile
            .get("avatarMediaUrl")
            .and_then(Value::as_str)
            .map(str::to_owned),
        ..Default::default()
    };
    store.add_profile(&ctx, uid, record);

    for entry in tweets.as_array().into_iter().flatten() {
        // wrapped in a {"tweet": ...} envelope from ~2020 onwards
        let tweet = entry.get("tweet").unwrap_or(entry);
        let mut legacy: LegacyPost = match serde_json::from_value(tweet.clone()) {
            Ok(legacy) => legacy,
            Err(err) => {
                warn!("skipping unreadable export tweet: {err}");
                continue;
            }
        };
        // exports omit the author on the account's own posts
        legacy.user_id_str = Some(uid);
        let Some(id) = legacy.id_str else {
            warn!("skipping export tweet without id");
            continue;
        };
        // exports render retweets as plain text, so parentage stays self
        // here and API captures processed later overwrite it
        store.add_post(&ctx, PostRecord::plain(legacy, id));
    }

    load_likes(store, &ctx, uid, &likes);
    load_conversations(store, fs, base)?;

    if let Some(media_dir) = layout.media_dir {
        store.media.add_from_archive(fs, media_dir);
    }
    Ok(())
}

fn load_likes(store: &mut Store, ctx: &IngestCtx, uid: UserId, likes: &Value) {
    let likes: Vec<&Value> = likes.as_array().into_iter().flatten().collect();
    let likes = unscramble(&likes);

    let mut like_ids: Vec<PostId> = Vec::with_capacity(likes.len());
    for like in likes {
        let Some(like) = like.get("like") else {
            continue;
        };
        let Some(id) = like
            .get("tweetId")
            .and_then(Value::as_str)
            .and_then(|id| id.parse::<PostId>().ok())
        else {
            continue;
        };
        like_ids.push(id);
        if let Some(text) = like.get("fullText").and_then(Value::as_str) {
            store.add_stub_post(id, text.to_owned());
        }
    }

    store.add_likes_snapshot(
        uid,
        Snapshot::Items {
            items: like_ids,
            time: ctx.time_ms.unwrap_or_default(),
        },
    );
}

fn load_conversations(store: &mut Store, fs: &Vfs, base: &str) -> Result<()> {
    let mut conversations = Vec::new();
    for (file, prefix) in [
        ("direct-messages.js", "window.YTD.direct_messages.part0 = "),
        (
            "direct-messages-group.js",
            "window.YTD.direct_messages_group.part0 = ",
        ),
    ] {
        let rel = join(base, file);
        if !fs.exists(&rel) {
            continue;
        }
        let parsed = load_with_prefix(fs, &rel, prefix)?;
        if let Some(list) = parsed.as_array() {
            conversations.extend(list.iter().cloned());
        }
    }

    // a conversation can be split over multiple entries with one id
    for entry in &conversations {
        let Some(conversation) = entry.get("dmConversation") else {
            continue;
        };
        let Some(id) = conversation
            .get("conversationId")
            .and_then(Value::as_str)
        else {
            continue;
        };
        let messages: Vec<DmMessage> = conversation
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|message| match serde_json::from_value(message.clone()) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!("skipping unreadable message in {id}: {err}");
                    None
                }
            })
            .collect();
        store.add_conversation(id, messages);
    }
    Ok(())
}

const KNOWN_2019_KEYS: &[&str] = &[
    "source",
    "entities",
    "geo",
    "id_str",
    "text",
    "id",
    "created_at",
    "user",
    "in_reply_to_screen_name",
    "in_reply_to_status_id",
    "in_reply_to_status_id_str",
    "in_reply_to_user_id",
    "in_reply_to_user_id_str",
];

fn load_2019(store: &mut Store, fs: &Vfs) -> Result<()> {
    let payload_details =
        load_with_prefix(fs, "data/js/payload_details.js", "var payload_details = ")?;
    let time_ms = payload_details
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|date| DateTime::parse_from_str(date, "%Y-%m-%d %H:%M:%S %z").ok())
        .map(|date| date.timestamp_millis())
        .or_else(|| fs.mtime_ms());

    let user_details = load_with_prefix(fs, "data/js/user_details.js", "var user_details = ")?;
    let uid: UserId = user_details
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::schema("user_details without an id"))?;

    let ctx = IngestCtx {
        time_ms,
        observer: Some(uid),
    };
    store.observers.insert(uid);
    store.add_profile(
        &ctx,
        uid,
        LegacyProfile {
            screen_name: user_details
                .get("screen_name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            name: user_details
                .get("full_name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            description: user_details
                .get("bio")
                .and_then(Value::as_str)
                .map(str::to_owned),
            ..Default::default()
        },
    );

    let tweet_index = load_with_prefix(fs, "data/js/tweet_index.js", "var tweet_index = ")?;
    for chunk in tweet_index.as_array().into_iter().flatten() {
        let (Some(file_name), Some(var_name)) = (
            chunk.get("file_name").and_then(Value::as_str),
            chunk.get("var_name").and_then(Value::as_str),
        ) else {
            warn!("skipping malformed tweet_index chunk");
            continue;
        };
        let prefix = format!("Grailbird.data.{var_name} = ");
        let tweets = load_with_prefix(fs, file_name, &prefix)?;
        for tweet in tweets.as_array().into_iter().flatten() {
            let mut tweet = tweet.clone();
            let retweeted_status = tweet
                .as_object_mut()
                .and_then(|obj| obj.remove("retweeted_status"));

            if let Some(unknown) = tweet.as_object().and_then(|obj| {
                obj.keys()
                    .find(|key| !KNOWN_2019_KEYS.contains(&key.as_str()))
            }) {
                warn!("unexpected key {unknown:?} in a 2019 export tweet");
            }

            match retweeted_status {
                Some(retweeted) => {
                    let Some(rtid) = retweeted
                        .get("id_str")
                        .and_then(Value::as_str)
                        .and_then(|id| id.parse::<PostId>().ok())
                    else {
                        warn!("skipping 2019 retweet without parent id");
                        continue;
                    };
                    add_2019_tweet(store, &ctx, retweeted, rtid);
                    add_2019_tweet(store, &ctx, tweet, rtid);
                }
                None => {
                    let Some(id) = tweet
                        .get("id_str")
                        .and_then(Value::as_str)
                        .and_then(|id| id.parse::<PostId>().ok())
                    else {
                        warn!("skipping 2019 tweet without id");
                        continue;
                    };
                    add_2019_tweet(store, &ctx, tweet, id);
                }
            }
        }
    }
    Ok(())
}

/// 2019 tweets embed their author and use a different date format.
fn add_2019_tweet(store: &mut Store, ctx: &IngestCtx, mut tweet: Value, original_id: PostId) {
    let user = tweet
        .as_object_mut()
        .and_then(|obj| obj.remove("user"));

    let mut legacy: LegacyPost = match serde_json::from_value(tweet) {
        Ok(legacy) => legacy,
        Err(err) => {
            warn!("skipping unreadable 2019 export tweet: {err}");
            return;
        }
    };

    if let Some(user) = user {
        let uid = user
            .get("id_str")
            .and_then(Value::as_str)
            .and_then(|id| id.parse::<UserId>().ok());
        if let Some(uid) = uid {
            match serde_json::from_value::<LegacyProfile>(user) {
                Ok(profile) => store.add_profile(ctx, uid, profile),
                Err(err) => warn!("skipping unreadable 2019 export user: {err}"),
            }
            legacy.user_id_str = Some(uid);
        }
    }

    if let Some(created_at) = &legacy.created_at {
        if let Ok(date) = DateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S %z") {
            legacy.created_at = Some(date.format("%a %b %d %H:%M:%S %z %Y").to_string());
        }
    }

    store.add_post(ctx, PostRecord::plain(legacy, original_id));
}

/// Un-scrambles the export's like list from its 25-per-page tree order.
///
/// The exporter fills a tree whose root holds 9 children and every other
/// node 10, pages of 25 items each; positions follow the creation queue
/// while content follows the pre-order traversal. Why the root differs is
/// undocumented; the fan-outs are replicated as observed.
pub fn unscramble<T: Clone>(items: &[T]) -> Vec<T> {
    let mut out: Vec<Option<T>> = vec![None; items.len()];
    let mut cursor = 0;
    visit_preorder(items.len(), &mut |index, count| {
        for j in 0..count {
            out[index + j] = Some(items[cursor].clone());
            cursor += 1;
        }
    });
    out.into_iter().map(|slot| slot.expect("tree covers all slots")).collect()
}

struct PageNode {
    index: usize,
    count: usize,
    children: Vec<usize>,
}

/// Builds the page tree for `n` items and calls `f(index, count)` for every
/// node in pre-order.
fn visit_preorder(n: usize, f: &mut impl FnMut(usize, usize)) {
    if n == 0 {
        return;
    }

    let mut nodes: Vec<PageNode> = Vec::new();
    let mut queue: std::collections::VecDeque<usize> = std::collections::VecDeque::new();
    for index in (0..n).step_by(LIKES_PAGE) {
        let id = nodes.len();
        nodes.push(PageNode {
            index,
            count: LIKES_PAGE.min(n - index),
            children: Vec::new(),
        });
        if let Some(&parent) = queue.front() {
            nodes[parent].children.push(id);
            let capacity = if parent == 0 {
                LIKES_ROOT_FANOUT
            } else {
                LIKES_FANOUT
            };
            if nodes[parent].children.len() == capacity {
                queue.pop_front();
            }
        }
        queue.push_back(id);
    }

    let mut stack = vec![0usize];
    while let Some(id) = stack.pop() {
        f(nodes[id].index, nodes[id].count);
        for &child in nodes[id].children.iter().rev() {
            stack.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    /// Inverse of `unscramble`, as the exporter applies it.
    fn scramble<T: Clone>(items: &[T]) -> Vec<T> {
        let mut out = Vec::with_capacity(items.len());
        visit_preorder(items.len(), &mut |index, count| {
            out.extend(items[index..index + count].iter().cloned());
        });
        out
    }

    #[test]
    fn unscramble_fifty_items_is_identity() {
        let items: Vec<i64> = (0..50).collect();
        assert_eq!(unscramble(&items), items);
        assert_eq!(scramble(&items), items);
    }

    #[test]
    fn scramble_round_trips() {
        for n in [0, 1, 24, 25, 26, 249, 250, 251, 300, 1000, 2513] {
            let items: Vec<usize> = (0..n).collect();
            assert_eq!(unscramble(&scramble(&items)), items, "n={n}");
            assert_eq!(scramble(&unscramble(&items)), items, "n={n}");
        }
    }

    #[test]
    fn scramble_moves_deep_pages() {
        // 12 pages: the root's first child gets pages 10 and 11 as children,
        // so pre-order pulls them ahead of page 2.
        let items: Vec<usize> = (0..300).collect();
        let scrambled = scramble(&items);
        assert_eq!(scrambled[..50], items[..50]);
        assert_eq!(scrambled[50], 250);
        assert_eq!(scrambled[75], 275);
        assert_eq!(scrambled[100], 50);
        assert_eq!(unscramble(&scrambled), items);
    }

    fn write_modern_bundle(dir: &std::path::Path) {
        let data = dir.join("data");
        std::fs::create_dir_all(&data).unwrap();
        let write = |name: &str, prefix: &str, value: serde_json::Value| {
            std::fs::write(data.join(name), format!("{prefix}{value}")).unwrap();
        };
        write(
            "tweets.js",
            "window.YTD.tweets.part0 = ",
            json!([
                { "tweet": {
                    "id_str": "100",
                    "full_text": "own post",
                    "favorite_count": "2",
                    "in_reply_to_status_id_str": null,
                }},
                { "tweet": {
                    "id_str": "101",
                    "full_text": "RT @other: reposted",
                }},
            ]),
        );
        write(
            "like.js",
            "window.YTD.like.part0 = ",
            json!([
                { "like": { "tweetId": "300", "fullText": "a liked post" } },
                { "like": { "tweetId": "301" } },
            ]),
        );
        write(
            "account.js",
            "window.YTD.account.part0 = ",
            json!([ { "account": {
                "accountId": "7",
                "username": "me",
                "accountDisplayName": "Me",
            }}]),
        );
        write(
            "profile.js",
            "window.YTD.profile.part0 = ",
            json!([ { "profile": {
                "description": { "bio": "my bio" },
                "avatarMediaUrl": "https://pbs.twimg.com/profile_images/7/me.jpg",
            }}]),
        );
        write(
            "manifest.js",
            "window.__THAR_CONFIG = ",
            json!({ "archiveInfo": { "generationDate": "2023-06-15T10:20:30.000Z" } }),
        );
        write(
            "direct-messages.js",
            "window.YTD.direct_messages.part0 = ",
            json!([ { "dmConversation": {
                "conversationId": "7-8",
                "messages": [
                    { "messageCreate": {
                        "id": "500", "senderId": "8", "recipientId": "7",
                        "text": "hi", "createdAt": "2023-01-01T00:00:00.000Z",
                    }},
                ],
            }}]),
        );
        write(
            "direct-messages-group.js",
            "window.YTD.direct_messages_group.part0 = ",
            json!([ { "dmConversation": {
                "conversationId": "900",
                "messages": [
                    { "joinConversation": {
                        "initiatingUserId": "8",
                        "participantsSnapshot": ["7", "8"],
                        "createdAt": "2023-01-02T00:00:00.000Z",
                    }},
                ],
            }}]),
        );
    }

    #[test]
    fn modern_bundle_loads_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_modern_bundle(dir.path());

        let mut store = Store::new();
        load_bundle(&mut store, &Vfs::native(dir.path())).unwrap();

        assert!(store.observers.contains(&7));
        assert_eq!(store.profiles[&7].screen_name.as_deref(), Some("me"));
        assert_eq!(store.profiles[&7].description.as_deref(), Some("my bio"));

        // author pre-filled, string counts parsed, parentage self
        let post = &store.posts[&100];
        assert_eq!(post.author, Some(7));
        assert_eq!(post.favorite_count, Some(2));
        assert_eq!(post.original_id, 100);

        // text-only like became a stub post and the snapshot is positional
        assert_eq!(store.posts[&300].text.as_deref(), Some("a liked post"));
        let snapshot = &store.likes_snapshots[&7][0];
        assert!(matches!(
            snapshot,
            Snapshot::Items { items, time } if items == &vec![300, 301]
                && *time == 1_686_824_430_000
        ));

        // both DM files merged by conversation id
        assert_eq!(store.conversations.len(), 2);
        assert_eq!(store.conversations["7-8"].messages.len(), 1);
        assert_eq!(store.conversations["900"].messages.len(), 1);
    }

    #[test]
    fn bundle_reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_modern_bundle(dir.path());

        let mut store = Store::new();
        let fs = Vfs::native(dir.path());
        load_bundle(&mut store, &fs).unwrap();
        load_bundle(&mut store, &fs).unwrap();

        assert_eq!(store.conversations["7-8"].messages.len(), 1);
        // a second snapshot of the same list aligns to the same sequence
        store.rebuild_indexes();
        assert_eq!(store.get_user_likes(7).len(), 2);
    }

    #[test]
    fn wrong_prefix_is_a_corrupt_capture() {
        let dir = tempfile::tempdir().unwrap();
        write_modern_bundle(dir.path());
        std::fs::write(
            dir.path().join("data/tweets.js"),
            "window.YTD.somethingelse.part0 = []",
        )
        .unwrap();

        let mut store = Store::new();
        let err = load_bundle(&mut store, &Vfs::native(dir.path())).unwrap_err();
        assert!(matches!(err, Error::CorruptCapture(_)));
    }

    #[test]
    fn bundles_without_markers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::new();
        assert!(load_bundle(&mut store, &Vfs::native(dir.path())).is_err());
    }
}
