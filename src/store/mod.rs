//! The normalized in-memory store.
//!
//! Everything every capture source produces lands here: posts, profiles,
//! follow edges, conversations, like/bookmark observations. Ingestion is a
//! single sequential pass; after it, `rebuild_indexes` computes the
//! secondary indexes the queries serve from. Merging is idempotent so that
//! overlapping captures can be replayed freely.

mod model;

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use itertools::Itertools;
pub use model::*;
pub(crate) use model::de_opt_i64;
use spdlog::prelude::*;

use crate::media::MediaStore;
use crate::seqalign::{self, Snapshot};

/// Capture context for one response: when it was recorded and which logged-in
/// user's session recorded it. Passed per call rather than kept as store
/// state.
#[derive(Clone, Copy, Debug, Default)]
pub struct IngestCtx {
    pub time_ms: Option<i64>,
    pub observer: Option<UserId>,
}

/// A fully-resolved post record ready for insertion: retweet parentage and
/// the GraphQL-only attachments are decided by the reader.
pub struct PostRecord {
    pub legacy: LegacyPost,
    pub original_id: PostId,
    pub card: Option<Card>,
    pub circle: Option<CircleOwner>,
}

impl PostRecord {
    pub fn plain(legacy: LegacyPost, original_id: PostId) -> Self {
        PostRecord {
            legacy,
            original_id,
            card: None,
            circle: None,
        }
    }
}

pub struct Store {
    pub posts: HashMap<PostId, Post>,
    pub replies: HashMap<PostId, Vec<PostId>>,
    pub profiles: HashMap<UserId, Profile>,
    pub followers: HashMap<UserId, BTreeSet<UserId>>,
    pub followings: HashMap<UserId, BTreeSet<UserId>>,
    pub user_by_handle: HashMap<String, BTreeSet<UserId>>,
    pub observers: BTreeSet<UserId>,
    pub conversations: HashMap<String, Conversation>,
    pub media: MediaStore,

    pub likes_snapshots: HashMap<UserId, Vec<Snapshot>>,
    pub likes_unsorted: HashMap<UserId, BTreeSet<PostId>>,
    bookmarks: HashMap<UserId, HashMap<PostId, i64>>,

    // secondary indexes, valid after rebuild_indexes
    by_user: HashMap<UserId, Vec<PostId>>,
    likes_sorted: HashMap<UserId, Vec<(i64, PostId)>>,
    bookmarks_sorted: HashMap<UserId, Vec<(i64, PostId)>>,
    interactions_sorted: HashMap<UserId, Vec<PostId>>,

    size_intern: HashMap<MediaSize, Rc<MediaSize>>,

    /// Whether like alignment tolerates non-contiguous anchor matches.
    pub allow_retcon: bool,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            posts: HashMap::new(),
            replies: HashMap::new(),
            profiles: HashMap::new(),
            followers: HashMap::new(),
            followings: HashMap::new(),
            user_by_handle: HashMap::new(),
            observers: BTreeSet::new(),
            conversations: HashMap::new(),
            media: MediaStore::new(),
            likes_snapshots: HashMap::new(),
            likes_unsorted: HashMap::new(),
            bookmarks: HashMap::new(),
            by_user: HashMap::new(),
            likes_sorted: HashMap::new(),
            bookmarks_sorted: HashMap::new(),
            interactions_sorted: HashMap::new(),
            size_intern: HashMap::new(),
            allow_retcon: true,
        }
    }

    // -- ingestion --

    fn intern_size(&mut self, size: &LegacySize) -> Rc<MediaSize> {
        let key = MediaSize {
            w: size.w.unwrap_or(0),
            h: size.h.unwrap_or(0),
            resize: size.resize.clone().unwrap_or_default(),
        };
        self.size_intern
            .entry(key.clone())
            .or_insert_with(|| Rc::new(key))
            .clone()
    }

    fn media_items(&mut self, entities: &LegacyEntities) -> Vec<MediaItem> {
        entities
            .media
            .iter()
            .flatten()
            .map(|media| MediaItem {
                url: media.media_url_https.clone(),
                kind: media.kind.clone(),
                sizes: media
                    .sizes
                    .iter()
                    .flatten()
                    .map(|(name, size)| (name.clone(), self.intern_size(size)))
                    .collect(),
                video_variants: media
                    .video_info
                    .as_ref()
                    .map(|info| info.variants.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Merges one post observation. Newer populated fields overwrite, the
    /// per-observer flag sets accumulate. Reply targets materialize a stub
    /// parent so the parent has an author even before it is ever captured.
    pub fn add_post(&mut self, ctx: &IngestCtx, rec: PostRecord) -> Option<PostId> {
        let PostRecord {
            legacy,
            original_id,
            card,
            circle,
        } = rec;

        let Some(id) = legacy.id_str else {
            warn!("post record without id, skipping");
            return None;
        };

        if let (Some(parent), Some(parent_user)) = (
            legacy.in_reply_to_status_id_str,
            legacy.in_reply_to_user_id_str,
        ) {
            let stub = self.posts.entry(parent).or_insert_with(|| Post::new(parent));
            // replying to a repost is not a thing the UI produces
            stub.author = Some(parent_user);
            if let Some(handle) = &legacy.in_reply_to_screen_name {
                self.profiles
                    .entry(parent_user)
                    .or_insert_with(|| Profile::new(parent_user))
                    .screen_name = Some(handle.clone());
            }
            let children = self.replies.entry(parent).or_default();
            if !children.contains(&id) {
                children.push(id);
            }
        }

        let media = legacy
            .extended_entities
            .as_ref()
            .or(legacy.entities.as_ref())
            .map(|entities| self.media_items(entities))
            .unwrap_or_default();

        let post = self.posts.entry(id).or_insert_with(|| Post::new(id));
        post.original_id = original_id;
        merge_field(&mut post.text, legacy.full_text);
        merge_field(&mut post.author, legacy.user_id_str);
        merge_field(&mut post.created_at, legacy.created_at);
        merge_field(&mut post.reply_to_post, legacy.in_reply_to_status_id_str);
        merge_field(&mut post.reply_to_user, legacy.in_reply_to_user_id_str);
        merge_field(&mut post.reply_to_screen_name, legacy.in_reply_to_screen_name);
        merge_field(&mut post.conversation_id, legacy.conversation_id_str);
        merge_field(&mut post.quoted_id, legacy.quoted_status_id_str);
        merge_field(&mut post.favorite_count, legacy.favorite_count);
        merge_field(&mut post.retweet_count, legacy.retweet_count);
        merge_field(&mut post.reply_count, legacy.reply_count);
        merge_field(&mut post.limited_actions, legacy.limited_actions);
        if circle.is_some() {
            post.circle = circle;
        }
        if card.is_some() {
            post.card = card;
        }
        if !media.is_empty() {
            post.media = media;
        }

        if let Some(observer) = ctx.observer {
            if legacy.bookmarked == Some(true) {
                post.bookmarkers.insert(observer);
            }
            if legacy.favorited == Some(true) {
                post.favoriters.insert(observer);
                self.likes_unsorted.entry(observer).or_default().insert(id);
            }
            if legacy.retweeted == Some(true) {
                post.reposters.insert(observer);
            }
        }

        Some(id)
    }

    /// A liked post known only by its text. Contributes the text but never
    /// overwrites a richer record.
    pub fn add_stub_post(&mut self, id: PostId, text: String) {
        let post = self.posts.entry(id).or_insert_with(|| Post::new(id));
        if post.text.is_none() {
            post.text = Some(text);
        }
    }

    pub fn add_profile(&mut self, ctx: &IngestCtx, uid: UserId, rec: LegacyProfile) {
        if rec.is_empty() {
            return;
        }
        if let Some(handle) = &rec.screen_name {
            self.user_by_handle
                .entry(handle.clone())
                .or_default()
                .insert(uid);
        }
        let following = rec.following == Some(true);
        let followed_by = rec.followed_by == Some(true);
        self.profiles
            .entry(uid)
            .or_insert_with(|| Profile::new(uid))
            .merge(rec);

        if let Some(observer) = ctx.observer {
            if following {
                self.add_follow(observer, uid);
            }
            if followed_by {
                self.add_follow(uid, observer);
            }
        }
    }

    /// Directed follower -> following edge, indexed both ways. Idempotent;
    /// self-edges are dropped.
    pub fn add_follow(&mut self, follower: UserId, following: UserId) {
        if follower == following {
            warn!("ignoring self-follow of {follower}");
            return;
        }
        self.followers.entry(following).or_default().insert(follower);
        self.followings.entry(follower).or_default().insert(following);
    }

    pub fn add_likes_snapshot(&mut self, observer: UserId, snapshot: Snapshot) {
        self.likes_snapshots.entry(observer).or_default().push(snapshot);
    }

    pub fn add_unsorted_like(&mut self, observer: UserId, post: PostId) {
        self.likes_unsorted.entry(observer).or_default().insert(post);
    }

    /// Bookmark positions merge by keeping the highest sort index seen.
    pub fn add_bookmark(&mut self, observer: UserId, post: PostId, sort_index: i64) {
        let slot = self
            .bookmarks
            .entry(observer)
            .or_default()
            .entry(post)
            .or_insert(sort_index);
        *slot = (*slot).max(sort_index);
    }

    pub fn add_conversation(&mut self, id: &str, messages: Vec<DmMessage>) {
        self.conversations
            .entry(id.to_owned())
            .or_default()
            .absorb(messages);
    }

    // -- secondary indexes --

    pub fn rebuild_indexes(&mut self) {
        self.by_user.clear();
        self.likes_sorted.clear();
        self.bookmarks_sorted.clear();
        self.interactions_sorted.clear();

        for (&id, post) in &self.posts {
            if let Some(author) = post.author {
                self.by_user.entry(author).or_default().push(id);
            }
        }
        for ids in self.by_user.values_mut() {
            dedup_desc(ids);
        }

        self.rebuild_likes();
        self.rebuild_bookmarks();
        self.infer_follows_from_replies();
        self.rebuild_interactions();

        for conversation in self.conversations.values_mut() {
            conversation
                .messages
                .sort_by_key(|message| Reverse(message.message_id()));
        }

        self.propagate_circles();
    }

    fn rebuild_likes(&mut self) {
        let users: BTreeSet<UserId> = self
            .likes_snapshots
            .keys()
            .chain(self.likes_unsorted.keys())
            .copied()
            .collect();

        for uid in users {
            let mut snapshots = self.likes_snapshots.get(&uid).cloned().unwrap_or_default();
            snapshots.sort_by_key(|snapshot| Reverse(snapshot.time()));

            // Items are posts; the event id of a like can never precede the
            // creation time encoded in the post id.
            let mut aligned = seqalign::align(
                &snapshots,
                Some(|post: PostId| id_timestamp_ms(post) << 20),
                self.allow_retcon,
            );

            let mut have: BTreeSet<PostId> = BTreeSet::new();
            for &(_, post) in &aligned {
                let original = self
                    .posts
                    .get(&post)
                    .map(|p| p.original_id)
                    .unwrap_or(post);
                have.insert(original);
            }

            for &post in self.likes_unsorted.get(&uid).into_iter().flatten() {
                let Some(tweet) = self.posts.get(&post) else {
                    continue;
                };
                let original = tweet.original_id;
                if !have.insert(original) {
                    continue;
                }
                let synthesized = id_timestamp_ms(original) << 20;
                aligned.push((synthesized, original));
            }

            aligned.sort_by_key(|&(evid, post)| (Reverse(evid), post));
            self.likes_sorted.insert(uid, aligned);
        }
    }

    fn rebuild_bookmarks(&mut self) {
        for (&uid, bookmarks) in &self.bookmarks {
            let mut sorted: Vec<(i64, PostId)> = bookmarks
                .iter()
                .map(|(&post, &sort_index)| (sort_index, post))
                .collect();
            sorted.sort_by_key(|&(sort_index, post)| (Reverse(sort_index), post));
            self.bookmarks_sorted.insert(uid, sorted);
        }
    }

    /// Having replied to a protected account implies the replier is allowed
    /// to see it, which implies a follow.
    fn infer_follows_from_replies(&mut self) {
        let mut edges = Vec::new();
        for post in self.posts.values() {
            let (Some(author), Some(target)) = (post.author, post.reply_to_user) else {
                continue;
            };
            if author != target
                && self
                    .profiles
                    .get(&target)
                    .is_some_and(|p| p.protected == Some(true))
            {
                edges.push((author, target));
            }
        }
        for (follower, following) in edges {
            self.add_follow(follower, following);
        }
    }

    /// An observer's like is an interaction with the liked post's author.
    fn rebuild_interactions(&mut self) {
        for (&uid, likes) in &self.likes_sorted {
            if !self.observers.contains(&uid) {
                continue;
            }
            for &(_, post) in likes {
                if let Some(author) = self.posts.get(&post).and_then(|p| p.author) {
                    self.interactions_sorted.entry(author).or_default().push(post);
                }
            }
        }
        for ids in self.interactions_sorted.values_mut() {
            dedup_desc(ids);
        }
    }

    /// All posts of a conversation belong to the same circle; propagate the
    /// machine-readable markers to posts that lack them, and derive the
    /// owner from the conversation root's author where it is still unknown.
    fn propagate_circles(&mut self) {
        let candidates: Vec<(PostId, PostId)> = self
            .posts
            .iter()
            .filter(|(_, post)| post.circle.is_none())
            .filter_map(|(&id, post)| post.conversation_id.map(|conv| (id, conv)))
            .collect();

        for (id, conv) in candidates {
            let Some(root) = self.posts.get(&conv) else {
                continue;
            };
            let root_limited = root.limited_actions.clone();
            let root_circle = root.circle.clone();
            let root_author = root.author;

            if id != conv {
                let post = self.posts.get_mut(&id).expect("candidate id exists");
                if root_limited.is_some() && post.limited_actions.is_none() {
                    info!("inferred that {id} must have limited actions");
                    post.limited_actions = root_limited;
                }
                if let (Some(circle), None) = (&root_circle, &post.circle) {
                    info!(
                        "inferred that {id} must belong to {}'s circle",
                        circle.screen_name
                    );
                    post.circle = root_circle.clone();
                }
            }

            let post = self.posts.get(&id).expect("candidate id exists");
            if post.limited_actions.as_deref() == Some("limit_trusted_friends_tweet")
                && root_circle.is_none()
            {
                // the circle is generally determined by the conversation root
                let owner = root_author.and_then(|uid| self.profiles.get(&uid)).and_then(
                    |profile| {
                        Some(CircleOwner {
                            screen_name: profile.screen_name.clone()?,
                            name: profile.name.clone().unwrap_or_default(),
                        })
                    },
                );
                if let Some(owner) = owner {
                    info!(
                        "inferred that {id} must belong to {}'s circle",
                        owner.screen_name
                    );
                    self.posts.get_mut(&id).expect("candidate id exists").circle =
                        Some(owner.clone());
                    self.posts
                        .get_mut(&conv)
                        .expect("root looked up above")
                        .circle = Some(owner);
                }
            }
        }
    }

    // -- queries --

    /// Pinned posts first, then non-replies, newest first.
    pub fn get_user_tweets(&self, uid: UserId) -> Vec<PostId> {
        let pinned = self
            .profiles
            .get(&uid)
            .map(|p| p.pinned_post_ids.clone())
            .unwrap_or_default();
        let regular = self
            .by_user
            .get(&uid)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.posts
                    .get(*id)
                    .is_none_or(|post| post.reply_to_post.is_none())
            })
            .copied();
        pinned.into_iter().chain(regular).collect()
    }

    pub fn get_user_with_replies(&self, uid: UserId) -> Vec<PostId> {
        self.by_user.get(&uid).cloned().unwrap_or_default()
    }

    /// Posts with media whose original author is `uid`; excludes reposted
    /// media of other accounts.
    pub fn get_user_media(&self, uid: UserId) -> Vec<PostId> {
        self.by_user
            .get(&uid)
            .into_iter()
            .flatten()
            .filter(|id| {
                let Some(post) = self.posts.get(*id) else {
                    return false;
                };
                if !post.has_media() {
                    return false;
                }
                let original = self.posts.get(&post.original_id).unwrap_or(post);
                original.author == Some(uid)
            })
            .copied()
            .collect()
    }

    pub fn get_user_likes(&self, uid: UserId) -> Vec<(i64, PostId)> {
        self.likes_sorted.get(&uid).cloned().unwrap_or_default()
    }

    pub fn get_user_bookmarks(&self, uid: UserId) -> Vec<(i64, PostId)> {
        self.bookmarks_sorted.get(&uid).cloned().unwrap_or_default()
    }

    pub fn get_user_interactions(&self, uid: UserId) -> Vec<PostId> {
        self.interactions_sorted.get(&uid).cloned().unwrap_or_default()
    }

    /// AND of space-separated words over the full text, plus substring match
    /// against media URLs.
    pub fn search(&self, query: &str) -> BTreeSet<PostId> {
        let words: Vec<&str> = query.split(' ').collect();
        self.posts
            .iter()
            .filter(|(_, post)| {
                let text_hit = post
                    .text
                    .as_deref()
                    .is_some_and(|text| words.iter().all(|word| text.contains(word)));
                let media_hit = post
                    .media
                    .iter()
                    .any(|media| media.url.as_deref().is_some_and(|url| url.contains(query)));
                text_hit || media_hit
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Ancestor chain of the post, the post itself, then the primary reply
    /// branch: at each level every known reply is listed and the walk
    /// continues from the last one that resolves to a stored post.
    pub fn thread_view(&self, post: PostId) -> Vec<PostId> {
        let mut seq = Vec::new();

        let mut up = Some(post);
        while let Some(id) = up {
            seq.insert(0, id);
            up = self.posts.get(&id).and_then(|p| p.reply_to_post);
        }

        let mut down = Some(post);
        while let Some(id) = down {
            let mut next = None;
            for &reply in self.replies.get(&id).into_iter().flatten() {
                seq.push(reply);
                if self.posts.contains_key(&reply) {
                    next = Some(reply);
                }
            }
            down = next;
        }

        seq
    }

    /// Post count per author, for the reload summary.
    pub fn author_counts(&self) -> Vec<(usize, UserId)> {
        self.by_user
            .iter()
            .map(|(&uid, ids)| (ids.len(), uid))
            .sorted_unstable()
            .collect()
    }
}

fn dedup_desc(ids: &mut Vec<PostId>) {
    let unique: BTreeSet<PostId> = ids.iter().copied().collect();
    *ids = unique.into_iter().rev().collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: PostId, author: UserId) -> PostRecord {
        PostRecord::plain(
            LegacyPost {
                id_str: Some(id),
                user_id_str: Some(author),
                full_text: Some(format!("post {id}")),
                ..Default::default()
            },
            id,
        )
    }

    fn reply(id: PostId, author: UserId, parent: PostId, parent_user: UserId) -> PostRecord {
        let mut rec = post(id, author);
        rec.legacy.in_reply_to_status_id_str = Some(parent);
        rec.legacy.in_reply_to_user_id_str = Some(parent_user);
        rec
    }

    #[test]
    fn thread_view_walks_up_and_down() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        store.add_post(&ctx, post(1, 10));
        store.add_post(&ctx, reply(2, 11, 1, 10));
        store.add_post(&ctx, reply(3, 10, 2, 11));
        store.rebuild_indexes();
        assert_eq!(store.thread_view(2), vec![1, 2, 3]);
    }

    #[test]
    fn ingest_is_idempotent() {
        let mut store = Store::new();
        let ctx = IngestCtx {
            time_ms: Some(1),
            observer: Some(99),
        };
        for _ in 0..2 {
            let mut rec = post(5, 10);
            rec.legacy.favorited = Some(true);
            store.add_post(&ctx, rec);
        }
        store.rebuild_indexes();
        let p = &store.posts[&5];
        assert_eq!(p.favoriters.len(), 1);
        assert_eq!(store.get_user_with_replies(10), vec![5]);
        assert_eq!(store.replies.len(), 0);
    }

    #[test]
    fn merge_overwrites_newer_fields_only() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        store.add_post(&ctx, post(5, 10));
        let mut newer = PostRecord::plain(
            LegacyPost {
                id_str: Some(5),
                favorite_count: Some(12),
                ..Default::default()
            },
            5,
        );
        newer.legacy.full_text = None;
        store.add_post(&ctx, newer);
        let p = &store.posts[&5];
        assert_eq!(p.text.as_deref(), Some("post 5"));
        assert_eq!(p.favorite_count, Some(12));
        assert_eq!(p.author, Some(10));
    }

    #[test]
    fn disjoint_merges_commute() {
        let text_only = PostRecord::plain(
            LegacyPost {
                id_str: Some(5),
                full_text: Some("hello".into()),
                ..Default::default()
            },
            5,
        );
        let counts_only = PostRecord::plain(
            LegacyPost {
                id_str: Some(5),
                favorite_count: Some(3),
                ..Default::default()
            },
            5,
        );

        let ctx = IngestCtx::default();
        let mut ab = Store::new();
        ab.add_post(&ctx, text_only);
        ab.add_post(&ctx, counts_only);

        let text_only = PostRecord::plain(
            LegacyPost {
                id_str: Some(5),
                full_text: Some("hello".into()),
                ..Default::default()
            },
            5,
        );
        let counts_only = PostRecord::plain(
            LegacyPost {
                id_str: Some(5),
                favorite_count: Some(3),
                ..Default::default()
            },
            5,
        );
        let mut ba = Store::new();
        ba.add_post(&ctx, counts_only);
        ba.add_post(&ctx, text_only);

        assert_eq!(ab.posts[&5].text, ba.posts[&5].text);
        assert_eq!(ab.posts[&5].favorite_count, ba.posts[&5].favorite_count);
    }

    #[test]
    fn reply_creates_stub_parent_with_author() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        let mut rec = reply(2, 11, 1, 10);
        rec.legacy.in_reply_to_screen_name = Some("op".into());
        store.add_post(&ctx, rec);

        let parent = &store.posts[&1];
        assert_eq!(parent.author, Some(10));
        assert_eq!(parent.original_id, 1);
        assert_eq!(store.profiles[&10].screen_name.as_deref(), Some("op"));
        assert_eq!(store.replies[&1], vec![2]);
    }

    #[test]
    fn stub_posts_never_overwrite_rich_text() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        store.add_post(&ctx, post(5, 10));
        store.add_stub_post(5, "liked text".into());
        assert_eq!(store.posts[&5].text.as_deref(), Some("post 5"));
        store.add_stub_post(6, "liked text".into());
        assert_eq!(store.posts[&6].text.as_deref(), Some("liked text"));
    }

    #[test]
    fn user_tweets_excludes_replies_and_leads_with_pins() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        store.add_post(&ctx, post(1, 10));
        store.add_post(&ctx, post(4, 10));
        store.add_post(&ctx, reply(3, 10, 1, 10));
        store.add_profile(
            &ctx,
            10,
            LegacyProfile {
                screen_name: Some("someone".into()),
                pinned_tweet_ids_str: Some(vec!["1".into()]),
                ..Default::default()
            },
        );
        store.rebuild_indexes();
        assert_eq!(store.get_user_tweets(10), vec![1, 4, 1]);
        assert_eq!(store.get_user_with_replies(10), vec![4, 3, 1]);
    }

    #[test]
    fn media_query_skips_reposted_media() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();

        let media_entities = LegacyEntities {
            media: Some(vec![LegacyMedia {
                media_url_https: Some("https://pbs.twimg.com/media/AAA.jpg".into()),
                kind: Some("photo".into()),
                ..Default::default()
            }]),
        };

        let mut own = post(4, 10);
        own.legacy.entities = Some(media_entities.clone());
        store.add_post(&ctx, own);

        // a repost of someone else's media post
        let mut original = post(1, 77);
        original.legacy.entities = Some(media_entities.clone());
        store.add_post(&ctx, original);
        let mut repost = post(6, 10);
        repost.legacy.entities = Some(media_entities);
        repost.original_id = 1;
        store.add_post(&ctx, repost);

        store.rebuild_indexes();
        assert_eq!(store.get_user_media(10), vec![4]);
        assert_eq!(store.get_user_media(77), vec![1]);
    }

    #[test]
    fn size_records_are_interned() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        let size = LegacySize {
            w: Some(680),
            h: Some(453),
            resize: Some("fit".into()),
        };
        for id in [1, 2] {
            let mut rec = post(id, 10);
            rec.legacy.entities = Some(LegacyEntities {
                media: Some(vec![LegacyMedia {
                    media_url_https: Some(format!("https://pbs.twimg.com/media/M{id}.jpg")),
                    sizes: Some(HashMap::from([("small".to_owned(), size.clone())])),
                    ..Default::default()
                }]),
            });
            store.add_post(&ctx, rec);
        }
        let a = &store.posts[&1].media[0].sizes["small"];
        let b = &store.posts[&2].media[0].sizes["small"];
        assert!(Rc::ptr_eq(a, b));
    }

    #[test]
    fn protected_reply_implies_follow() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        store.add_profile(
            &ctx,
            10,
            LegacyProfile {
                screen_name: Some("locked".into()),
                protected: Some(true),
                ..Default::default()
            },
        );
        store.add_post(&ctx, reply(2, 11, 1, 10));
        store.rebuild_indexes();
        assert!(store.followings[&11].contains(&10));
        assert!(store.followers[&10].contains(&11));
    }

    #[test]
    fn self_follow_is_rejected() {
        let mut store = Store::new();
        store.add_follow(7, 7);
        assert!(store.followers.is_empty());
        assert!(store.followings.is_empty());
    }

    #[test]
    fn likes_include_unsorted_channel() {
        let mut store = Store::new();
        let ctx = IngestCtx {
            time_ms: Some(1000),
            observer: Some(99),
        };
        store.observers.insert(99);
        let a = 1 << 23;
        let b = 2 << 23;
        store.add_post(&ctx, post(a, 10));
        store.add_post(&ctx, post(b, 11));
        store.add_likes_snapshot(
            99,
            Snapshot::Items {
                items: vec![b],
                time: 1000,
            },
        );
        store.add_unsorted_like(99, a);
        store.rebuild_indexes();

        let likes = store.get_user_likes(99);
        assert_eq!(likes.len(), 2);
        assert_eq!(likes[0].1, b);
        assert_eq!(likes[1].1, a);
        // liking counts as interacting with the authors
        assert_eq!(store.get_user_interactions(10), vec![a]);
        assert_eq!(store.get_user_interactions(11), vec![b]);
    }

    #[test]
    fn bookmarks_keep_highest_sort_index() {
        let mut store = Store::new();
        store.add_bookmark(9, 5, 100);
        store.add_bookmark(9, 5, 50);
        store.add_bookmark(9, 6, 70);
        store.rebuild_indexes();
        assert_eq!(store.get_user_bookmarks(9), vec![(100, 5), (70, 6)]);
    }

    #[test]
    fn circle_markers_propagate_along_conversations() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        store.add_profile(
            &ctx,
            10,
            LegacyProfile {
                screen_name: Some("owner".into()),
                name: Some("Circle Owner".into()),
                ..Default::default()
            },
        );

        let mut root = post(1, 10);
        root.legacy.conversation_id_str = Some(1);
        root.legacy.limited_actions = Some("limit_trusted_friends_tweet".into());
        store.add_post(&ctx, root);

        let mut reply_rec = reply(2, 11, 1, 10);
        reply_rec.legacy.conversation_id_str = Some(1);
        store.add_post(&ctx, reply_rec);

        store.rebuild_indexes();

        let root = &store.posts[&1];
        let child = &store.posts[&2];
        assert_eq!(
            root.circle.as_ref().map(|c| c.screen_name.as_str()),
            Some("owner")
        );
        assert_eq!(
            child.limited_actions.as_deref(),
            Some("limit_trusted_friends_tweet")
        );
    }

    #[test]
    fn search_matches_words_and_media_urls() {
        let mut store = Store::new();
        let ctx = IngestCtx::default();
        let mut a = post(1, 10);
        a.legacy.full_text = Some("the quick brown fox".into());
        store.add_post(&ctx, a);
        let mut b = post(2, 10);
        b.legacy.full_text = Some("quick note".into());
        b.legacy.entities = Some(LegacyEntities {
            media: Some(vec![LegacyMedia {
                media_url_https: Some("https://pbs.twimg.com/media/FOX99.jpg".into()),
                ..Default::default()
            }]),
        });
        store.add_post(&ctx, b);

        assert_eq!(store.search("quick fox"), BTreeSet::from([1]));
        assert_eq!(store.search("quick"), BTreeSet::from([1, 2]));
        assert_eq!(store.search("FOX99"), BTreeSet::from([2]));
    }
}
