//! Normalized entities and the wire-side record shapes they are merged from.
//!
//! Every capture generation ultimately produces the same `LegacyPost` /
//! `LegacyProfile` records; exports encode numbers as strings and the API as
//! integers, so the id/count fields deserialize leniently.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use serde::{Deserialize, Deserializer};

pub type PostId = i64;
pub type UserId = i64;

/// Unix epoch millis of the id scheme; post ids carry their creation time in
/// the upper bits.
pub const ID_EPOCH_MS: i64 = 1288834974657;

pub fn id_timestamp_ms(id: PostId) -> i64 {
    (id >> 22) + ID_EPOCH_MS
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(i64),
    Str(String),
}

pub(crate) fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match Option::<NumOrStr>::deserialize(d)? {
        None => Ok(None),
        Some(NumOrStr::Num(n)) => Ok(Some(n)),
        Some(NumOrStr::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// One post as any capture source encodes it. Field names follow the wire
/// format; older generations leave most of them out.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyPost {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub id_str: Option<PostId>,
    #[serde(default, alias = "text")]
    pub full_text: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub user_id_str: Option<UserId>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub in_reply_to_status_id_str: Option<PostId>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub in_reply_to_user_id_str: Option<UserId>,
    #[serde(default)]
    pub in_reply_to_screen_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub conversation_id_str: Option<PostId>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub quoted_status_id_str: Option<PostId>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub retweeted_status_id_str: Option<PostId>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub favorite_count: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub retweet_count: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub reply_count: Option<i64>,
    #[serde(default)]
    pub favorited: Option<bool>,
    #[serde(default)]
    pub retweeted: Option<bool>,
    #[serde(default)]
    pub bookmarked: Option<bool>,
    #[serde(default)]
    pub limited_actions: Option<String>,
    #[serde(default)]
    pub entities: Option<LegacyEntities>,
    #[serde(default)]
    pub extended_entities: Option<LegacyEntities>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyEntities {
    #[serde(default)]
    pub media: Option<Vec<LegacyMedia>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyMedia {
    #[serde(default)]
    pub media_url_https: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub sizes: Option<HashMap<String, LegacySize>>,
    #[serde(default)]
    pub video_info: Option<LegacyVideoInfo>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LegacySize {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub w: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub h: Option<i64>,
    #[serde(default)]
    pub resize: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyVideoInfo {
    #[serde(default)]
    pub variants: Vec<LegacyVideoVariant>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LegacyVideoVariant {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub bitrate: Option<i64>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub url: String,
}

/// One profile as the wire encodes it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyProfile {
    #[serde(default)]
    pub screen_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub protected: Option<bool>,
    #[serde(default)]
    pub profile_image_url_https: Option<String>,
    #[serde(default)]
    pub profile_banner_url: Option<String>,
    #[serde(default)]
    pub following: Option<bool>,
    #[serde(default)]
    pub followed_by: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub followers_count: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub friends_count: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub statuses_count: Option<i64>,
    #[serde(default)]
    pub pinned_tweet_ids_str: Option<Vec<String>>,
}

impl LegacyProfile {
    pub fn is_empty(&self) -> bool {
        self.screen_name.is_none() && self.name.is_none()
    }
}

/// Size record shared between media entries through the store's interner.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MediaSize {
    pub w: i64,
    pub h: i64,
    pub resize: String,
}

#[derive(Clone, Debug, Default)]
pub struct MediaItem {
    pub url: Option<String>,
    pub kind: Option<String>,
    pub sizes: BTreeMap<String, Rc<MediaSize>>,
    pub video_variants: Vec<LegacyVideoVariant>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircleOwner {
    pub screen_name: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardValue {
    Boolean { boolean_value: bool },
    String { string_value: String },
    Image { image_value: CardImage },
    ImageColor,
    User,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CardImage {
    pub url: String,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub width: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub height: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct Card {
    pub name: Option<String>,
    pub binding_values: BTreeMap<String, CardValue>,
}

/// A post in the store. Merging overwrites populated fields and accumulates
/// the per-observer flag sets.
#[derive(Clone, Debug)]
pub struct Post {
    pub id: PostId,
    pub text: Option<String>,
    pub author: Option<UserId>,
    pub created_at: Option<String>,
    pub reply_to_post: Option<PostId>,
    pub reply_to_user: Option<UserId>,
    pub reply_to_screen_name: Option<String>,
    pub conversation_id: Option<PostId>,
    pub quoted_id: Option<PostId>,
    /// Id of the post this one republishes, or `id` itself.
    pub original_id: PostId,
    pub favorite_count: Option<i64>,
    pub retweet_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub limited_actions: Option<String>,
    pub circle: Option<CircleOwner>,
    pub card: Option<Card>,
    pub media: Vec<MediaItem>,
    pub bookmarkers: BTreeSet<UserId>,
    pub favoriters: BTreeSet<UserId>,
    pub reposters: BTreeSet<UserId>,
}

impl Post {
    pub fn new(id: PostId) -> Self {
        Post {
            id,
            text: None,
            author: None,
            created_at: None,
            reply_to_post: None,
            reply_to_user: None,
            reply_to_screen_name: None,
            conversation_id: None,
            quoted_id: None,
            original_id: id,
            favorite_count: None,
            retweet_count: None,
            reply_count: None,
            limited_actions: None,
            circle: None,
            card: None,
            media: Vec::new(),
            bookmarkers: BTreeSet::new(),
            favoriters: BTreeSet::new(),
            reposters: BTreeSet::new(),
        }
    }

    pub fn is_repost(&self) -> bool {
        self.original_id != self.id
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Profile {
    pub id: UserId,
    pub screen_name: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub protected: Option<bool>,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
    pub following: Option<bool>,
    pub followed_by: Option<bool>,
    pub followers_count: Option<i64>,
    pub friends_count: Option<i64>,
    pub statuses_count: Option<i64>,
    pub pinned_post_ids: Vec<PostId>,
}

impl Profile {
    pub fn new(id: UserId) -> Self {
        Profile {
            id,
            screen_name: None,
            name: None,
            description: None,
            protected: None,
            avatar_url: None,
            banner_url: None,
            following: None,
            followed_by: None,
            followers_count: None,
            friends_count: None,
            statuses_count: None,
            pinned_post_ids: Vec::new(),
        }
    }

    /// Newer fields win; absent fields keep earlier observations.
    pub fn merge(&mut self, rec: LegacyProfile) {
        merge_field(&mut self.screen_name, rec.screen_name);
        merge_field(&mut self.name, rec.name);
        merge_field(&mut self.description, rec.description);
        merge_field(&mut self.protected, rec.protected);
        merge_field(&mut self.avatar_url, rec.profile_image_url_https);
        merge_field(&mut self.banner_url, rec.profile_banner_url);
        merge_field(&mut self.following, rec.following);
        merge_field(&mut self.followed_by, rec.followed_by);
        merge_field(&mut self.followers_count, rec.followers_count);
        merge_field(&mut self.friends_count, rec.friends_count);
        merge_field(&mut self.statuses_count, rec.statuses_count);
        if let Some(pinned) = rec.pinned_tweet_ids_str {
            self.pinned_post_ids = pinned.iter().filter_map(|s| s.parse().ok()).collect();
        }
    }
}

pub(crate) fn merge_field<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Direct-message records from export bundles, one externally-tagged object
/// per message.
#[derive(Clone, Debug, Deserialize)]
pub enum DmMessage {
    #[serde(rename = "messageCreate")]
    Create(DmCreate),
    #[serde(rename = "joinConversation")]
    Join(DmJoin),
    #[serde(rename = "participantsLeave")]
    Leave(DmLeave),
}

impl DmMessage {
    /// Sort key; join/leave events carry no message id.
    pub fn message_id(&self) -> i64 {
        match self {
            DmMessage::Create(create) => create.id,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmCreate {
    #[serde(deserialize_with = "de_i64")]
    pub id: i64,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub sender_id: Option<UserId>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub reactions: Vec<serde_json::Value>,
    #[serde(default)]
    pub urls: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmJoin {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub initiating_user_id: Option<UserId>,
    #[serde(default)]
    pub participants_snapshot: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmLeave {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Conversation {
    pub messages: Vec<DmMessage>,
    pub known_ids: HashSet<i64>,
    /// Join/leave events carry no id; dedup on re-ingest by timestamp.
    pub seen_events: HashSet<String>,
}

impl Conversation {
    /// Appends unseen messages; returns how many were new.
    pub fn absorb(&mut self, messages: Vec<DmMessage>) -> usize {
        let mut added = 0;
        for message in messages {
            match &message {
                DmMessage::Create(create) => {
                    if !self.known_ids.insert(create.id) {
                        continue;
                    }
                }
                DmMessage::Join(join) => {
                    let key = format!("join:{}", join.created_at.as_deref().unwrap_or(""));
                    if !self.seen_events.insert(key) {
                        continue;
                    }
                }
                DmMessage::Leave(leave) => {
                    let key = format!("leave:{}", leave.created_at.as_deref().unwrap_or(""));
                    if !self.seen_events.insert(key) {
                        continue;
                    }
                }
            }
            self.messages.push(message);
            added += 1;
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_ids_and_counts() {
        let api: LegacyPost = serde_json::from_str(
            r#"{"id_str":"100","favorite_count":3,"user_id_str":"7"}"#,
        )
        .unwrap();
        assert_eq!(api.id_str, Some(100));
        assert_eq!(api.favorite_count, Some(3));

        let export: LegacyPost = serde_json::from_str(
            r#"{"id_str":"100","favorite_count":"3","in_reply_to_status_id_str":null}"#,
        )
        .unwrap();
        assert_eq!(export.favorite_count, Some(3));
        assert_eq!(export.in_reply_to_status_id_str, None);
    }

    #[test]
    fn text_alias_for_old_exports() {
        let post: LegacyPost =
            serde_json::from_str(r#"{"id_str":"5","text":"hello world"}"#).unwrap();
        assert_eq!(post.full_text.as_deref(), Some("hello world"));
    }

    #[test]
    fn profile_merge_keeps_earlier_fields() {
        let mut profile = Profile::new(7);
        profile.merge(LegacyProfile {
            screen_name: Some("someone".into()),
            description: Some("old bio".into()),
            ..Default::default()
        });
        profile.merge(LegacyProfile {
            description: Some("new bio".into()),
            protected: Some(true),
            ..Default::default()
        });
        assert_eq!(profile.screen_name.as_deref(), Some("someone"));
        assert_eq!(profile.description.as_deref(), Some("new bio"));
        assert_eq!(profile.protected, Some(true));
    }

    #[test]
    fn conversation_dedups_by_message_id() {
        let message = |id: i64| {
            DmMessage::Create(DmCreate {
                id,
                sender_id: Some(1),
                recipient_id: Some(2),
                text: Some("hi".into()),
                created_at: None,
                media_urls: vec![],
                reactions: vec![],
                urls: vec![],
            })
        };
        let mut conversation = Conversation::default();
        assert_eq!(conversation.absorb(vec![message(1), message(2)]), 2);
        assert_eq!(conversation.absorb(vec![message(2), message(3)]), 1);
        assert_eq!(conversation.messages.len(), 3);
    }

    #[test]
    fn id_timestamp_is_monotone() {
        assert!(id_timestamp_ms(1_600_000_000_000_000) > ID_EPOCH_MS);
        assert!(id_timestamp_ms(2) < id_timestamp_ms(1 << 23));
    }

    #[test]
    fn dm_message_parses_externally_tagged() {
        let raw = r#"{"messageCreate":{"id":"99","senderId":"1","recipientId":"2","text":"yo","createdAt":"2020-01-01T00:00:00.000Z"}}"#;
        let message: DmMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.message_id(), 99);
    }
}
